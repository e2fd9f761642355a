//! Java class file parsing: constant pool, class hierarchy and the set
//! of referenced class names.

use std::collections::HashMap;

use thiserror::Error;

pub const CLASS_MAGIC: &[u8] = &[0xca, 0xfe, 0xba, 0xbe];

#[derive(Debug, Error)]
pub enum JavaClassError {
    #[error("not a class file")]
    BadMagic,
    #[error("truncated class file at offset {0}")]
    Truncated(usize),
    #[error("unknown constant pool tag {0}")]
    UnknownTag(u8),
    #[error("invalid constant pool index {0}")]
    BadIndex(u16),
}

pub fn looks_like_class(data: &[u8]) -> bool {
    data.starts_with(CLASS_MAGIC)
}

#[derive(Debug)]
pub struct JavaClass {
    pub access_flags: u16,
    pub this_class: String,
    pub super_class: String,
    pub interfaces: Vec<String>,
    /// Deduplicated referenced class names, with `java/lang/Object`,
    /// `java/lang/String` and the class itself filtered out.
    pub class_references: Vec<String>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], JavaClassError> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(JavaClassError::Truncated(self.pos))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, JavaClassError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, JavaClassError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, JavaClassError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

pub fn parse(data: &[u8]) -> Result<JavaClass, JavaClassError> {
    if !looks_like_class(data) {
        return Err(JavaClassError::BadMagic);
    }
    let mut cur = Cursor { data, pos: 4 };
    cur.u16()?; // minor
    cur.u16()?; // major

    let pool_count = cur.u16()?;
    let mut utf8: HashMap<u16, String> = HashMap::new();
    let mut classes: HashMap<u16, u16> = HashMap::new();
    let mut index = 1u16;
    while index < pool_count {
        let tag = cur.u8()?;
        let mut slots = 1;
        match tag {
            1 => {
                let len = cur.u16()? as usize;
                let raw = cur.take(len)?;
                utf8.insert(index, String::from_utf8_lossy(raw).into_owned());
            }
            7 => {
                let name_index = cur.u16()?;
                classes.insert(index, name_index);
            }
            3 | 4 => {
                cur.u32()?;
            }
            5 | 6 => {
                cur.u32()?;
                cur.u32()?;
                slots = 2;
            }
            8 | 16 | 19 | 20 => {
                cur.u16()?;
            }
            9 | 10 | 11 | 12 | 17 | 18 => {
                cur.u16()?;
                cur.u16()?;
            }
            15 => {
                cur.u8()?;
                cur.u16()?;
            }
            other => return Err(JavaClassError::UnknownTag(other)),
        }
        index += slots;
    }

    let access_flags = cur.u16()?;
    let this_index = cur.u16()?;
    let super_index = cur.u16()?;
    let interface_count = cur.u16()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        let idx = cur.u16()?;
        interfaces.push(class_name(&classes, &utf8, idx)?);
    }

    let this_class = class_name(&classes, &utf8, this_index)?;
    let super_class = if super_index == 0 {
        String::new()
    } else {
        class_name(&classes, &utf8, super_index)?
    };

    let mut references: Vec<String> = classes
        .values()
        .filter_map(|name_index| utf8.get(name_index).cloned())
        .filter(|name| {
            name != "java/lang/Object" && name != "java/lang/String" && *name != this_class
        })
        .collect();
    references.sort();
    references.dedup();

    Ok(JavaClass {
        access_flags,
        this_class,
        super_class,
        interfaces,
        class_references: references,
    })
}

fn class_name(
    classes: &HashMap<u16, u16>,
    utf8: &HashMap<u16, String>,
    index: u16,
) -> Result<String, JavaClassError> {
    let name_index = classes.get(&index).ok_or(JavaClassError::BadIndex(index))?;
    utf8.get(name_index)
        .cloned()
        .ok_or(JavaClassError::BadIndex(*name_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_utf8(pool: &mut Vec<u8>, text: &str) {
        pool.push(1);
        pool.extend_from_slice(&(text.len() as u16).to_be_bytes());
        pool.extend_from_slice(text.as_bytes());
    }

    fn push_class(pool: &mut Vec<u8>, name_index: u16) {
        pool.push(7);
        pool.extend_from_slice(&name_index.to_be_bytes());
    }

    fn build_class() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(CLASS_MAGIC);
        out.extend_from_slice(&0u16.to_be_bytes()); // minor
        out.extend_from_slice(&52u16.to_be_bytes()); // major
        let mut pool = Vec::new();
        // 1: "com/example/Main", 2: Class(1), 3: "java/lang/Object",
        // 4: Class(3), 5: "java/util/List", 6: Class(5),
        // 7: "java/io/Serializable", 8: Class(7)
        push_utf8(&mut pool, "com/example/Main");
        push_class(&mut pool, 1);
        push_utf8(&mut pool, "java/lang/Object");
        push_class(&mut pool, 3);
        push_utf8(&mut pool, "java/util/List");
        push_class(&mut pool, 5);
        push_utf8(&mut pool, "java/io/Serializable");
        push_class(&mut pool, 7);
        out.extend_from_slice(&9u16.to_be_bytes()); // pool count = entries + 1
        out.extend_from_slice(&pool);
        out.extend_from_slice(&0x0021u16.to_be_bytes()); // ACC_PUBLIC | ACC_SUPER
        out.extend_from_slice(&2u16.to_be_bytes()); // this
        out.extend_from_slice(&4u16.to_be_bytes()); // super
        out.extend_from_slice(&1u16.to_be_bytes()); // interface count
        out.extend_from_slice(&8u16.to_be_bytes());
        out
    }

    #[test]
    fn test_parse_class() {
        let raw = build_class();
        let class = parse(&raw).unwrap();
        assert_eq!(class.this_class, "com/example/Main");
        assert_eq!(class.super_class, "java/lang/Object");
        assert_eq!(class.access_flags, 0x0021);
        assert_eq!(class.interfaces, vec!["java/io/Serializable".to_string()]);
        // Object and the class itself are filtered from references.
        assert_eq!(
            class.class_references,
            vec![
                "java/io/Serializable".to_string(),
                "java/util/List".to_string()
            ]
        );
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            parse(b"\x7fELF....."),
            Err(JavaClassError::BadMagic)
        ));
    }

    #[test]
    fn test_truncated() {
        let raw = build_class();
        assert!(matches!(
            parse(&raw[..raw.len() - 3]),
            Err(JavaClassError::Truncated(_))
        ));
    }
}
