//! RPM package lead and header sections. A package starts with a 96-byte
//! lead, followed by the signature header (padded to 8 bytes) and the
//! main metadata header, then the compressed payload.

use std::collections::HashMap;
use std::io::Read;

use nom::bytes::complete::tag as nom_tag;
use nom::number::complete::{be_i32, be_u16, be_u32, be_u8};
use nom::sequence::tuple;
use nom::IResult;

use super::RpmError;

pub const LEAD_LEN: usize = 96;
const HEADER_MAGIC: &[u8] = &[0x8e, 0xad, 0xe8, 0x01];

// Signature header tags.
pub const SIGTAG_SHA1: i32 = 269;

// Main header tags.
pub const TAG_NAME: i32 = 1000;
pub const TAG_VERSION: i32 = 1001;
pub const TAG_RELEASE: i32 = 1002;
pub const TAG_EPOCH: i32 = 1003;
pub const TAG_SUMMARY: i32 = 1004;
pub const TAG_DESCRIPTION: i32 = 1005;
pub const TAG_BUILDTIME: i32 = 1006;
pub const TAG_BUILDHOST: i32 = 1007;
pub const TAG_LICENSE: i32 = 1014;
pub const TAG_GROUP: i32 = 1016;
pub const TAG_URL: i32 = 1020;
pub const TAG_ARCH: i32 = 1022;
pub const TAG_PREIN: i32 = 1023;
pub const TAG_POSTIN: i32 = 1024;
pub const TAG_PREUN: i32 = 1025;
pub const TAG_POSTUN: i32 = 1026;
pub const TAG_FILESIZES: i32 = 1028;
pub const TAG_FILEMODES: i32 = 1030;
pub const TAG_FILEMTIMES: i32 = 1034;
pub const TAG_FILEDIGESTS: i32 = 1035;
pub const TAG_FILELINKTOS: i32 = 1036;
pub const TAG_FILEFLAGS: i32 = 1037;
pub const TAG_FILEUSERNAME: i32 = 1039;
pub const TAG_FILEGROUPNAME: i32 = 1040;
pub const TAG_SOURCERPM: i32 = 1044;
pub const TAG_PROVIDENAME: i32 = 1047;
pub const TAG_REQUIREFLAGS: i32 = 1048;
pub const TAG_REQUIRENAME: i32 = 1049;
pub const TAG_REQUIREVERSION: i32 = 1050;
pub const TAG_TRIGGERSCRIPTS: i32 = 1065;
pub const TAG_TRIGGERNAME: i32 = 1066;
pub const TAG_TRIGGERVERSION: i32 = 1067;
pub const TAG_TRIGGERFLAGS: i32 = 1068;
pub const TAG_TRIGGERINDEX: i32 = 1069;
pub const TAG_PREINPROG: i32 = 1085;
pub const TAG_POSTINPROG: i32 = 1086;
pub const TAG_PREUNPROG: i32 = 1087;
pub const TAG_POSTUNPROG: i32 = 1088;
pub const TAG_OBSOLETENAME: i32 = 1090;
pub const TAG_TRIGGERSCRIPTPROG: i32 = 1092;
pub const TAG_FILEINODES: i32 = 1096;
pub const TAG_SOURCEPACKAGE: i32 = 1106;
pub const TAG_PROVIDEFLAGS: i32 = 1112;
pub const TAG_PROVIDEVERSION: i32 = 1113;
pub const TAG_OBSOLETEFLAGS: i32 = 1114;
pub const TAG_OBSOLETEVERSION: i32 = 1115;
pub const TAG_DIRINDEXES: i32 = 1116;
pub const TAG_BASENAMES: i32 = 1117;
pub const TAG_DIRNAMES: i32 = 1118;
pub const TAG_PAYLOADCOMPRESSOR: i32 = 1125;
pub const TAG_FILECAPS: i32 = 5010;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Char(Vec<u8>),
    Int8(Vec<u8>),
    Int16(Vec<u16>),
    Int32(Vec<u32>),
    Int64(Vec<u64>),
    String(String),
    Bin(Vec<u8>),
    StringArray(Vec<String>),
    I18nString(Vec<String>),
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    tag: i32,
    typ: u32,
    offset: u32,
    count: u32,
}

fn index_entry(input: &[u8]) -> IResult<&[u8], IndexEntry> {
    let (rest, (tag, typ, offset, count)) =
        tuple((be_i32, be_u32, be_u32, be_u32))(input)?;
    Ok((
        rest,
        IndexEntry {
            tag,
            typ,
            offset,
            count,
        },
    ))
}

fn header_preamble(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    let (rest, _) = nom_tag(HEADER_MAGIC)(input)?;
    let (rest, (_reserved, nindex, hsize)) = tuple((be_u32, be_u32, be_u32))(rest)?;
    Ok((rest, (nindex, hsize)))
}

/// Validate the 96-byte lead. Only the magic and the package type field
/// are interesting; everything else is legacy.
pub fn parse_lead(input: &[u8]) -> Result<(), RpmError> {
    fn lead(input: &[u8]) -> IResult<&[u8], (u8, u8, u16)> {
        let (rest, _) = nom_tag(&[0xedu8, 0xab, 0xee, 0xdb][..])(input)?;
        tuple((be_u8, be_u8, be_u16))(rest)
    }
    match lead(input) {
        Ok(_) => Ok(()),
        Err(_) => Err(RpmError::NotRpm),
    }
}

/// A parsed header section: tag to typed value.
#[derive(Debug, Default)]
pub struct Header {
    values: HashMap<i32, Value>,
}

impl Header {
    /// Read one header section from `r`. The signature header is padded
    /// so the following section starts on an 8-byte boundary; `pad`
    /// selects that behaviour.
    pub fn read_from<R: Read>(r: &mut R, pad: bool) -> Result<Header, RpmError> {
        let mut preamble = [0u8; 16];
        r.read_exact(&mut preamble)
            .map_err(|_| RpmError::Truncated("header preamble"))?;
        let (_, (nindex, hsize)) = header_preamble(&preamble)
            .map_err(|_| RpmError::Header("bad header section magic".into()))?;
        if nindex > 0xffff || hsize > (256 << 20) {
            return Err(RpmError::Header("header size out of range".into()));
        }
        let mut index = vec![0u8; nindex as usize * 16];
        r.read_exact(&mut index)
            .map_err(|_| RpmError::Truncated("header index"))?;
        let padding = if pad { (8 - hsize % 8) % 8 } else { 0 };
        let mut store = vec![0u8; (hsize + padding) as usize];
        r.read_exact(&mut store)
            .map_err(|_| RpmError::Truncated("header store"))?;
        store.truncate(hsize as usize);

        let mut values = HashMap::new();
        let mut rest: &[u8] = &index;
        for _ in 0..nindex {
            let (next, entry) =
                index_entry(rest).map_err(|_| RpmError::Header("bad index entry".into()))?;
            rest = next;
            let value = decode_value(&store, entry)?;
            values.insert(entry.tag, value);
        }
        Ok(Header { values })
    }

    pub fn has(&self, tag: i32) -> bool {
        self.values.contains_key(&tag)
    }

    pub fn string(&self, tag: i32) -> Option<&str> {
        match self.values.get(&tag) {
            Some(Value::String(s)) => Some(s),
            Some(Value::I18nString(v)) | Some(Value::StringArray(v)) => {
                v.first().map(|s| s.as_str())
            }
            _ => None,
        }
    }

    pub fn require_string(&self, name: &'static str, tag: i32) -> Result<&str, RpmError> {
        self.string(tag).ok_or(RpmError::MissingTag(name))
    }

    pub fn string_array(&self, tag: i32) -> Option<&[String]> {
        match self.values.get(&tag) {
            Some(Value::StringArray(v)) | Some(Value::I18nString(v)) => Some(v),
            _ => None,
        }
    }

    pub fn u32_array(&self, tag: i32) -> Option<&[u32]> {
        match self.values.get(&tag) {
            Some(Value::Int32(v)) => Some(v),
            _ => None,
        }
    }

    pub fn u16_array(&self, tag: i32) -> Option<&[u16]> {
        match self.values.get(&tag) {
            Some(Value::Int16(v)) => Some(v),
            _ => None,
        }
    }

    pub fn u32(&self, tag: i32) -> Option<u32> {
        self.u32_array(tag).and_then(|v| v.first().copied())
    }
}

fn store_slice(store: &[u8], offset: u32, len: usize) -> Result<&[u8], RpmError> {
    store
        .get(offset as usize..)
        .and_then(|s| s.get(..len))
        .ok_or_else(|| RpmError::Header("index entry outside store".into()))
}

fn nul_strings(store: &[u8], offset: u32, count: u32) -> Result<Vec<String>, RpmError> {
    let mut out = Vec::with_capacity(count as usize);
    let mut pos = offset as usize;
    for _ in 0..count {
        let rest = store
            .get(pos..)
            .ok_or_else(|| RpmError::Header("string outside store".into()))?;
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RpmError::Header("unterminated string in store".into()))?;
        out.push(String::from_utf8_lossy(&rest[..end]).into_owned());
        pos += end + 1;
    }
    Ok(out)
}

fn decode_value(store: &[u8], entry: IndexEntry) -> Result<Value, RpmError> {
    let count = entry.count as usize;
    Ok(match entry.typ {
        0 => Value::Null,
        1 => Value::Char(store_slice(store, entry.offset, count)?.to_vec()),
        2 => Value::Int8(store_slice(store, entry.offset, count)?.to_vec()),
        3 => {
            let raw = store_slice(store, entry.offset, count * 2)?;
            Value::Int16(
                raw.chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect(),
            )
        }
        4 => {
            let raw = store_slice(store, entry.offset, count * 4)?;
            Value::Int32(
                raw.chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )
        }
        5 => {
            let raw = store_slice(store, entry.offset, count * 8)?;
            Value::Int64(
                raw.chunks_exact(8)
                    .map(|c| {
                        u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect(),
            )
        }
        6 => Value::String(
            nul_strings(store, entry.offset, 1)?
                .pop()
                .unwrap_or_default(),
        ),
        7 => Value::Bin(store_slice(store, entry.offset, count)?.to_vec()),
        8 => Value::StringArray(nul_strings(store, entry.offset, entry.count)?),
        9 => Value::I18nString(nul_strings(store, entry.offset, entry.count)?),
        other => {
            return Err(RpmError::Header(format!(
                "unknown header data type {} for tag {}",
                other, entry.tag
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header(entries: &[(i32, u32, &[u8], u32)]) -> Vec<u8> {
        // entries: (tag, type, raw store bytes, count); laid out back to
        // back which is good enough for the parser.
        let mut store = Vec::new();
        let mut index = Vec::new();
        for (tag, typ, raw, count) in entries {
            index.extend_from_slice(&tag.to_be_bytes());
            index.extend_from_slice(&typ.to_be_bytes());
            index.extend_from_slice(&(store.len() as u32).to_be_bytes());
            index.extend_from_slice(&count.to_be_bytes());
            store.extend_from_slice(raw);
        }
        let mut out = Vec::new();
        out.extend_from_slice(&[0x8e, 0xad, 0xe8, 0x01]);
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&((entries.len() as u32).to_be_bytes()));
        out.extend_from_slice(&(store.len() as u32).to_be_bytes());
        out.extend_from_slice(&index);
        out.extend_from_slice(&store);
        out
    }

    #[test]
    fn test_read_header() {
        let raw = build_header(&[
            (TAG_NAME, 6, b"unzip\0", 1),
            (TAG_EPOCH, 4, &1u32.to_be_bytes(), 1),
            (TAG_BASENAMES, 8, b"unzip\0zipinfo\0", 2),
            (TAG_FILEMODES, 3, &[0x81, 0xed, 0x81, 0xed], 2),
        ]);
        let header = Header::read_from(&mut &raw[..], false).unwrap();
        assert_eq!(header.string(TAG_NAME), Some("unzip"));
        assert_eq!(header.u32(TAG_EPOCH), Some(1));
        assert_eq!(
            header.string_array(TAG_BASENAMES).unwrap(),
            &["unzip".to_string(), "zipinfo".to_string()]
        );
        assert_eq!(
            header.u16_array(TAG_FILEMODES).unwrap(),
            &[0o100755, 0o100755]
        );
        assert!(!header.has(TAG_SOURCEPACKAGE));
    }

    #[test]
    fn test_bad_magic() {
        let mut raw = build_header(&[(TAG_NAME, 6, b"x\0", 1)]);
        raw[0] = 0;
        assert!(Header::read_from(&mut &raw[..], false).is_err());
    }

    #[test]
    fn test_lead() {
        let mut lead = vec![0u8; LEAD_LEN];
        lead[..4].copy_from_slice(&[0xed, 0xab, 0xee, 0xdb]);
        assert!(parse_lead(&lead).is_ok());
        lead[0] = 0x7f;
        assert!(parse_lead(&lead).is_err());
    }
}
