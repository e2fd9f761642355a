//! Row-level operations for the catalogue: interning and insertion of
//! packages, files, contents and analyzer facts. All of these expect to
//! run inside the caller's transaction.

use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, Result};
use sqlx::postgres::PgConnection;
use sqlx::Row;

use super::{AttributeId, ClassId, ContentsId, FileId, PackageId, PackageSetId};
use crate::base16;
use crate::checksum::{hash, HashKind};
use crate::elf::{ElfImage, SymbolDefinition, SymbolReference};
use crate::java_class::JavaClass;
use crate::maven_url::{MavenUrl, XmlErrorInfo};
use crate::python_analyzer::{PythonAnalysis, PythonErrorInfo};
use crate::rpm::{
    Dependency, DependencyKind, FileInfo, PackageInfo, PackageKind, Script, Trigger,
};

fn id_from_row(row: &sqlx::postgres::PgRow) -> Result<i32> {
    let id: i32 = row.get(0);
    if id <= 0 {
        return Err(anyhow!("database returned invalid id {}", id));
    }
    Ok(id)
}

/// Look up or insert a package row. The SHA-1 header hash is the
/// identity key; returns `(id, added)` where `added` is false for a
/// package that was already present.
pub async fn intern_package(
    conn: &mut PgConnection,
    pkg: &PackageInfo,
) -> Result<(PackageId, bool)> {
    let hash_bytes = base16::decode(&pkg.hash)
        .map_err(|e| anyhow!("malformed package header hash {:?}: {}", pkg.hash, e))?;
    let existing = sqlx::query("SELECT package_id FROM symboldb.package WHERE hash = $1")
        .bind(&hash_bytes)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(row) = existing {
        return Ok((PackageId(id_from_row(&row)?), false));
    }

    let kind = match pkg.kind {
        PackageKind::Binary => "binary",
        PackageKind::Source => "source",
    };
    let row = sqlx::query(
        "INSERT INTO symboldb.package \
         (name, epoch, version, release, arch, hash, source, build_host, \
          build_time, summary, description, license, rpm_group, normalized, kind) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         RETURNING package_id",
    )
    .bind(&pkg.name)
    .bind(pkg.epoch)
    .bind(&pkg.version)
    .bind(&pkg.release)
    .bind(&pkg.arch)
    .bind(&hash_bytes)
    .bind(pkg.source_rpm.as_deref())
    .bind(&pkg.build_host)
    .bind(pkg.build_time)
    .bind(&pkg.summary)
    .bind(&pkg.description)
    .bind(&pkg.license)
    .bind(&pkg.group)
    .bind(pkg.normalized)
    .bind(kind)
    .fetch_one(conn)
    .await?;
    Ok((PackageId(id_from_row(&row)?), true))
}

pub async fn add_package_digest(
    conn: &mut PgConnection,
    pkg: PackageId,
    digest: &[u8],
    length: i64,
) -> Result<()> {
    if digest.len() < 16 {
        return Err(anyhow!("invalid digest length {}", digest.len()));
    }
    sqlx::query(
        "INSERT INTO symboldb.package_digest (package_id, digest, length) \
         VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
    )
    .bind(pkg.value())
    .bind(digest)
    .bind(length)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn package_by_digest(
    conn: &mut PgConnection,
    digest: &[u8],
) -> Result<Option<PackageId>> {
    let row = sqlx::query("SELECT package_id FROM symboldb.package_digest WHERE digest = $1")
        .bind(digest)
        .fetch_optional(conn)
        .await?;
    row.map(|r| Ok(PackageId(id_from_row(&r)?))).transpose()
}

pub async fn add_package_url(conn: &mut PgConnection, pkg: PackageId, url: &str) -> Result<()> {
    sqlx::query("INSERT INTO symboldb.package_url (package_id, url) VALUES ($1, $2)")
        .bind(pkg.value())
        .bind(url)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn add_package_dependency(
    conn: &mut PgConnection,
    pkg: PackageId,
    dep: &Dependency,
) -> Result<()> {
    let table = match dep.kind {
        DependencyKind::Requires => "package_require",
        DependencyKind::Provides => "package_provide",
        DependencyKind::Obsoletes => "package_obsolete",
    };
    let stmt = format!(
        "INSERT INTO symboldb.{} \
         (package_id, capability, op, version, pre, build) \
         VALUES ($1, $2, $3, $4, $5, $6)",
        table
    );
    sqlx::query(&stmt)
        .bind(pkg.value())
        .bind(&dep.capability)
        .bind(dep.op)
        .bind(dep.version.as_deref())
        .bind(dep.pre)
        .bind(dep.build)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn add_package_script(
    conn: &mut PgConnection,
    pkg: PackageId,
    script: &Script,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.package_script (package_id, kind, script, prog) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(pkg.value())
    .bind(script.kind.as_str())
    .bind(&script.script)
    .bind(script.prog.as_deref())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn add_package_trigger(
    conn: &mut PgConnection,
    pkg: PackageId,
    index: i32,
    trigger: &Trigger,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.package_trigger \
         (package_id, trigger_index, script, prog) VALUES ($1, $2, $3, $4)",
    )
    .bind(pkg.value())
    .bind(index)
    .bind(&trigger.script)
    .bind(&trigger.prog)
    .execute(&mut *conn)
    .await?;
    for cond in &trigger.conditions {
        sqlx::query(
            "INSERT INTO symboldb.package_trigger_condition \
             (package_id, trigger_index, name, version, flags) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(pkg.value())
        .bind(index)
        .bind(&cond.name)
        .bind(&cond.version)
        .bind(cond.flags as i64)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Per-loader cache of interned attribute tuples; the database enforces
/// uniqueness across loaders.
#[derive(Default)]
pub struct AttributeCache {
    map: HashMap<(u32, u32, String, String, String), AttributeId>,
}

/// Canonical encoding hashed to key an attribute tuple:
/// mode LE32 ‖ flags LE32 ‖ user ‖ NUL ‖ group ‖ NUL ‖ capabilities.
fn attribute_hash(info: &FileInfo) -> Vec<u8> {
    let mut to_hash = Vec::with_capacity(
        8 + info.user.len() + info.group.len() + info.capabilities.len() + 2,
    );
    to_hash.extend_from_slice(&info.mode.to_le_bytes());
    to_hash.extend_from_slice(&info.flags.to_le_bytes());
    to_hash.extend_from_slice(info.user.as_bytes());
    to_hash.push(0);
    to_hash.extend_from_slice(info.group.as_bytes());
    to_hash.push(0);
    to_hash.extend_from_slice(info.capabilities.as_bytes());
    hash(HashKind::Md5, &to_hash)
}

pub async fn intern_file_attribute(
    conn: &mut PgConnection,
    cache: &mut AttributeCache,
    info: &FileInfo,
) -> Result<AttributeId> {
    let key = (
        info.mode,
        info.flags,
        info.user.clone(),
        info.group.clone(),
        info.capabilities.clone(),
    );
    if let Some(&aid) = cache.map.get(&key) {
        return Ok(aid);
    }
    let row_hash = attribute_hash(info);
    let existing =
        sqlx::query("SELECT attribute_id FROM symboldb.file_attribute WHERE hash = $1")
            .bind(&row_hash)
            .fetch_optional(&mut *conn)
            .await?;
    let aid = match existing {
        Some(row) => AttributeId(id_from_row(&row)?),
        None => {
            let inserted = sqlx::query(
                "INSERT INTO symboldb.file_attribute \
                 (hash, mode, flags, user_name, group_name, capabilities) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (hash) DO NOTHING RETURNING attribute_id",
            )
            .bind(&row_hash)
            .bind(info.mode as i32)
            .bind(info.flags as i32)
            .bind(&info.user)
            .bind(&info.group)
            .bind(&info.capabilities)
            .fetch_optional(&mut *conn)
            .await?;
            let row = match inserted {
                Some(row) => row,
                None => {
                    sqlx::query(
                        "SELECT attribute_id FROM symboldb.file_attribute WHERE hash = $1",
                    )
                    .bind(&row_hash)
                    .fetch_one(&mut *conn)
                    .await?
                }
            };
            AttributeId(id_from_row(&row)?)
        }
    };
    cache.map.insert(key, aid);
    Ok(aid)
}

/// Intern a (length, digest) contents row. Identical bytes in any
/// package share one row; analyzers attach their facts to this id.
pub async fn intern_file_contents(
    conn: &mut PgConnection,
    length: i64,
    digest: &[u8],
) -> Result<(ContentsId, bool)> {
    let existing = sqlx::query(
        "SELECT contents_id FROM symboldb.file_contents \
         WHERE length = $1 AND digest = $2",
    )
    .bind(length)
    .bind(digest)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = existing {
        return Ok((ContentsId(id_from_row(&row)?), false));
    }
    // A concurrent loader may insert the same contents between the
    // lookup and the insert; the conflict clause turns that into a
    // regular miss.
    let inserted = sqlx::query(
        "INSERT INTO symboldb.file_contents (length, digest) \
         VALUES ($1, $2) ON CONFLICT (length, digest) DO NOTHING \
         RETURNING contents_id",
    )
    .bind(length)
    .bind(digest)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok((ContentsId(id_from_row(&row)?), true));
    }
    let row = sqlx::query(
        "SELECT contents_id FROM symboldb.file_contents \
         WHERE length = $1 AND digest = $2",
    )
    .bind(length)
    .bind(digest)
    .fetch_one(conn)
    .await?;
    Ok((ContentsId(id_from_row(&row)?), false))
}

pub async fn add_file(
    conn: &mut PgConnection,
    cache: &mut AttributeCache,
    pkg: PackageId,
    info: &FileInfo,
    digest: &[u8],
    length: i64,
) -> Result<(FileId, ContentsId, bool)> {
    let aid = intern_file_attribute(conn, cache, info).await?;
    let (cid, added) = intern_file_contents(conn, length, digest).await?;
    let row = sqlx::query(
        "INSERT INTO symboldb.file \
         (package_id, name, mtime, inode, contents_id, attribute_id, normalized) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING file_id",
    )
    .bind(pkg.value())
    .bind(&info.name)
    .bind(info.mtime as i64)
    .bind(info.ino as i32)
    .bind(cid.value())
    .bind(aid.value())
    .bind(info.normalized)
    .fetch_one(conn)
    .await?;
    Ok((FileId(id_from_row(&row)?), cid, added))
}

pub async fn update_contents_preview(
    conn: &mut PgConnection,
    cid: ContentsId,
    preview: &[u8],
) -> Result<()> {
    sqlx::query("UPDATE symboldb.file_contents SET contents = $2 WHERE contents_id = $1")
        .bind(cid.value())
        .bind(preview)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn add_directory(
    conn: &mut PgConnection,
    pkg: PackageId,
    info: &FileInfo,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.directory \
         (package_id, flags, name, user_name, group_name, mtime, mode, normalized) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(pkg.value())
    .bind(info.flags as i32)
    .bind(&info.name)
    .bind(&info.user)
    .bind(&info.group)
    .bind(info.mtime as i64)
    .bind(info.mode as i64)
    .bind(info.normalized)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn add_symlink(
    conn: &mut PgConnection,
    pkg: PackageId,
    info: &FileInfo,
) -> Result<()> {
    if info.linkto.is_empty() {
        return Err(anyhow!("symlink {} with empty target", info.name));
    }
    sqlx::query(
        "INSERT INTO symboldb.symlink \
         (package_id, flags, name, target, user_name, group_name, mtime, normalized) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(pkg.value())
    .bind(info.flags as i32)
    .bind(&info.name)
    .bind(&info.linkto)
    .bind(&info.user)
    .bind(&info.group)
    .bind(info.mtime as i64)
    .bind(info.normalized)
    .execute(conn)
    .await?;
    Ok(())
}

// ELF facts.

pub async fn add_elf_image(
    conn: &mut PgConnection,
    cid: ContentsId,
    image: &ElfImage<'_>,
    soname: &str,
) -> Result<()> {
    let interp = image.interp().filter(|s| !s.is_empty());
    let build_id = image.build_id();
    sqlx::query(
        "INSERT INTO symboldb.elf_file \
         (contents_id, ei_class, ei_data, e_type, e_machine, arch, soname, \
          interp, build_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(cid.value())
    .bind(image.ei_class() as i32)
    .bind(image.ei_data() as i32)
    .bind(image.e_type() as i32)
    .bind(image.e_machine() as i32)
    .bind(image.arch())
    .bind(soname)
    .bind(interp)
    .bind(build_id)
    .execute(&mut *conn)
    .await?;

    for phdr in image.program_headers() {
        sqlx::query(
            "INSERT INTO symboldb.elf_program_header \
             (contents_id, type, file_offset, virt_addr, phys_addr, file_size, \
              memory_size, align, readable, writable, executable) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(cid.value())
        .bind(phdr.p_type as i64)
        .bind(phdr.file_offset as i64)
        .bind(phdr.virt_addr as i64)
        .bind(phdr.phys_addr as i64)
        .bind(phdr.file_size as i64)
        .bind(phdr.memory_size as i64)
        .bind(phdr.align as i64)
        .bind(phdr.readable)
        .bind(phdr.writable)
        .bind(phdr.executable)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn visibility_name(visibility: u8) -> &'static str {
    match visibility {
        1 => "internal",
        2 => "hidden",
        3 => "protected",
        _ => "default",
    }
}

pub async fn add_elf_symbol_definition(
    conn: &mut PgConnection,
    cid: ContentsId,
    def: &SymbolDefinition,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.elf_definition \
         (contents_id, name, version, primary_version, symbol_type, binding, \
          section, xsection, visibility) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(cid.value())
    .bind(&def.name)
    .bind(def.version.as_deref())
    .bind(def.default_version)
    .bind(def.sym_type as i32)
    .bind(def.binding as i32)
    .bind(def.section as i32)
    .bind(def.xsection.map(|x| x as i32))
    .bind(visibility_name(def.visibility))
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn add_elf_symbol_reference(
    conn: &mut PgConnection,
    cid: ContentsId,
    reference: &SymbolReference,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.elf_reference \
         (contents_id, name, version, symbol_type, binding, visibility) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(cid.value())
    .bind(&reference.name)
    .bind(reference.version.as_deref())
    .bind(reference.sym_type as i32)
    .bind(reference.binding as i32)
    .bind(visibility_name(reference.visibility))
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn add_elf_needed(conn: &mut PgConnection, cid: ContentsId, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO symboldb.elf_needed (contents_id, name) VALUES ($1, $2)")
        .bind(cid.value())
        .bind(name)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn add_elf_rpath(conn: &mut PgConnection, cid: ContentsId, path: &str) -> Result<()> {
    sqlx::query("INSERT INTO symboldb.elf_rpath (contents_id, path) VALUES ($1, $2)")
        .bind(cid.value())
        .bind(path)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn add_elf_runpath(conn: &mut PgConnection, cid: ContentsId, path: &str) -> Result<()> {
    sqlx::query("INSERT INTO symboldb.elf_runpath (contents_id, path) VALUES ($1, $2)")
        .bind(cid.value())
        .bind(path)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn add_elf_dynamic(
    conn: &mut PgConnection,
    cid: ContentsId,
    tag: u64,
    value: u64,
) -> Result<()> {
    sqlx::query("INSERT INTO symboldb.elf_dynamic (contents_id, tag, value) VALUES ($1, $2, $3)")
        .bind(cid.value())
        .bind(tag as i64)
        .bind(value as i64)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn add_elf_error(conn: &mut PgConnection, cid: ContentsId, message: &str) -> Result<()> {
    sqlx::query("INSERT INTO symboldb.elf_error (contents_id, message) VALUES ($1, $2)")
        .bind(cid.value())
        .bind(message)
        .execute(conn)
        .await?;
    Ok(())
}

// Java facts.

/// Intern a class (deduplicated by the SHA-256 of its bytes) and link
/// it to the contents row. Interfaces and references are only written
/// the first time the class is seen.
pub async fn add_java_class(
    conn: &mut PgConnection,
    cid: ContentsId,
    class: &JavaClass,
    class_bytes: &[u8],
) -> Result<ClassId> {
    let digest = hash(HashKind::Sha256, class_bytes);
    let existing = sqlx::query("SELECT class_id FROM symboldb.java_class WHERE hash = $1")
        .bind(&digest)
        .fetch_optional(&mut *conn)
        .await?;
    let (class_id, added) = match existing {
        Some(row) => (ClassId(id_from_row(&row)?), false),
        None => {
            let row = sqlx::query(
                "INSERT INTO symboldb.java_class \
                 (hash, name, super_class, access_flags) \
                 VALUES ($1, $2, $3, $4) RETURNING class_id",
            )
            .bind(&digest)
            .bind(&class.this_class)
            .bind(&class.super_class)
            .bind(class.access_flags as i32)
            .fetch_one(&mut *conn)
            .await?;
            (ClassId(id_from_row(&row)?), true)
        }
    };
    if added {
        for interface in &class.interfaces {
            sqlx::query("INSERT INTO symboldb.java_interface (class_id, name) VALUES ($1, $2)")
                .bind(class_id.value())
                .bind(interface)
                .execute(&mut *conn)
                .await?;
        }
        for name in &class.class_references {
            sqlx::query(
                "INSERT INTO symboldb.java_class_reference (class_id, name) VALUES ($1, $2)",
            )
            .bind(class_id.value())
            .bind(name)
            .execute(&mut *conn)
            .await?;
        }
    }
    sqlx::query(
        "INSERT INTO symboldb.java_class_contents (class_id, contents_id) \
         VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(class_id.value())
    .bind(cid.value())
    .execute(conn)
    .await?;
    Ok(class_id)
}

pub async fn add_java_error(
    conn: &mut PgConnection,
    cid: ContentsId,
    message: &str,
    path: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.java_error (contents_id, message, path) VALUES ($1, $2, $3)",
    )
    .bind(cid.value())
    .bind(message)
    .bind(path)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn add_maven_url(
    conn: &mut PgConnection,
    cid: ContentsId,
    url: &MavenUrl,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.java_maven_url (contents_id, url, type) VALUES ($1, $2, $3)",
    )
    .bind(cid.value())
    .bind(&url.url)
    .bind(url.kind.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn add_xml_error(
    conn: &mut PgConnection,
    cid: ContentsId,
    error: &XmlErrorInfo,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.xml_error (contents_id, message, line, before, after) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(cid.value())
    .bind(&error.message)
    .bind(error.line as i64)
    .bind(&error.before)
    .bind(&error.after)
    .execute(conn)
    .await?;
    Ok(())
}

// Python facts.

pub async fn add_python_analysis(
    conn: &mut PgConnection,
    cid: ContentsId,
    analysis: &PythonAnalysis,
) -> Result<()> {
    for (table, names) in [
        ("python_import", &analysis.imports),
        ("python_attribute", &analysis.attributes),
        ("python_function_def", &analysis.function_defs),
        ("python_class_def", &analysis.class_defs),
    ] {
        let stmt = format!(
            "INSERT INTO symboldb.{} (contents_id, name) VALUES ($1, $2)",
            table
        );
        for name in names {
            sqlx::query(&stmt)
                .bind(cid.value())
                .bind(name)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

pub async fn add_python_error(
    conn: &mut PgConnection,
    cid: ContentsId,
    error: &PythonErrorInfo,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO symboldb.python_error (contents_id, line, message) VALUES ($1, $2, $3)",
    )
    .bind(cid.value())
    .bind(error.line.map(|l| l as i32))
    .bind(&error.message)
    .execute(conn)
    .await?;
    Ok(())
}

// Package sets.

pub async fn create_package_set(conn: &mut PgConnection, name: &str) -> Result<PackageSetId> {
    let row = sqlx::query("INSERT INTO symboldb.package_set (name) VALUES ($1) RETURNING set_id")
        .bind(name)
        .fetch_one(conn)
        .await?;
    Ok(PackageSetId(id_from_row(&row)?))
}

pub async fn lookup_package_set(
    conn: &mut PgConnection,
    name: &str,
) -> Result<Option<PackageSetId>> {
    let row = sqlx::query("SELECT set_id FROM symboldb.package_set WHERE name = $1")
        .bind(name)
        .fetch_optional(conn)
        .await?;
    row.map(|r| Ok(PackageSetId(id_from_row(&r)?))).transpose()
}

pub async fn package_set_members(
    conn: &mut PgConnection,
    set: PackageSetId,
) -> Result<BTreeSet<PackageId>> {
    let rows =
        sqlx::query("SELECT package_id FROM symboldb.package_set_member WHERE set_id = $1")
            .bind(set.value())
            .fetch_all(conn)
            .await?;
    let mut out = BTreeSet::new();
    for row in rows {
        out.insert(PackageId(id_from_row(&row)?));
    }
    Ok(out)
}

/// Reconcile the membership of a set with `pids`. Returns true when any
/// row was added or removed.
pub async fn update_package_set(
    conn: &mut PgConnection,
    set: PackageSetId,
    pids: &BTreeSet<PackageId>,
) -> Result<bool> {
    let mut old = BTreeSet::new();
    let rows =
        sqlx::query("SELECT package_id FROM symboldb.package_set_member WHERE set_id = $1")
            .bind(set.value())
            .fetch_all(&mut *conn)
            .await?;
    for row in rows {
        old.insert(PackageId(id_from_row(&row)?));
    }

    let mut changes = false;
    for &pkg in pids {
        if !old.remove(&pkg) {
            sqlx::query(
                "INSERT INTO symboldb.package_set_member (set_id, package_id) VALUES ($1, $2)",
            )
            .bind(set.value())
            .bind(pkg.value())
            .execute(&mut *conn)
            .await?;
            changes = true;
        }
    }
    // Entries left over in `old` are no longer members.
    for pkg in old {
        sqlx::query(
            "DELETE FROM symboldb.package_set_member WHERE set_id = $1 AND package_id = $2",
        )
        .bind(set.value())
        .bind(pkg.value())
        .execute(&mut *conn)
        .await?;
        changes = true;
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_hash_canonical_encoding() {
        let info = FileInfo {
            name: "/usr/bin/x".into(),
            user: "root".into(),
            group: "wheel".into(),
            mode: 0o100755,
            mtime: 0,
            ino: 1,
            flags: 3,
            linkto: String::new(),
            capabilities: "cap_net_raw+ep".into(),
            normalized: false,
        };
        let mut expected = Vec::new();
        expected.extend_from_slice(&0o100755u32.to_le_bytes());
        expected.extend_from_slice(&3u32.to_le_bytes());
        expected.extend_from_slice(b"root\0wheel\0cap_net_raw+ep");
        assert_eq!(attribute_hash(&info), hash(HashKind::Md5, &expected));
        // The file name must not influence the attribute identity.
        let mut other = info.clone();
        other.name = "/usr/bin/y".into();
        assert_eq!(attribute_hash(&info), attribute_hash(&other));
    }

    #[test]
    fn test_visibility_names() {
        assert_eq!(visibility_name(0), "default");
        assert_eq!(visibility_name(1), "internal");
        assert_eq!(visibility_name(2), "hidden");
        assert_eq!(visibility_name(3), "protected");
    }
}
