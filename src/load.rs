//! Package ingestion: stream an RPM archive into the catalogue inside a
//! single transaction. Analyzer failures are recorded per file and do
//! not abort the package; archive-level failures roll everything back.

use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use memmap2::Mmap;
use sqlx::postgres::PgConnection;

use crate::base16;
use crate::checksum::{hash, HashKind, HashSink};
use crate::db::{self, ops, ContentsId, Database, PackageId};
use crate::elf::{self, DynamicEntry, ElfImage, Symbol};
use crate::java_class;
use crate::maven_url;
use crate::python_analyzer;
use crate::rpm::{FileEntry, RpmArchive};
use crate::stream::{copy, SliceSource, TeeSink};

/// Files larger than this never get a stored preview.
const PREVIEW_LIMIT: usize = 64 * 1024;
const PREVIEW_BYTES: usize = 1024;

const ELF_MAGIC: &[u8] = &[0x7f, 0x45, 0x4c, 0x46];

/// Load one package archive. Loading the same archive twice is a no-op
/// returning the existing id.
pub async fn rpm_load(db: &Database, path: &Path) -> Result<PackageId> {
    let mut archive =
        RpmArchive::open(path).with_context(|| format!("opening {}", path.display()))?;
    let info = archive.package_info().clone();
    let hash_bytes = base16::decode(&info.hash)
        .with_context(|| format!("malformed header hash in {}", path.display()))?;

    let mut tx = db.begin_no_sync().await?;
    // Prevents two workers from ingesting the same package at once; the
    // lock dies with the transaction.
    db::xact_lock_digest(&mut tx, &hash_bytes).await?;

    let (pkg, added) = ops::intern_package(&mut tx, &info).await?;
    if !added {
        info!("skipping {} from {}", info.nevra(), path.display());
    } else {
        info!("loading {} from {}", info.nevra(), path.display());
        load_package_body(&mut tx, pkg, &mut archive).await?;
    }

    // The full-archive digests are recorded even for a package that was
    // already present, since older loads may predate one of the
    // algorithms.
    let file = std::fs::File::open(path)?;
    let map = unsafe { Mmap::map(&file)? };
    let mut sha256 = HashSink::new(HashKind::Sha256);
    let mut sha1 = HashSink::new(HashKind::Sha1);
    {
        let mut tee = TeeSink::new(&mut sha256, &mut sha1);
        let mut source = SliceSource::new(&map);
        copy(&mut source, &mut tee)?;
    }
    let length = map.len() as i64;
    ops::add_package_digest(&mut tx, pkg, &sha256.finalize(), length).await?;
    ops::add_package_digest(&mut tx, pkg, &sha1.finalize(), length).await?;

    tx.commit().await?;
    Ok(pkg)
}

async fn load_package_body(
    conn: &mut PgConnection,
    pkg: PackageId,
    archive: &mut RpmArchive,
) -> Result<()> {
    for dep in archive.dependencies()? {
        ops::add_package_dependency(conn, pkg, &dep).await?;
    }
    for script in archive.scripts() {
        ops::add_package_script(conn, pkg, &script).await?;
    }
    for (index, trigger) in archive.triggers()?.iter().enumerate() {
        ops::add_package_trigger(conn, pkg, index as i32, trigger).await?;
    }
    if let Some(url) = archive.package_info().url.clone() {
        ops::add_package_url(conn, pkg, &url).await?;
    }

    let mut attributes = ops::AttributeCache::default();
    while let Some(entry) = archive.read_file()? {
        let info = &entry.info;
        debug!(
            "{} {} {} {} {} 0{:o} {}",
            archive.nevra(),
            info.name,
            info.user,
            info.group,
            info.mtime,
            info.mode,
            entry.contents.len()
        );
        if info.is_directory() {
            ops::add_directory(conn, pkg, info).await?;
            continue;
        }
        if info.is_symlink() {
            ops::add_symlink(conn, pkg, info).await?;
            continue;
        }

        let digest = hash(HashKind::Sha256, &entry.contents);
        let (_fid, cid, added) = ops::add_file(
            conn,
            &mut attributes,
            pkg,
            info,
            &digest,
            entry.contents.len() as i64,
        )
        .await?;
        if added {
            analyze_file(conn, cid, &entry).await?;
        }
    }
    Ok(())
}

/// Classify freshly interned contents and run the matching analyzer.
/// Per-file analyzer failures become `*_error` rows.
async fn analyze_file(
    conn: &mut PgConnection,
    cid: ContentsId,
    entry: &FileEntry,
) -> Result<()> {
    let data = &entry.contents;
    let name = &entry.info.name;
    if data.len() > 4 && data.starts_with(ELF_MAGIC) {
        if let Err(e) = analyze_elf(conn, cid, entry).await? {
            debug!("{}: ELF error: {}", name, e);
            ops::add_elf_error(conn, cid, &e.to_string()).await?;
        }
        return Ok(());
    }
    if java_class::looks_like_class(data) {
        match java_class::parse(data) {
            Ok(class) => {
                ops::add_java_class(conn, cid, &class, data).await?;
            }
            Err(e) => ops::add_java_error(conn, cid, &e.to_string(), name).await?,
        }
        return Ok(());
    }
    if maven_url::looks_like_xml(data) {
        match maven_url::scan_pom(data) {
            Ok(urls) => {
                for url in &urls {
                    ops::add_maven_url(conn, cid, url).await?;
                }
            }
            Err(e) => ops::add_xml_error(conn, cid, &e).await?,
        }
    } else if python_analyzer::looks_like_python(name, data) {
        match python_analyzer::analyze(data) {
            Ok(analysis) => ops::add_python_analysis(conn, cid, &analysis).await?,
            Err(e) => ops::add_python_error(conn, cid, &e).await?,
        }
    }
    if let Some(preview) = text_preview(data) {
        ops::update_contents_preview(conn, cid, preview).await?;
    }
    Ok(())
}

/// The outer Result carries database failures, the inner one analyzer
/// failures that only concern this file.
async fn analyze_elf(
    conn: &mut PgConnection,
    cid: ContentsId,
    entry: &FileEntry,
) -> Result<Result<(), elf::ElfError>> {
    let image = match ElfImage::parse(&entry.contents) {
        Ok(image) => image,
        Err(e) => return Ok(Err(e)),
    };
    let symbols = match image.symbols() {
        Ok(symbols) => symbols,
        Err(e) => return Ok(Err(e)),
    };
    for symbol in &symbols {
        match symbol {
            Symbol::Definition(def) if !def.name.is_empty() => {
                ops::add_elf_symbol_definition(conn, cid, def).await?;
            }
            Symbol::Reference(reference) if !reference.name.is_empty() => {
                ops::add_elf_symbol_reference(conn, cid, reference).await?;
            }
            _ => {}
        }
    }

    let mut soname: Option<String> = None;
    for dyn_entry in image.dynamic_entries() {
        match dyn_entry {
            DynamicEntry::Needed(name) => ops::add_elf_needed(conn, cid, &name).await?,
            DynamicEntry::Soname(value) => match &soname {
                None => soname = Some(value),
                // The dynamic linker honours only the first soname;
                // keep a record of differing extras.
                Some(first) if *first != value => {
                    let message = format!(
                        "duplicate soname ignored: {}, previous soname: {}",
                        value, first
                    );
                    ops::add_elf_error(conn, cid, &message).await?;
                }
                Some(_) => {}
            },
            DynamicEntry::Rpath(path) => ops::add_elf_rpath(conn, cid, &path).await?,
            DynamicEntry::Runpath(path) => ops::add_elf_runpath(conn, cid, &path).await?,
            DynamicEntry::Other { tag, value } => {
                ops::add_elf_dynamic(conn, cid, tag, value).await?
            }
        }
    }
    let soname = match soname {
        Some(soname) => soname,
        None => elf::soname_from_path(&entry.info.name).to_string(),
    };
    ops::add_elf_image(conn, cid, &image, &soname).await?;
    Ok(Ok(()))
}

fn text_preview(data: &[u8]) -> Option<&[u8]> {
    if data.is_empty() || data.len() > PREVIEW_LIMIT || data.contains(&0) {
        return None;
    }
    Some(&data[..data.len().min(PREVIEW_BYTES)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_preview() {
        assert_eq!(text_preview(b"short text"), Some(&b"short text"[..]));
        assert_eq!(text_preview(b""), None);
        assert_eq!(text_preview(b"bin\x00ary"), None);
        let long = vec![b'a'; PREVIEW_LIMIT + 1];
        assert_eq!(text_preview(&long), None);
        let medium = vec![b'a'; 4096];
        assert_eq!(text_preview(&medium).unwrap().len(), PREVIEW_BYTES);
    }

    #[test]
    fn test_elf_magic_guard() {
        assert!(b"\x7fELF\x02\x01\x01".starts_with(ELF_MAGIC));
        assert!(!b"\x7fELB".starts_with(ELF_MAGIC));
    }
}
