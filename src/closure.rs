//! Shared-library closure over a package set: resolve every NEEDED
//! reference to a concrete provider, compute the transitive closure and
//! reconcile the `elf_closure` table with the new relation.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use sqlx::postgres::PgConnection;
use sqlx::Row;

use crate::db::{Database, FileId, PackageSetId};
use crate::elf::soname_from_path;

/// Reborrow an `Option<&mut dyn ConflictSink>` for a shorter lifetime
/// without moving out of the original binding.
fn reborrow_conflicts<'a>(
    conflicts: &'a mut Option<&mut dyn ConflictSink>,
) -> Option<&'a mut dyn ConflictSink> {
    match conflicts {
        Some(sink) => Some(&mut **sink),
        None => None,
    }
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub arch: String,
    pub soname: String,
    pub file: FileId,
    pub file_name: String,
    pub package_name: String,
}

#[derive(Debug, Clone)]
pub struct NeededRef {
    pub arch: String,
    pub needed: String,
    pub file: FileId,
    pub file_name: String,
}

/// Observer for unresolvable and ambiguous references. Returning true
/// from `skip_update` turns the resolver into a dry run.
pub trait ConflictSink {
    fn missing(&mut self, file: FileId, soname: &str);
    fn conflict(&mut self, file: FileId, soname: &str, choices: &[FileId]);
    fn skip_update(&self) -> bool {
        false
    }
}

/// True when both absolute paths name files in the same directory. Two
/// parent paths only compare equal when their lengths match, so
/// `/a/b/x` and `/a/bb/x` are distinct even at equal depth.
fn same_directory(left: &str, right: &str) -> bool {
    match (left.rfind('/'), right.rfind('/')) {
        (Some(l), Some(r)) => l == r && left.as_bytes()[..l] == right.as_bytes()[..r],
        _ => false,
    }
}

const LIB_PRIO: i64 = 100_000;
const DIRECTORY_PRIO: i64 = 10_000;

/// Rate how well a provider path matches the location of the needing
/// object.
fn priority(candidate: &str, needing_path: &str) -> i64 {
    let mut prio = 0;
    // The standard library directories are strongly preferred.
    if candidate.starts_with("/lib/")
        || candidate.starts_with("/lib64/")
        || candidate.starts_with("/usr/lib/")
        || candidate.starts_with("/usr/lib64/")
    {
        prio += LIB_PRIO;
    }
    if same_directory(candidate, needing_path) {
        prio += DIRECTORY_PRIO;
    }
    // Reward a shared leading path, penalise deep nesting.
    prio += 2 * candidate
        .bytes()
        .zip(needing_path.bytes())
        .take_while(|(a, b)| a == b)
        .count() as i64;
    prio -= candidate.len() as i64;
    prio
}

fn ignored_file_name(path: &str) -> bool {
    (path.starts_with("/lib/")
        && (path.starts_with("/lib/i686/nosegneg/")
            || (path.starts_with("/lib/rtkaio/")
                && (path.starts_with("/lib/rtkaio/librtkaio-")
                    || path.starts_with("/lib/rtkaio/i686/nosegneg/")))))
        || path.starts_with("/lib64/rtkaio/librtkaio-")
}

fn ignored_package_name(package: &str) -> bool {
    package == "compat-gcc-34-c++" || package == "compat-glibc"
}

type SonameMap = BTreeMap<String, Vec<Provider>>;
type ArchSonameMap = BTreeMap<String, SonameMap>;

fn build_provider_map(providers: Vec<Provider>) -> ArchSonameMap {
    let mut map = ArchSonameMap::new();
    for mut provider in providers {
        if provider.soname.is_empty() {
            provider.soname = soname_from_path(&provider.file_name).to_string();
        }
        map.entry(provider.arch.clone())
            .or_default()
            .entry(provider.soname.clone())
            .or_default()
            .push(provider);
    }
    map
}

/// Drop compatibility-package and sub-architecture providers from a
/// bucket, but only when exactly one non-flagged provider remains.
fn ignore_some_conflicts(map: &mut ArchSonameMap) {
    for sonames in map.values_mut() {
        for bucket in sonames.values_mut() {
            let flagged = bucket
                .iter()
                .filter(|p| {
                    ignored_file_name(&p.file_name) || ignored_package_name(&p.package_name)
                })
                .count();
            if flagged + 1 == bucket.len() {
                bucket.retain(|p| {
                    !ignored_file_name(&p.file_name) && !ignored_package_name(&p.package_name)
                });
            }
        }
    }
}

fn lookup(
    map: &ArchSonameMap,
    reference: &NeededRef,
    mut conflicts: Option<&mut dyn ConflictSink>,
) -> Option<FileId> {
    let providers = map
        .get(&reference.arch)
        .and_then(|sonames| sonames.get(&reference.needed));
    let providers = match providers {
        Some(p) if !p.is_empty() => p,
        _ => {
            if let Some(sink) = conflicts.as_mut() {
                sink.missing(reference.file, &reference.needed);
            }
            return None;
        }
    };
    if providers.len() == 1 {
        return Some(providers[0].file);
    }

    let mut best = &providers[0];
    let mut best_priority = priority(&best.file_name, &reference.file_name);
    for candidate in &providers[1..] {
        let prio = priority(&candidate.file_name, &reference.file_name);
        let wins = prio > best_priority
            || (prio == best_priority
                && (candidate.package_name.as_str(), candidate.file_name.as_str())
                    < (best.package_name.as_str(), best.file_name.as_str()));
        if wins {
            best = candidate;
            best_priority = prio;
        }
    }
    if let Some(sink) = conflicts.as_mut() {
        let mut choices = vec![best.file];
        choices.extend(
            providers
                .iter()
                .map(|p| p.file)
                .filter(|&fid| fid != best.file),
        );
        sink.conflict(reference.file, &reference.needed, &choices);
    }
    Some(best.file)
}

/// Resolve all direct NEEDED edges and close them transitively.
pub fn resolve_closure(
    providers: Vec<Provider>,
    needed: &[NeededRef],
    mut conflicts: Option<&mut dyn ConflictSink>,
) -> BTreeMap<FileId, BTreeSet<FileId>> {
    let mut map = build_provider_map(providers);
    ignore_some_conflicts(&mut map);

    let mut closure: BTreeMap<FileId, BTreeSet<FileId>> = BTreeMap::new();
    for reference in needed {
        if let Some(library) = lookup(&map, reference, reborrow_conflicts(&mut conflicts)) {
            closure.entry(reference.file).or_default().insert(library);
        }
    }

    // Iterate to a fixpoint. Reflexive edges appear only through real
    // cycles in the NEEDED graph.
    let mut changed = true;
    while changed {
        changed = false;
        let keys: Vec<FileId> = closure.keys().copied().collect();
        for file in keys {
            let deps: Vec<FileId> = closure[&file].iter().copied().collect();
            let mut additions = Vec::new();
            for dep in deps {
                if let Some(transitive) = closure.get(&dep) {
                    for &next in transitive {
                        if !closure[&file].contains(&next) {
                            additions.push(next);
                        }
                    }
                }
            }
            if !additions.is_empty() {
                changed = true;
                closure.entry(file).or_default().extend(additions);
            }
        }
    }
    closure
}

async fn read_providers(conn: &mut PgConnection, set: PackageSetId) -> Result<Vec<Provider>> {
    // e_type = 3 restricts providers to shared objects.
    let rows = sqlx::query(
        "SELECT COALESCE(ef.arch, ''), COALESCE(ef.soname, ''), f.file_id, f.name, p.name \
         FROM symboldb.package_set_member psm \
         JOIN symboldb.package p USING (package_id) \
         JOIN symboldb.file f USING (package_id) \
         JOIN symboldb.elf_file ef USING (contents_id) \
         WHERE psm.set_id = $1 AND ef.e_type = 3",
    )
    .bind(set.value())
    .fetch_all(conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| Provider {
            arch: row.get(0),
            soname: row.get(1),
            file: FileId(row.get(2)),
            file_name: row.get(3),
            package_name: row.get(4),
        })
        .collect())
}

async fn read_needed(conn: &mut PgConnection, set: PackageSetId) -> Result<Vec<NeededRef>> {
    let rows = sqlx::query(
        "SELECT COALESCE(ef.arch, ''), en.name, f.file_id, f.name \
         FROM symboldb.package_set_member psm \
         JOIN symboldb.file f USING (package_id) \
         JOIN symboldb.elf_file ef USING (contents_id) \
         JOIN symboldb.elf_needed en USING (contents_id) \
         WHERE psm.set_id = $1",
    )
    .bind(set.value())
    .fetch_all(conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| NeededRef {
            arch: row.get(0),
            needed: row.get(1),
            file: FileId(row.get(2)),
            file_name: row.get(3),
        })
        .collect())
}

/// Rebuild the closure table for a package set. Must run inside the
/// caller's transaction; the final table state equals the newly
/// computed relation.
pub async fn update_elf_closure(
    conn: &mut PgConnection,
    set: PackageSetId,
    mut conflicts: Option<&mut dyn ConflictSink>,
) -> Result<()> {
    let providers = read_providers(conn, set).await?;
    let needed = read_needed(conn, set).await?;
    let closure = resolve_closure(providers, &needed, reborrow_conflicts(&mut conflicts));

    if let Some(sink) = conflicts {
        if sink.skip_update() {
            return Ok(());
        }
    }

    sqlx::query(
        "CREATE TEMPORARY TABLE update_elf_closure \
         (file_id INTEGER NOT NULL, needed INTEGER NOT NULL) ON COMMIT DROP",
    )
    .execute(&mut *conn)
    .await?;

    let mut copy = conn
        .copy_in_raw("COPY update_elf_closure FROM STDIN")
        .await?;
    let mut upload = Vec::with_capacity(128 * 1024);
    for (file, deps) in &closure {
        for needed in deps {
            upload.extend_from_slice(file.value().to_string().as_bytes());
            upload.push(b'\t');
            upload.extend_from_slice(needed.value().to_string().as_bytes());
            upload.push(b'\n');
            if upload.len() > 128 * 1024 {
                copy.send(std::mem::take(&mut upload)).await?;
            }
        }
    }
    if !upload.is_empty() {
        copy.send(upload).await?;
    }
    copy.finish().await?;

    sqlx::query("CREATE INDEX ON update_elf_closure (file_id, needed)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("ANALYZE update_elf_closure")
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "DELETE FROM symboldb.elf_closure ec WHERE set_id = $1 \
         AND NOT EXISTS (SELECT 1 FROM update_elf_closure u \
         WHERE ec.file_id = u.file_id AND ec.needed = u.needed)",
    )
    .bind(set.value())
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "INSERT INTO symboldb.elf_closure (set_id, file_id, needed) \
         SELECT $1, * FROM (SELECT * FROM update_elf_closure \
         EXCEPT SELECT file_id, needed FROM symboldb.elf_closure \
         WHERE set_id = $1) x",
    )
    .bind(set.value())
    .execute(&mut *conn)
    .await?;
    sqlx::query("DROP TABLE update_elf_closure")
        .execute(conn)
        .await?;
    Ok(())
}

#[derive(Default)]
struct CollectingSink {
    missing: Vec<(FileId, String)>,
    conflicts: Vec<(FileId, String, Vec<FileId>)>,
}

impl ConflictSink for CollectingSink {
    fn missing(&mut self, file: FileId, soname: &str) {
        self.missing.push((file, soname.to_string()));
    }

    fn conflict(&mut self, file: FileId, soname: &str, choices: &[FileId]) {
        self.conflicts
            .push((file, soname.to_string(), choices.to_vec()));
    }

    fn skip_update(&self) -> bool {
        true
    }
}

/// Print `missing:` and `conflicts:` lines for a package set without
/// touching the closure table. Runs on a repeatable-read snapshot.
pub async fn print_soname_conflicts(db: &Database, set: PackageSetId) -> Result<()> {
    let mut tx = db.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;
    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await?;
    let mut sink = CollectingSink::default();
    update_elf_closure(&mut tx, set, Some(&mut sink)).await?;

    let mut names: BTreeMap<FileId, (String, String)> = BTreeMap::new();
    for fid in sink
        .missing
        .iter()
        .map(|(fid, _)| *fid)
        .chain(sink.conflicts.iter().flat_map(|(fid, _, choices)| {
            std::iter::once(*fid).chain(choices.iter().copied())
        }))
    {
        if names.contains_key(&fid) {
            continue;
        }
        let row = sqlx::query(
            "SELECT f.name, p.name, p.epoch, p.version, p.release, p.arch \
             FROM symboldb.file f JOIN symboldb.package p USING (package_id) \
             WHERE f.file_id = $1",
        )
        .bind(fid.value())
        .fetch_one(&mut *tx)
        .await?;
        let file_name: String = row.get(0);
        let epoch: Option<i32> = row.get(2);
        let nevra = match epoch {
            Some(e) => format!(
                "{}-{}:{}-{}.{}",
                row.get::<String, _>(1),
                e,
                row.get::<String, _>(3),
                row.get::<String, _>(4),
                row.get::<String, _>(5)
            ),
            None => format!(
                "{}-{}-{}.{}",
                row.get::<String, _>(1),
                row.get::<String, _>(3),
                row.get::<String, _>(4),
                row.get::<String, _>(5)
            ),
        };
        names.insert(fid, (file_name, nevra));
    }
    tx.rollback().await?;

    for (fid, soname) in &sink.missing {
        let (file, nevra) = &names[fid];
        println!("missing: {} ({}) {}", file, nevra, soname);
    }
    for (fid, soname, choices) in &sink.conflicts {
        let (file, nevra) = &names[fid];
        println!("conflicts: {} ({}) {}", file, nevra, soname);
        let mut marker = "*";
        for choice in choices {
            let (file, nevra) = &names[choice];
            println!("  {} {} ({})", marker, file, nevra);
            marker = " ";
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(soname: &str, file: i32, file_name: &str, package: &str) -> Provider {
        Provider {
            arch: "x86_64".into(),
            soname: soname.into(),
            file: FileId(file),
            file_name: file_name.into(),
            package_name: package.into(),
        }
    }

    fn needs(needed: &str, file: i32, file_name: &str) -> NeededRef {
        NeededRef {
            arch: "x86_64".into(),
            needed: needed.into(),
            file: FileId(file),
            file_name: file_name.into(),
        }
    }

    #[test]
    fn test_same_directory_quirk() {
        assert!(same_directory("/usr/lib64/a.so", "/usr/lib64/b"));
        assert!(!same_directory("/a/b/x", "/a/bb/x"));
        assert!(!same_directory("noslash", "/a/x"));
    }

    #[test]
    fn test_priority_prefers_lib_dirs() {
        let lib = priority("/usr/lib64/libc.so.6", "/usr/bin/ls");
        let opt = priority("/opt/compat/libc.so.6", "/usr/bin/ls");
        assert!(lib > opt);
    }

    #[test]
    fn test_priority_same_directory_and_length() {
        let near = priority("/opt/app/lib/libx.so", "/opt/app/lib/prog");
        let far = priority("/opt/other/libx.so", "/opt/app/lib/prog");
        assert!(near > far);
        // Deep nesting costs.
        assert!(
            priority("/usr/lib64/libz.so", "/usr/bin/p")
                > priority("/usr/lib64/sub/dir/libz.so", "/usr/bin/p")
        );
    }

    #[test]
    fn test_single_provider_wins_without_conflict() {
        let mut sink = CollectingSink::default();
        let closure = resolve_closure(
            vec![provider("libz.so.1", 10, "/usr/lib64/libz.so.1", "zlib")],
            &[needs("libz.so.1", 1, "/usr/bin/unzip")],
            Some(&mut sink),
        );
        assert_eq!(closure[&FileId(1)], BTreeSet::from([FileId(10)]));
        assert!(sink.conflicts.is_empty());
        assert!(sink.missing.is_empty());
    }

    #[test]
    fn test_missing_reported() {
        let mut sink = CollectingSink::default();
        let closure = resolve_closure(
            Vec::new(),
            &[needs("libgone.so", 1, "/usr/bin/x")],
            Some(&mut sink),
        );
        assert!(closure.is_empty());
        assert_eq!(sink.missing, vec![(FileId(1), "libgone.so".to_string())]);
    }

    #[test]
    fn test_conflict_priority_and_tie_break() {
        let mut sink = CollectingSink::default();
        let closure = resolve_closure(
            vec![
                provider("libfoo.so.1", 10, "/usr/lib64/libfoo.so.1", "foo"),
                provider("libfoo.so.1", 11, "/opt/vendor/libfoo.so.1", "foo-vendor"),
            ],
            &[needs("libfoo.so.1", 1, "/usr/bin/tool")],
            Some(&mut sink),
        );
        assert_eq!(closure[&FileId(1)], BTreeSet::from([FileId(10)]));
        assert_eq!(sink.conflicts.len(), 1);
        assert_eq!(sink.conflicts[0].2, vec![FileId(10), FileId(11)]);

        // Equal priority: the lexicographically smaller package wins.
        let mut sink = CollectingSink::default();
        let closure = resolve_closure(
            vec![
                provider("libbar.so", 21, "/usr/lib64/libbar.so", "pkg-b"),
                provider("libbar.so", 20, "/usr/lib64/libbar.so", "pkg-a"),
            ],
            &[needs("libbar.so", 2, "/usr/bin/tool")],
            Some(&mut sink),
        );
        assert_eq!(closure[&FileId(2)], BTreeSet::from([FileId(20)]));
    }

    #[test]
    fn test_arch_separation() {
        let mut providers = vec![provider("libc.so.6", 10, "/lib64/libc.so.6", "glibc")];
        providers[0].arch = "i386".into();
        let closure = resolve_closure(
            providers,
            &[needs("libc.so.6", 1, "/usr/bin/tool")],
            None,
        );
        assert!(closure.is_empty());
    }

    #[test]
    fn test_synthesized_soname() {
        // A provider without DT_SONAME is addressable by its basename.
        let closure = resolve_closure(
            vec![provider("", 10, "/usr/lib64/libplugin.so", "plugin")],
            &[needs("libplugin.so", 1, "/usr/bin/host")],
            None,
        );
        assert_eq!(closure[&FileId(1)], BTreeSet::from([FileId(10)]));
    }

    #[test]
    fn test_suppression_of_compat_providers() {
        let mut sink = CollectingSink::default();
        let closure = resolve_closure(
            vec![
                provider("libc.so.6", 10, "/lib64/libc.so.6", "glibc"),
                provider("libc.so.6", 11, "/lib64/libc.so.6", "compat-glibc"),
            ],
            &[needs("libc.so.6", 1, "/usr/bin/tool")],
            Some(&mut sink),
        );
        assert_eq!(closure[&FileId(1)], BTreeSet::from([FileId(10)]));
        // The suppressed bucket has one provider left: no conflict.
        assert!(sink.conflicts.is_empty());
    }

    #[test]
    fn test_suppression_requires_single_survivor() {
        let mut sink = CollectingSink::default();
        resolve_closure(
            vec![
                provider("libm.so.6", 10, "/lib64/libm.so.6", "glibc"),
                provider("libm.so.6", 11, "/opt/libm.so.6", "othermath"),
                provider("libm.so.6", 12, "/lib/i686/nosegneg/libm.so.6", "glibc"),
            ],
            &[needs("libm.so.6", 1, "/usr/bin/tool")],
            Some(&mut sink),
        );
        // Two non-flagged providers remain, so nothing is suppressed
        // and the conflict covers all three.
        assert_eq!(sink.conflicts.len(), 1);
        assert_eq!(sink.conflicts[0].2.len(), 3);
    }

    #[test]
    fn test_transitive_closure_and_cycles() {
        let providers = vec![
            provider("liba.so", 10, "/usr/lib64/liba.so", "a"),
            provider("libb.so", 11, "/usr/lib64/libb.so", "b"),
            provider("libc.so", 12, "/usr/lib64/libc.so", "c"),
        ];
        let needed = vec![
            needs("liba.so", 1, "/usr/bin/prog"),
            needs("libb.so", 10, "/usr/lib64/liba.so"),
            needs("libc.so", 11, "/usr/lib64/libb.so"),
        ];
        let closure = resolve_closure(providers.clone(), &needed, None);
        assert_eq!(
            closure[&FileId(1)],
            BTreeSet::from([FileId(10), FileId(11), FileId(12)])
        );
        // No reflexive edges without a cycle.
        assert!(!closure[&FileId(10)].contains(&FileId(10)));

        // A two-node cycle produces reflexive edges through the cycle.
        let needed = vec![
            needs("libb.so", 10, "/usr/lib64/liba.so"),
            needs("liba.so", 11, "/usr/lib64/libb.so"),
        ];
        let closure = resolve_closure(providers, &needed, None);
        assert!(closure[&FileId(10)].contains(&FileId(10)));
        assert!(closure[&FileId(11)].contains(&FileId(11)));
    }
}
