//! Repository synchronisation: index remote repositories, consolidate
//! to the newest build of each package, download what the catalogue
//! does not yet know and optionally load it into a package set.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_queue::SegQueue;
use futures::stream::{self, StreamExt};
use log::{error, info};
use regex::Regex;

use crate::checksum::Checksum;
use crate::closure;
use crate::db::{self, ops, Database, PackageId, PackageSetId};
use crate::download::{CacheMode, DownloadOptions, Downloader};
use crate::filecache::FileCache;
use crate::load::rpm_load;
use crate::repomd::{Primary, PrimaryPackage, RepoMd};
use crate::vercmp::Evr;

const DOWNLOAD_CONCURRENCY: usize = 4;
const DOWNLOAD_ITERATIONS: u32 = 3;

#[derive(Debug)]
pub struct SyncOptions {
    pub cache_dir: PathBuf,
    pub no_net: bool,
    pub exclude_name: Option<Regex>,
    pub set_name: Option<String>,
    pub ignore_download_errors: bool,
}

#[derive(Debug, Clone)]
pub struct RpmUrl {
    pub name: String,
    pub href: String,
    pub checksum: Checksum,
}

/// Keeps, per package name and architecture, the candidate with the
/// largest epoch/version/release.
#[derive(Default)]
pub struct PackageSetConsolidator {
    entries: HashMap<(String, String), (Evr, RpmUrl)>,
}

impl PackageSetConsolidator {
    pub fn add(&mut self, package: &PrimaryPackage, url: RpmUrl) {
        let key = (package.name.clone(), package.arch.clone());
        let evr = Evr::new(package.epoch, &package.version, &package.release);
        match self.entries.get_mut(&key) {
            Some((existing, slot)) => {
                if evr > *existing {
                    *existing = evr;
                    *slot = url;
                }
            }
            None => {
                self.entries.insert(key, (evr, url));
            }
        }
    }

    pub fn values(self) -> Vec<RpmUrl> {
        let mut out: Vec<RpmUrl> = self.entries.into_values().map(|(_, url)| url).collect();
        out.sort_by(|a, b| a.href.cmp(&b.href));
        out
    }
}

/// Index the given repositories and download (and optionally load) the
/// consolidated package set.
pub async fn download_repo(
    db: &Database,
    opts: &SyncOptions,
    base_urls: &[String],
    load: bool,
) -> Result<()> {
    let set = match (&opts.set_name, load) {
        (Some(name), true) => {
            let mut conn = db.pool().acquire().await?;
            Some(
                ops::lookup_package_set(&mut conn, name)
                    .await?
                    .ok_or_else(|| anyhow!("unknown package set: {}", name))?,
            )
        }
        _ => None,
    };

    let downloader = Downloader::new(db)?;
    let mut consolidator = PackageSetConsolidator::default();
    for base_url in base_urls {
        info!("processing repository {}", base_url);
        let index_opts = DownloadOptions {
            cache_mode: if opts.no_net {
                CacheMode::OnlyCache
            } else {
                CacheMode::CheckCache
            },
        };
        let repomd = RepoMd::acquire(&downloader, &index_opts, base_url).await?;
        let primary = Primary::acquire(&downloader, &repomd, opts.no_net).await?;
        for package in primary {
            let package = package?;
            let url = RpmUrl {
                name: package.name.clone(),
                href: repomd.resolve(&package.href),
                checksum: package.checksum.clone(),
            };
            consolidator.add(&package, url);
        }
    }

    let mut urls = consolidator.values();
    info!("{} packages in download set", urls.len());

    if let Some(exclude) = &opts.exclude_name {
        let before = urls.len();
        urls.retain(|u| !exclude.is_match(&u.name));
        info!(
            "package name filter excluded {} packages",
            before - urls.len()
        );
    }

    let mut pids: BTreeSet<PackageId> = BTreeSet::new();
    {
        let mut conn = db.pool().acquire().await?;
        let mut remaining = Vec::with_capacity(urls.len());
        for url in urls {
            match ops::package_by_digest(&mut conn, &url.checksum.value).await? {
                Some(pid) => {
                    pids.insert(pid);
                }
                None => remaining.push(url),
            }
        }
        urls = remaining;
    }
    info!(
        "{} packages to download after database comparison",
        urls.len()
    );

    let cache = FileCache::open(&opts.cache_dir)
        .with_context(|| format!("opening cache {}", opts.cache_dir.display()))?;
    let start_count = urls.len();
    let download_count = SegQueue::new();
    for _iteration in 0..DOWNLOAD_ITERATIONS {
        if urls.is_empty() {
            break;
        }
        let results: Vec<(RpmUrl, Result<Option<PackageId>>)> =
            stream::iter(urls.into_iter().map(|url| {
                let downloader = &downloader;
                let cache = &cache;
                let download_count = &download_count;
                async move {
                    let result =
                        fetch_one(db, downloader, cache, &url, load, download_count).await;
                    (url, result)
                }
            }))
            .buffer_unordered(DOWNLOAD_CONCURRENCY)
            .collect()
            .await;

        let mut failed = Vec::new();
        for (url, result) in results {
            match result {
                Ok(Some(pid)) => {
                    pids.insert(pid);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("{}: {:#}", url.href, e);
                    failed.push(url);
                }
            }
        }
        urls = failed;
    }
    info!(
        "downloaded {} of {} packages",
        download_count.len(),
        start_count
    );

    if !urls.is_empty() {
        error!("{} packages failed download:", urls.len());
        for url in &urls {
            error!("  {}", url.href);
        }
        if !opts.ignore_download_errors {
            bail!("{} packages failed to download", urls.len());
        }
    }

    if let Some(set) = set {
        finalize_package_set(db, set, &pids).await?;
    }
    Ok(())
}

/// Fetch one package into the file cache (serialised per digest via an
/// advisory lock) and load it when requested. Returns the loaded
/// package id, or None when only downloading.
async fn fetch_one(
    db: &Database,
    downloader: &Downloader<'_>,
    cache: &FileCache,
    url: &RpmUrl,
    load: bool,
    download_count: &SegQueue<String>,
) -> Result<Option<PackageId>> {
    let lock = db.session_lock_digest(&url.checksum.value).await?;
    let path = match cache.lookup_path(&url.checksum) {
        Some(path) => path,
        None => {
            match url.checksum.length {
                Some(length) => info!("downloading {} ({} bytes)", url.href, length),
                None => info!("downloading {}", url.href),
            }
            let mut sink = cache.add_sink(&url.checksum)?;
            downloader.fetch_to_sink(&url.href, &mut sink).await?;
            let path = sink.finish()?;
            download_count.push(url.href.clone());
            path
        }
    };
    let pid = if load {
        Some(rpm_load(db, &path).await?)
    } else {
        None
    };
    lock.release().await?;
    Ok(pid)
}

/// Atomically replace the membership of a set and rebuild its ELF
/// closure when anything changed.
pub async fn finalize_package_set(
    db: &Database,
    set: PackageSetId,
    pids: &BTreeSet<PackageId>,
) -> Result<()> {
    let mut tx = db.begin().await?;
    db::xact_lock(&mut tx, db::PACKAGE_SET_LOCK_TAG, set.value()).await?;
    if ops::update_package_set(&mut tx, set, pids).await? {
        info!("updating package set caches");
        closure::update_elf_closure(&mut tx, set, None).await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::HashKind;

    fn package(name: &str, epoch: Option<i32>, version: &str, release: &str) -> PrimaryPackage {
        PrimaryPackage {
            name: name.into(),
            epoch,
            version: version.into(),
            release: release.into(),
            arch: "x86_64".into(),
            source_rpm: format!("{}-src.rpm", name),
            checksum: Checksum {
                kind: HashKind::Sha256,
                length: Some(1),
                value: vec![0; 32],
            },
            href: format!("Packages/{}-{}-{}.rpm", name, version, release),
        }
    }

    fn url_for(p: &PrimaryPackage) -> RpmUrl {
        RpmUrl {
            name: p.name.clone(),
            href: p.href.clone(),
            checksum: p.checksum.clone(),
        }
    }

    #[test]
    fn test_consolidator_keeps_largest_evr() {
        let mut consolidator = PackageSetConsolidator::default();
        let old = package("bash", Some(0), "4.2", "1.fc18");
        let new = package("bash", Some(0), "4.2", "2.fc18");
        let unrelated = package("zlib", None, "1.2.7", "1.fc18");
        consolidator.add(&old, url_for(&old));
        consolidator.add(&new, url_for(&new));
        consolidator.add(&unrelated, url_for(&unrelated));
        let urls = consolidator.values();
        assert_eq!(urls.len(), 2);
        assert!(urls.iter().any(|u| u.href.contains("4.2-2.fc18")));
        assert!(!urls.iter().any(|u| u.href.contains("4.2-1.fc18")));
    }

    #[test]
    fn test_consolidator_missing_epoch_is_smallest() {
        let mut consolidator = PackageSetConsolidator::default();
        let without = package("bash", None, "9.9", "1");
        let with = package("bash", Some(0), "0.1", "1");
        consolidator.add(&without, url_for(&without));
        consolidator.add(&with, url_for(&with));
        let urls = consolidator.values();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].href.contains("0.1"));
    }

    #[test]
    fn test_consolidator_insertion_order_independent() {
        for order in [[0usize, 1], [1, 0]] {
            let packages = [
                package("bash", Some(0), "4.2", "1"),
                package("bash", Some(0), "4.10", "1"),
            ];
            let mut consolidator = PackageSetConsolidator::default();
            for &i in &order {
                consolidator.add(&packages[i], url_for(&packages[i]));
            }
            let urls = consolidator.values();
            assert_eq!(urls.len(), 1);
            assert!(urls[0].href.contains("4.10"), "order {:?}", order);
        }
    }

    #[test]
    fn test_consolidator_separates_architectures() {
        let mut consolidator = PackageSetConsolidator::default();
        let amd = package("bash", Some(0), "4.2", "1");
        let mut arm = package("bash", Some(0), "4.2", "1");
        arm.arch = "armv7hl".into();
        arm.href = "Packages/bash.armv7hl.rpm".into();
        consolidator.add(&amd, url_for(&amd));
        consolidator.add(&arm, url_for(&arm));
        assert_eq!(consolidator.values().len(), 2);
    }
}
