//! Repository metadata: the `repomd.xml` index and the `primary.xml`
//! package manifest it points at.

use serde::Deserialize;
use thiserror::Error;

use crate::checksum::{Checksum, ChecksumError};
use crate::download::{CacheMode, DownloadError, DownloadOptions, Downloader};
use crate::stream::{read_all, GunzipSource, SliceSource};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("malformed repository metadata: {0}")]
    Parse(String),
    #[error("empty document")]
    Empty,
    #[error("{0} element missing from data element")]
    MissingDataElement(&'static str),
    #[error("size element malformed")]
    MalformedSize,
    #[error("malformed checksum: {0}")]
    Checksum(#[from] ChecksumError),
    #[error("invalid package type: {0}")]
    InvalidPackageType(String),
    #[error("missing {element} element in package: {package}")]
    MissingPackageElement {
        element: &'static str,
        package: String,
    },
    #[error("repository has no primary.xml.gz entry")]
    NoPrimary,
    #[error("decompressing primary.xml: {0}")]
    Decompress(String),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

// Wire format of repomd.xml.

#[derive(Debug, Deserialize)]
struct RepoMdXml {
    revision: Option<String>,
    #[serde(rename = "data", default)]
    data: Vec<DataXml>,
}

#[derive(Debug, Deserialize)]
struct DataXml {
    #[serde(rename = "type")]
    data_type: Option<String>,
    location: Option<LocationXml>,
    checksum: Option<ChecksumXml>,
    #[serde(rename = "open-checksum")]
    open_checksum: Option<ChecksumXml>,
    size: Option<String>,
    #[serde(rename = "open-size")]
    open_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocationXml {
    href: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChecksumXml {
    #[serde(rename = "type")]
    checksum_type: Option<String>,
    #[serde(rename = "$value")]
    value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RepoMdEntry {
    pub entry_type: String,
    pub href: String,
    pub checksum: Checksum,
    pub open_checksum: Option<Checksum>,
}

#[derive(Debug)]
pub struct RepoMd {
    pub base_url: String,
    pub revision: String,
    pub entries: Vec<RepoMdEntry>,
}

fn parse_size(text: Option<&String>) -> Result<Option<u64>, RepoError> {
    match text {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| RepoError::MalformedSize),
    }
}

fn parse_checksum(raw: &ChecksumXml, length: Option<u64>) -> Result<Checksum, RepoError> {
    let kind = raw
        .checksum_type
        .as_deref()
        .ok_or(RepoError::MissingDataElement("checksum type"))?;
    let value = raw.value.as_deref().unwrap_or("");
    Ok(Checksum::from_hex(kind, length, value)?)
}

impl RepoMd {
    /// Fetch and parse `<base_url>/repodata/repomd.xml`.
    pub async fn acquire(
        downloader: &Downloader<'_>,
        opts: &DownloadOptions,
        url: &str,
    ) -> Result<RepoMd, RepoError> {
        let mut base = url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let mdurl = format!("{}repodata/repomd.xml", base);
        let data = downloader.fetch(opts, &mdurl).await?;
        if data.is_empty() {
            return Err(RepoError::Empty);
        }
        RepoMd::parse(base, &data)
    }

    pub fn parse(base_url: String, data: &[u8]) -> Result<RepoMd, RepoError> {
        let raw: RepoMdXml =
            serde_xml_rs::from_reader(data).map_err(|e| RepoError::Parse(e.to_string()))?;
        let mut entries = Vec::with_capacity(raw.data.len());
        for data in raw.data {
            let entry_type = data
                .data_type
                .ok_or(RepoError::MissingDataElement("type"))?;
            let href = data
                .location
                .and_then(|l| l.href)
                .filter(|h| !h.is_empty())
                .ok_or(RepoError::MissingDataElement("location"))?;
            let checksum_raw = data
                .checksum
                .as_ref()
                .ok_or(RepoError::MissingDataElement("checksum"))?;
            let size = parse_size(data.size.as_ref())?;
            let checksum = parse_checksum(checksum_raw, size)?;
            let open_checksum = match data.open_checksum.as_ref() {
                Some(raw) => Some(parse_checksum(raw, parse_size(data.open_size.as_ref())?)?),
                None => None,
            };
            entries.push(RepoMdEntry {
                entry_type,
                href,
                checksum,
                open_checksum,
            });
        }
        Ok(RepoMd {
            base_url,
            revision: raw.revision.unwrap_or_default(),
            entries,
        })
    }

    pub fn entry(&self, entry_type: &str) -> Option<&RepoMdEntry> {
        self.entries.iter().find(|e| e.entry_type == entry_type)
    }

    /// Absolute URL for a repository-relative href.
    pub fn resolve(&self, href: &str) -> String {
        format!("{}{}", self.base_url, href)
    }
}

// Wire format of primary.xml.

#[derive(Debug, Deserialize)]
struct MetadataXml {
    #[serde(rename = "package", default)]
    packages: Vec<PackageXml>,
}

#[derive(Debug, Deserialize)]
struct PackageXml {
    #[serde(rename = "type")]
    package_type: Option<String>,
    name: Option<String>,
    arch: Option<String>,
    version: Option<VersionXml>,
    checksum: Option<ChecksumXml>,
    size: Option<PackageSizeXml>,
    location: Option<LocationXml>,
    format: Option<FormatXml>,
}

#[derive(Debug, Deserialize)]
struct VersionXml {
    epoch: Option<String>,
    ver: Option<String>,
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PackageSizeXml {
    package: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FormatXml {
    #[serde(rename = "sourcerpm")]
    source_rpm: Option<String>,
}

/// One `<package type="rpm">` record from primary.xml.
#[derive(Debug, Clone)]
pub struct PrimaryPackage {
    pub name: String,
    pub epoch: Option<i32>,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub source_rpm: String,
    pub checksum: Checksum,
    pub href: String,
}

/// Iterator over the packages of a primary.xml document, yielding them
/// in document order with per-package validation.
pub struct Primary {
    packages: std::vec::IntoIter<PackageXml>,
}

impl Primary {
    pub fn from_xml(data: &[u8]) -> Result<Primary, RepoError> {
        let raw: MetadataXml =
            serde_xml_rs::from_reader(data).map_err(|e| RepoError::Parse(e.to_string()))?;
        Ok(Primary {
            packages: raw.packages.into_iter(),
        })
    }

    pub fn from_gz(data: &[u8]) -> Result<Primary, RepoError> {
        let mut source = SliceSource::new(data);
        let mut gunzip = GunzipSource::new(&mut source);
        let xml = read_all(&mut gunzip).map_err(|e| RepoError::Decompress(e.to_string()))?;
        Primary::from_xml(&xml)
    }

    /// Locate the primary entry of a repository (type `primary`, href
    /// ending in `.xml.gz`), fetch and decompress it.
    pub async fn acquire(
        downloader: &Downloader<'_>,
        repomd: &RepoMd,
        no_net: bool,
    ) -> Result<Primary, RepoError> {
        let entry = repomd
            .entries
            .iter()
            .find(|e| e.entry_type == "primary" && e.href.ends_with(".xml.gz"))
            .ok_or(RepoError::NoPrimary)?;
        let opts = DownloadOptions {
            cache_mode: if no_net {
                CacheMode::OnlyCache
            } else {
                CacheMode::AlwaysCache
            },
        };
        let data = downloader.fetch(&opts, &repomd.resolve(&entry.href)).await?;
        Primary::from_gz(&data)
    }
}

fn validate_package(raw: PackageXml) -> Result<PrimaryPackage, RepoError> {
    let package_type = raw.package_type.as_deref().unwrap_or_default();
    if package_type != "rpm" {
        return Err(RepoError::InvalidPackageType(package_type.to_string()));
    }
    let name = raw
        .name
        .filter(|n| !n.is_empty())
        .ok_or(RepoError::MissingPackageElement {
            element: "<name>",
            package: String::new(),
        })?;
    let missing = |element: &'static str| RepoError::MissingPackageElement {
        element,
        package: name.clone(),
    };

    let version = raw.version.ok_or_else(|| missing("<version>"))?;
    let ver = version
        .ver
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("<version>"))?;
    let rel = version
        .rel
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("<version>"))?;
    let epoch = match version.epoch.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw_epoch) => Some(
            raw_epoch
                .parse::<i32>()
                .map_err(|_| missing("<version>"))?,
        ),
    };
    let arch = raw
        .arch
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("<arch>"))?;
    let source_rpm = raw
        .format
        .and_then(|f| f.source_rpm)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("<format>/<rpm:sourcerpm>"))?;
    let href = raw
        .location
        .and_then(|l| l.href)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("<location>/href"))?;
    let size = raw
        .size
        .and_then(|s| s.package)
        .ok_or_else(|| missing("<size>"))?;
    let length = size
        .trim()
        .parse::<u64>()
        .map_err(|_| RepoError::MalformedSize)?;
    let checksum_raw = raw.checksum.ok_or_else(|| missing("<checksum>"))?;
    let checksum = parse_checksum(&checksum_raw, Some(length))?;

    Ok(PrimaryPackage {
        name,
        epoch,
        version: ver,
        release: rel,
        arch,
        source_rpm,
        checksum,
        href,
    })
}

impl Iterator for Primary {
    type Item = Result<PrimaryPackage, RepoError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.packages.next().map(validate_package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::HashKind;

    const REPOMD: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <revision>1362262447</revision>
  <data type="primary">
    <checksum type="sha256">93a6633c5fa1a8c7a1e0b97e24e37a9011b6121b14226aeda62eff30c04f6ops</checksum>
    <open-checksum type="sha256">2c4bc6b23a631dcc74b2e1f3df2145d7b4d7f1f722b0545a8ccad40ff1a26bcf</open-checksum>
    <location href="repodata/primary.xml.gz"/>
    <size>2386347</size>
    <open-size>21167920</open-size>
  </data>
  <data type="filelists">
    <checksum type="sha256">2c4bc6b23a631dcc74b2e1f3df2145d7b4d7f1f722b0545a8ccad40ff1a26bcf</checksum>
    <location href="repodata/filelists.xml.gz"/>
  </data>
</repomd>"#;

    #[test]
    fn test_repomd_parse() {
        // The first checksum above is intentionally not valid hex.
        assert!(RepoMd::parse("http://example.com/".into(), REPOMD).is_err());
        let fixed = String::from_utf8_lossy(REPOMD).replace("c04f6ops", "c04f6abc");
        let md = RepoMd::parse("http://example.com/".into(), fixed.as_bytes()).unwrap();
        assert_eq!(md.revision, "1362262447");
        assert_eq!(md.entries.len(), 2);
        let primary = md.entry("primary").unwrap();
        assert_eq!(primary.href, "repodata/primary.xml.gz");
        assert_eq!(primary.checksum.length, Some(2386347));
        assert_eq!(primary.checksum.kind, HashKind::Sha256);
        assert!(primary.open_checksum.is_some());
        assert_eq!(
            md.resolve(&primary.href),
            "http://example.com/repodata/primary.xml.gz"
        );
    }

    #[test]
    fn test_repomd_missing_location() {
        let doc = br#"<repomd><data type="primary">
            <checksum type="sha256">00</checksum>
        </data></repomd>"#;
        assert!(matches!(
            RepoMd::parse("u".into(), doc),
            Err(RepoError::MissingDataElement("location"))
        ));
    }

    fn sample_package(name: &str, version: &str, sha: char) -> String {
        format!(
            r#"<package type="rpm">
  <name>{name}</name>
  <arch>x86_64</arch>
  <version epoch="0" ver="{version}" rel="9.fc18"/>
  <checksum type="sha256" pkgid="YES">{sha}{}</checksum>
  <summary>test</summary>
  <size package="143436" installed="432429" archive="434684"/>
  <location href="Packages/{name}.rpm"/>
  <format>
    <rpm:sourcerpm>{name}-src.rpm</rpm:sourcerpm>
  </format>
</package>"#,
            "0".repeat(63)
        )
    }

    fn wrap_metadata(packages: &[String]) -> String {
        format!(
            r#"<?xml version="1.0"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="{}">
{}
</metadata>"#,
            packages.len(),
            packages.join("\n")
        )
    }

    #[test]
    fn test_primary_document_order() {
        let doc = wrap_metadata(&[
            sample_package("sysvinit-tools", "2.88", 'a'),
            sample_package("unzip", "6.0", 'b'),
            sample_package("zlib", "1.2.7", 'c'),
        ]);
        let packages: Vec<_> = Primary::from_xml(doc.as_bytes())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(packages.len(), 3);
        assert_eq!(packages[0].name, "sysvinit-tools");
        assert_eq!(packages[1].name, "unzip");
        assert_eq!(packages[2].name, "zlib");
        assert_eq!(packages[0].epoch, Some(0));
        assert_eq!(packages[0].version, "2.88");
        assert_eq!(packages[0].release, "9.fc18");
        assert_eq!(packages[0].checksum.length, Some(143436));
        assert_eq!(packages[0].href, "Packages/sysvinit-tools.rpm");
        assert_eq!(&packages[1].checksum.hex_value()[..1], "b");
    }

    #[test]
    fn test_primary_missing_sourcerpm() {
        let mut pkg = sample_package("x", "1.0", 'a');
        pkg = pkg.replace("<rpm:sourcerpm>x-src.rpm</rpm:sourcerpm>", "");
        let doc = wrap_metadata(&[pkg]);
        let result: Result<Vec<_>, _> =
            Primary::from_xml(doc.as_bytes()).unwrap().collect();
        match result {
            Err(RepoError::MissingPackageElement { element, package }) => {
                assert_eq!(element, "<format>/<rpm:sourcerpm>");
                assert_eq!(package, "x");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_primary_gz_round_trip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let doc = wrap_metadata(&[sample_package("zlib", "1.2.7", 'c')]);
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(doc.as_bytes()).unwrap();
        let gz = enc.finish().unwrap();
        let packages: Vec<_> = Primary::from_gz(&gz)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "zlib");
    }
}
