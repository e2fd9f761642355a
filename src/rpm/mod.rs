//! RPM package reader: header metadata, dependencies, scriptlets,
//! triggers and the CPIO payload stream.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use thiserror::Error;

pub mod cpio;
pub mod header;
mod payload;

use cpio::CpioError;
use header::Header;

#[derive(Debug, Error)]
pub enum RpmError {
    #[error("not an RPM package")]
    NotRpm,
    #[error("{0}")]
    Header(String),
    #[error("could not get RPM {0} header")]
    MissingTag(&'static str),
    #[error("{0} header contains wrong number of elements")]
    CountMismatch(&'static str),
    #[error("end of stream in {0}")]
    Truncated(&'static str),
    #[error("unsupported payload compressor: {0}")]
    UnsupportedPayload(String),
    #[error(transparent)]
    Cpio(#[from] CpioError),
    #[error("cpio file not found in RPM header: {0}")]
    FileNotInHeader(String),
    #[error("RPM epoch out of range")]
    EpochRange,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Binary,
    Source,
}

#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub name: String,
    pub epoch: Option<i32>,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub source_rpm: Option<String>,
    /// SHA-1 over the header section, as recorded by rpmbuild. This is
    /// the package identity key.
    pub hash: String,
    pub kind: PackageKind,
    pub build_host: String,
    pub build_time: i64,
    pub summary: String,
    pub description: String,
    pub license: String,
    pub group: String,
    pub url: Option<String>,
    pub normalized: bool,
}

impl PackageInfo {
    pub fn nevra(&self) -> String {
        match self.epoch {
            Some(e) => format!(
                "{}-{}:{}-{}.{}",
                self.name, e, self.version, self.release, self.arch
            ),
            None => format!(
                "{}-{}-{}.{}",
                self.name, self.version, self.release, self.arch
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Requires,
    Provides,
    Obsoletes,
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub capability: String,
    pub op: Option<&'static str>,
    pub version: Option<String>,
    pub pre: bool,
    pub build: bool,
}

const RPMSENSE_LESS: u32 = 1 << 1;
const RPMSENSE_GREATER: u32 = 1 << 2;
const RPMSENSE_EQUAL: u32 = 1 << 3;
const RPMSENSE_PREREQ: u32 = 1 << 6;
const RPMSENSE_SCRIPT_BUILD: u32 =
    (1 << 16) | (1 << 17) | (1 << 18) | (1 << 19);

fn dependency_op(flags: u32) -> Option<&'static str> {
    let less = flags & RPMSENSE_LESS != 0;
    let greater = flags & RPMSENSE_GREATER != 0;
    let equal = flags & RPMSENSE_EQUAL != 0;
    match (less, greater, equal) {
        (true, false, false) => Some("<"),
        (true, false, true) => Some("<="),
        (false, true, false) => Some(">"),
        (false, true, true) => Some(">="),
        (false, false, true) => Some("="),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    PreInstall,
    PostInstall,
    PreUninstall,
    PostUninstall,
}

impl ScriptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptKind::PreInstall => "prein",
            ScriptKind::PostInstall => "postin",
            ScriptKind::PreUninstall => "preun",
            ScriptKind::PostUninstall => "postun",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Script {
    pub kind: ScriptKind,
    pub script: String,
    pub prog: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TriggerCondition {
    pub name: String,
    pub version: String,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct Trigger {
    pub script: String,
    pub prog: String,
    pub conditions: Vec<TriggerCondition>,
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub user: String,
    pub group: String,
    pub mode: u32,
    pub mtime: u32,
    pub ino: u32,
    pub flags: u32,
    pub linkto: String,
    pub capabilities: String,
    pub normalized: bool,
}

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170000 == 0o120000
    }
}

pub struct FileEntry {
    pub info: FileInfo,
    pub contents: Vec<u8>,
}

/// Decode a possibly non-UTF-8 path. Historic packages carry latin-1
/// names; those are transcoded and flagged as normalized.
pub fn normalize_name(raw: &[u8]) -> (String, bool) {
    match std::str::from_utf8(raw) {
        Ok(s) => (s.to_string(), false),
        Err(_) => (raw.iter().map(|&b| b as char).collect(), true),
    }
}

enum PayloadState {
    Closed(BufReader<File>),
    Open(Box<dyn Read + Send>),
    Done,
}

pub struct RpmArchive {
    header: Header,
    info: PackageInfo,
    files: HashMap<String, FileInfo>,
    payload: PayloadState,
}

impl RpmArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RpmArchive, RpmError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut lead = [0u8; header::LEAD_LEN];
        reader
            .read_exact(&mut lead)
            .map_err(|_| RpmError::NotRpm)?;
        header::parse_lead(&lead)?;
        let signature = Header::read_from(&mut reader, true)?;
        let hdr = Header::read_from(&mut reader, false)?;
        let info = package_info(&signature, &hdr)?;
        let files = file_map(&hdr)?;
        Ok(RpmArchive {
            header: hdr,
            info,
            files,
            payload: PayloadState::Closed(reader),
        })
    }

    pub fn package_info(&self) -> &PackageInfo {
        &self.info
    }

    pub fn nevra(&self) -> String {
        self.info.nevra()
    }

    pub fn dependencies(&self) -> Result<Vec<Dependency>, RpmError> {
        let mut out = Vec::new();
        for (kind, names, versions, flags) in [
            (
                DependencyKind::Requires,
                header::TAG_REQUIRENAME,
                header::TAG_REQUIREVERSION,
                header::TAG_REQUIREFLAGS,
            ),
            (
                DependencyKind::Provides,
                header::TAG_PROVIDENAME,
                header::TAG_PROVIDEVERSION,
                header::TAG_PROVIDEFLAGS,
            ),
            (
                DependencyKind::Obsoletes,
                header::TAG_OBSOLETENAME,
                header::TAG_OBSOLETEVERSION,
                header::TAG_OBSOLETEFLAGS,
            ),
        ] {
            let names = match self.header.string_array(names) {
                Some(v) => v,
                None => continue,
            };
            let versions = self
                .header
                .string_array(versions)
                .ok_or(RpmError::CountMismatch("dependency version"))?;
            let flags = self
                .header
                .u32_array(flags)
                .ok_or(RpmError::CountMismatch("dependency flags"))?;
            if names.len() != versions.len() || names.len() != flags.len() {
                return Err(RpmError::CountMismatch("dependency"));
            }
            for ((name, version), &flag) in names.iter().zip(versions).zip(flags) {
                out.push(Dependency {
                    kind,
                    capability: name.clone(),
                    op: dependency_op(flag),
                    version: if version.is_empty() {
                        None
                    } else {
                        Some(version.clone())
                    },
                    pre: flag & RPMSENSE_PREREQ != 0,
                    build: flag & RPMSENSE_SCRIPT_BUILD != 0,
                });
            }
        }
        Ok(out)
    }

    pub fn scripts(&self) -> Vec<Script> {
        let mut out = Vec::new();
        for (kind, tag, prog_tag) in [
            (ScriptKind::PreInstall, header::TAG_PREIN, header::TAG_PREINPROG),
            (ScriptKind::PostInstall, header::TAG_POSTIN, header::TAG_POSTINPROG),
            (ScriptKind::PreUninstall, header::TAG_PREUN, header::TAG_PREUNPROG),
            (
                ScriptKind::PostUninstall,
                header::TAG_POSTUN,
                header::TAG_POSTUNPROG,
            ),
        ] {
            if let Some(script) = self.header.string(tag) {
                out.push(Script {
                    kind,
                    script: script.to_string(),
                    prog: self.header.string(prog_tag).map(str::to_string),
                });
            }
        }
        out
    }

    pub fn triggers(&self) -> Result<Vec<Trigger>, RpmError> {
        let scripts = match self.header.string_array(header::TAG_TRIGGERSCRIPTS) {
            Some(v) => v,
            None => return Ok(Vec::new()),
        };
        let progs = self
            .header
            .string_array(header::TAG_TRIGGERSCRIPTPROG)
            .ok_or(RpmError::CountMismatch("TRIGGERSCRIPTPROG"))?;
        if scripts.len() != progs.len() {
            return Err(RpmError::CountMismatch("TRIGGERSCRIPTPROG"));
        }
        let mut triggers: Vec<Trigger> = scripts
            .iter()
            .zip(progs)
            .map(|(script, prog)| Trigger {
                script: script.clone(),
                prog: prog.clone(),
                conditions: Vec::new(),
            })
            .collect();

        let names = self
            .header
            .string_array(header::TAG_TRIGGERNAME)
            .unwrap_or(&[]);
        let versions = self
            .header
            .string_array(header::TAG_TRIGGERVERSION)
            .unwrap_or(&[]);
        let flags = self.header.u32_array(header::TAG_TRIGGERFLAGS).unwrap_or(&[]);
        let indexes = self.header.u32_array(header::TAG_TRIGGERINDEX).unwrap_or(&[]);
        if names.len() != versions.len()
            || names.len() != flags.len()
            || names.len() != indexes.len()
        {
            return Err(RpmError::CountMismatch("TRIGGERNAME"));
        }
        for (((name, version), &flag), &index) in
            names.iter().zip(versions).zip(flags).zip(indexes)
        {
            let trigger = triggers
                .get_mut(index as usize)
                .ok_or(RpmError::CountMismatch("TRIGGERINDEX"))?;
            trigger.conditions.push(TriggerCondition {
                name: name.clone(),
                version: version.clone(),
                flags: flag,
            });
        }
        Ok(triggers)
    }

    fn open_payload(&mut self) -> Result<(), RpmError> {
        if let PayloadState::Closed(_) = self.payload {
            let compressor = self
                .header
                .string(header::TAG_PAYLOADCOMPRESSOR)
                .unwrap_or("gzip")
                .to_string();
            let state = std::mem::replace(&mut self.payload, PayloadState::Done);
            let reader = match state {
                PayloadState::Closed(r) => r,
                _ => unreachable!(),
            };
            self.payload = PayloadState::Open(payload::decompressor(&compressor, reader)?);
        }
        Ok(())
    }

    /// Read the next payload entry, or `None` at the archive trailer.
    pub fn read_file(&mut self) -> Result<Option<FileEntry>, RpmError> {
        self.open_payload()?;
        let reader = match &mut self.payload {
            PayloadState::Open(r) => r,
            PayloadState::Done => return Ok(None),
            PayloadState::Closed(_) => unreachable!(),
        };

        let mut magic = [0u8; cpio::MAGIC_LEN];
        reader
            .read_exact(&mut magic)
            .map_err(|_| RpmError::Truncated("cpio file header"))?;
        let hdr_len = cpio::header_length(&magic)?;
        let mut hdr_buf = vec![0u8; hdr_len];
        reader
            .read_exact(&mut hdr_buf)
            .map_err(|_| RpmError::Truncated("cpio file header"))?;
        let entry = cpio::parse(&hdr_buf)?;
        if entry.namesize == 0 {
            return Err(CpioError::EmptyName.into());
        }

        let mut name = vec![0u8; entry.namesize as usize];
        reader
            .read_exact(&mut name)
            .map_err(|_| RpmError::Truncated("cpio file name"))?;
        // Name and contents are padded to four bytes, counted from the
        // start of the header.
        let mut pos = cpio::MAGIC_LEN + hdr_len + name.len();
        skip_padding(reader, &mut pos)?;
        // Drop the trailing NUL.
        if name.last() == Some(&0) {
            name.pop();
        }

        if name == cpio::TRAILER.as_bytes() {
            self.payload = PayloadState::Done;
            return Ok(None);
        }

        let (decoded, normalized) = normalize_name(payload_name(&name));

        let mut info = self
            .files
            .get(&decoded)
            .cloned()
            .ok_or_else(|| RpmError::FileNotInHeader(decoded.clone()))?;
        info.normalized = normalized;

        let mut contents = vec![0u8; entry.filesize as usize];
        if entry.filesize > 0 {
            reader
                .read_exact(&mut contents)
                .map_err(|_| RpmError::Truncated("cpio file contents"))?;
        }
        let mut pos = entry.filesize as usize;
        skip_padding(reader, &mut pos)?;

        Ok(Some(FileEntry { info, contents }))
    }
}

/// The payload prefixes entry names with `./`; the header records
/// absolute paths. Dropping the dot keeps the leading slash.
fn payload_name(name: &[u8]) -> &[u8] {
    if name.starts_with(b"./") {
        &name[1..]
    } else {
        name
    }
}

fn skip_padding(reader: &mut (dyn Read + Send), pos: &mut usize) -> Result<(), RpmError> {
    let mut pad = [0u8; 1];
    while *pos % 4 != 0 {
        reader
            .read_exact(&mut pad)
            .map_err(|_| RpmError::Truncated("cpio padding"))?;
        *pos += 1;
    }
    Ok(())
}

fn package_info(signature: &Header, hdr: &Header) -> Result<PackageInfo, RpmError> {
    let epoch = match hdr.u32(header::TAG_EPOCH) {
        Some(e) if e > i32::MAX as u32 => return Err(RpmError::EpochRange),
        Some(e) => Some(e as i32),
        None => None,
    };
    let kind = if hdr.has(header::TAG_SOURCEPACKAGE) {
        PackageKind::Source
    } else {
        PackageKind::Binary
    };
    Ok(PackageInfo {
        name: hdr.require_string("NAME", header::TAG_NAME)?.to_string(),
        epoch,
        version: hdr
            .require_string("VERSION", header::TAG_VERSION)?
            .to_string(),
        release: hdr
            .require_string("RELEASE", header::TAG_RELEASE)?
            .to_string(),
        arch: hdr.require_string("ARCH", header::TAG_ARCH)?.to_string(),
        source_rpm: hdr
            .string(header::TAG_SOURCERPM)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        hash: signature
            .string(header::SIGTAG_SHA1)
            .ok_or(RpmError::MissingTag("SHA1HEADER"))?
            .to_string(),
        kind,
        build_host: hdr.string(header::TAG_BUILDHOST).unwrap_or("").to_string(),
        build_time: hdr.u32(header::TAG_BUILDTIME).unwrap_or(0) as i64,
        summary: hdr.string(header::TAG_SUMMARY).unwrap_or("").to_string(),
        description: hdr
            .string(header::TAG_DESCRIPTION)
            .unwrap_or("")
            .to_string(),
        license: hdr.string(header::TAG_LICENSE).unwrap_or("").to_string(),
        group: hdr.string(header::TAG_GROUP).unwrap_or("").to_string(),
        url: hdr
            .string(header::TAG_URL)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        normalized: false,
    })
}

fn file_map(hdr: &Header) -> Result<HashMap<String, FileInfo>, RpmError> {
    let basenames = match hdr.string_array(header::TAG_BASENAMES) {
        Some(v) => v,
        // Empty package without a single file entry.
        None => return Ok(HashMap::new()),
    };
    let dirnames = hdr
        .string_array(header::TAG_DIRNAMES)
        .ok_or(RpmError::MissingTag("DIRNAMES"))?;
    let dirindexes = hdr
        .u32_array(header::TAG_DIRINDEXES)
        .ok_or(RpmError::MissingTag("DIRINDEXES"))?;
    let users = hdr
        .string_array(header::TAG_FILEUSERNAME)
        .ok_or(RpmError::MissingTag("FILEUSERNAME"))?;
    let groups = hdr
        .string_array(header::TAG_FILEGROUPNAME)
        .ok_or(RpmError::MissingTag("FILEGROUPNAME"))?;
    let modes = hdr
        .u16_array(header::TAG_FILEMODES)
        .ok_or(RpmError::MissingTag("FILEMODES"))?;
    let mtimes = hdr
        .u32_array(header::TAG_FILEMTIMES)
        .ok_or(RpmError::MissingTag("FILEMTIMES"))?;
    let inodes = hdr
        .u32_array(header::TAG_FILEINODES)
        .ok_or(RpmError::MissingTag("FILEINODES"))?;
    let flags = hdr
        .u32_array(header::TAG_FILEFLAGS)
        .ok_or(RpmError::MissingTag("FILEFLAGS"))?;
    let linktos = hdr
        .string_array(header::TAG_FILELINKTOS)
        .ok_or(RpmError::MissingTag("FILELINKTOS"))?;
    let caps = hdr.string_array(header::TAG_FILECAPS);

    let n = basenames.len();
    if [users.len(), groups.len(), modes.len(), mtimes.len()]
        .iter()
        .any(|&l| l != n)
        || [inodes.len(), flags.len(), linktos.len(), dirindexes.len()]
            .iter()
            .any(|&l| l != n)
    {
        return Err(RpmError::CountMismatch("file attribute"));
    }

    let mut files = HashMap::with_capacity(n);
    for i in 0..n {
        let dir = dirnames
            .get(dirindexes[i] as usize)
            .ok_or(RpmError::CountMismatch("DIRINDEXES"))?;
        let name = format!("{}{}", dir, basenames[i]);
        files.insert(
            name.clone(),
            FileInfo {
                name,
                user: users[i].clone(),
                group: groups[i].clone(),
                mode: modes[i] as u32,
                mtime: mtimes[i],
                ino: inodes[i],
                flags: flags[i],
                linkto: linktos[i].clone(),
                capabilities: caps
                    .and_then(|c| c.get(i))
                    .cloned()
                    .unwrap_or_default(),
                normalized: false,
            },
        );
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_op() {
        assert_eq!(dependency_op(0), None);
        assert_eq!(dependency_op(RPMSENSE_EQUAL), Some("="));
        assert_eq!(dependency_op(RPMSENSE_LESS | RPMSENSE_EQUAL), Some("<="));
        assert_eq!(
            dependency_op(RPMSENSE_GREATER | RPMSENSE_EQUAL),
            Some(">=")
        );
        assert_eq!(dependency_op(RPMSENSE_GREATER), Some(">"));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name(b"usr/bin/ls"), ("usr/bin/ls".into(), false));
        // latin-1 e-acute
        let (name, normalized) = normalize_name(b"caf\xe9");
        assert_eq!(name, "caf\u{e9}");
        assert!(normalized);
    }

    #[test]
    fn test_payload_name_keeps_absolute_path() {
        assert_eq!(payload_name(b"./usr/bin/ls"), b"/usr/bin/ls");
        assert_eq!(payload_name(b"/sbin/killall5"), b"/sbin/killall5");
        assert_eq!(payload_name(b"relative"), b"relative");
    }

    #[test]
    fn test_nevra() {
        let mut info = PackageInfo {
            name: "unzip".into(),
            epoch: None,
            version: "6.0".into(),
            release: "7.fc18".into(),
            arch: "x86_64".into(),
            source_rpm: None,
            hash: String::new(),
            kind: PackageKind::Binary,
            build_host: String::new(),
            build_time: 0,
            summary: String::new(),
            description: String::new(),
            license: String::new(),
            group: String::new(),
            url: None,
            normalized: false,
        };
        assert_eq!(info.nevra(), "unzip-6.0-7.fc18.x86_64");
        info.epoch = Some(1);
        assert_eq!(info.nevra(), "unzip-1:6.0-7.fc18.x86_64");
    }

    #[test]
    fn test_file_kind_bits() {
        let mut info = FileInfo {
            name: "/usr".into(),
            user: "root".into(),
            group: "root".into(),
            mode: 0o040755,
            mtime: 0,
            ino: 1,
            flags: 0,
            linkto: String::new(),
            capabilities: String::new(),
            normalized: false,
        };
        assert!(info.is_directory());
        assert!(!info.is_symlink());
        info.mode = 0o120777;
        assert!(info.is_symlink());
        info.mode = 0o100755;
        assert!(!info.is_directory() && !info.is_symlink());
    }
}
