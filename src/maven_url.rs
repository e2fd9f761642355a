//! Maven POM scanning for repository, SCM and site URLs, plus the
//! cheap "does this smell like XML" test used by the ingestion
//! pipeline.

use quick_xml::events::Event;
use quick_xml::Reader;

/// Number of context bytes captured around an XML parse failure.
const ERROR_CONTEXT: usize = 64;

/// Optional UTF-8 BOM, optional whitespace, then an opening angle
/// bracket.
pub fn looks_like_xml(data: &[u8]) -> bool {
    let data = data.strip_prefix(&[0xefu8, 0xbb, 0xbf][..]).unwrap_or(data);
    for &b in data {
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => continue,
            b'<' => return true,
            _ => return false,
        }
    }
    false
}

/// Where in the POM a URL was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MavenUrlKind {
    Repository,
    PluginRepository,
    DistributionManagement,
    Site,
    Scm,
    Connection,
    DeveloperConnection,
    Other,
}

impl MavenUrlKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MavenUrlKind::Repository => "repository",
            MavenUrlKind::PluginRepository => "pluginRepository",
            MavenUrlKind::DistributionManagement => "distributionManagement",
            MavenUrlKind::Site => "site",
            MavenUrlKind::Scm => "scm",
            MavenUrlKind::Connection => "connection",
            MavenUrlKind::DeveloperConnection => "developerConnection",
            MavenUrlKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MavenUrl {
    pub url: String,
    pub kind: MavenUrlKind,
}

#[derive(Debug, Clone)]
pub struct XmlErrorInfo {
    pub message: String,
    pub line: u32,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

fn error_at(data: &[u8], pos: usize, message: String) -> XmlErrorInfo {
    let pos = pos.min(data.len());
    let line = data[..pos].iter().filter(|&&b| b == b'\n').count() as u32 + 1;
    let start = pos.saturating_sub(ERROR_CONTEXT);
    let end = (pos + ERROR_CONTEXT).min(data.len());
    XmlErrorInfo {
        message,
        line,
        before: data[start..pos].to_vec(),
        after: data[pos..end].to_vec(),
    }
}

/// Classify a `<url>` element by its enclosing structure. A site URL
/// stays a site URL even inside `<distributionManagement>`, and the
/// deploy repositories there count as distribution management rather
/// than ordinary repositories.
fn classify_url(ancestors: &[Vec<u8>]) -> MavenUrlKind {
    let has = |name: &[u8]| ancestors.iter().any(|a| a == name);
    if has(b"site") {
        MavenUrlKind::Site
    } else if has(b"distributionManagement") {
        MavenUrlKind::DistributionManagement
    } else if has(b"scm") {
        MavenUrlKind::Scm
    } else if has(b"pluginRepository") {
        MavenUrlKind::PluginRepository
    } else if has(b"repository") {
        MavenUrlKind::Repository
    } else {
        MavenUrlKind::Other
    }
}

/// Extract `<url>`, `<connection>` and `<developerConnection>` values
/// from a POM document, in document order.
pub fn scan_pom(data: &[u8]) -> Result<Vec<MavenUrl>, XmlErrorInfo> {
    let mut reader = Reader::from_reader(data);
    reader.check_end_names(true);
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut urls = Vec::new();
    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| error_at(data, reader.buffer_position() as usize, e.to_string()))?;
        match event {
            Event::Start(start) => {
                stack.push(start.local_name().as_ref().to_vec());
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(text) => {
                let kind = match stack.split_last() {
                    Some((tag, ancestors)) if tag == b"url" => classify_url(ancestors),
                    Some((tag, _)) if tag == b"connection" => MavenUrlKind::Connection,
                    Some((tag, _)) if tag == b"developerConnection" => {
                        MavenUrlKind::DeveloperConnection
                    }
                    _ => continue,
                };
                let value = text
                    .unescape()
                    .map_err(|e| {
                        error_at(data, reader.buffer_position() as usize, e.to_string())
                    })?
                    .trim()
                    .to_string();
                if value.is_empty() {
                    continue;
                }
                urls.push(MavenUrl { url: value, kind });
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_xml() {
        assert!(looks_like_xml(b"<project/>"));
        assert!(looks_like_xml(b"  \n\t<project/>"));
        assert!(looks_like_xml(b"\xef\xbb\xbf<project/>"));
        assert!(!looks_like_xml(b"#!/bin/sh\n"));
        assert!(!looks_like_xml(b""));
        assert!(!looks_like_xml(b"   "));
    }

    fn found(pom: &[u8]) -> Vec<(String, &'static str)> {
        scan_pom(pom)
            .unwrap()
            .into_iter()
            .map(|u| (u.url, u.kind.as_str()))
            .collect()
    }

    #[test]
    fn test_scan_pom_taxonomy() {
        let pom = br#"<project>
  <url>http://commons.apache.org/net/</url>
  <organization>
    <url>http://www.apache.org/</url>
  </organization>
  <scm>
    <connection>scm:svn:http://svn.apache.org/repos/asf/commons/proper/net/trunk</connection>
    <developerConnection>scm:svn:https://svn.apache.org/repos/asf/commons/proper/net/trunk</developerConnection>
    <url>http://svn.apache.org/viewvc/commons/proper/net/trunk</url>
  </scm>
  <distributionManagement>
    <repository>
      <url>https://repository.apache.org/service/local/staging/deploy/maven2</url>
    </repository>
    <snapshotRepository>
      <url>https://repository.apache.org/content/repositories/snapshots</url>
    </snapshotRepository>
    <site>
      <url>scp://people.apache.org/www/commons.apache.org/net</url>
    </site>
  </distributionManagement>
  <repositories>
    <repository>
      <url>http://repo.maven.apache.org/maven2</url>
    </repository>
  </repositories>
  <pluginRepositories>
    <pluginRepository>
      <url>http://repo.maven.apache.org/maven2</url>
    </pluginRepository>
  </pluginRepositories>
</project>"#;
        assert_eq!(
            found(pom),
            vec![
                ("http://commons.apache.org/net/".to_string(), "other"),
                ("http://www.apache.org/".to_string(), "other"),
                (
                    "scm:svn:http://svn.apache.org/repos/asf/commons/proper/net/trunk"
                        .to_string(),
                    "connection"
                ),
                (
                    "scm:svn:https://svn.apache.org/repos/asf/commons/proper/net/trunk"
                        .to_string(),
                    "developerConnection"
                ),
                (
                    "http://svn.apache.org/viewvc/commons/proper/net/trunk".to_string(),
                    "scm"
                ),
                (
                    "https://repository.apache.org/service/local/staging/deploy/maven2"
                        .to_string(),
                    "distributionManagement"
                ),
                (
                    "https://repository.apache.org/content/repositories/snapshots"
                        .to_string(),
                    "distributionManagement"
                ),
                (
                    "scp://people.apache.org/www/commons.apache.org/net".to_string(),
                    "site"
                ),
                ("http://repo.maven.apache.org/maven2".to_string(), "repository"),
                (
                    "http://repo.maven.apache.org/maven2".to_string(),
                    "pluginRepository"
                ),
            ]
        );
    }

    #[test]
    fn test_scan_pom_site_outside_distribution_management() {
        let pom = br#"<project>
  <distributionManagement>
    <site>
      <url>${site.deploy.url}/maven/${siteId}/${version}</url>
    </site>
  </distributionManagement>
</project>"#;
        assert_eq!(
            found(pom),
            vec![(
                "${site.deploy.url}/maven/${siteId}/${version}".to_string(),
                "site"
            )]
        );
    }

    #[test]
    fn test_scan_error_position() {
        let bad = b"<project>\n  <url>x</wrong>\n</project>";
        let err = scan_pom(bad).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(!err.before.is_empty());
    }
}
