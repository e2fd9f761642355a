//! HTTP fetching with a database-backed URL cache. The cache policy is
//! selected per call: repository indexes are revalidated with a HEAD
//! request, package archives bypass the URL cache entirely (they go to
//! the content-addressed file cache instead).

use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

use crate::db::{self, Database};
use crate::stream::{Sink, VecSink};

pub const USER_AGENT: &str = "symboldb/0.0";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Unconditional GET, cache untouched.
    NoCache,
    /// Revalidate with HEAD against the stored length and time.
    CheckCache,
    /// Serve from cache when present, otherwise fetch.
    AlwaysCache,
    /// Never touch the network.
    OnlyCache,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    pub cache_mode: CacheMode,
}

impl Default for DownloadOptions {
    fn default() -> DownloadOptions {
        DownloadOptions {
            cache_mode: CacheMode::CheckCache,
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("URL not in cache and network access disabled: {0}")]
    UrlNotInCache(String),
    #[error("{message} (URL {original_url})")]
    Transfer {
        message: String,
        original_url: String,
        effective_url: Option<String>,
        status: u16,
        remote: Option<SocketAddr>,
    },
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("writing fetched data: {0}")]
    Sink(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

pub struct Downloader<'a> {
    db: &'a Database,
    client: Client,
}

fn http_date(headers: &reqwest::header::HeaderMap) -> Option<i64> {
    let value = headers.get(reqwest::header::LAST_MODIFIED)?.to_str().ok()?;
    // HTTP dates use the obsolete "GMT" zone name, which the RFC 2822
    // parser does not accept.
    let value = match value.trim().strip_suffix("GMT") {
        Some(prefix) => format!("{}+0000", prefix),
        None => value.trim().to_string(),
    };
    OffsetDateTime::parse(&value, &Rfc2822)
        .ok()
        .map(|t| t.unix_timestamp())
}

impl<'a> Downloader<'a> {
    pub fn new(db: &'a Database) -> Result<Downloader<'a>, DownloadError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| DownloadError::Transfer {
                message: e.to_string(),
                original_url: String::new(),
                effective_url: None,
                status: 0,
                remote: None,
            })?;
        Ok(Downloader { db, client })
    }

    /// Fetch a URL into memory, honouring the cache mode. Successful
    /// network fetches under any mode except `NoCache` update the URL
    /// cache.
    pub async fn fetch(
        &self,
        opts: &DownloadOptions,
        url: &str,
    ) -> Result<Vec<u8>, DownloadError> {
        match opts.cache_mode {
            CacheMode::OnlyCache | CacheMode::AlwaysCache => {
                if let Some(data) = db::url_cache_fetch(self.db.pool(), url).await? {
                    debug!("url cache hit for {}", url);
                    return Ok(data);
                }
                if opts.cache_mode == CacheMode::OnlyCache {
                    return Err(DownloadError::UrlNotInCache(url.to_string()));
                }
            }
            CacheMode::CheckCache => {
                if let Some(data) = self.revalidate(url).await? {
                    debug!("url cache still fresh for {}", url);
                    return Ok(data);
                }
            }
            CacheMode::NoCache => {}
        }

        let mut sink = VecSink::default();
        let time = self.get(url, &mut sink).await?;
        if opts.cache_mode != CacheMode::NoCache {
            db::url_cache_update(self.db.pool(), url, &sink.data, time.unwrap_or(0)).await?;
        }
        Ok(sink.data)
    }

    /// Stream a plain GET into a sink without touching the URL cache.
    pub async fn fetch_to_sink(
        &self,
        url: &str,
        sink: &mut dyn Sink,
    ) -> Result<(), DownloadError> {
        self.get(url, sink).await?;
        Ok(())
    }

    async fn revalidate(&self, url: &str) -> Result<Option<Vec<u8>>, DownloadError> {
        let response = match self.client.head(url).send().await {
            Ok(r) => r,
            // A failed HEAD just degrades to a full GET.
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                return Ok(None);
            }
        };
        if response.status() != StatusCode::OK {
            return Ok(None);
        }
        let time = match http_date(response.headers()) {
            Some(t) if t > 0 => t,
            _ => return Ok(None),
        };
        let length = match response.content_length() {
            Some(l) => l as usize,
            None => return Ok(None),
        };
        Ok(db::url_cache_fetch_checked(self.db.pool(), url, length, time).await?)
    }

    async fn get(&self, url: &str, sink: &mut dyn Sink) -> Result<Option<i64>, DownloadError> {
        if let Ok(parsed) = url::Url::parse(url) {
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(DownloadError::UnsupportedScheme(parsed.scheme().to_string()));
            }
        }
        let transfer_error = |message: String,
                              effective: Option<String>,
                              status: u16,
                              remote: Option<SocketAddr>| {
            DownloadError::Transfer {
                message,
                original_url: url.to_string(),
                effective_url: effective.filter(|u| u != url),
                status,
                remote,
            }
        };
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transfer_error(e.to_string(), None, 0, None))?;
        let effective = response.url().to_string();
        let remote = response.remote_addr();
        if response.status() != StatusCode::OK {
            return Err(transfer_error(
                format!("unexpected HTTP status {}", response.status()),
                Some(effective),
                response.status().as_u16(),
                remote,
            ));
        }
        let time = http_date(response.headers());
        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|e| transfer_error(e.to_string(), Some(effective.clone()), 200, remote))?;
            match chunk {
                Some(data) => sink.write(&data)?,
                None => break,
            }
        }
        Ok(time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_date() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::LAST_MODIFIED,
            "Sun, 06 Nov 1994 08:49:37 GMT".parse().unwrap(),
        );
        assert_eq!(http_date(&headers), Some(784111777));
        headers.insert(reqwest::header::LAST_MODIFIED, "garbage".parse().unwrap());
        assert_eq!(http_date(&headers), None);
    }
}
