//! Bounded asset fetching.
//!
//! Bodies are hashed incrementally while they arrive. Anything larger than
//! the spool threshold goes to a temp file in the output directory instead of
//! memory; the pipeline renames it into place once the hash is known.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use super::AssetConfig;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("server answered {status}")]
    Http { status: u16 },
    #[error("body of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::Http { status } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_too_large(&self) -> bool {
        matches!(self, DownloadError::TooLarge { .. })
    }
}

#[derive(Debug)]
pub enum FetchedBody {
    Buffered(Bytes),
    /// Spooled to a temp file; the path must be renamed or removed by the caller.
    Spooled(PathBuf),
}

#[derive(Debug)]
pub struct FetchedAsset {
    pub hash: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub body: FetchedBody,
}

/// Fetch one asset with bounded retries on transient failures.
pub async fn fetch_asset(
    client: &reqwest::Client,
    url: &Url,
    config: &AssetConfig,
    spool_dir: &Path,
) -> Result<FetchedAsset, DownloadError> {
    let retries = effective_retries(config.retries);
    let mut attempt = 1;
    loop {
        match fetch_once(client, url, config, spool_dir).await {
            Ok(asset) => return Ok(asset),
            Err(err) if err.is_retryable() && attempt < retries => {
                let backoff = config.retry_backoff.saturating_mul(1 << (attempt - 1));
                log::debug!("retrying {url} after {err} (attempt {attempt})");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &Url,
    config: &AssetConfig,
    spool_dir: &Path,
) -> Result<FetchedAsset, DownloadError> {
    // One deadline covers the headers and the whole body read; a server that
    // drips bytes forever cannot hold the download open past it.
    let deadline = tokio::time::Instant::now() + config.request_timeout;
    let timed_out =
        || DownloadError::Network(format!("timed out after {:?}", config.request_timeout));
    let response = tokio::time::timeout_at(deadline, client.get(url.clone()).send())
        .await
        .map_err(|_| timed_out())?
        .map_err(|err| DownloadError::Network(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Http {
            status: status.as_u16(),
        });
    }
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if let Some(declared) = response.content_length()
        && declared > config.max_asset_size
    {
        return Err(DownloadError::TooLarge {
            size: declared,
            limit: config.max_asset_size,
        });
    }

    let mut response = response;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut buffer = BytesMut::new();
    let mut spool: Option<(PathBuf, tokio::fs::File)> = None;

    loop {
        let chunk = match tokio::time::timeout_at(deadline, response.chunk()).await {
            Ok(result) => result.map_err(|err| DownloadError::Network(err.to_string()))?,
            Err(_) => {
                if let Some((path, _)) = spool.take() {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                return Err(timed_out());
            }
        };
        let Some(chunk) = chunk else {
            break;
        };
        size += chunk.len() as u64;
        if size > config.max_asset_size {
            if let Some((path, _)) = spool.take() {
                let _ = tokio::fs::remove_file(&path).await;
            }
            return Err(DownloadError::TooLarge {
                size,
                limit: config.max_asset_size,
            });
        }
        hasher.update(&chunk);

        if let Some((_, file)) = spool.as_mut() {
            file.write_all(&chunk).await?;
        } else if size > config.stream_threshold {
            // Crossed the memory threshold; spill what we have and stream on.
            let path = spool_dir.join(format!(".spool-{:016x}", rand::random::<u64>()));
            let mut file = tokio::fs::File::create(&path).await?;
            file.write_all(&buffer).await?;
            file.write_all(&chunk).await?;
            buffer.clear();
            spool = Some((path, file));
        } else {
            buffer.extend_from_slice(&chunk);
        }
    }

    let hash = format!("{:x}", hasher.finalize());
    let body = match spool {
        Some((path, mut file)) => {
            file.flush().await?;
            FetchedBody::Spooled(path)
        }
        None => FetchedBody::Buffered(buffer.freeze()),
    };
    Ok(FetchedAsset {
        hash,
        size,
        content_type,
        body,
    })
}

/// Seam for asset retrieval. The production implementation goes through
/// reqwest; tests substitute an in-memory site.
#[async_trait::async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &Url,
        proxy: Option<&str>,
        spool_dir: &Path,
    ) -> Result<FetchedAsset, DownloadError>;
}

/// reqwest-backed fetcher with one client per proxy endpoint.
pub struct HttpResourceFetcher {
    config: AssetConfig,
    user_agent: String,
    clients: tokio::sync::Mutex<std::collections::HashMap<String, reqwest::Client>>,
}

impl HttpResourceFetcher {
    pub fn new(config: AssetConfig, user_agent: impl Into<String>) -> Self {
        Self {
            config,
            user_agent: user_agent.into(),
            clients: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    async fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, DownloadError> {
        let key = proxy.unwrap_or_default().to_string();
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(self.user_agent.clone());
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| DownloadError::Network(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| DownloadError::Network(err.to_string()))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch(
        &self,
        url: &Url,
        proxy: Option<&str>,
        spool_dir: &Path,
    ) -> Result<FetchedAsset, DownloadError> {
        let client = self.client_for(proxy).await?;
        fetch_asset(&client, url, &self.config, spool_dir).await
    }
}

/// SHA-256 of an in-memory body, as lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Ensure a retry backoff schedule never sleeps forever on misconfiguration.
pub(super) fn effective_retries(retries: usize) -> usize {
    retries.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_matches_known_vector() {
        assert_eq!(
            hash_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(DownloadError::Network("reset".into()).is_retryable());
        assert!(DownloadError::Http { status: 503 }.is_retryable());
        assert!(DownloadError::Http { status: 429 }.is_retryable());
        assert!(!DownloadError::Http { status: 404 }.is_retryable());
        assert!(
            !DownloadError::TooLarge {
                size: 10,
                limit: 5
            }
            .is_retryable()
        );
    }

    #[test]
    fn retry_floor() {
        assert_eq!(effective_retries(0), 1);
        assert_eq!(effective_retries(3), 3);
    }

    #[tokio::test]
    async fn stalled_body_hits_the_request_deadline() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            // Headers plus a partial body, then silence.
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial")
                .await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = reqwest::Client::new();
        let config = AssetConfig {
            retries: 1,
            retry_backoff: Duration::from_millis(1),
            request_timeout: Duration::from_millis(200),
            ..AssetConfig::default()
        };
        let url = Url::parse(&format!("http://{addr}/slow.bin")).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let result = fetch_asset(&client, &url, &config, dir.path()).await;
        assert!(
            matches!(&result, Err(DownloadError::Network(message)) if message.contains("timed out")),
            "{result:?}"
        );
    }

    #[tokio::test]
    async fn unreachable_hosts_fail_with_network_errors() {
        let client = reqwest::Client::new();
        let config = AssetConfig {
            retries: 1,
            retry_backoff: Duration::from_millis(1),
            request_timeout: Duration::from_millis(500),
            ..AssetConfig::default()
        };
        let url = Url::parse("http://127.0.0.1:1/asset.png").unwrap();
        let dir = tempfile::tempdir().unwrap();

        let result = fetch_asset(&client, &url, &config, dir.path()).await;
        assert!(matches!(result, Err(DownloadError::Network(_))));
    }
}
