//! Asset capture and rewrite pipeline.
//!
//! For each resolved page the pipeline enumerates referenced resources,
//! downloads them with bounded concurrency, deduplicates by URL and content
//! hash, follows stylesheet imports to a capped depth, and rewrites the page
//! so every captured reference works from the local output tree. Individual
//! asset failures never fail the page.

pub mod download;
pub mod extract;
pub mod rewrite;
pub mod store;

pub use download::{
    DownloadError, FetchedAsset, FetchedBody, HttpResourceFetcher, ResourceFetcher,
};
pub use extract::{AssetRef, extract_asset_refs, extract_css_refs, extract_links};
pub use rewrite::{page_local_path, relative_prefix, rewrite_page_links};
pub use store::{AssetRecord, AssetStore, AssetStoreError};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use url::Url;

use crate::crawl::CancelToken;

/// Download and capture policy.
#[derive(Debug, Clone)]
pub struct AssetConfig {
    /// Concurrent downloads per page.
    pub max_in_flight: usize,
    pub retries: usize,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    /// Bodies above this size spool to disk instead of memory.
    pub stream_threshold: u64,
    pub max_asset_size: u64,
    /// How many levels of `@import` to follow.
    pub css_import_depth: usize,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 12,
            retries: 3,
            retry_backoff: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
            stream_threshold: 4 * 1024 * 1024,
            max_asset_size: 256 * 1024 * 1024,
            css_import_depth: 3,
        }
    }
}

/// Failures that abort the capture instead of being recorded on it.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Collision(#[from] AssetStoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("job cancelled")]
    Cancelled,
}

/// One asset that failed after retries; recorded on the page, never fatal.
#[derive(Debug, Clone)]
pub struct AssetFailure {
    pub url: String,
    pub message: String,
    pub too_large: bool,
}

/// Output of capturing one page. The markup still needs the cross-page link
/// pass, which runs once the full set of captured pages is known.
#[derive(Debug)]
pub struct CapturedPage {
    pub local_path: String,
    pub html: String,
    pub asset_urls: Vec<String>,
    pub failures: Vec<AssetFailure>,
}

struct PendingStylesheet {
    filename: String,
    content: String,
    refs: Vec<AssetRef>,
}

/// Capture pipeline shared by all page tasks of one job.
pub struct CapturePipeline {
    output_root: PathBuf,
    config: AssetConfig,
    fetcher: Arc<dyn ResourceFetcher>,
    store: Mutex<AssetStore>,
    permits: Arc<Semaphore>,
}

impl CapturePipeline {
    pub fn new(
        output_root: PathBuf,
        config: AssetConfig,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            output_root,
            config,
            fetcher,
            store: Mutex::new(AssetStore::new()),
            permits,
        }
    }

    /// Capture every resource a resolved page references and rewrite the
    /// references to local paths. `intercepted` carries runtime-created
    /// requests observed by the session.
    pub async fn capture(
        &self,
        page_url: &Url,
        markup: &str,
        intercepted: Vec<Url>,
        proxy: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<CapturedPage, CaptureError> {
        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }
        let assets_dir = self.output_root.join("assets");
        tokio::fs::create_dir_all(&assets_dir).await?;

        let mut page_refs = extract_asset_refs(markup, page_url);
        let mut seen: HashSet<String> =
            page_refs.iter().map(|r| r.url.to_string()).collect();
        for url in intercepted {
            if matches!(url.scheme(), "http" | "https") && seen.insert(url.to_string()) {
                page_refs.push(AssetRef {
                    raw: url.to_string(),
                    url,
                });
            }
        }

        let local_path = page_local_path(page_url);
        let prefix = relative_prefix(&local_path);

        // url -> bare filename under assets/, for every capture of this call
        // and everything already in the store.
        let mut url_to_file: HashMap<String, String> = HashMap::new();
        let mut failures = Vec::new();
        let mut stylesheets: Vec<PendingStylesheet> = Vec::new();

        let mut wave: Vec<(AssetRef, usize)> =
            page_refs.iter().cloned().map(|r| (r, 0)).collect();

        while !wave.is_empty() {
            if cancel.is_cancelled() {
                return Err(CaptureError::Cancelled);
            }

            let mut join_set = JoinSet::new();
            for (asset_ref, depth) in wave.drain(..) {
                let key = asset_ref.url.to_string();
                if url_to_file.contains_key(&key) {
                    continue;
                }
                let already_captured = {
                    let store = self.store.lock().await;
                    store
                        .lookup_url(&key)
                        .map(|record| filename_of(&record.local_path))
                };
                if let Some(filename) = already_captured {
                    url_to_file.insert(key, filename);
                    continue;
                }

                let fetcher = self.fetcher.clone();
                let permits = self.permits.clone();
                let spool_dir = assets_dir.clone();
                let proxy = proxy.map(str::to_string);
                join_set.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let result = fetcher
                        .fetch(&asset_ref.url, proxy.as_deref(), &spool_dir)
                        .await;
                    (asset_ref, depth, result)
                });
            }

            let mut next_wave = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let Ok((asset_ref, depth, result)) = joined else {
                    log::warn!("asset download task aborted");
                    continue;
                };
                match result {
                    Err(err) => {
                        log::debug!("asset {} failed: {err}", asset_ref.url);
                        failures.push(AssetFailure {
                            url: asset_ref.url.to_string(),
                            message: err.to_string(),
                            too_large: err.is_too_large(),
                        });
                    }
                    Ok(fetched) => {
                        let children = self
                            .commit_fetched(
                                &asset_ref,
                                fetched,
                                depth,
                                &mut url_to_file,
                                &mut stylesheets,
                            )
                            .await?;
                        for child in children {
                            if seen.insert(child.url.to_string()) {
                                next_wave.push((child, depth + 1));
                            }
                        }
                    }
                }
            }
            wave = next_wave;
        }

        // Stylesheets are written last, once every import they reference has
        // a known filename.
        for sheet in stylesheets {
            let replacements: Vec<(String, String)> = sheet
                .refs
                .iter()
                .filter_map(|r| {
                    url_to_file
                        .get(r.url.as_str())
                        .map(|file| (r.raw.clone(), file.clone()))
                })
                .collect();
            let rewritten = rewrite::rewrite_css_refs(&sheet.content, &replacements);
            tokio::fs::write(assets_dir.join(&sheet.filename), rewritten).await?;
        }

        let replacements: Vec<(String, String)> = page_refs
            .iter()
            .filter_map(|r| {
                url_to_file
                    .get(r.url.as_str())
                    .map(|file| (r.raw.clone(), format!("{prefix}assets/{file}")))
            })
            .collect();
        let html = rewrite::rewrite_asset_refs(markup, &replacements);

        let asset_urls = page_refs
            .iter()
            .filter(|r| url_to_file.contains_key(r.url.as_str()))
            .map(|r| r.url.to_string())
            .collect();

        Ok(CapturedPage {
            local_path,
            html,
            asset_urls,
            failures,
        })
    }

    /// Commit one fetched body: dedupe by hash, persist, and return any
    /// stylesheet children to follow.
    async fn commit_fetched(
        &self,
        asset_ref: &AssetRef,
        fetched: FetchedAsset,
        depth: usize,
        url_to_file: &mut HashMap<String, String>,
        stylesheets: &mut Vec<PendingStylesheet>,
    ) -> Result<Vec<AssetRef>, CaptureError> {
        let extension =
            store::extension_for(fetched.content_type.as_deref(), asset_ref.url.path());
        let commit = self.store.lock().await.commit(
            asset_ref.url.as_str(),
            &fetched.hash,
            &extension,
            fetched.content_type.clone(),
            fetched.size,
        )?;

        match commit {
            store::Commit::Duplicate { local_path } => {
                if let FetchedBody::Spooled(path) = fetched.body {
                    let _ = tokio::fs::remove_file(path).await;
                }
                url_to_file.insert(asset_ref.url.to_string(), filename_of(&local_path));
                Ok(Vec::new())
            }
            store::Commit::New { local_path } => {
                let filename = filename_of(&local_path);
                let target = self.output_root.join(&local_path);
                let mut children = Vec::new();

                if extension == "css" && depth < self.config.css_import_depth {
                    let content = match &fetched.body {
                        FetchedBody::Buffered(bytes) => {
                            String::from_utf8_lossy(bytes).into_owned()
                        }
                        FetchedBody::Spooled(path) => tokio::fs::read_to_string(path).await?,
                    };
                    if let FetchedBody::Spooled(path) = &fetched.body {
                        let _ = tokio::fs::remove_file(path).await;
                    }
                    children = extract_css_refs(&content, &asset_ref.url);
                    stylesheets.push(PendingStylesheet {
                        filename: filename.clone(),
                        content,
                        refs: children.clone(),
                    });
                } else {
                    match fetched.body {
                        FetchedBody::Buffered(bytes) => {
                            tokio::fs::write(&target, &bytes).await?;
                        }
                        FetchedBody::Spooled(path) => {
                            tokio::fs::rename(&path, &target).await?;
                        }
                    }
                }

                url_to_file.insert(asset_ref.url.to_string(), filename);
                Ok(children)
            }
        }
    }

    /// Snapshot of every asset record captured so far, for the manifest.
    pub async fn records(&self) -> Vec<AssetRecord> {
        self.store.lock().await.records().to_vec()
    }

    /// Count of distinct asset files on disk.
    pub async fn distinct_files(&self) -> usize {
        self.store.lock().await.distinct_files()
    }
}

fn filename_of(local_path: &str) -> String {
    local_path
        .rsplit('/')
        .next()
        .unwrap_or(local_path)
        .to_string()
}
