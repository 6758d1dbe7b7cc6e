// src/artifact.rs

//! Artifact lifecycle: fetch shared input files before use, delete them once
//! nothing needs them.
//!
//! A download lands in `<path>.partial` and is renamed onto `<path>` only
//! after the transfer succeeded, so the final path never names a truncated
//! file.

use std::ffi::OsString;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use reqwest::redirect::Policy;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::ArtifactSection;
use crate::errors::{FleetError, Result};
use crate::fs::FileSystem;
use crate::remote::BoxFuture;
use crate::store::ArtifactRef;

const PARTIAL_SUFFIX: &str = ".partial";

/// Where artifact bytes and capacity figures come from.
pub trait ArtifactSource: Send + Sync + Debug {
    /// Size in bytes of the remote object, if it can be determined.
    fn remote_size<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<u64>>;

    /// Bytes available to unprivileged writers on the filesystem holding
    /// `dir`.
    fn free_space(&self, dir: &Path) -> Option<u64>;

    /// Transfer `url` into `dest`, overwriting it.
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// HTTP(S) source.
///
/// The size comes from the `Content-Length` of the final response to a HEAD
/// request (redirects followed). A chunked or length-less final response
/// means the size is unknown.
#[derive(Debug, Clone)]
pub struct HttpArtifactSource {
    client: Client,
    size_timeout: Duration,
    transfer_timeout: Duration,
}

impl HttpArtifactSource {
    pub fn new(cfg: &ArtifactSection) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(10))
            .build()
            .map_err(|e| FleetError::Other(anyhow!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            size_timeout: cfg.size_timeout,
            transfer_timeout: cfg.transfer_timeout,
        })
    }

    async fn stream_to(&self, url: &str, dest: &Path) -> anyhow::Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()
            .with_context(|| format!("downloading {url}"))?;
        let expected = content_length(response.headers());

        let mut file = File::create(dest)
            .await
            .with_context(|| format!("creating {dest:?}"))?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("reading body of {url}"))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(anyhow!("incomplete transfer: got {written} of {expected} bytes"));
            }
        }
        Ok(written)
    }
}

/// `Content-Length` of a single response, if present and numeric.
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

impl ArtifactSource for HttpArtifactSource {
    fn remote_size<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            let request = self.client.head(url).timeout(self.size_timeout).send();
            let response = match request.await {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    warn!(url = %url, status = %resp.status(), "size query failed");
                    return None;
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "size query failed");
                    return None;
                }
            };

            let size = content_length(response.headers());
            if size.is_none() {
                debug!(url = %url, final_url = %response.url(), "no content length on final response");
            }
            size
        })
    }

    fn free_space(&self, dir: &Path) -> Option<u64> {
        let existing = dir.ancestors().find(|p| p.is_dir())?;
        match fs2::available_space(existing) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(dir = ?existing, error = %err, "could not query free space");
                None
            }
        }
    }

    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let bytes = tokio::time::timeout(self.transfer_timeout, self.stream_to(url, dest))
                .await
                .map_err(|_| anyhow!("transfer timed out after {:?}", self.transfer_timeout))??;
            debug!(url = %url, bytes, "transfer complete");
            Ok(())
        })
    }
}

/// Ensures artifacts are present before use and reclaims them afterwards.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    source: Arc<dyn ArtifactSource>,
    fs: Arc<dyn FileSystem>,
    base_url: Option<String>,
    space_margin: f64,
}

impl ArtifactManager {
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        fs: Arc<dyn FileSystem>,
        cfg: &ArtifactSection,
    ) -> Self {
        Self {
            source,
            fs,
            base_url: cfg.base_url.clone(),
            space_margin: cfg.space_margin,
        }
    }

    pub fn is_present(&self, artifact: &ArtifactRef) -> bool {
        self.fs.is_file(&artifact.local_path)
    }

    /// Remote URL for `artifact`: absolute `download_path` values are used
    /// as-is, relative ones are joined onto the configured base URL.
    pub fn resolve_url(&self, artifact: &ArtifactRef) -> Option<String> {
        let source = artifact.source.as_deref()?;
        if source.contains("://") {
            return Some(source.to_string());
        }
        let base = self.base_url.as_deref()?;
        Some(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            source.trim_start_matches('/')
        ))
    }

    /// Make sure the artifact exists locally, downloading it if needed.
    ///
    /// Returns `false` without side effects when the source, size or free
    /// space is unknown or insufficient. A failed transfer leaves no partial
    /// file behind.
    pub async fn ensure_present(&self, artifact: &ArtifactRef) -> bool {
        if self.is_present(artifact) {
            return true;
        }
        let path = &artifact.local_path;

        let Some(url) = self.resolve_url(artifact) else {
            warn!(artifact = ?path, "artifact missing and no download source configured");
            return false;
        };

        let Some(size) = self.source.remote_size(&url).await else {
            warn!(artifact = ?path, url = %url, "remote size unknown; not downloading");
            return false;
        };

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let Some(free) = self.source.free_space(parent) else {
            warn!(artifact = ?path, "free space unknown; not downloading");
            return false;
        };
        let usable = (free as f64 * self.space_margin) as u64;
        if size > usable {
            warn!(
                artifact = ?path,
                size_bytes = size,
                usable_bytes = usable,
                "insufficient free space for artifact"
            );
            return false;
        }

        if let Err(err) = self.fs.create_dir_all(parent) {
            warn!(artifact = ?path, error = %err, "could not create artifact directory");
            return false;
        }

        let partial = partial_path(path);
        self.discard(&partial);

        info!(artifact = ?path, url = %url, size_bytes = size, "downloading artifact");
        if let Err(err) = self.source.fetch(&url, &partial).await {
            warn!(artifact = ?path, url = %url, error = %err, "download failed");
            self.discard(&partial);
            return false;
        }

        if let Err(err) = self.fs.rename(&partial, path) {
            warn!(artifact = ?path, error = %err, "could not move downloaded artifact into place");
            self.discard(&partial);
            return false;
        }

        info!(artifact = ?path, "artifact ready");
        true
    }

    /// Delete the local copy. The caller has already checked that every
    /// referencing experiment is terminal and none is running.
    pub fn reclaim(&self, artifact: &ArtifactRef) -> bool {
        let path = &artifact.local_path;
        if !self.fs.is_file(path) {
            return false;
        }
        match self.fs.remove_file(path) {
            Ok(()) => {
                info!(artifact = ?path, "reclaimed artifact");
                true
            }
            Err(err) => {
                warn!(artifact = ?path, error = %err, "could not delete artifact");
                false
            }
        }
    }

    fn discard(&self, partial: &Path) {
        if self.fs.is_file(partial) {
            debug!(path = ?partial, "removing partial download");
            if let Err(err) = self.fs.remove_file(partial) {
                warn!(path = ?partial, error = %err, "could not remove partial download");
            }
        }
    }
}

pub fn partial_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[derive(Debug)]
    struct ScriptedSource {
        fs: MockFileSystem,
        size: Option<u64>,
        free: Option<u64>,
        fail_fetch: bool,
        fetches: Mutex<Vec<String>>,
    }

    impl ArtifactSource for ScriptedSource {
        fn remote_size<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Option<u64>> {
            Box::pin(async move { self.size })
        }

        fn free_space(&self, _dir: &Path) -> Option<u64> {
            self.free
        }

        fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.fetches.lock().unwrap().push(url.to_string());
                self.fs.add_file(dest, "partial bytes");
                if self.fail_fetch {
                    return Err(anyhow!("connection reset"));
                }
                Ok(())
            })
        }
    }

    fn setup(
        size: Option<u64>,
        free: Option<u64>,
        fail_fetch: bool,
    ) -> (MockFileSystem, Arc<ScriptedSource>, ArtifactManager) {
        let fs = MockFileSystem::new();
        let source = Arc::new(ScriptedSource {
            fs: fs.clone(),
            size,
            free,
            fail_fetch,
            fetches: Mutex::new(Vec::new()),
        });
        let cfg = ArtifactSection {
            base_url: Some("https://traces.example.org/".to_string()),
            ..ArtifactSection::default()
        };
        let mgr = ArtifactManager::new(source.clone(), Arc::new(fs.clone()), &cfg);
        (fs, source, mgr)
    }

    fn artifact() -> ArtifactRef {
        ArtifactRef {
            local_path: PathBuf::from("/traces/kv/t1.zst"),
            source: Some("/kv/t1.zst".to_string()),
        }
    }

    /// Serves one canned HTTP/1.1 response per connection, picked by path.
    async fn serve(routes: Vec<(&'static str, String)>) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&buf).into_owned();
                    let path = request.split_whitespace().nth(1).unwrap_or("/");
                    let response = routes
                        .iter()
                        .find(|(p, _)| *p == path)
                        .map(|(_, r)| r.clone())
                        .unwrap_or_else(|| reply("404 Not Found", "Content-Length: 0", ""));
                    let _ = sock.write_all(response.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn reply(status: &str, headers: &str, body: &str) -> String {
        format!("HTTP/1.1 {status}\r\n{headers}\r\nConnection: close\r\n\r\n{body}")
    }

    fn http_source() -> HttpArtifactSource {
        HttpArtifactSource {
            client: Client::builder().no_proxy().build().unwrap(),
            size_timeout: Duration::from_secs(5),
            transfer_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn content_length_header_must_be_numeric() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(CONTENT_LENGTH, "12345".parse().unwrap());
        assert_eq!(content_length(&headers), Some(12345));
        headers.insert(CONTENT_LENGTH, "lots".parse().unwrap());
        assert_eq!(content_length(&headers), None);
    }

    #[tokio::test]
    async fn redirect_length_does_not_leak_into_size() {
        let base = serve(vec![
            ("/t", reply("302 Found", "Location: /final\r\nContent-Length: 0", "")),
            ("/final", reply("200 OK", "Transfer-Encoding: chunked", "0\r\n\r\n")),
        ])
        .await;
        assert_eq!(http_source().remote_size(&format!("{base}/t")).await, None);
    }

    #[tokio::test]
    async fn size_comes_from_final_response() {
        let base = serve(vec![
            ("/t", reply("302 Found", "Location: /big\r\nContent-Length: 0", "")),
            ("/big", reply("200 OK", "Content-Length: 4096", "")),
        ])
        .await;
        assert_eq!(http_source().remote_size(&format!("{base}/t")).await, Some(4096));
    }

    #[tokio::test]
    async fn missing_remote_object_has_unknown_size() {
        let base = serve(Vec::new()).await;
        assert_eq!(http_source().remote_size(&format!("{base}/gone")).await, None);
    }

    #[tokio::test]
    async fn fetch_streams_body_to_destination() {
        let base = serve(vec![(
            "/t",
            reply("200 OK", "Content-Length: 11", "trace bytes"),
        )])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("t1.zst.partial");

        http_source().fetch(&format!("{base}/t"), &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "trace bytes");
    }

    #[tokio::test]
    async fn truncated_body_fails_the_fetch() {
        let base = serve(vec![("/t", reply("200 OK", "Content-Length: 64", "short"))]).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("t1.zst.partial");

        assert!(http_source().fetch(&format!("{base}/t"), &dest).await.is_err());
    }

    #[test]
    fn resolves_relative_and_absolute_sources() {
        let (_, _, mgr) = setup(None, None, false);
        assert_eq!(
            mgr.resolve_url(&artifact()).as_deref(),
            Some("https://traces.example.org/kv/t1.zst")
        );
        let abs = ArtifactRef {
            source: Some("s3://bucket/t1".to_string()),
            ..artifact()
        };
        assert_eq!(mgr.resolve_url(&abs).as_deref(), Some("s3://bucket/t1"));
    }

    #[tokio::test]
    async fn downloads_via_partial_then_renames() {
        let (fs, source, mgr) = setup(Some(100), Some(1_000), false);
        assert!(mgr.ensure_present(&artifact()).await);
        assert!(fs.is_file(Path::new("/traces/kv/t1.zst")));
        assert!(!fs.exists(Path::new("/traces/kv/t1.zst.partial")));
        assert_eq!(source.fetches.lock().unwrap().len(), 1);

        // Already present: no second transfer.
        assert!(mgr.ensure_present(&artifact()).await);
        assert_eq!(source.fetches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_space_has_no_side_effects() {
        // 950 > 0.9 * 1000
        let (fs, source, mgr) = setup(Some(950), Some(1_000), false);
        assert!(!mgr.ensure_present(&artifact()).await);
        assert!(source.fetches.lock().unwrap().is_empty());
        assert!(!fs.exists(Path::new("/traces/kv")));
    }

    #[tokio::test]
    async fn unknown_size_is_a_failure() {
        let (_, source, mgr) = setup(None, Some(1_000), false);
        assert!(!mgr.ensure_present(&artifact()).await);
        assert!(source.fetches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_transfer_removes_partial() {
        let (fs, _, mgr) = setup(Some(10), Some(1_000), true);
        assert!(!mgr.ensure_present(&artifact()).await);
        assert!(!fs.exists(Path::new("/traces/kv/t1.zst.partial")));
        assert!(!fs.exists(Path::new("/traces/kv/t1.zst")));
    }

    #[test]
    fn reclaim_removes_present_file_only() {
        let (fs, _, mgr) = setup(None, None, false);
        assert!(!mgr.reclaim(&artifact()));
        fs.add_file("/traces/kv/t1.zst", "data");
        assert!(mgr.reclaim(&artifact()));
        assert!(!mgr.is_present(&artifact()));
    }
}
