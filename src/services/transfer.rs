use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::errors::{LauncherError, Result};
use crate::utils::file::remove_file_if_exists;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte progress callback: `(downloaded, total_if_known)`.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Missing,
    Present { size: Option<u64> },
}

impl ProbeResult {
    pub fn exists(&self) -> bool {
        matches!(self, ProbeResult::Present { .. })
    }
}

#[async_trait]
pub trait ArtifactTransport: Send + Sync {
    /// Checks existence and advertised size without fetching the body.
    async fn probe(&self, url: &str) -> Result<ProbeResult>;

    /// Streams `url` into `dest`. On error or cancellation the partial file is removed.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ByteProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64>;
}

#[derive(Clone)]
pub struct HttpTransfer {
    client: reqwest::Client,
}

impl HttpTransfer {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("game-updater/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ByteProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LauncherError::Cancelled),
            response = self.client.get(url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(LauncherError::Download(format!("{url} -> HTTP {status}")));
        }
        let total = header_content_length(&response);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        on_progress(0, total);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(LauncherError::Cancelled);
                }
                next = stream.next() => {
                    let Some(next) = next else { break; };
                    let bytes = next.map_err(|err| {
                        LauncherError::Download(format!("{url} -> stream interrupted: {err}"))
                    })?;
                    file.write_all(&bytes).await?;
                    downloaded = downloaded.saturating_add(bytes.len() as u64);
                    on_progress(downloaded, total);
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = total {
            if expected != downloaded {
                return Err(LauncherError::Download(format!(
                    "{url} -> truncated body ({downloaded}/{expected} bytes)"
                )));
            }
        }
        Ok(downloaded)
    }
}

impl Default for HttpTransfer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactTransport for HttpTransfer {
    async fn probe(&self, url: &str) -> Result<ProbeResult> {
        let response = self.client.head(url).timeout(PROBE_TIMEOUT).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
            return Ok(ProbeResult::Missing);
        }
        if !status.is_success() {
            return Err(LauncherError::Http(format!("{url} -> HTTP {status}")));
        }
        Ok(ProbeResult::Present {
            size: header_content_length(&response),
        })
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        on_progress: ByteProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        tracing::debug!("download start url={} dest={}", url, dest.display());
        match self.stream_to_file(url, dest, on_progress, cancel).await {
            Ok(bytes) => {
                tracing::debug!("download complete url={} bytes={}", url, bytes);
                Ok(bytes)
            }
            Err(err) => {
                if let Err(cleanup) = remove_file_if_exists(dest) {
                    tracing::warn!(
                        "failed to remove partial download {}: {}",
                        dest.display(),
                        cleanup
                    );
                }
                let err = match err {
                    LauncherError::Network(inner) => {
                        LauncherError::Download(format!("{url} -> {inner}"))
                    }
                    other => other,
                };
                Err(err)
            }
        }
    }
}

// reqwest reports a zero body hint for HEAD responses, so read the header itself.
fn header_content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::TempRoot;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response per connection; optionally never finishes the body.
    async fn spawn_stub(head: String, body: Vec<u8>, stall: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let head = head.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut seen = Vec::new();
                    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => seen.extend_from_slice(&buf[..n]),
                        }
                    }
                    let is_head = seen.starts_with(b"HEAD");
                    let _ = socket.write_all(head.as_bytes()).await;
                    if !is_head {
                        let _ = socket.write_all(&body).await;
                    }
                    let _ = socket.flush().await;
                    if stall {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                });
            }
        });
        format!("http://{addr}/artifact.pwr")
    }

    #[tokio::test]
    async fn probe_reads_advertised_size() {
        let url = spawn_stub(
            "HTTP/1.1 200 OK\r\nContent-Length: 629145600\r\nConnection: close\r\n\r\n".into(),
            Vec::new(),
            false,
        )
        .await;
        let probe = HttpTransfer::new().probe(&url).await.expect("probe stub");
        assert_eq!(
            probe,
            ProbeResult::Present {
                size: Some(629_145_600)
            }
        );
    }

    #[tokio::test]
    async fn probe_maps_not_found_to_missing() {
        let url = spawn_stub(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
            Vec::new(),
            false,
        )
        .await;
        let probe = HttpTransfer::new().probe(&url).await.expect("probe stub");
        assert_eq!(probe, ProbeResult::Missing);
    }

    #[tokio::test]
    async fn download_writes_full_body() {
        let body = vec![7u8; 2048];
        let url = spawn_stub(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            ),
            body.clone(),
            false,
        )
        .await;
        let root = TempRoot::new("game-updater-transfer");
        let dest = root.join("artifact.pwr");
        let seen = AtomicU64::new(0);
        let progress = |done: u64, _total: Option<u64>| {
            seen.store(done, Ordering::SeqCst);
        };

        let bytes = HttpTransfer::new()
            .download(&url, &dest, &progress, &CancellationToken::new())
            .await
            .expect("download body");

        assert_eq!(bytes, 2048);
        assert_eq!(seen.load(Ordering::SeqCst), 2048);
        assert_eq!(std::fs::read(&dest).expect("read artifact"), body);
    }

    #[tokio::test]
    async fn cancelling_mid_download_removes_partial_file() {
        let url = spawn_stub(
            "HTTP/1.1 200 OK\r\nContent-Length: 1048576\r\nConnection: close\r\n\r\n".into(),
            vec![1u8; 1024],
            true,
        )
        .await;
        let root = TempRoot::new("game-updater-transfer");
        let dest = root.join("artifact.pwr");
        let cancel = CancellationToken::new();
        let received = Arc::new(AtomicU64::new(0));
        let cancel_on_bytes = cancel.clone();
        let received_in_cb = received.clone();
        let progress = move |done: u64, _total: Option<u64>| {
            received_in_cb.store(done, Ordering::SeqCst);
            if done > 0 {
                cancel_on_bytes.cancel();
            }
        };

        let result = HttpTransfer::new()
            .download(&url, &dest, &progress, &cancel)
            .await;

        assert!(matches!(result, Err(LauncherError::Cancelled)));
        assert!(received.load(Ordering::SeqCst) > 0);
        assert!(!dest.exists(), "partial artifact must be deleted");
    }

    #[tokio::test]
    async fn http_error_status_is_download_error() {
        let url = spawn_stub(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .into(),
            Vec::new(),
            false,
        )
        .await;
        let root = TempRoot::new("game-updater-transfer");
        let dest = root.join("artifact.pwr");
        let progress = |_: u64, _: Option<u64>| {};
        let result = HttpTransfer::new()
            .download(&url, &dest, &progress, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(LauncherError::Download(_))));
        assert!(!dest.exists());
    }
}
