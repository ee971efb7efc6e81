//! Receiving-machine side of sharing: manifest fetch and the combined
//! download+import operation
//!
//! Download and import are deliberately one backend call: there is no
//! coordinator-visible point where a half-downloaded package could be
//! mistaken for an importable one. The only feedback channel is the
//! progress stream, under a single operation id for both halves.

use crate::error::{ShareError, ShareResult};
use crate::events::{EventBus, ProgressReporter};
use crate::export::sharing_temp_dir;
use crate::import;
use crate::instance::ImportedInstance;
use crate::manifest::{format_size, SharingManifest, PACKAGE_EXTENSION};
use futures_util::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;
use url::Url;
use uuid::Uuid;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;
/// Report download progress after this many received bytes
const REPORT_INTERVAL_BYTES: u64 = 256 * 1024;
/// Share of the combined operation's progress taken by the download half
const DOWNLOAD_PROGRESS_CEILING: u64 = 40;

/// HTTP client with bounded timeouts so a dead share cannot hang the
/// import flow.
pub fn build_http_client() -> ShareResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("instance-share/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .map_err(|e| ShareError::Network(format!("Failed to build HTTP client: {}", e)))
}

/// Check that a user-entered share URL is syntactically usable:
/// parseable, http(s), and with a host.
pub fn validate_share_url(share_url: &str) -> ShareResult<Url> {
    let url = Url::parse(share_url)
        .map_err(|e| ShareError::Validation(format!("Invalid share URL: {}", e)))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ShareError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(ShareError::Validation("Share URL has no host".to_string()));
    }
    Ok(url)
}

fn classify_request_error(e: reqwest::Error, what: &str) -> ShareError {
    if e.is_timeout() {
        ShareError::Network(format!("{} timed out", what))
    } else {
        ShareError::Network(format!("{} failed: {}", what, e))
    }
}

/// Map the serving side's auth protocol to errors: 401 means a password
/// is required, 403 with the marker body means it was wrong.
async fn check_auth_status(response: reqwest::Response, what: &str) -> ShareResult<reqwest::Response> {
    match response.status() {
        reqwest::StatusCode::UNAUTHORIZED => Err(ShareError::Auth("PASSWORD_REQUIRED".to_string())),
        reqwest::StatusCode::FORBIDDEN => {
            let body = response.text().await.unwrap_or_default();
            if body.contains("INVALID_PASSWORD") {
                Err(ShareError::Auth("INVALID_PASSWORD".to_string()))
            } else {
                Err(ShareError::Network(format!("{}: access denied", what)))
            }
        }
        status if !status.is_success() => Err(ShareError::Network(format!(
            "{} failed with status {}",
            what, status
        ))),
        _ => Ok(response),
    }
}

/// Fetch the manifest of a remote share for preview before download
pub async fn fetch_share_manifest(
    client: &reqwest::Client,
    share_url: &str,
    password: Option<&str>,
) -> ShareResult<SharingManifest> {
    validate_share_url(share_url)?;
    let manifest_url = format!("{}/manifest", share_url.trim_end_matches('/'));
    info!("[SHARE] Fetching manifest from {}", manifest_url);

    let mut request = client.get(&manifest_url);
    if let Some(password) = password {
        request = request.header("X-Share-Password", password);
    }
    let response = request
        .send()
        .await
        .map_err(|e| classify_request_error(e, "Manifest fetch"))?;
    let response = check_auth_status(response, "Manifest fetch").await?;

    let body = response
        .text()
        .await
        .map_err(|e| classify_request_error(e, "Manifest fetch"))?;
    serde_json::from_str(&body)
        .map_err(|e| ShareError::Validation(format!("Malformed manifest: {}", e)))
}

/// Download a shared package and import it as a new local instance.
///
/// Streams the package to a temp file (progress stage "downloading"),
/// then runs the regular import path under the same operation id. The
/// temp file is removed on every exit path.
pub async fn download_and_import(
    client: &reqwest::Client,
    bus: &EventBus,
    data_dir: &Path,
    instances_dir: &Path,
    share_url: &str,
    new_name: Option<String>,
    password: Option<&str>,
) -> ShareResult<ImportedInstance> {
    validate_share_url(share_url)?;

    let operation_id = Uuid::new_v4().to_string();
    let reporter = Arc::new(ProgressReporter::new(bus.clone(), operation_id));

    let temp_dir = sharing_temp_dir(data_dir);
    tokio::fs::create_dir_all(&temp_dir)
        .await
        .map_err(|e| ShareError::Io(format!("Failed to create temp dir: {}", e)))?;
    let temp_file = temp_dir.join(format!("download_{}.{}", Uuid::new_v4(), PACKAGE_EXTENSION));

    let downloaded = download_package(client, &reporter, share_url, password, &temp_file).await;
    if let Err(e) = downloaded {
        let _ = tokio::fs::remove_file(&temp_file).await;
        return Err(e);
    }

    let imported = import::import_package(&reporter, instances_dir, &temp_file, new_name).await;
    let _ = tokio::fs::remove_file(&temp_file).await;
    imported
}

async fn download_package(
    client: &reqwest::Client,
    reporter: &ProgressReporter,
    share_url: &str,
    password: Option<&str>,
    temp_file: &Path,
) -> ShareResult<()> {
    reporter.report("downloading", 0, "Contacting share...");
    info!("[SHARE] Downloading from {}", share_url);

    let mut request = client.get(share_url);
    if let Some(password) = password {
        request = request.header("X-Share-Password", password);
    }
    let response = request
        .send()
        .await
        .map_err(|e| classify_request_error(e, "Download"))?;
    let response = check_auth_status(response, "Download").await?;

    let total_size = response.content_length().unwrap_or(0);

    let mut file = tokio::fs::File::create(temp_file)
        .await
        .map_err(|e| ShareError::Io(format!("Failed to create temp file: {}", e)))?;

    let mut stream = response.bytes_stream();
    let mut received = 0u64;
    let mut unreported = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| classify_request_error(e, "Download"))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| ShareError::Io(format!("Failed to write temp file: {}", e)))?;
        received += chunk.len() as u64;
        unreported += chunk.len() as u64;

        if unreported >= REPORT_INTERVAL_BYTES {
            unreported = 0;
            let progress = if total_size > 0 {
                ((received * DOWNLOAD_PROGRESS_CEILING) / total_size) as u32
            } else {
                0
            };
            reporter.report(
                "downloading",
                progress,
                &format!("Downloaded {}...", format_size(received)),
            );
        }
    }
    file.flush()
        .await
        .map_err(|e| ShareError::Io(format!("Failed to flush temp file: {}", e)))?;

    reporter.report(
        "downloading",
        DOWNLOAD_PROGRESS_CEILING as u32,
        &format!("Download complete ({})", format_size(received)),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_url_validation() {
        assert!(validate_share_url("https://tunnel.example/abc123").is_ok());
        assert!(validate_share_url("http://127.0.0.1:9000/tok").is_ok());
        assert!(validate_share_url("ftp://example.com/pkg").is_err());
        assert!(validate_share_url("not a url").is_err());
        assert!(validate_share_url("file:///tmp/pkg.share").is_err());
    }

    #[tokio::test]
    async fn fetch_from_unreachable_host_is_network_error() {
        let client = build_http_client().unwrap();
        // Reserved TEST-NET-1 address, nothing listens there
        let err = fetch_share_manifest(&client, "http://192.0.2.1:9/token", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Network(_)));
    }

    #[tokio::test]
    async fn invalid_url_rejected_before_any_io() {
        let client = build_http_client().unwrap();
        let err = fetch_share_manifest(&client, "nonsense", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Validation(_)));
    }
}
