//! HTTP file server for active shares
//!
//! Each share runs one instance of this server on a loopback port; the
//! tunnel makes it reachable. The share token is the first path segment of
//! every request, so an unguessable URL is the baseline access control,
//! with an optional password on top. Supports whole-file and ranged GETs,
//! HEAD, and a manifest preview endpoint.

use crate::error::{ShareError, ShareResult};
use crate::events::EventBus;
use crate::import;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// 256-bit share token, hex encoded
const AUTH_TOKEN_BYTES: usize = 32;
const MAX_CONCURRENT_CONNECTIONS: usize = 10;
const REQUEST_TIMEOUT_SECS: u64 = 300;
/// Stream the package in chunks of this size
const CHUNK_SIZE: usize = 64 * 1024;
/// Publish a download event after this many newly uploaded bytes
const EMIT_INTERVAL_BYTES: u64 = 256 * 1024;

/// Cumulative transfer counters for one share. Updates and the matching
/// `ShareDownloadEvent` publish happen under one write lock so the event
/// stream itself never regresses, even with concurrent downloads.
#[derive(Debug, Default)]
pub(crate) struct TransferCounters {
    pub download_count: u32,
    pub uploaded_bytes: u64,
}

/// Everything one share's server needs to answer requests
pub(crate) struct ServeContext {
    pub package_path: PathBuf,
    pub share_id: String,
    pub auth_token: String,
    pub password_hash: Option<String>,
    pub bus: EventBus,
    pub counters: Arc<RwLock<TransferCounters>>,
}

pub(crate) fn generate_auth_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; AUTH_TOKEN_BYTES] = rng.gen();
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Constant-time comparison to keep token probing timing-neutral
fn constant_time_eq(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// SHA-256 of password salted with the share id
pub(crate) fn hash_password(password: &str, share_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(share_id.as_bytes());
    hex_encode(&hasher.finalize())
}

fn validate_password(provided: &str, share_id: &str, expected_hash: &str) -> bool {
    constant_time_eq(&hash_password(provided, share_id), expected_hash)
}

/// Accept loop. Runs until the shutdown signal; each connection is handled
/// on its own task under a request timeout and a concurrency cap.
pub(crate) async fn run_file_server(
    listener: TcpListener,
    ctx: Arc<ServeContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let active_connections = Arc::new(AtomicUsize::new(0));
    info!(
        "[SHARE] File server for share {} listening on {:?}",
        ctx.share_id,
        listener.local_addr().ok()
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("[SHARE] Shutting down file server for share {}", ctx.share_id);
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("[SHARE] Accept error: {}", e);
                        continue;
                    }
                };

                let current = active_connections.load(Ordering::SeqCst);
                if current >= MAX_CONCURRENT_CONNECTIONS {
                    warn!("[SECURITY] Connection cap reached, rejecting {}", peer);
                    continue;
                }
                active_connections.fetch_add(1, Ordering::SeqCst);
                debug!("[SHARE] Connection from {} (active: {})", peer, current + 1);

                let ctx = ctx.clone();
                let connections = active_connections.clone();
                tokio::spawn(async move {
                    let outcome = tokio::time::timeout(
                        Duration::from_secs(REQUEST_TIMEOUT_SECS),
                        handle_connection(stream, &ctx),
                    )
                    .await;
                    connections.fetch_sub(1, Ordering::SeqCst);
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("[SHARE] Connection error: {}", e),
                        Err(_) => warn!("[SECURITY] Request timeout from {}", peer),
                    }
                });
            }
        }
    }
}

/// Minimal parsed HTTP request
struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

impl Request {
    async fn read_from(stream: &mut TcpStream) -> ShareResult<Self> {
        let mut buffer = [0u8; 8192];
        let n = stream
            .read(&mut buffer)
            .await
            .map_err(|e| ShareError::Io(format!("Read error: {}", e)))?;
        let raw = String::from_utf8_lossy(&buffer[..n]).to_string();

        let mut lines = raw.lines();
        let first = lines.next().unwrap_or("");
        let mut parts = first.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();
        if method.is_empty() || path.is_empty() {
            return Err(ShareError::Io("Malformed request line".to_string()));
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_lowercase(), value.trim().to_string());
            }
        }

        Ok(Self {
            method,
            path,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: &ServeContext) -> ShareResult<()> {
    let request = Request::read_from(&mut stream).await?;
    debug!("[SHARE] {} {}", request.method, request.path);

    // First path segment is the share token: /{token}[/download|/manifest]
    let trimmed = request.path.trim_start_matches('/');
    let (token, rest) = match trimmed.split_once('/') {
        Some((token, rest)) => (token, format!("/{}", rest)),
        None => (trimmed, "/".to_string()),
    };

    if token.is_empty() || !constant_time_eq(token, &ctx.auth_token) {
        warn!("[SECURITY] Invalid share token attempted");
        // Slow down brute force attempts
        tokio::time::sleep(Duration::from_millis(100)).await;
        return write_text(&mut stream, 403, "Forbidden", "Invalid or missing access token").await;
    }

    if let Some(expected_hash) = ctx.password_hash.as_deref() {
        match request.header("x-share-password") {
            None => {
                info!("[SHARE] Password required but not provided");
                return write_text(&mut stream, 401, "Unauthorized", "PASSWORD_REQUIRED").await;
            }
            Some(password) => {
                if !validate_password(password, &ctx.share_id, expected_hash) {
                    warn!("[SECURITY] Invalid share password attempted");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    return write_text(&mut stream, 403, "Forbidden", "INVALID_PASSWORD").await;
                }
            }
        }
    }

    let range = request.header("range").map(str::to_string);
    match (request.method.as_str(), rest.as_str()) {
        ("GET", "/") | ("GET", "/download") => serve_package(&mut stream, ctx, range).await,
        ("HEAD", "/") | ("HEAD", "/download") => serve_package_head(&mut stream, ctx).await,
        ("GET", "/manifest") => serve_manifest(&mut stream, &ctx.package_path).await,
        _ => write_text(&mut stream, 404, "Not Found", "Not Found").await,
    }
}

/// Byte range resolved against the file size: (start, end inclusive,
/// status, body length). Unsatisfiable or inverted ranges fall back to
/// the whole file.
fn resolve_range(range: Option<&str>, file_size: u64) -> (u64, u64, u16, u64) {
    let full = (0, file_size.saturating_sub(1), 200, file_size);

    if let Some(spec) = range.and_then(|r| r.strip_prefix("bytes=").map(str::to_string)) {
        let mut parts = spec.split('-');
        let start: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let end: u64 = parts
            .next()
            .and_then(|s| if s.is_empty() { None } else { s.parse().ok() })
            .unwrap_or(file_size.saturating_sub(1))
            .min(file_size.saturating_sub(1));
        if start > end || start >= file_size {
            return full;
        }
        (start, end, 206, end - start + 1)
    } else {
        full
    }
}

async fn serve_package(
    stream: &mut TcpStream,
    ctx: &ServeContext,
    range: Option<String>,
) -> ShareResult<()> {
    let mut file = tokio::fs::File::open(&ctx.package_path)
        .await
        .map_err(|e| ShareError::Io(format!("Failed to open package: {}", e)))?;
    let file_size = file
        .metadata()
        .await
        .map_err(|e| ShareError::Io(format!("Failed to stat package: {}", e)))?
        .len();
    let filename = package_filename(&ctx.package_path);

    let (start, end, status, body_len) = resolve_range(range.as_deref(), file_size);

    let mut headers = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/zip\r\nContent-Length: {}\r\n",
        if status == 206 {
            "206 Partial Content"
        } else {
            "200 OK"
        },
        body_len
    );
    if status == 206 {
        headers.push_str(&format!(
            "Content-Range: bytes {}-{}/{}\r\n",
            start, end, file_size
        ));
    }
    headers.push_str(&format!(
        "Content-Disposition: attachment; filename=\"{}\"\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
        filename
    ));
    stream
        .write_all(headers.as_bytes())
        .await
        .map_err(|e| ShareError::Io(format!("Write headers error: {}", e)))?;

    if start > 0 {
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| ShareError::Io(format!("Seek error: {}", e)))?;
    }

    let mut remaining = body_len;
    let mut total_sent = 0u64;
    let mut unreported = 0u64;
    let mut buffer = vec![0u8; CHUNK_SIZE];

    while remaining > 0 {
        let want = (remaining as usize).min(buffer.len());
        let n = file
            .read(&mut buffer[..want])
            .await
            .map_err(|e| ShareError::Io(format!("Read package error: {}", e)))?;
        if n == 0 {
            break;
        }
        stream
            .write_all(&buffer[..n])
            .await
            .map_err(|e| ShareError::Io(format!("Write body error: {}", e)))?;

        remaining -= n as u64;
        total_sent += n as u64;
        unreported += n as u64;

        if unreported >= EMIT_INTERVAL_BYTES {
            let mut counters = ctx.counters.write().await;
            counters.uploaded_bytes += unreported;
            unreported = 0;
            ctx.bus.publish_download(
                &ctx.share_id,
                counters.download_count,
                counters.uploaded_bytes,
            );
        }
    }

    let mut counters = ctx.counters.write().await;
    counters.uploaded_bytes += unreported;
    // A complete from-zero transfer counts as one download
    if start == 0 && total_sent >= file_size {
        counters.download_count += 1;
        info!(
            "[SHARE] Download #{} completed ({} bytes)",
            counters.download_count, total_sent
        );
    }
    ctx.bus.publish_download(
        &ctx.share_id,
        counters.download_count,
        counters.uploaded_bytes,
    );

    Ok(())
}

async fn serve_package_head(stream: &mut TcpStream, ctx: &ServeContext) -> ShareResult<()> {
    let metadata = tokio::fs::metadata(&ctx.package_path)
        .await
        .map_err(|e| ShareError::Io(format!("Failed to stat package: {}", e)))?;
    let headers = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/zip\r\nContent-Length: {}\r\nContent-Disposition: attachment; filename=\"{}\"\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
        metadata.len(),
        package_filename(&ctx.package_path)
    );
    stream
        .write_all(headers.as_bytes())
        .await
        .map_err(|e| ShareError::Io(format!("Write headers error: {}", e)))
}

/// Serve the package manifest as JSON for preview before download
async fn serve_manifest(stream: &mut TcpStream, package_path: &Path) -> ShareResult<()> {
    let manifest = import::validate_local_package(package_path).await?;
    let json = serde_json::to_string_pretty(&manifest)?;

    let headers = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        json.len()
    );
    stream
        .write_all(headers.as_bytes())
        .await
        .map_err(|e| ShareError::Io(format!("Write headers error: {}", e)))?;
    stream
        .write_all(json.as_bytes())
        .await
        .map_err(|e| ShareError::Io(format!("Write body error: {}", e)))
}

async fn write_text(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &str,
) -> ShareResult<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| ShareError::Io(format!("Write response error: {}", e)))
}

fn package_filename(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("instance.share")
        .to_string()
}
