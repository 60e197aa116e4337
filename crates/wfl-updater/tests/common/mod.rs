//! Shared fixtures for pipeline tests.
//!
//! `TestServer` is an in-process static file server with `Range` support
//! and fault injection: always-failing paths, paths that fail a number of
//! times first, corrupted bodies, latency, stalled bodies, and ignored range
//! requests. Every request is counted.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use ed25519_dalek::SigningKey;
use tokio::task::JoinHandle;

use wfl_updater::security::{digest_bytes, sign_payload};
use wfl_updater::{
    Downloader, DownloaderConfig, FileEntry, LauncherSettings, Manifest, ManifestService,
    SecurityService, UpdateEvent, UpdateObserver, UpdateService, UpdateStatus,
};

#[derive(Default)]
struct Faults {
    failing: HashSet<String>,
    fail_times: HashMap<String, usize>,
    corrupt: HashSet<String>,
    delays: HashMap<String, Duration>,
    stalls: HashMap<String, usize>,
    ignore_range: HashSet<String>,
}

#[derive(Default)]
struct ServerState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    faults: Mutex<Faults>,
    hits: Mutex<HashMap<String, usize>>,
    range_starts: Mutex<HashMap<String, Vec<u64>>>,
}

/// In-process HTTP file server.
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new().fallback(serve).with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.trim_start_matches('/').to_string(), data.into());
    }

    pub fn remove(&self, path: &str) {
        self.state.files.lock().unwrap().remove(path);
    }

    /// Every request for `path` answers 500.
    pub fn fail(&self, path: &str) {
        self.state.faults.lock().unwrap().failing.insert(path.to_string());
    }

    /// The next `times` requests for `path` answer 503.
    pub fn fail_times(&self, path: &str, times: usize) {
        self.state
            .faults
            .lock()
            .unwrap()
            .fail_times
            .insert(path.to_string(), times);
    }

    /// Serve `path` with its first byte flipped.
    pub fn corrupt(&self, path: &str) {
        self.state.faults.lock().unwrap().corrupt.insert(path.to_string());
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.state
            .faults
            .lock()
            .unwrap()
            .delays
            .insert(path.to_string(), delay);
    }

    /// Send only the first `bytes` of `path`, then hang.
    pub fn stall_after(&self, path: &str, bytes: usize) {
        self.state
            .faults
            .lock()
            .unwrap()
            .stalls
            .insert(path.to_string(), bytes);
    }

    pub fn clear_stall(&self, path: &str) {
        self.state.faults.lock().unwrap().stalls.remove(path);
    }

    /// Answer range requests for `path` with the whole body.
    pub fn ignore_range(&self, path: &str) {
        self.state
            .faults
            .lock()
            .unwrap()
            .ignore_range
            .insert(path.to_string());
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.state.hits.lock().unwrap().values().sum()
    }

    /// Offsets of the range requests received for `path`.
    pub fn range_starts(&self, path: &str) -> Vec<u64> {
        self.state
            .range_starts
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(State(state): State<Arc<ServerState>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().trim_start_matches('/').to_string();
    *state.hits.lock().unwrap().entry(path.clone()).or_default() += 1;

    let (failing, flaky, corrupt, delay, stall, ignore_range) = {
        let mut faults = state.faults.lock().unwrap();
        let flaky = match faults.fail_times.get_mut(&path) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        (
            faults.failing.contains(&path),
            flaky,
            faults.corrupt.contains(&path),
            faults.delays.get(&path).copied(),
            faults.stalls.get(&path).copied(),
            faults.ignore_range.contains(&path),
        )
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if failing {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }
    if flaky {
        return (StatusCode::SERVICE_UNAVAILABLE, "injected transient failure").into_response();
    }

    let Some(mut data) = state.files.lock().unwrap().get(&path).cloned() else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    if corrupt && !data.is_empty() {
        data[0] ^= 0xff;
    }

    let total = data.len() as u64;
    let range_start = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.strip_suffix('-'))
        .and_then(|v| v.parse::<u64>().ok());

    let (status, start) = match range_start {
        Some(start) => {
            state
                .range_starts
                .lock()
                .unwrap()
                .entry(path.clone())
                .or_default()
                .push(start);
            if ignore_range {
                (StatusCode::OK, 0)
            } else if start >= total {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            } else {
                (StatusCode::PARTIAL_CONTENT, start)
            }
        }
        None => (StatusCode::OK, 0),
    };

    let body_bytes = data[start as usize..].to_vec();
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, body_bytes.len())
        .header(header::ACCEPT_RANGES, "bytes");
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, total - 1, total),
        );
    }

    let body = match stall {
        Some(limit) => {
            let first = Bytes::from(body_bytes[..limit.min(body_bytes.len())].to_vec());
            let stream = futures_util::StreamExt::chain(
                futures_util::stream::iter(vec![Ok::<_, std::io::Error>(first)]),
                futures_util::stream::pending(),
            );
            Body::from_stream(stream)
        }
        None => Body::from(body_bytes),
    };

    builder.body(body).unwrap()
}

/// Downloader tuned for tests: fast retries, short timeouts.
pub fn test_downloader() -> Downloader {
    Downloader::with_config(DownloaderConfig {
        connect_timeout_secs: 5,
        read_timeout_secs: 10,
        max_retries: 3,
        retry_backoff: Duration::from_millis(10),
        user_agent: "wfl-updater-tests".to_string(),
    })
    .unwrap()
}

/// Build a manifest for `files` and publish both files and manifest.
pub fn publish(server: &TestServer, version: &str, files: &[(&str, &[u8])]) -> Manifest {
    let prefix = format!("builds/{version}");
    let entries = files
        .iter()
        .map(|(path, data)| {
            server.put(&format!("{prefix}/{path}"), data.to_vec());
            FileEntry {
                path: path.to_string(),
                size: data.len() as u64,
                sha256: digest_bytes(data),
                url: None,
                compressed: false,
                optional: false,
                executable: false,
                delta: None,
            }
        })
        .collect();

    let manifest = Manifest {
        version: version.to_string(),
        channel: "stable".to_string(),
        base_url: server.url(&prefix),
        files: entries,
        executable_name: "game".to_string(),
        launch_arguments: None,
        force_update: false,
    };
    server.put("manifest.json", serde_json::to_vec_pretty(&manifest).unwrap());
    manifest
}

/// Publish a detached signature for the current manifest.
pub fn sign_published(server: &TestServer, key: &SigningKey) {
    let payload = server
        .state
        .files
        .lock()
        .unwrap()
        .get("manifest.json")
        .cloned()
        .unwrap();
    server.put("manifest.sig", sign_payload(key, &payload).to_vec());
}

pub fn settings_for(root: &Path, server: &TestServer, concurrency: usize) -> Arc<LauncherSettings> {
    Arc::new(LauncherSettings {
        install_path: root.to_path_buf(),
        manifest_url: server.url("manifest.json"),
        max_concurrent_downloads: concurrency,
        last_played_version: None,
        require_signature: false,
    })
}

pub fn manifest_service(root: &Path, security: SecurityService) -> ManifestService {
    ManifestService::new(root.to_path_buf(), test_downloader(), security)
}

pub fn update_service(
    root: &Path,
    server: &TestServer,
    concurrency: usize,
    observer: Arc<dyn UpdateObserver>,
) -> UpdateService {
    UpdateService::new(
        settings_for(root, server, concurrency),
        manifest_service(root, SecurityService::default()),
    )
    .with_observer(observer)
}

/// Observer that records the highest number of concurrently active files.
#[derive(Default)]
pub struct ConcurrencyProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl UpdateObserver for ConcurrencyProbe {
    fn on_file_started(&self, _path: &str) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn on_file_finished(&self, _path: &str, _ok: bool) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Observer that runs a closure when the pipeline enters `status`.
pub struct OnStatus<F> {
    status: UpdateStatus,
    action: F,
}

impl<F: Fn() + Send + Sync> OnStatus<F> {
    pub fn new(status: UpdateStatus, action: F) -> Arc<Self> {
        Arc::new(Self { status, action })
    }
}

impl<F: Fn() + Send + Sync> UpdateObserver for OnStatus<F> {
    fn on_status(&self, status: UpdateStatus) {
        if status == self.status {
            (self.action)();
        }
    }
}

/// Status transitions recorded from a channel observer's events.
pub fn statuses(events: &mut tokio::sync::mpsc::UnboundedReceiver<UpdateEvent>) -> Vec<UpdateStatus> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let UpdateEvent::Status(status) = event {
            out.push(status);
        }
    }
    out
}

pub fn read(root: &Path, path: &str) -> Vec<u8> {
    std::fs::read(root.join(path)).unwrap()
}
