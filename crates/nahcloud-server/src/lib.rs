//! HTTP server for the Terraform remote-state backend protocol.
//!
//! Serves `GET`/`POST`/`DELETE`/`LOCK`/`UNLOCK` on `/tfstate/{id}` (also
//! under the `/v1` API prefix), plus `/health` and `/buildz`. Requests are
//! turned into [`Reply`] values by [`dispatch`], which knows nothing about
//! `tiny_http`; [`handle_request`] adapts between the two.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

pub mod config;
pub mod reply;
pub mod service;

pub use config::{ConfigLayer, ServerConfig};
pub use reply::Reply;
pub use service::{ServiceError, StateService, Unlocked};

use nahcloud_store::{StateStore, StoreError};
use serde::Serialize;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tiny_http::{Header, Response, Server, StatusCode};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(String),
}

const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    (
        "Access-Control-Allow-Methods",
        "GET, POST, PUT, PATCH, DELETE, OPTIONS, LOCK, UNLOCK",
    ),
    (
        "Access-Control-Allow-Headers",
        "Accept, Authorization, Content-Type, X-CSRF-Token",
    ),
];

/// Shared state for all request handlers.
pub struct App {
    service: StateService,
    max_body_bytes: usize,
    started: Instant,
}

impl App {
    pub fn new(service: StateService, max_body_bytes: usize) -> Self {
        Self {
            service,
            max_body_bytes,
            started: Instant::now(),
        }
    }

    pub fn service(&self) -> &StateService {
        &self.service
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a> {
    State(&'a str),
    Health,
    Buildz,
}

/// Parse a URL path (without query string) into a route.
///
/// State routes are accepted both as `/tfstate/{id}` and `/v1/tfstate/{id}`.
pub fn parse_route(path: &str) -> Option<Route<'_>> {
    match path {
        "/health" => return Some(Route::Health),
        "/buildz" => return Some(Route::Buildz),
        _ => {}
    }
    let rest = path.strip_prefix("/v1").unwrap_or(path);
    let id = rest.strip_prefix("/tfstate/")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(Route::State(id))
}

fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| percent_decode(v))
        .filter(|v| !v.is_empty())
}

/// Undo form encoding (`%XX` and `+`). Malformed escapes are kept literally.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let escaped = bytes
                    .get(i + 1..i + 3)
                    .filter(|hex| hex.iter().all(u8::is_ascii_hexdigit))
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(b) = escaped {
                    out.push(b);
                    i += 3;
                    continue;
                }
                out.push(b'%');
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Serialize)]
struct BuildInfo {
    version: &'static str,
    os: &'static str,
    arch: &'static str,
    uptime: String,
}

fn handle_state(app: &App, method: &str, id: &str, query: Option<&str>, body: &[u8]) -> Reply {
    let svc = &app.service;
    let result = match method {
        "GET" => svc.get_state(id).map(Reply::octet),
        "POST" => {
            let lock_id = query.and_then(|q| query_param(q, "ID"));
            svc.set_state(id, body, lock_id.as_deref())
                .map(|()| Reply::empty(200))
        }
        "DELETE" => svc.delete_state(id).map(|()| Reply::empty(200)),
        "LOCK" => svc
            .acquire_lock(id, body)
            .map(|record| Reply::json(200, &record)),
        "UNLOCK" => svc.release_lock(id, body).map(|_| Reply::empty(200)),
        _ => return Reply::error(405, "method not allowed"),
    };
    result.unwrap_or_else(Reply::from)
}

/// Route one request and produce its reply.
pub fn dispatch(app: &App, method: &str, url: &str, body: &[u8]) -> Reply {
    if method == "OPTIONS" {
        return Reply::empty(200);
    }
    let (path, query) = split_query(url);
    match parse_route(path) {
        Some(Route::State(id)) => handle_state(app, method, id, query, body),
        Some(Route::Health) if method == "GET" => {
            Reply::json(200, &serde_json::json!({ "status": "ok" }))
        }
        Some(Route::Buildz) if method == "GET" => Reply::json(
            200,
            &BuildInfo {
                version: env!("CARGO_PKG_VERSION"),
                os: std::env::consts::OS,
                arch: std::env::consts::ARCH,
                uptime: format!("{}s", app.started.elapsed().as_secs()),
            },
        ),
        Some(Route::Health | Route::Buildz) => Reply::error(405, "method not allowed"),
        None => Reply::error(404, "not found"),
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn respond(req: tiny_http::Request, reply: Reply) {
    let mut response = Response::from_data(reply.body).with_status_code(StatusCode(reply.status));
    for h in CORS_HEADERS
        .iter()
        .filter_map(|(name, value)| header(name, value))
    {
        response.add_header(h);
    }
    if let Some(h) = reply.content_type.and_then(|ct| header("Content-Type", ct)) {
        response.add_header(h);
    }
    if let Err(e) = req.respond(response) {
        debug!("failed to send response: {e}");
    }
}

/// Read at most `limit` bytes. `Ok(None)` means the body was larger.
fn read_body(req: &mut tiny_http::Request, limit: usize) -> std::io::Result<Option<Vec<u8>>> {
    if req.body_length().is_some_and(|len| len > limit) {
        return Ok(None);
    }
    let mut body = Vec::new();
    req.as_reader()
        .take(limit as u64 + 1)
        .read_to_end(&mut body)?;
    if body.len() > limit {
        return Ok(None);
    }
    Ok(Some(body))
}

/// Handle a single HTTP request.
pub fn handle_request(app: &App, mut req: tiny_http::Request) {
    let method = req.method().to_string();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let body = match read_body(&mut req, app.max_body_bytes) {
        Ok(Some(body)) => body,
        Ok(None) => {
            respond(req, Reply::error(413, "request body too large"));
            return;
        }
        Err(e) => {
            error!("{method} {url}: failed to read body: {e}");
            respond(req, Reply::error(400, "failed to read request body"));
            return;
        }
    };

    let reply = dispatch(app, &method, &url, &body);
    debug!("{method} {url} -> {}", reply.status);
    respond(req, reply);
}

/// Unblocks every worker of a running server.
#[derive(Clone)]
pub struct Stopper {
    server: Arc<Server>,
    workers: usize,
}

impl Stopper {
    pub fn stop(&self) {
        for _ in 0..self.workers {
            self.server.unblock();
        }
    }
}

/// A running server: one `tiny_http::Server` shared by a pool of worker threads.
///
/// Dropping the handle stops the workers and waits for them to finish their
/// current request.
pub struct ServerHandle {
    addr: SocketAddr,
    stopper: Stopper,
    workers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn start(app: Arc<App>, addr: &str, workers: usize) -> Result<Self, ServerError> {
        let server = Server::http(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_owned(),
            reason: e.to_string(),
        })?;
        let local = server.server_addr().to_ip().ok_or_else(|| ServerError::Bind {
            addr: addr.to_owned(),
            reason: "not an IP address".to_owned(),
        })?;
        let server = Arc::new(server);

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let server = Arc::clone(&server);
            let app = Arc::clone(&app);
            let handle = std::thread::Builder::new()
                .name(format!("http-worker-{n}"))
                .spawn(move || {
                    for request in server.incoming_requests() {
                        handle_request(&app, request);
                    }
                })?;
            handles.push(handle);
        }
        info!("listening on {local} with {workers} workers");

        Ok(Self {
            addr: local,
            stopper: Stopper { server, workers },
            workers: handles,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    /// Block until every worker has exited (after [`Stopper::stop`]).
    pub fn wait(mut self) {
        self.join_workers();
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("HTTP worker panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stopper.stop();
            self.join_workers();
        }
    }
}

/// Build the app from a resolved config and serve until stopped.
pub fn run_server(config: &ServerConfig, store: StateStore) -> Result<ServerHandle, ServerError> {
    let app = Arc::new(App::new(StateService::new(store), config.max_body_bytes));
    ServerHandle::start(app, &config.addr, config.workers)
}

/// A test helper that starts a server on a random port in background threads.
///
/// The server listens on `127.0.0.1:{port}`. Drop the `TestServer` to stop it.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    _handle: ServerHandle,
}

impl TestServer {
    /// Start a test server persisting into `data_dir`.
    pub fn start(data_dir: PathBuf) -> Self {
        let store = ServerConfig {
            data_dir: Some(data_dir.clone()),
            ..ServerConfig::default()
        }
        .open_store()
        .expect("failed to open test store");
        Self::with_store(store, Some(data_dir))
    }

    /// Start a test server keeping state in memory.
    pub fn in_memory() -> Self {
        Self::with_store(StateStore::in_memory(), None)
    }

    fn with_store(store: StateStore, data_dir: Option<PathBuf>) -> Self {
        let config = ServerConfig {
            addr: "127.0.0.1:0".to_owned(),
            ..ServerConfig::default()
        };
        let handle = run_server(&config, store).expect("failed to bind test HTTP server");
        let port = handle.local_addr().port();
        Self {
            url: format!("http://127.0.0.1:{port}"),
            port,
            data_dir,
            _handle: handle,
        }
    }
}
