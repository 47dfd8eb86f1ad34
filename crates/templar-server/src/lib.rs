//! Static HTTP server for an image directory.
//!
//! Serves the files of one directory read-only so that another host can
//! import from it: `GET /<file>` streams a file, `GET /` lists the files as a
//! JSON array, `GET /health` reports liveness. A manifest generated with bare
//! file names and placed in the directory as `imports.json` resolves its
//! sources against the manifest URL, so the whole directory is portable.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

/// Name under which a generated manifest is published.
pub const MANIFEST_FILE: &str = "imports.json";

/// The directory being served.
pub struct ImageRoot {
    dir: PathBuf,
}

impl ImageRoot {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Map a request path onto a file below the root. Anything that is not
    /// a plain relative path (`..`, absolute, prefixes) is refused.
    pub fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        let path = url_path.split(['?', '#']).next().unwrap_or(url_path);
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return None;
        }
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return None;
        }
        let full = self.dir.join(relative);
        full.is_file().then_some(full)
    }

    pub fn list_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)
            .map(|rd| {
                rd.filter_map(Result::ok)
                    .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
                    .filter_map(|e| e.file_name().to_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("toml") => "application/toml",
        _ => "application/octet-stream",
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name, value).ok()
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_json(req: tiny_http::Request, json: String) {
    let mut resp = Response::from_string(json);
    if let Some(h) = header("Content-Type", "application/json") {
        resp = resp.with_header(h);
    }
    let _ = req.respond(resp);
}

fn respond_file(req: tiny_http::Request, path: &Path, head_only: bool) {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("open {}: {e}", path.display());
            respond_err(req, 500, "read error");
            return;
        }
    };
    let len = file.metadata().map(|m| m.len()).ok();
    if head_only {
        let mut resp = Response::empty(200);
        if let Some(h) = len.and_then(|l| header("Content-Length", &l.to_string())) {
            resp = resp.with_header(h);
        }
        let _ = req.respond(resp);
        return;
    }
    let mut resp = Response::from_file(file);
    if let Some(h) = header("Content-Type", content_type(path)) {
        resp = resp.with_header(h);
    }
    let _ = req.respond(resp);
}

/// Handle a single HTTP request.
pub fn handle_request(root: &ImageRoot, req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let head_only = match method {
        Method::Get => false,
        Method::Head => true,
        _ => {
            respond_err(req, 405, "method not allowed");
            return;
        }
    };

    if url == "/health" {
        respond_json(req, r#"{"status":"ok"}"#.to_owned());
    } else if url == "/" {
        let json = serde_json::to_string(&root.list_files()).unwrap_or_else(|_| "[]".to_owned());
        respond_json(req, json);
    } else if let Some(path) = root.resolve(&url) {
        respond_file(req, &path, head_only);
    } else {
        respond_err(req, 404, "not found");
    }
}

/// Bind `addr` and serve `root`, blocking the current thread.
pub fn run_server(root: &Arc<ImageRoot>, addr: &str) -> Result<(), String> {
    let server = Server::http(addr).map_err(|e| format!("failed to bind {addr}: {e}"))?;
    info!("serving {} on {addr}", root.dir().display());
    for request in server.incoming_requests() {
        handle_request(root, request);
    }
    Ok(())
}

/// Write `imports.json` for every image in `dir`.
pub fn write_manifest(dir: &Path, base_url: Option<&str>) -> Result<usize, String> {
    let manifest = templar_schema::generate_manifest(dir, base_url).map_err(|e| e.to_string())?;
    let json = manifest.to_json_pretty().map_err(|e| e.to_string())?;
    fs::write(dir.join(MANIFEST_FILE), json + "\n").map_err(|e| e.to_string())?;
    Ok(manifest.len())
}

/// A test helper that serves a directory on a random port in a background thread.
///
/// Drop the `TestServer` to stop the server (via `Server::unblock`).
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub dir: PathBuf,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server for `dir`, bound to `127.0.0.1:0`.
    pub fn start(dir: PathBuf) -> Self {
        fs::create_dir_all(&dir).expect("failed to create test data dir");
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let root = ImageRoot::new(dir.clone());
        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&root, request);
            }
        });

        Self {
            url,
            port,
            dir,
            server,
            _handle: handle,
        }
    }

    /// URL of `file` below the served directory.
    pub fn file_url(&self, file: &str) -> String {
        format!("{}/{file}", self.url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}
