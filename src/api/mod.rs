//! Blocking HTTP/1.1 front end: MJPEG streams, zone counts and the
//! detection log. Every accepted connection gets its own thread, so a
//! long-lived stream never holds up other clients.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::counting::ZoneCounter;
use crate::detect::{Detector, DetectorRegistry, RAW_FEED_NAME};
use crate::encode::STREAM_CONTENT_TYPE;
use crate::source::{SourceMonitor, SourceState};
use crate::stream::StreamMultiplexer;

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

/// Everything request handlers read from.
pub struct ApiState {
    pub multiplexer: StreamMultiplexer,
    pub detectors: DetectorRegistry,
    pub counter: Arc<ZoneCounter>,
    pub source: Option<SourceMonitor>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Open streams end with their next part or
    /// when the frame buffer closes.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = Arc::new(self.state);
        let join = std::thread::Builder::new()
            .name("coopcam-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, state, shutdown_thread) {
                    log::error!("api stopped: {}", err);
                }
            })?;
        log::info!("api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: Arc<ApiState>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                let shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name("coopcam-http".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &state, &shutdown) {
                            log::warn!("api request from {} rejected: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("api: failed to spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, state: &ApiState, shutdown: &AtomicBool) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        return Ok(());
    }

    // The dashboard reaches the same routes under /api.
    let path = match request.path.strip_prefix("/api") {
        Some(rest) if rest.starts_with('/') => rest,
        _ => request.path.as_str(),
    };

    if path == "/" {
        let detector = state.detectors.default_detector();
        return serve_stream(&mut stream, state, detector, shutdown);
    }
    if path == "/video_feed" {
        return serve_stream(&mut stream, state, None, shutdown);
    }
    if let Some(model) = path.strip_prefix("/stream/") {
        return match state.detectors.resolve(model) {
            Ok(detector) => serve_stream(&mut stream, state, detector, shutdown),
            Err(_) => write_json_response(&mut stream, 404, &json!({"error": "unknown_model"})),
        };
    }
    if let Some(zone) = path.strip_prefix("/count/") {
        return serve_count(&mut stream, state, zone);
    }

    match path {
        "/health" => serve_health(&mut stream, state),
        "/coordinates" => match state.counter.coordinates() {
            Some(points) => write_json_response(&mut stream, 200, &json!({ "coordinates": points })),
            None => camera_unavailable(&mut stream),
        },
        "/detections" => serve_detections(&mut stream, state, &request),
        _ => write_json_response(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

// ----------------------------------------------------------------------------
// Routes
// ----------------------------------------------------------------------------

/// Write multipart parts until the client goes away or the buffer closes.
fn serve_stream(
    stream: &mut TcpStream,
    state: &ApiState,
    detector: Option<Arc<dyn Detector>>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let name = detector
        .as_ref()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|| RAW_FEED_NAME.to_string());
    let peer = stream.peer_addr()?;
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store\r\nPragma: no-cache\r\nConnection: close\r\n\r\n",
        STREAM_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;
    log::debug!("api: stream '{}' opened for {}", name, peer);

    let mut frames = state.multiplexer.open_stream(detector);
    for part in frames.by_ref() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if let Err(err) = stream.write_all(&part).and_then(|_| stream.flush()) {
            log::debug!("api: stream '{}' to {} closed: {}", name, peer, err);
            break;
        }
    }
    log::debug!(
        "api: stream '{}' for {} ended after {} frames",
        name,
        peer,
        frames.frames_emitted()
    );
    Ok(())
}

fn serve_count(stream: &mut TcpStream, state: &ApiState, zone: &str) -> Result<()> {
    if state.counter.zone(zone).is_none() {
        return write_json_response(stream, 404, &json!({"error": "unknown_zone"}));
    }
    match state.counter.count_zone(zone) {
        Ok(Some(record)) => write_json_response(stream, 200, &json!({"chicken_count": record.count})),
        Ok(None) => camera_unavailable(stream),
        Err(err) => {
            log::error!("api: count for zone '{}' failed: {}", zone, err);
            write_json_response(stream, 500, &json!({"error": "internal_error"}))
        }
    }
}

fn serve_detections(stream: &mut TcpStream, state: &ApiState, request: &HttpRequest) -> Result<()> {
    let limit = match request.query_param("limit") {
        Some(value) => match value.parse::<usize>() {
            Ok(limit) => Some(limit),
            Err(_) => {
                return write_json_response(stream, 400, &json!({"error": "invalid_limit"}));
            }
        },
        None => None,
    };
    let detections = {
        let mut store = state
            .counter
            .store()
            .lock()
            .map_err(|_| anyhow!("detection store lock poisoned"))?;
        store.list_detections(limit)?
    };
    let count = detections.len();
    write_json_response(
        stream,
        200,
        &json!({ "detections": detections, "count": count }),
    )
}

fn serve_health(stream: &mut TcpStream, state: &ApiState) -> Result<()> {
    let (camera, frames) = match &state.source {
        Some(monitor) => {
            let stats = monitor.stats();
            (stats.state, stats.frames_captured)
        }
        None => (SourceState::Stopped, state.multiplexer.buffer().generation()),
    };
    write_json_response(
        stream,
        200,
        &json!({"status": "ok", "camera": camera.as_str(), "frames": frames}),
    )
}

fn camera_unavailable(stream: &mut TcpStream) -> Result<()> {
    write_json_response(stream, 500, &json!({"error": "camera_unavailable"}))
}

// ----------------------------------------------------------------------------
// HTTP plumbing
// ----------------------------------------------------------------------------

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text.split("\r\n").next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
}

impl HttpRequest {
    fn query_param(&self, key: &str) -> Option<&str> {
        let query = self.raw_path.split_once('?')?.1;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw_path: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            path: raw_path.split('?').next().unwrap().to_string(),
            raw_path: raw_path.to_string(),
        }
    }

    #[test]
    fn query_param_lookup() {
        let req = request("/detections?limit=5&x=1");
        assert_eq!(req.query_param("limit"), Some("5"));
        assert_eq!(req.query_param("x"), Some("1"));
        assert_eq!(req.query_param("y"), None);
        assert_eq!(request("/detections").query_param("limit"), None);
    }
}
