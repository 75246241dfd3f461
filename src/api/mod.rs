use crate::config::ServiceConfig;
use crate::crop::FilesystemCropStore;
use crate::detect::build_detector;
use crate::error::PipelineError;
use crate::images::{ImageService, PageRequest, DEFAULT_PAGE_SIZE};
use crate::pipeline::PredictionService;
use crate::storage::{SqliteViolationStore, ViolationStore};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

/// Everything a request handler needs.
pub struct AppState {
    pub store: Box<dyn ViolationStore>,
    pub crops: FilesystemCropStore,
    pub images: ImageService,
    pub predictions: PredictionService,
}

impl AppState {
    pub fn from_config(cfg: &ServiceConfig) -> Result<Self> {
        let store = SqliteViolationStore::open(&cfg.db_path)?;
        let detector = build_detector(&cfg.detector)?;
        Ok(Self {
            store: Box::new(store),
            crops: FilesystemCropStore::new(&cfg.cropped_dir, &cfg.base_url),
            images: ImageService::new(&cfg.upload_dir),
            predictions: PredictionService::new(detector),
        })
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
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
    state: AppState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: AppState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let mut state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &cfg, &mut state, shutdown_thread) {
                log::error!("helmet api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: &ApiConfig,
    state: &mut AppState,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, cfg, state) {
                    log::warn!("helmet api request failed: {}", err);
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

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: String,
}

enum Route<'a> {
    Health,
    Upload,
    ListImages,
    GetImage(&'a str),
    DeleteImage(&'a str),
    Predict(&'a str),
    ListViolations,
    CroppedImage(&'a str),
}

fn route<'a>(method: &str, path: &'a str) -> std::result::Result<Route<'a>, u16> {
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let found = match segments.as_slice() {
        ["health"] => ("GET", Route::Health),
        ["image", "upload"] => ("POST", Route::Upload),
        ["image", "list"] => ("GET", Route::ListImages),
        ["image", id, "predict"] => ("POST", Route::Predict(*id)),
        ["image", id] if method == "DELETE" => ("DELETE", Route::DeleteImage(*id)),
        ["image", id] => ("GET", Route::GetImage(*id)),
        ["violation", "list"] => ("GET", Route::ListViolations),
        ["cropped_images", file] => ("GET", Route::CroppedImage(*file)),
        _ => return Err(404),
    };
    if found.0 != method {
        return Err(405);
    }
    Ok(found.1)
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, state: &mut AppState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream, cfg.max_upload_bytes) {
        Ok(request) => request,
        Err(err) => {
            write_error(&mut stream, 400, "bad_request", err.to_string())?;
            return Err(err);
        }
    };

    let matched = match route(&request.method, &request.path) {
        Ok(matched) => matched,
        Err(405) => return write_error(&mut stream, 405, "method_not_allowed", String::new()),
        Err(_) => return write_error(&mut stream, 404, "not_found", String::new()),
    };

    let result = match matched {
        Route::Health => Ok(json_body(&serde_json::json!({"status": "ok"}))?),
        Route::Upload => upload(&request, state),
        Route::ListImages => page_request(&request).and_then(|page| {
            let page = state.images.list_images(state.store.as_mut(), page)?;
            Ok(json_body(&page)?)
        }),
        Route::GetImage(id) => state
            .images
            .get_image(state.store.as_mut(), id)
            .and_then(|image| Ok(json_body(&image)?)),
        Route::DeleteImage(id) => state
            .images
            .delete_image(state.store.as_mut(), &mut state.crops, id)
            .and_then(|_| {
                Ok(json_body(&serde_json::json!({
                    "status": "success",
                    "message": format!("Image {} deleted", id),
                }))?)
            }),
        Route::Predict(id) => state
            .predictions
            .predict_image(id, state.store.as_mut(), &mut state.crops)
            .and_then(|report| Ok(json_body(&report)?)),
        Route::ListViolations => page_request(&request).and_then(|page| {
            let page = state.images.list_violations(state.store.as_mut(), page)?;
            Ok(json_body(&page)?)
        }),
        Route::CroppedImage(file) => match state.crops.read(file) {
            Ok(bytes) => return write_response(&mut stream, 200, "image/jpeg", &bytes),
            Err(_) => return write_error(&mut stream, 404, "not_found", file.to_string()),
        },
    };

    match result {
        Ok(body) => write_response(&mut stream, 200, "application/json", &body),
        Err(err) => {
            let (status, code) = error_status(&err);
            if status >= 500 {
                log::error!("{} {} failed: {}", request.method, request.path, err);
            }
            write_error(&mut stream, status, code, err.to_string())
        }
    }
}

fn upload(request: &HttpRequest, state: &mut AppState) -> std::result::Result<Vec<u8>, PipelineError> {
    if request.body.is_empty() {
        return Err(PipelineError::InvalidRequest("empty upload body".to_string()));
    }
    let content_type = request
        .headers
        .get("content-type")
        .map(String::as_str)
        .unwrap_or("");
    let query = request.query();
    let filename = query
        .get("filename")
        .map(String::as_str)
        .unwrap_or("upload");
    let record = state
        .images
        .upload(state.store.as_mut(), &request.body, filename, content_type)?;
    Ok(json_body(&serde_json::json!({
        "status": "success",
        "id": record.id,
        "filename": record.filename,
        "filepath": record.filepath,
        "message": "Image uploaded successfully",
    }))?)
}

fn page_request(request: &HttpRequest) -> std::result::Result<PageRequest, PipelineError> {
    let query = request.query();
    let parse = |key: &str, default: usize| -> std::result::Result<usize, PipelineError> {
        match query.get(key) {
            Some(value) => value
                .parse()
                .map_err(|_| PipelineError::InvalidRequest(format!("{} must be an integer", key))),
            None => Ok(default),
        }
    };
    PageRequest::new(parse("page", 1)?, parse("size", DEFAULT_PAGE_SIZE)?)
}

fn json_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn error_status(err: &PipelineError) -> (u16, &'static str) {
    match err {
        PipelineError::ImageNotFound(_) => (404, "image_not_found"),
        PipelineError::InvalidImageFormat(_) => (400, "invalid_image_format"),
        PipelineError::InvalidRequest(_) => (400, "invalid_request"),
        PipelineError::DetectionService { .. } => (502, "detection_service_error"),
        PipelineError::Storage(_) => (500, "internal_error"),
    }
}

fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data.split_off(header_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_error(stream: &mut TcpStream, status: u16, code: &str, detail: String) -> Result<()> {
    let body = serde_json::to_vec(&ErrorBody {
        error: code,
        detail,
    })?;
    write_response(stream, status, "application/json", &body)
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
        502 => "HTTP/1.1 502 Bad Gateway",
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
    headers: HashMap<String, String>,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query(&self) -> HashMap<String, String> {
        match self.raw_path.split_once('?') {
            Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            None => HashMap::new(),
        }
    }
}
