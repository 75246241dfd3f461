use anyhow::Result;
use image::{DynamicImage, ImageFormat};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use tempfile::tempdir;

use helmet_witness::api::{ApiConfig, ApiHandle, ApiServer, AppState};
use helmet_witness::{
    BoundingBox, FilesystemCropStore, ImageService, InMemoryViolationStore, PredictionService,
    StubDetector,
};

struct Response {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

fn send(
    addr: std::net::SocketAddr,
    method: &str,
    path: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<Response> {
    let mut stream = TcpStream::connect(addr)?;
    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n",
        method,
        path,
        body.len()
    );
    if let Some(content_type) = content_type {
        request.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes())?;
    stream.write_all(body)?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let headers = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    Ok(Response {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    })
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

struct TestApi {
    _dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(detector: StubDetector) -> Result<Self> {
        let dir = tempdir()?;
        let state = AppState {
            store: Box::new(InMemoryViolationStore::new()),
            crops: FilesystemCropStore::new(dir.path().join("cropped_images"), "http://test:8000"),
            images: ImageService::new(dir.path().join("images")),
            predictions: PredictionService::new(Box::new(detector)),
        };
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, state).spawn()?;
        Ok(Self {
            _dir: dir,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.api_handle.as_ref().expect("api handle").addr
    }

    fn upload_png(&self) -> Result<String> {
        let resp = send(
            self.addr(),
            "POST",
            "/image/upload?filename=rider.png",
            Some("image/png"),
            &png_bytes(640, 480),
        )?;
        assert_eq!(resp.status, 200);
        Ok(resp.json()["id"].as_str().expect("id").to_string())
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
    }
}

#[test]
fn health_reports_ok() -> Result<()> {
    let api = TestApi::new(StubDetector::default())?;
    let resp = send(api.addr(), "GET", "/health", None, b"")?;
    assert_eq!(resp.status, 200);
    assert!(resp.headers.contains("Content-Type: application/json"));
    assert_eq!(resp.json()["status"], "ok");
    Ok(())
}

#[test]
fn upload_predict_and_list_violations() -> Result<()> {
    let api = TestApi::new(StubDetector::new(vec![
        BoundingBox::new(100.0, 100.0, 60.0, 120.0, 0.9, "driver"),
        BoundingBox::new(400.0, 300.0, 60.0, 120.0, 0.9, "driver"),
        BoundingBox::new(405.0, 240.0, 30.0, 30.0, 0.8, "helmet"),
    ]))?;
    let id = api.upload_png()?;

    let resp = send(api.addr(), "GET", &format!("/image/{}", id), None, b"")?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.json()["content_type"], "image/png");

    let resp = send(api.addr(), "POST", &format!("/image/{}/predict", id), None, b"")?;
    assert_eq!(resp.status, 200);
    let report = resp.json();
    assert_eq!(report["status"], "success");
    assert_eq!(report["predictions"].as_array().unwrap().len(), 3);
    assert_eq!(report["cropped_images"].as_array().unwrap().len(), 1);

    let resp = send(api.addr(), "GET", "/violation/list?page=1&size=5", None, b"")?;
    assert_eq!(resp.status, 200);
    let page = resp.json();
    assert_eq!(page["total"], 1);
    assert_eq!(page["pages"], 1);
    let violation = &page["items"][0];
    assert_eq!(violation["type"], 1);
    let filename = format!("{}_violation_0.jpeg", id);
    assert_eq!(
        violation["image_url"],
        format!("http://test:8000/cropped_images/{}", filename)
    );

    let resp = send(api.addr(), "GET", &format!("/cropped_images/{}", filename), None, b"")?;
    assert_eq!(resp.status, 200);
    assert!(resp.headers.contains("Content-Type: image/jpeg"));
    assert_eq!(&resp.body[..2], &[0xFF, 0xD8]);
    Ok(())
}

#[test]
fn list_images_pages_results() -> Result<()> {
    let api = TestApi::new(StubDetector::default())?;
    for _ in 0..3 {
        api.upload_png()?;
    }
    let resp = send(api.addr(), "GET", "/image/list?page=2&size=2", None, b"")?;
    assert_eq!(resp.status, 200);
    let page = resp.json();
    assert_eq!(page["total"], 3);
    assert_eq!(page["pages"], 2);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);

    let resp = send(api.addr(), "GET", "/image/list?size=0", None, b"")?;
    assert_eq!(resp.status, 400);
    let resp = send(api.addr(), "GET", "/image/list?page=abc", None, b"")?;
    assert_eq!(resp.status, 400);
    Ok(())
}

#[test]
fn rejects_non_image_upload() -> Result<()> {
    let api = TestApi::new(StubDetector::default())?;
    let resp = send(
        api.addr(),
        "POST",
        "/image/upload?filename=notes.txt",
        Some("text/plain"),
        b"hello",
    )?;
    assert_eq!(resp.status, 400);
    assert_eq!(resp.json()["error"], "invalid_image_format");
    Ok(())
}

#[test]
fn unknown_image_is_not_found() -> Result<()> {
    let api = TestApi::new(StubDetector::default())?;
    let resp = send(api.addr(), "GET", "/image/missing", None, b"")?;
    assert_eq!(resp.status, 404);
    let resp = send(api.addr(), "POST", "/image/missing/predict", None, b"")?;
    assert_eq!(resp.status, 404);
    assert_eq!(resp.json()["error"], "image_not_found");
    let resp = send(api.addr(), "GET", "/cropped_images/missing.jpeg", None, b"")?;
    assert_eq!(resp.status, 404);
    Ok(())
}

#[test]
fn detector_failure_maps_to_bad_gateway() -> Result<()> {
    let api = TestApi::new(StubDetector::unavailable(500, "inference backend down"))?;
    let id = api.upload_png()?;
    let resp = send(api.addr(), "POST", &format!("/image/{}/predict", id), None, b"")?;
    assert_eq!(resp.status, 502);
    let body = resp.json();
    assert_eq!(body["error"], "detection_service_error");
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .contains("inference backend down"));
    Ok(())
}

#[test]
fn delete_removes_image() -> Result<()> {
    let api = TestApi::new(StubDetector::new(vec![BoundingBox::new(
        100.0, 100.0, 60.0, 120.0, 0.9, "driver",
    )]))?;
    let id = api.upload_png()?;
    send(api.addr(), "POST", &format!("/image/{}/predict", id), None, b"")?;

    let resp = send(api.addr(), "DELETE", &format!("/image/{}", id), None, b"")?;
    assert_eq!(resp.status, 200);
    let resp = send(api.addr(), "GET", &format!("/image/{}", id), None, b"")?;
    assert_eq!(resp.status, 404);
    let resp = send(api.addr(), "GET", "/violation/list", None, b"")?;
    assert_eq!(resp.json()["total"], 0);
    let resp = send(
        api.addr(),
        "GET",
        &format!("/cropped_images/{}_violation_0.jpeg", id),
        None,
        b"",
    )?;
    assert_eq!(resp.status, 404);
    Ok(())
}

#[test]
fn wrong_method_is_rejected() -> Result<()> {
    let api = TestApi::new(StubDetector::default())?;
    let resp = send(api.addr(), "POST", "/health", None, b"")?;
    assert_eq!(resp.status, 405);
    let resp = send(api.addr(), "GET", "/nowhere", None, b"")?;
    assert_eq!(resp.status, 404);
    Ok(())
}

#[test]
fn oversized_page_is_rejected_and_server_keeps_serving() -> Result<()> {
    let api = TestApi::new(StubDetector::default())?;
    let resp = send(
        api.addr(),
        "GET",
        "/violation/list?page=18446744073709551615&size=100",
        None,
        b"",
    )?;
    assert_eq!(resp.status, 400);
    assert_eq!(resp.json()["error"], "invalid_request");

    let resp = send(api.addr(), "GET", "/image/list?page=9223372036854775807&size=2", None, b"")?;
    assert_eq!(resp.status, 400);

    let resp = send(api.addr(), "GET", "/health", None, b"")?;
    assert_eq!(resp.status, 200);
    Ok(())
}
