use std::io::Cursor;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use neuroseg::{mocks::MockSegmentationModel, server, ModelHandle};

const BOUNDARY: &str = "neuroseg-test-boundary";

fn app(handle: ModelHandle<MockSegmentationModel>, temp_dir: &TempDir) -> Router {
    server::router(Arc::new(handle), temp_dir.path().join("report.txt"))
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbImage::from_pixel(width, height, Rgb([60, 60, 60]))
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn multipart_body(image: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(bytes) = image {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"scan.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nfollow-up\r\n--{BOUNDARY}--\r\n"
        )
        .as_bytes(),
    );
    body
}

fn submit_request(image: Option<&[u8]>, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/submit")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::from(multipart_body(image))).unwrap()
}

fn clear_request(cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/api/clear");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

/// `name=value` part of the session cookie the server handed out.
fn session_cookie(response: &axum::response::Response) -> String {
    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    assert!(set_cookie.starts_with(server::SESSION_COOKIE));
    set_cookie.split(';').next().unwrap().to_string()
}

async fn image_of(response: axum::response::Response) -> image::DynamicImage {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    image::load_from_memory(&bytes).unwrap()
}

async fn json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_submit_and_fetch_results() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(
        ModelHandle::Ready(MockSegmentationModel::single_pixel(7, 7)),
        &temp_dir,
    );

    let response = app
        .clone()
        .oneshot(submit_request(Some(&png_bytes(128, 96)), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = session_cookie(&response);
    let body = json(response).await;
    assert_eq!(body["prediction"], "Tumor Detected");
    assert_eq!(body["confidence"], "90.00%");
    assert_eq!(body["tumor_area"], "0.00%");
    assert_eq!(body["results_visible"], true);
    assert_eq!(body["report"], "/api/report");

    let response = app
        .clone()
        .oneshot(get("/api/overlay.png", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let overlay = image_of(response).await;
    assert_eq!((overlay.width(), overlay.height()), (256, 256));

    let response = app
        .clone()
        .oneshot(get("/api/original.png", Some(&cookie)))
        .await
        .unwrap();
    let original = image_of(response).await;
    assert_eq!((original.width(), original.height()), (128, 96));

    let response = app
        .clone()
        .oneshot(get("/api/report", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let report = String::from_utf8(bytes.to_vec()).unwrap();
    assert_eq!(
        report,
        std::fs::read_to_string(temp_dir.path().join("report.txt")).unwrap()
    );
    assert!(report.contains("Prediction: Tumor Detected"));

    // the resubmit reuses this client's stored image
    let response = app
        .oneshot(submit_request(None, Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_submit_without_image_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(
        ModelHandle::Ready(MockSegmentationModel::empty()),
        &temp_dir,
    );

    let response = app.clone().oneshot(submit_request(None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert_eq!(body["category"], "user_input");
    assert!(!temp_dir.path().join("report.txt").exists());

    let response = app.oneshot(get("/api/mask.png", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_clients_do_not_share_sessions() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(
        ModelHandle::Ready(MockSegmentationModel::single_pixel(0, 0)),
        &temp_dir,
    );

    let response = app
        .clone()
        .oneshot(submit_request(Some(&png_bytes(128, 96)), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first = session_cookie(&response);

    // a second client has nothing stored, with or without a cookie of its own
    let response = app.clone().oneshot(submit_request(None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let other = format!("{}={}", server::SESSION_COOKIE, uuid::Uuid::new_v4());
    let response = app
        .clone()
        .oneshot(submit_request(None, Some(&other)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    for uri in ["/api/original.png", "/api/overlay.png", "/api/report"] {
        let response = app.clone().oneshot(get(uri, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        let response = app.clone().oneshot(get(uri, Some(&other))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }

    // the second client's clear and upload leave the first client's results alone
    let response = app.clone().oneshot(clear_request(Some(&other))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .clone()
        .oneshot(submit_request(Some(&png_bytes(64, 64)), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_ne!(session_cookie(&response), first);

    let response = app
        .oneshot(get("/api/original.png", Some(&first)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let original = image_of(response).await;
    assert_eq!((original.width(), original.height()), (128, 96));
}

#[tokio::test]
async fn test_undecodable_upload_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(
        ModelHandle::Ready(MockSegmentationModel::empty()),
        &temp_dir,
    );

    let response = app
        .oneshot(submit_request(Some(b"definitely not a png"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unavailable_model() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(
        ModelHandle::Unavailable {
            reason: "missing".to_string(),
        },
        &temp_dir,
    );

    let response = app.clone().oneshot(get("/healthz", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = app
        .clone()
        .oneshot(submit_request(Some(&png_bytes(128, 96)), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().get(header::SET_COOKIE).is_none());

    // the model is checked before the upload is decoded
    let response = app
        .oneshot(submit_request(Some(b"definitely not a png"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_clear_hides_results_and_keeps_report() {
    let temp_dir = TempDir::new().unwrap();
    let app = app(
        ModelHandle::Ready(MockSegmentationModel::empty()),
        &temp_dir,
    );

    let response = app
        .clone()
        .oneshot(submit_request(Some(&png_bytes(128, 96)), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = session_cookie(&response);
    let report_before = std::fs::read_to_string(temp_dir.path().join("report.txt")).unwrap();

    let response = app
        .clone()
        .oneshot(clear_request(Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["results_visible"], false);

    let response = app
        .clone()
        .oneshot(get("/api/overlay.png", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // the cleared session no longer holds an input image
    let response = app
        .oneshot(submit_request(None, Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let report_after = std::fs::read_to_string(temp_dir.path().join("report.txt")).unwrap();
    assert_eq!(report_before, report_after);
}
