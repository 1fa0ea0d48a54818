//! HTTP boundary around per-client [`Session`]s.
//!
//! Each client gets its own session, keyed by a cookie. Submits are
//! serialized through the store lock and run on a blocking thread, so at most
//! one inference is in flight.

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{ErrorCategory, NeuroSegError, Result};
use crate::model::ModelHandle;
use crate::pipeline::Prediction;
use crate::report;
use crate::session::{DisplaySignal, ResultBundle, Session, Submission};
use crate::traits::SegmentationModel;

pub const OVERLAY_URL: &str = "/api/overlay.png";
pub const MASK_URL: &str = "/api/mask.png";
pub const ORIGINAL_URL: &str = "/api/original.png";
pub const REPORT_URL: &str = "/api/report";

pub const SESSION_COOKIE: &str = "neuroseg_session";

/// Uploads larger than this are refused before decoding.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Live sessions kept at once; the least recently used one is dropped first.
pub const MAX_SESSIONS: usize = 64;

struct StoredSession<M> {
    session: Session<M>,
    last_used: u64,
}

/// Client sessions sharing one model.
struct SessionStore<M> {
    model: Arc<ModelHandle<M>>,
    report_path: PathBuf,
    sessions: HashMap<Uuid, StoredSession<M>>,
    clock: u64,
}

impl<M: SegmentationModel> SessionStore<M> {
    fn new(model: Arc<ModelHandle<M>>, report_path: PathBuf) -> Self {
        Self {
            model,
            report_path,
            sessions: HashMap::new(),
            clock: 0,
        }
    }

    /// The session for `id`, created on first use.
    fn session(&mut self, id: Uuid) -> &mut Session<M> {
        self.clock += 1;
        if !self.sessions.contains_key(&id) {
            self.evict_if_full();
            debug!(%id, "new session");
        }

        let model = &self.model;
        let report_path = &self.report_path;
        let stored = self.sessions.entry(id).or_insert_with(|| StoredSession {
            session: Session::new(Arc::clone(model), report_path.clone()),
            last_used: 0,
        });
        stored.last_used = self.clock;
        &mut stored.session
    }

    fn existing(&mut self, id: Uuid) -> Option<&mut Session<M>> {
        self.clock += 1;
        let stored = self.sessions.get_mut(&id)?;
        stored.last_used = self.clock;
        Some(&mut stored.session)
    }

    fn evict_if_full(&mut self) {
        if self.sessions.len() < MAX_SESSIONS {
            return;
        }
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|(_, stored)| stored.last_used)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.sessions.remove(&id);
            debug!(%id, "evicted least recently used session");
        }
    }
}

pub struct AppState<M> {
    model: Arc<ModelHandle<M>>,
    store: Arc<Mutex<SessionStore<M>>>,
}

impl<M> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            store: Arc::clone(&self.store),
        }
    }
}

fn session_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().strip_prefix(SESSION_COOKIE)?.strip_prefix('='))
        .find_map(|value| Uuid::parse_str(value).ok())
}

fn session_cookie(id: Uuid) -> String {
    format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax")
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    prediction: Prediction,
    confidence: String,
    tumor_area: String,
    results_visible: bool,
    overlay: &'static str,
    mask: &'static str,
    original: &'static str,
    report: &'static str,
}

impl From<&Submission> for SubmitResponse {
    fn from(submission: &Submission) -> Self {
        let bundle = &submission.bundle;
        Self {
            prediction: bundle.prediction,
            confidence: bundle.confidence.clone(),
            tumor_area: bundle.tumor_area.clone(),
            results_visible: submission.signal == DisplaySignal::ShowResults,
            overlay: OVERLAY_URL,
            mask: MASK_URL,
            original: ORIGINAL_URL,
            report: REPORT_URL,
        }
    }
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    results_visible: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    category: Option<ErrorCategory>,
}

pub enum ApiError {
    Request(NeuroSegError),
    NotFound(&'static str),
}

impl From<NeuroSegError> for ApiError {
    fn from(err: NeuroSegError) -> Self {
        Self::Request(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: what.to_string(),
                    category: None,
                },
            ),
            Self::Request(err) => {
                let status = match (&err, err.category()) {
                    (NeuroSegError::ModelUnavailable { .. }, _) => StatusCode::SERVICE_UNAVAILABLE,
                    (_, ErrorCategory::UserInput) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                } else {
                    warn!(error = %err, "request rejected");
                }
                (
                    status,
                    ErrorBody {
                        error: err.to_string(),
                        category: Some(err.category()),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn invalid_upload(err: MultipartError) -> ApiError {
    NeuroSegError::Validation {
        field: "upload".to_string(),
        reason: err.body_text(),
    }
    .into()
}

async fn submit<M: SegmentationModel + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> std::result::Result<Response, ApiError> {
    // nothing is decoded or stored while the model is unavailable
    state.model.get()?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid_upload)? {
        if field.name() != Some("image") {
            continue;
        }
        let bytes = field.bytes().await.map_err(invalid_upload)?;
        // browsers send an empty part when no file was chosen
        if !bytes.is_empty() {
            upload = Some(bytes);
        }
    }

    let id = session_id(&headers).unwrap_or_else(Uuid::new_v4);
    let mut store = Arc::clone(&state.store).lock_owned().await;
    let submission = tokio::task::spawn_blocking(move || -> Result<Submission> {
        let session = match upload {
            Some(bytes) => {
                let image =
                    image::load_from_memory(&bytes).map_err(|e| NeuroSegError::Validation {
                        field: "image".to_string(),
                        reason: format!("could not be decoded: {e}"),
                    })?;
                let session = store.session(id);
                session.set_input(image);
                session
            }
            None => store.existing(id).ok_or(NeuroSegError::MissingImage)?,
        };
        session.submit()
    })
    .await
    .map_err(|e| NeuroSegError::model("submit task", e))??;

    Ok((
        [(header::SET_COOKIE, session_cookie(id))],
        Json(SubmitResponse::from(&submission)),
    )
        .into_response())
}

async fn clear<M: SegmentationModel + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
) -> Json<ClearResponse> {
    let mut store = state.store.lock().await;
    let signal = session_id(&headers)
        .and_then(|id| store.existing(id))
        .map_or(DisplaySignal::HideResults, Session::clear);
    Json(ClearResponse {
        results_visible: signal == DisplaySignal::ShowResults,
    })
}

#[derive(Debug, Clone, Copy)]
enum ImageKind {
    Overlay,
    Mask,
    Original,
}

impl ImageKind {
    fn select(self, bundle: &ResultBundle) -> &RgbImage {
        match self {
            Self::Overlay => &bundle.overlay,
            Self::Mask => &bundle.mask,
            Self::Original => &bundle.original,
        }
    }
}

async fn displayed<M: SegmentationModel>(
    state: &AppState<M>,
    headers: &HeaderMap,
) -> std::result::Result<Arc<ResultBundle>, ApiError> {
    let mut store = state.store.lock().await;
    let bundle = session_id(headers)
        .and_then(|id| store.existing(id))
        .and_then(|session| session.last_result());
    bundle.ok_or(ApiError::NotFound("no results are displayed"))
}

async fn png<M: SegmentationModel + 'static>(
    state: &AppState<M>,
    headers: &HeaderMap,
    kind: ImageKind,
) -> std::result::Result<Response, ApiError> {
    let bundle = displayed(state, headers).await?;
    let mut buf = Cursor::new(Vec::new());
    kind.select(&bundle)
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(NeuroSegError::from)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], buf.into_inner()).into_response())
}

async fn overlay_png<M: SegmentationModel + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    png(&state, &headers, ImageKind::Overlay).await
}

async fn mask_png<M: SegmentationModel + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    png(&state, &headers, ImageKind::Mask).await
}

async fn original_png<M: SegmentationModel + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    png(&state, &headers, ImageKind::Original).await
}

/// The report of this client's displayed results. The file on disk is shared
/// by every client, so the text is rendered from the client's own bundle.
async fn report_txt<M: SegmentationModel + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let bundle = displayed(&state, &headers).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"report.txt\"",
            ),
        ],
        report::render(&bundle.summary()),
    )
        .into_response())
}

async fn health<M: SegmentationModel + 'static>(
    State(state): State<AppState<M>>,
) -> (StatusCode, &'static str) {
    if state.model.is_available() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "model unavailable")
    }
}

pub fn router<M: SegmentationModel + 'static>(
    model: Arc<ModelHandle<M>>,
    report_path: impl Into<PathBuf>,
) -> Router {
    let state = AppState {
        store: Arc::new(Mutex::new(SessionStore::new(
            Arc::clone(&model),
            report_path.into(),
        ))),
        model,
    };

    Router::new()
        .route("/api/submit", post(submit::<M>))
        .route("/api/clear", post(clear::<M>))
        .route(OVERLAY_URL, get(overlay_png::<M>))
        .route(MASK_URL, get(mask_png::<M>))
        .route(ORIGINAL_URL, get(original_png::<M>))
        .route(REPORT_URL, get(report_txt::<M>))
        .route("/healthz", get(health::<M>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve<M: SegmentationModel + 'static>(
    model: Arc<ModelHandle<M>>,
    report_path: impl Into<PathBuf>,
    addr: SocketAddr,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| NeuroSegError::Configuration {
            message: format!("failed to bind {addr}: {e}"),
        })?;
    info!(%addr, "listening");

    axum::serve(listener, router(model, report_path))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
