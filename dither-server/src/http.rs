use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderName, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, instrument};

use crate::color;
use crate::config::{self, Preset};
use crate::dither::{DitherError, Rgba};
use crate::message::{DitherRequest, DitherResponse};
use crate::pipeline;
use crate::worker::{DitherWorker, WorkerError, WorkerStats};

pub const PIXEL_SIZE_HEADER: &str = "x-pixel-size";
pub const CUTOFF_HEADER: &str = "x-cutoff";

#[derive(Clone)]
pub struct AppState {
    pub cfg: config::SharedConfig,
    pub worker: Arc<DitherWorker>,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

/// Optional overrides for the image endpoint; colors are CSS strings.
#[derive(Deserialize, Default)]
pub struct ImageQuery {
    pub preset: Option<String>,
    pub pixel_size: Option<i32>,
    pub cutoff: Option<f32>,
    pub black: Option<String>,
    pub white: Option<String>,
}

#[derive(Serialize)]
pub struct PresetResponse {
    pub id: String,
    pub pixel_size: i32,
    pub cutoff: f32,
    pub black_color: Rgba,
    pub white_color: Rgba,
    pub black_hex: String,
    pub white_hex: String,
}

// Logs all 4xx/5xx responses with method, URI, status and latency.
async fn log_error_responses(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let res = next.run(req).await;
    let status = res.status();
    if status.is_server_error() {
        tracing::error!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 5xx");
    } else if status.is_client_error() {
        tracing::warn!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 4xx");
    }
    res
}

fn dither_failure(e: &DitherError) -> Response {
    let status = match e {
        DitherError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
        DitherError::MalformedInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    let body = ErrorBody {
        error: e.to_string(),
        kind: e.kind(),
    };
    (status, Json(body)).into_response()
}

fn worker_failure(e: WorkerError) -> Response {
    match e {
        WorkerError::Dither(d) => dither_failure(&d),
        WorkerError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<config::Config>, StatusCode> {
    config::ConfigManager::to_struct(&state.cfg)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn get_stats(State(state): State<AppState>) -> Json<WorkerStats> {
    Json(state.worker.stats())
}

/// Message endpoint: one request in, one response out.
pub async fn dither_message(
    State(state): State<AppState>,
    Json(request): Json<DitherRequest>,
) -> Result<Json<DitherResponse>, Response> {
    // Malformed requests must report as such, not as over budget.
    request.validate().map_err(|e| dither_failure(&e))?;
    let cfg = config::ConfigManager::to_struct(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?;
    if let Err(e) = pipeline::check_output_budget(
        &request.image_data,
        request.pixel_size,
        cfg.image_limits.as_ref(),
    ) {
        tracing::debug!(error = %e, "dither request over budget");
        return Err(StatusCode::PAYLOAD_TOO_LARGE.into_response());
    }
    state
        .worker
        .run(request)
        .await
        .map(Json)
        .map_err(worker_failure)
}

/// Upload endpoint: multipart `file` in, dithered PNG out.
pub async fn dither_image(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
    mut multipart: Multipart,
) -> Result<Response, Response> {
    let bad_request = || StatusCode::BAD_REQUEST.into_response();
    let mut data: Option<Vec<u8>> = None;
    while let Some(field) = multipart.next_field().await.map_err(|_| bad_request())? {
        if field.name() == Some("file") {
            data = Some(field.bytes().await.map_err(|_| bad_request())?.to_vec());
            break;
        }
    }
    let data = data.ok_or_else(bad_request)?;

    let cfg = config::ConfigManager::to_struct(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?;
    let preset = cfg
        .resolve_preset(query.preset.as_deref())
        .map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    let overrides = Preset {
        pixel_size: query.pixel_size,
        cutoff: query.cutoff,
        black_color: query.black,
        white_color: query.white,
    };
    let params = overrides
        .overlay(&preset)
        .to_params()
        .map_err(|_| bad_request())?;

    let limits = cfg.image_limits.as_ref();
    let raster = pipeline::decode_upload(&data, limits).map_err(|e| {
        tracing::debug!(error = %e, "rejecting upload");
        bad_request()
    })?;
    if pipeline::check_output_budget(&raster, params.pixel_size, limits).is_err() {
        return Err(StatusCode::PAYLOAD_TOO_LARGE.into_response());
    }

    let response = state
        .worker
        .run(DitherRequest::new(raster, params))
        .await
        .map_err(worker_failure)?;
    let png = pipeline::encode_png(&response.image_data)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?;
    let headers = [
        (header::CONTENT_TYPE, mime::IMAGE_PNG.to_string()),
        (
            HeaderName::from_static(PIXEL_SIZE_HEADER),
            response.pixel_size.to_string(),
        ),
        (
            HeaderName::from_static(CUTOFF_HEADER),
            response.cutoff.to_string(),
        ),
    ];
    Ok((headers, png).into_response())
}

fn preset_response(id: String, preset: &Preset) -> Result<PresetResponse, StatusCode> {
    let p = preset
        .to_params()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(PresetResponse {
        id,
        pixel_size: p.pixel_size,
        cutoff: p.cutoff,
        black_color: p.black_color,
        white_color: p.white_color,
        black_hex: color::to_hex(p.black_color),
        white_hex: color::to_hex(p.white_color),
    })
}

pub async fn get_preset(
    Path(preset_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PresetResponse>, StatusCode> {
    let cfg = config::ConfigManager::to_struct(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let preset = cfg
        .resolve_preset(Some(&preset_id))
        .map_err(|_| StatusCode::NOT_FOUND)?;
    preset_response(preset_id, &preset).map(Json)
}

#[instrument(err, skip_all)]
pub async fn patch_preset(
    Path(preset_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<Preset>,
) -> Result<Json<PresetResponse>, StatusCode> {
    config::ConfigManager::update_preset(&state.cfg, &preset_id, &payload)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    config::ConfigManager::save(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let cfg = config::ConfigManager::to_struct(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let preset = cfg
        .resolve_preset(Some(&preset_id))
        .map_err(|_| StatusCode::NOT_FOUND)?;
    preset_response(preset_id, &preset).map(Json)
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(PIXEL_SIZE_HEADER),
            HeaderName::from_static(CUTOFF_HEADER),
        ]);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    let api = Router::new()
        .route("/config", get(get_config))
        .route("/stats", get(get_stats))
        .route(
            "/dither",
            post(dither_message).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/dither/image",
            post(dither_image).layer(DefaultBodyLimit::disable()),
        )
        .route("/presets/{id}", get(get_preset).patch(patch_preset))
        .with_state(state)
        .layer(cors)
        .layer(trace)
        .layer(middleware::from_fn(log_error_responses));

    Router::new().nest("/api", api)
}

/// Serve the HTTP API. If `bind` is Some it is parsed as a socket address, otherwise
/// defaults to 0.0.0.0:8080.
pub async fn serve(app: Router, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr = bind.unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!(addr=%addr, "starting http server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
