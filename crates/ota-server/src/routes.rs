use std::convert::Infallible;
use std::net::IpAddr;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use ota_gateway::{CommandKind, Gateway, UploadRequest};

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
}

type HandlerError = (StatusCode, &'static str);

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub active_sessions: usize,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", post(upload))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /: multipart upload with an `ip` field and `firmware` and/or
/// `spiffs` files. Streams progress lines back until the upload ends.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, HandlerError> {
    let mut device: Option<IpAddr> = None;
    let mut firmware: Option<Bytes> = None;
    let mut spiffs: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        if field.file_name().is_none() {
            if name == "ip" {
                if device.is_some() {
                    return Err((StatusCode::BAD_REQUEST, "invalid ip field"));
                }
                let text = field.text().await.map_err(multipart_error)?;
                let ip = text
                    .trim()
                    .parse()
                    .map_err(|_| (StatusCode::BAD_REQUEST, "failed to parse ip"))?;
                device = Some(ip);
            }
            continue;
        }

        let command = CommandKind::from_field_name(&name)
            .ok_or((StatusCode::BAD_REQUEST, "invalid file name"))?;
        let data = field.bytes().await.map_err(multipart_error)?;
        let slot = match command {
            CommandKind::Flash => &mut firmware,
            CommandKind::SpiFs => &mut spiffs,
        };
        if slot.replace(data).is_some() {
            return Err((StatusCode::BAD_REQUEST, "duplicate file"));
        }
    }

    let device = device.ok_or((StatusCode::BAD_REQUEST, "missing ip"))?;
    if firmware.is_none() && spiffs.is_none() {
        return Err((StatusCode::BAD_REQUEST, "missing payload"));
    }

    info!(
        "Upload for {}: firmware={} spiffs={}",
        device,
        firmware.as_ref().map_or(0, Bytes::len),
        spiffs.as_ref().map_or(0, Bytes::len)
    );

    let progress = state.gateway.start_upload(UploadRequest {
        device,
        firmware,
        spiffs,
    });
    let body = Body::from_stream(progress.into_lines().map(Ok::<_, Infallible>));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(Health {
        status: "ok",
        active_sessions: state.gateway.registry().len().await,
    })
}

fn multipart_error(e: MultipartError) -> HandlerError {
    warn!("Rejected multipart body: {}", e);
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        (StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
    } else {
        (StatusCode::BAD_REQUEST, "invalid multipart body")
    }
}
