//! HTTP API. Thin axum handlers over [`HeatingSystem`]; malformed
//! input maps to 400 with a JSON error body, unknown services to 404.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use tracing::warn;

use heating_common::{
    Channel, DomainError, Request, TargetTemp, TemperatureWire, Timeline, Until, UntilWire,
};

use crate::app::HeatingSystem;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct RequestBody {
    service: String,
    source: String,
    until: UntilWire,
    temperature: TemperatureWire,
}

#[derive(Debug, Deserialize)]
struct BoostBody {
    source: String,
    temperature: f64,
}

pub fn router(system: Arc<HeatingSystem>, web_root: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/api/state", get(handle_get_state))
        .route("/api/request", post(handle_post_request))
        .route("/api/log/{type}/{service}", get(handle_get_log))
        .route(
            "/api/timeline/{service}",
            get(handle_get_timeline).put(handle_put_timeline),
        )
        .route("/api/boost/{service}", post(handle_post_boost))
        .with_state(system);
    match web_root {
        Some(dir) => api.fallback_service(ServeDir::new(dir)),
        None => api,
    }
}

async fn handle_get_state(State(system): State<Arc<HeatingSystem>>) -> impl IntoResponse {
    match system.state().await {
        Ok(state) => Json(state).into_response(),
        Err(err) => {
            warn!("state read failed: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read state")
        }
    }
}

async fn handle_post_request(
    State(system): State<Arc<HeatingSystem>>,
    Json(body): Json<RequestBody>,
) -> impl IntoResponse {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(err) => return domain_error_response(err),
    };
    match system.services().make_request(&body.service, request).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => domain_error_response(err),
    }
}

fn decode_request(body: &RequestBody) -> Result<Request, DomainError> {
    let until = Until::parse(&body.until)?;
    let temperature = TargetTemp::parse(&body.temperature)?;
    Request::new(body.source.as_str(), until, temperature)
}

async fn handle_get_log(
    State(system): State<Arc<HeatingSystem>>,
    Path((log_type, service)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let since = match params.get("since").map(|raw| raw.parse::<i64>()) {
        None => None,
        Some(Ok(since)) => Some(since),
        Some(Err(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid 'since' parameter")
        }
    };
    let Ok(channel) = Channel::from_str(&service) else {
        return error_response(StatusCode::NOT_FOUND, "No such service");
    };
    let history = match log_type.as_str() {
        "thermostat" => system
            .services()
            .get(channel)
            .and_then(|t| t.history().cloned()),
        "pin" => system.valve().pin(channel).history().cloned(),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Log type must be 'thermostat' or 'pin'",
            )
        }
    };
    match history {
        Some(history) => Json(history.encode_trace(since).await).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No log kept for this service"),
    }
}

async fn handle_get_timeline(
    State(system): State<Arc<HeatingSystem>>,
    Path(service): Path<String>,
) -> impl IntoResponse {
    let Some(thermostat) = Channel::from_str(&service)
        .ok()
        .and_then(|channel| system.services().get(channel).cloned())
    else {
        return error_response(StatusCode::NOT_FOUND, "No such service");
    };
    Json(thermostat.timeline().await).into_response()
}

async fn handle_put_timeline(
    State(system): State<Arc<HeatingSystem>>,
    Path(service): Path<String>,
    Json(timeline): Json<Timeline>,
) -> impl IntoResponse {
    let Ok(channel) = Channel::from_str(&service) else {
        return error_response(StatusCode::NOT_FOUND, "No such service");
    };
    let timeline = match timeline.validated() {
        Ok(timeline) => timeline,
        Err(err) => return domain_error_response(err),
    };
    match system.set_timeline(channel, timeline).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            warn!("timeline update failed: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist timeline",
            )
        }
    }
}

async fn handle_post_boost(
    State(system): State<Arc<HeatingSystem>>,
    Path(service): Path<String>,
    Json(body): Json<BoostBody>,
) -> impl IntoResponse {
    let request = match Request::new(
        body.source.as_str(),
        Until::Boost,
        TargetTemp::Degrees(body.temperature),
    ) {
        Ok(request) => request,
        Err(err) => return domain_error_response(err),
    };
    match system.services().make_request(&service, request).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => domain_error_response(err),
    }
}

fn domain_error_response(err: DomainError) -> axum::response::Response {
    let status = match err {
        DomainError::UnknownService(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
