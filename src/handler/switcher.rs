use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::{
    handler::{ApiJsonResult, ApiResult},
    switcher::{StatusSnapshot, SwitcherHandle},
    switcher::types::{Overlay, Rect, Resolution, SourceId},
};

pub fn switcher_router(handle: SwitcherHandle) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/active", post(set_active))
        .route("/select-source", post(select_source))
        .with_state(handle)
}

#[derive(Serialize)]
struct StatusResponse {
    available: Vec<AvailableResponse>,
    active: ActiveResponse,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AvailableResponse {
    source: String,
    resolution: Resolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_rate: Option<f64>,
    /// Seconds since the source went live.
    age: u64,
}

#[derive(Serialize)]
struct ActiveResponse {
    primary: String,
    overlays: Vec<OverlayResponse>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OverlayResponse {
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_rect: Option<Rect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dest_rect: Option<Rect>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetActiveRequest {
    source: String,
    fade_ms: Option<u64>,
}

#[derive(Deserialize)]
struct SelectSourceRequest {
    source: SourceId,
    #[serde(default)]
    overlays: Vec<Overlay>,
}

async fn status(State(handle): State<SwitcherHandle>) -> ApiJsonResult<StatusResponse> {
    let snapshot = handle.status().await?;
    Ok(Json(to_response(snapshot)))
}

async fn set_active(
    State(handle): State<SwitcherHandle>,
    Json(req): Json<SetActiveRequest>,
) -> ApiResult<&'static str> {
    let source = SourceId::from_pin(&req.source);
    handle.select_source(source, Vec::new(), req.fade_ms).await?;
    Ok("ok")
}

async fn select_source(
    State(handle): State<SwitcherHandle>,
    Json(req): Json<SelectSourceRequest>,
) -> ApiResult<&'static str> {
    handle.select_source(req.source, req.overlays, None).await?;
    Ok("ok")
}

fn to_response(snapshot: StatusSnapshot) -> StatusResponse {
    StatusResponse {
        available: snapshot
            .available
            .iter()
            .map(|s| AvailableResponse {
                source: s.source.pin(),
                resolution: s.resolution,
                frame_rate: s.frame_rate,
                age: s.went_live_at.elapsed().as_secs(),
            })
            .collect(),
        active: ActiveResponse {
            primary: snapshot.active.pin.clone(),
            overlays: snapshot
                .active
                .overlays
                .iter()
                .map(|o| OverlayResponse {
                    source: o.source.pin(),
                    source_rect: o.source_rect,
                    dest_rect: o.dest_rect,
                })
                .collect(),
        },
    }
}
