//! HTTP surface of the daemon.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v1/build` | Run a build, stream newline-delimited JSON messages |
//! | GET | `/healthz` | Always `SERVING` |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! A build stream carries `output` messages, then either one
//! `tsuru_config` or one `error`. Dropping the connection cancels the
//! build.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Json, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use kiln_build::BuildService;
use kiln_core::{BuildRequest, BuildResponse, Code, TsuruConfig, validate_build_request};
use kiln_metrics::{BuildMetrics, render_prometheus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

pub const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
pub struct AppState {
    pub builds: BuildService,
    pub metrics: Arc<BuildMetrics>,
}

/// One line of a build stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMessage {
    Output(String),
    TsuruConfig(TsuruConfig),
    Error { code: Code, message: String },
}

impl From<BuildResponse> for StreamMessage {
    fn from(msg: BuildResponse) -> Self {
        match msg {
            BuildResponse::Output(text) => StreamMessage::Output(text),
            BuildResponse::TsuruConfig(config) => StreamMessage::TsuruConfig(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/build", post(build))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "SERVING"
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render_prometheus(&state.metrics),
    )
}

async fn build(State(state): State<AppState>, Json(req): Json<BuildRequest>) -> Response {
    if let Err(e) = validate_build_request(&req) {
        let body = StreamMessage::Error {
            code: e.code(),
            message: e.to_string(),
        };
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    let token = CancellationToken::new();
    let cancel_on_disconnect = token.clone().drop_guard();
    let (mut responses, handle) = state.builds.spawn(token, req);
    let (lines_tx, lines_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(msg) = responses.recv().await {
            if let Some(line) = encode(&StreamMessage::from(msg))
                && lines_tx.send(line).is_err()
            {
                break;
            }
        }
        let failure = match handle.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(StreamMessage::Error {
                code: e.code(),
                message: e.to_string(),
            }),
            Err(e) => {
                error!(error = %e, "build task failed");
                Some(StreamMessage::Error {
                    code: Code::Internal,
                    message: "build task failed".to_string(),
                })
            }
        };
        if let Some(line) = failure.as_ref().and_then(encode) {
            let _ = lines_tx.send(line);
        }
    });

    let stream = futures::stream::unfold(
        (lines_rx, cancel_on_disconnect),
        |(mut rx, guard)| async move {
            let line = rx.recv().await?;
            Some((Ok::<_, Infallible>(line), (rx, guard)))
        },
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, NDJSON)],
        Body::from_stream(stream),
    )
        .into_response()
}

fn encode(msg: &StreamMessage) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(mut line) => {
            line.push('\n');
            Some(line)
        }
        Err(e) => {
            warn!(error = %e, "failed to encode build stream message");
            None
        }
    }
}
