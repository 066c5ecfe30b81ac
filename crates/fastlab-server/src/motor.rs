//! Motor routes: move, position, speed and the live status stream.

use async_trait::async_trait;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use chrono::{DateTime, Utc};
use fastlab_broker::{SampleSink, Session, SinkClosed, StreamPacing, stream_session};
use fastlab_hal::{Motor, MotorHandle};
use fastlab_types::{MoveRequest, SpeedRequest, format_number};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ApiError, accept, operation_failed};
use crate::server::{AppState, MessageBody};
use crate::ws::{WsSender, closed_by_peer, finish};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionBody {
    pub position: f64,
}

/// One message on `/motor/ws/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSample {
    pub sequence: u64,
    pub position: f64,
    pub timestamp: DateTime<Utc>,
}

pub async fn move_motor(
    State(state): State<AppState>,
    body: Result<Json<MoveRequest>, JsonRejection>,
) -> Result<Json<MessageBody>, ApiError> {
    let MoveRequest { position } = accept(body)?;
    info!(position, "move motor requested");

    state
        .motor
        .with_session(|lease| async move {
            lease.call(move |motor| motor.move_to(position)).await.map_err(|cause| {
                operation_failed(lease.endpoint(), "move motor", Some(format_number(position)), cause)
            })
        })
        .await?;

    info!(position, "move command sent");
    Ok(Json(MessageBody::new(format!(
        "Motor moving to position: {}",
        format_number(position)
    ))))
}

pub async fn get_position(State(state): State<AppState>) -> Result<Json<PositionBody>, ApiError> {
    info!("motor position requested");
    let position = state
        .motor
        .with_session(|lease| async move {
            lease
                .call(|motor| motor.position())
                .await
                .map_err(|cause| operation_failed(lease.endpoint(), "get motor position", None, cause))
        })
        .await?;

    info!(position, "motor position read");
    Ok(Json(PositionBody { position }))
}

pub async fn set_speed(
    State(state): State<AppState>,
    body: Result<Json<SpeedRequest>, JsonRejection>,
) -> Result<Json<MessageBody>, ApiError> {
    let SpeedRequest { speed } = accept(body)?;
    info!(speed, "motor speed change requested");

    state
        .motor
        .with_session(|lease| async move {
            lease.call(move |motor| motor.set_speed(speed)).await.map_err(|cause| {
                operation_failed(lease.endpoint(), "set motor speed", Some(format_number(speed)), cause)
            })
        })
        .await?;

    Ok(Json(MessageBody::new(format!(
        "Motor speed set to: {}",
        format_number(speed)
    ))))
}

/// Stream the motor position until the client goes away.
///
/// The connection is opened before the upgrade, so connect failures come
/// back as ordinary HTTP errors instead of an upgraded socket that closes
/// straight away.
pub async fn status_stream(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = state.motor.acquire().await?;
    let pacing = state.motor_pacing;
    Ok(ws.on_upgrade(move |socket| run_status_stream(socket, session, pacing)))
}

async fn run_status_stream(socket: WebSocket, session: Session<MotorHandle>, pacing: StreamPacing) {
    let (tx, rx) = socket.split();
    let mut sink = StatusSink { tx, sequence: 0 };

    let end = stream_session(
        session,
        &mut sink,
        closed_by_peer(rx),
        pacing,
        "read motor position",
        |motor: &mut MotorHandle| motor.position().map(Some),
    )
    .await;

    finish(sink.tx, end).await;
}

/// Numbers each position and sends it as a JSON text message.
struct StatusSink {
    tx: WsSender,
    sequence: u64,
}

#[async_trait]
impl SampleSink<f64> for StatusSink {
    async fn send(&mut self, position: f64) -> Result<(), SinkClosed> {
        self.sequence += 1;
        let sample = StatusSample {
            sequence: self.sequence,
            position,
            timestamp: Utc::now(),
        };
        let json = match serde_json::to_string(&sample) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "status sample not serializable; skipping");
                return Ok(());
            }
        };
        self.tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| SinkClosed)
    }
}
