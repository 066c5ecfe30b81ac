//! Camera routes: single frames, exposure, gain and the live JPEG stream.

use async_trait::async_trait;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use fastlab_broker::{SampleSink, Session, SinkClosed, StreamPacing, stream_session};
use fastlab_hal::{Camera, CameraFrame, CameraHandle};
use fastlab_types::{ExposureRequest, GainRequest, InstrumentFault, format_number};
use futures_util::{SinkExt, StreamExt};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, ImageBuffer};
use tracing::{info, warn};

use crate::error::{ApiError, accept, operation_failed};
use crate::server::{AppState, MessageBody};
use crate::ws::{WsSender, closed_by_peer, finish};

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

const NO_FRAME: &str = "No frames received from camera";
const ENCODE_FAILED: &str = "Could not encode frame to JPEG";

/// Encode an 8-bit greyscale frame as JPEG.
///
/// Returns `None` when the frame's buffer does not match its dimensions or
/// the encoder rejects it.
pub fn encode_jpeg(frame: &CameraFrame, quality: u8) -> Option<Bytes> {
    if !frame.is_well_formed() {
        return None;
    }
    let img: GrayImage = ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())?;

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder.encode_image(&img).ok()?;

    Some(Bytes::from(jpeg))
}

pub async fn get_frame(State(state): State<AppState>) -> Result<Response, ApiError> {
    info!("camera frame requested");
    let quality = state.jpeg_quality;

    let jpeg = state
        .camera
        .with_session(|lease| async move {
            lease
                .call(move |camera| {
                    let frame = camera.frame()?.ok_or_else(|| InstrumentFault::new(NO_FRAME))?;
                    encode_jpeg(&frame, quality).ok_or_else(|| InstrumentFault::new(ENCODE_FAILED))
                })
                .await
                .map_err(|cause| operation_failed(lease.endpoint(), "acquire camera frame", None, cause))
        })
        .await?;

    info!(bytes = jpeg.len(), "camera frame served");
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

pub async fn set_exposure(
    State(state): State<AppState>,
    body: Result<Json<ExposureRequest>, JsonRejection>,
) -> Result<Json<MessageBody>, ApiError> {
    let ExposureRequest { exposure_time_us } = accept(body)?;
    info!(exposure_time_us, "camera exposure change requested");

    state
        .camera
        .with_session(|lease| async move {
            lease
                .call(move |camera| camera.set_exposure_time(exposure_time_us))
                .await
                .map_err(|cause| {
                    operation_failed(
                        lease.endpoint(),
                        "set exposure time",
                        Some(format_number(exposure_time_us)),
                        cause,
                    )
                })
        })
        .await?;

    Ok(Json(MessageBody::new(format!(
        "Exposure time set to {} us",
        format_number(exposure_time_us)
    ))))
}

pub async fn set_gain(
    State(state): State<AppState>,
    body: Result<Json<GainRequest>, JsonRejection>,
) -> Result<Json<MessageBody>, ApiError> {
    let GainRequest { gain } = accept(body)?;
    info!(gain, "camera gain change requested");

    state
        .camera
        .with_session(|lease| async move {
            lease
                .call(move |camera| camera.set_gain(gain))
                .await
                .map_err(|cause| operation_failed(lease.endpoint(), "set gain", Some(format_number(gain)), cause))
        })
        .await?;

    Ok(Json(MessageBody::new(format!("Gain set to {}", format_number(gain)))))
}

/// Stream JPEG frames as binary messages until the client goes away.
pub async fn frame_stream(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = state.camera.acquire().await?;
    let pacing = state.camera_pacing;
    let quality = state.jpeg_quality;
    Ok(ws.on_upgrade(move |socket| run_frame_stream(socket, session, pacing, quality)))
}

async fn run_frame_stream(
    socket: WebSocket,
    session: Session<CameraHandle>,
    pacing: StreamPacing,
    quality: u8,
) {
    let (tx, rx) = socket.split();
    let mut sink = FrameSink { tx };

    let end = stream_session(
        session,
        &mut sink,
        closed_by_peer(rx),
        pacing,
        "acquire camera frame",
        move |camera: &mut CameraHandle| {
            let Some(frame) = camera.frame()? else {
                return Ok(None);
            };
            let jpeg = encode_jpeg(&frame, quality);
            if jpeg.is_none() {
                warn!(width = frame.width, height = frame.height, "frame could not be encoded; skipping");
            }
            Ok(jpeg)
        },
    )
    .await;

    finish(sink.tx, end).await;
}

struct FrameSink {
    tx: WsSender,
}

#[async_trait]
impl SampleSink<Bytes> for FrameSink {
    async fn send(&mut self, jpeg: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(Message::Binary(jpeg)).await.map_err(|_| SinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> CameraFrame {
        CameraFrame {
            width,
            height,
            data: (0..width * height).map(|i| (i % 256) as u8).collect(),
        }
    }

    #[test]
    fn encodes_a_jpeg() {
        let jpeg = encode_jpeg(&gradient(16, 8), DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let mut frame = gradient(4, 4);
        frame.data.pop();
        assert!(encode_jpeg(&frame, DEFAULT_JPEG_QUALITY).is_none());
    }

    #[test]
    fn lower_quality_gives_smaller_output() {
        let frame = gradient(64, 64);
        let high = encode_jpeg(&frame, 95).unwrap();
        let low = encode_jpeg(&frame, 10).unwrap();
        assert!(low.len() < high.len());
    }
}
