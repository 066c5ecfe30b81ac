//! WebSocket plumbing shared by the motor and camera streams.

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use fastlab_broker::StreamEnd;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

/// Close reasons must fit in a single control frame.
const MAX_CLOSE_REASON: usize = 123;

pub type WsSender = SplitSink<WebSocket, Message>;

/// Resolves once the peer closes the socket or the connection drops.
///
/// Anything else the client sends is read and ignored.
pub async fn closed_by_peer(mut rx: SplitStream<WebSocket>) {
    while let Some(msg) = rx.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

/// Tell the client why its stream ended, if it is still listening.
pub async fn finish(mut tx: WsSender, end: StreamEnd) {
    let frame = match end {
        StreamEnd::Failed(err) => CloseFrame {
            code: close_code::ERROR,
            reason: truncate_reason(&err.to_string()).into(),
        },
        StreamEnd::ClientDisconnected => CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        },
    };
    if let Err(err) = tx.send(Message::Close(Some(frame))).await {
        debug!(error = %err, "close frame not delivered");
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reasons_pass_through() {
        assert_eq!(truncate_reason("Could not read motor position: boom"), "Could not read motor position: boom");
    }

    #[test]
    fn long_reasons_are_cut_on_a_char_boundary() {
        let reason = "é".repeat(100);
        let cut = truncate_reason(&reason);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
