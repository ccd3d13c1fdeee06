//! Push channel: a WebSocket carrying refresh triggers.
//!
//! Speaks enough Socket.IO (Engine.IO v4 text packets) to join the default
//! namespace and answer pings, and also accepts bare JSON event frames.

use async_trait::async_trait;
use futures::{stream::BoxStream, SinkExt, StreamExt};
use serde_json::Value;
use shared::{domain::Side, protocol::ChannelFrame};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use crate::error::SyncError;

pub type FrameStream = BoxStream<'static, Result<ChannelFrame, SyncError>>;

#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Resolves once the channel is open; the stream ends when it drops.
    async fn connect(&self, url: &Url) -> Result<FrameStream, SyncError>;
}

/// What a channel event asks the scheduler to re-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshIntent {
    Left,
    Right,
    Full,
}

impl RefreshIntent {
    pub fn lane(side: Side) -> Self {
        match side {
            Side::Left => RefreshIntent::Left,
            Side::Right => RefreshIntent::Right,
        }
    }

    pub fn from_frame(frame: &ChannelFrame) -> Option<Self> {
        match frame.event.as_str() {
            "sequence:left:changed" => Some(RefreshIntent::Left),
            "sequence:right:changed" => Some(RefreshIntent::Right),
            "sequence:changed" | "sequencing:change" | "sequencing:changed" | "sequence:change" => {
                Some(RefreshIntent::Full)
            }
            "container:changed" | "flush" => Some(RefreshIntent::Full),
            "update" => Some(
                side_of(frame.payload.as_ref())
                    .map(RefreshIntent::lane)
                    .unwrap_or(RefreshIntent::Full),
            ),
            _ => None,
        }
    }
}

fn side_of(payload: Option<&Value>) -> Option<Side> {
    payload?.get("side")?.as_str()?.parse().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Packet {
    Open,
    Ping,
    Connected,
    Event(ChannelFrame),
    Disconnect,
    ConnectError(String),
    Ignore,
}

pub(crate) fn parse_packet(text: &str) -> Packet {
    let text = text.trim();
    if text.starts_with('{') || text.starts_with('[') {
        return json_event(text);
    }

    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some('0'), _) => Packet::Open,
        (Some('1'), _) => Packet::Disconnect,
        (Some('2'), _) => Packet::Ping,
        (Some('4'), Some('0')) => Packet::Connected,
        (Some('4'), Some('1')) => Packet::Disconnect,
        (Some('4'), Some('2')) => json_event(strip_namespace_and_ack(&text[2..])),
        (Some('4'), Some('4')) => Packet::ConnectError(text[2..].to_string()),
        _ => Packet::Ignore,
    }
}

/// `42/ns,17["event",...]` → `["event",...]`
fn strip_namespace_and_ack(rest: &str) -> &str {
    let rest = if rest.starts_with('/') {
        rest.split_once(',').map(|(_, tail)| tail).unwrap_or("")
    } else {
        rest
    };
    rest.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn json_event(text: &str) -> Packet {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(ChannelFrame::from_json)
        .map(Packet::Event)
        .unwrap_or(Packet::Ignore)
}

pub struct WsConnector;

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<FrameStream, SyncError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SyncError::Channel(format!("failed to connect websocket {url}: {err}")))?;
        let (writer, reader) = ws_stream.split();

        let frames = futures::stream::unfold(Some((writer, reader)), |state| async move {
            let (mut writer, mut reader) = state?;
            loop {
                let text = match reader.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        let err = SyncError::Channel(format!("websocket receive failed: {err}"));
                        return Some((Err(err), None));
                    }
                };
                let reply = match parse_packet(&text) {
                    Packet::Event(frame) => return Some((Ok(frame), Some((writer, reader)))),
                    Packet::Disconnect => return None,
                    Packet::ConnectError(reason) => {
                        let err = SyncError::Channel(format!("namespace connect refused: {reason}"));
                        return Some((Err(err), None));
                    }
                    Packet::Open => "40",
                    Packet::Ping => "3",
                    Packet::Connected | Packet::Ignore => {
                        debug!(packet = %text, "channel: ignoring control packet");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(reply.to_string())).await {
                    let err = SyncError::Channel(format!("websocket send failed: {err}"));
                    return Some((Err(err), None));
                }
            }
        });

        Ok(frames.boxed())
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
