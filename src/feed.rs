//! Server-sent-events transport for push updates.
//!
//! The server opens every stream with a session frame carrying the event key
//! that subscriptions must quote, then sends one push envelope per `data:`
//! frame. Empty frames are heartbeats.

use std::collections::VecDeque;

use featherbone_core::{FeedError, PushEnvelope, PushFeed, PushMessage};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::client::{ClientError, HttpDataSource};
use crate::config::ClientConfig;

/// Splits a byte stream into the data payloads of complete SSE events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every event completed by them, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments (`:`) and other fields carry nothing we use.
        }
        events
    }
}

/// A live event stream.
#[derive(Debug)]
pub struct EventStream {
    response: reqwest::Response,
    decoder: SseDecoder,
    ready: VecDeque<String>,
}

impl EventStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
        }
    }

    /// Next non-empty data payload, or `None` when the server closed.
    async fn next_frame(&mut self) -> Result<Option<String>, FeedError> {
        loop {
            while let Some(frame) = self.ready.pop_front() {
                if frame.trim().is_empty() {
                    debug!("heartbeat");
                    continue;
                }
                return Ok(Some(frame));
            }
            match self.response.chunk().await {
                Ok(Some(bytes)) => {
                    let frames = self.decoder.push(&bytes);
                    self.ready.extend(frames);
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(FeedError::Transport(e.to_string())),
            }
        }
    }
}

impl PushFeed for EventStream {
    async fn next_message(&mut self) -> Result<Option<PushMessage>, FeedError> {
        while let Some(frame) = self.next_frame().await? {
            match serde_json::from_str::<PushEnvelope>(&frame) {
                Ok(envelope) => return Ok(Some(envelope.message)),
                Err(e) => warn!(error = %e, "skipping unrecognised frame"),
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionFrame {
    event_key: String,
    #[serde(default = "authorized_by_default")]
    authorized: bool,
}

fn authorized_by_default() -> bool {
    true
}

/// An opened push session.
#[derive(Debug)]
pub struct Session {
    pub event_key: String,
    pub stream: EventStream,
}

/// Connect to the event endpoint and read the session frame.
pub async fn open_session(
    client: &HttpDataSource,
    config: &ClientConfig,
) -> Result<Session, FeedError> {
    let response = client
        .open_stream(&config.event_path)
        .await
        .map_err(|e| match e {
            ClientError::Unauthorized => FeedError::Transport("not authorized".into()),
            other => FeedError::Transport(other.to_string()),
        })?;
    let mut stream = EventStream::new(response);

    let frame = stream.next_frame().await?.ok_or(FeedError::Closed)?;
    let session: SessionFrame =
        serde_json::from_str(&frame).map_err(|e| FeedError::Malformed(e.to_string()))?;
    if !session.authorized {
        return Err(FeedError::Transport("not authorized".into()));
    }

    info!(event_key = %session.event_key, "push session opened");
    Ok(Session {
        event_key: session.event_key,
        stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert!(decoder.push(b"1}\n").is_empty());
        assert_eq!(decoder.push(b"\n"), vec!["{\"a\":1}"]);
    }

    #[test]
    fn joins_multiline_data_and_ignores_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keepalive\r\nevent: x\r\ndata: one\r\ndata:two\r\n\r\ndata: three\n\n");
        assert_eq!(events, vec!["one\ntwo", "three"]);
    }

    #[test]
    fn heartbeats_are_empty_payloads() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(b"data:\n\n"), vec![""]);
    }
}
