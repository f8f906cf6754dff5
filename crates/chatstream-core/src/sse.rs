//! Server-sent-events framing for viewer feeds.
//!
//! Each delta becomes one frame whose `id` is the record's sequence number and
//! whose `event` is the payload type. The terminal marker is an `end` frame
//! without an id. A reconnecting client passes its last id to
//! `resume_after`, which never redelivers a record it already saw.

use crate::delta::{DeltaRecord, FeedItem, StreamOutcome};
use crate::errors::EngineError;

pub const END_EVENT: &str = "end";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<u64>,
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn from_item(item: &FeedItem) -> Result<Self, EngineError> {
        match item {
            FeedItem::Delta(record) => Ok(Self {
                id: Some(record.seq),
                event: Some(record.payload.type_tag().to_string()),
                data: serde_json::to_string(record).map_err(EngineError::codec)?,
            }),
            FeedItem::End(outcome) => Ok(Self {
                id: None,
                event: Some(END_EVENT.to_string()),
                data: serde_json::to_string(outcome).map_err(EngineError::codec)?,
            }),
        }
    }

    /// Wire form, terminated by a blank line.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(id) = self.id {
            out.push_str(&format!("id: {id}\n"));
        }
        if let Some(event) = &self.event {
            out.push_str(&format!("event: {event}\n"));
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Decodes the frame back into a feed item.
    pub fn to_item(&self) -> Result<FeedItem, EngineError> {
        if self.event.as_deref() == Some(END_EVENT) {
            let outcome: StreamOutcome =
                serde_json::from_str(&self.data).map_err(EngineError::codec)?;
            return Ok(FeedItem::End(outcome));
        }
        let record: DeltaRecord = serde_json::from_str(&self.data).map_err(EngineError::codec)?;
        Ok(FeedItem::Delta(record))
    }
}

/// Incremental decoder for a chunked SSE body. Remembers the last event id so
/// the client knows where to resume after a disconnect.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    last_event_id: Option<u64>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame_bytes = self.buf[..idx].to_vec();
            self.buf.drain(..idx + delim_len);
            if let Some(frame) = parse_frame(&frame_bytes) {
                if let Some(id) = frame.id {
                    self.last_event_id = Some(id);
                }
                frames.push(frame);
            }
        }
        frames
    }

    pub fn last_event_id(&self) -> Option<u64> {
        self.last_event_id
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut id = None;
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("id:") {
            id = rest.trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        id,
        event,
        data: data_lines.join("\n"),
    })
}
