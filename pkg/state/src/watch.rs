//! Typed change feed over the store's newline-framed watch stream.
//!
//! Each frame is a single line of the form `Type: <PUT|DELETE> Value: <payload>`
//! where the payload is JSON or YAML. There is no resume token: a feed only
//! carries events emitted after it was opened.

use futures_util::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tracing::{debug, warn};

const TYPE_PREFIX: &str = "Type:";
const VALUE_SEPARATOR: &str = " Value:";

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

impl std::str::FromStr for EventType {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PUT" => Ok(EventType::Put),
            "DELETE" => Ok(EventType::Delete),
            _ => Err(FrameError::UnknownEventType(s.to_string())),
        }
    }
}

/// A single decoded change to a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Put(T),
    Delete(T),
}

impl<T> Change<T> {
    pub fn event_type(&self) -> EventType {
        match self {
            Change::Put(_) => EventType::Put,
            Change::Delete(_) => EventType::Delete,
        }
    }

    pub fn object(&self) -> &T {
        match self {
            Change::Put(obj) | Change::Delete(obj) => obj,
        }
    }
}

/// Stream of decoded changes for one resource kind. Ends when the
/// underlying connection is closed.
pub type ChangeFeed<T> = Pin<Box<dyn Stream<Item = Change<T>> + Send>>;

/// Why a watch frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame does not start with 'Type:'")]
    MissingType,
    #[error("frame has no 'Value:' section")]
    MissingValue,
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
    #[error("invalid payload: {0}")]
    Payload(String),
}

/// Split a frame into its event type and raw payload.
pub fn parse_frame(line: &str) -> Result<(EventType, &str), FrameError> {
    let rest = line
        .trim()
        .strip_prefix(TYPE_PREFIX)
        .ok_or(FrameError::MissingType)?;
    let (event_type, value) = rest
        .split_once(VALUE_SEPARATOR)
        .ok_or(FrameError::MissingValue)?;
    Ok((event_type.trim().parse()?, value.trim()))
}

/// Decode a full frame into a typed change. JSON is tried first, then YAML.
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<Change<T>, FrameError> {
    let (event_type, value) = parse_frame(line)?;
    let object: T = match serde_json::from_str(value) {
        Ok(obj) => obj,
        Err(json_err) => serde_yaml::from_str(value)
            .map_err(|_| FrameError::Payload(json_err.to_string()))?,
    };
    Ok(match event_type {
        EventType::Put => Change::Put(object),
        EventType::Delete => Change::Delete(object),
    })
}

/// Reassembles newline-terminated frames from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed a chunk and return every complete, non-blank line it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Bytes received after the last newline.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Turn a raw byte stream into a typed change feed.
///
/// Read errors and malformed frames are logged and skipped; the feed ends
/// when `bytes` ends. A trailing line without a newline is discarded.
pub fn change_feed<T, S, B, E>(kind: &'static str, bytes: S) -> ChangeFeed<T>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let feed = bytes
        .scan(LineBuffer::default(), move |buffer, chunk| {
            let lines = match chunk {
                Ok(chunk) => buffer.push(chunk.as_ref()),
                Err(e) => {
                    warn!("{} watch: error reading stream: {}", kind, e);
                    Vec::new()
                }
            };
            futures_util::future::ready(Some(stream::iter(lines)))
        })
        .flatten()
        .filter_map(move |line| {
            let change = match decode_frame::<T>(&line) {
                Ok(change) => {
                    debug!("{} watch: {:?} event", kind, change.event_type());
                    Some(change)
                }
                Err(e) => {
                    warn!("{} watch: skipping frame: {} ({})", kind, e, line);
                    None
                }
            };
            futures_util::future::ready(change)
        });

    Box::pin(feed)
}
