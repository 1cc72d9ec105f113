//! Output Multiplexer: one ordered, append-only console for a session.
//!
//! Every process chunk and every status message goes through
//! [`Console::append`], which assigns a sequence number and broadcasts the
//! entry while holding the buffer lock, so subscribers observe exactly the
//! order in which entries were recorded.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use super::ws::{PreviewEvent, broadcast_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleSource {
    /// Phase transitions, errors, stop notices.
    System,
    /// Tree and blob retrieval progress.
    Fetch,
    /// Dependency installation output.
    Install,
    /// Development server output.
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub seq: u64,
    pub source: ConsoleSource,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct ConsoleBuffer {
    next_seq: u64,
    entries: Vec<ConsoleEntry>,
}

#[derive(Debug)]
pub struct Console {
    buffer: Mutex<ConsoleBuffer>,
    events: broadcast::Sender<String>,
}

impl Console {
    pub fn new(events: broadcast::Sender<String>) -> Self {
        Self {
            buffer: Mutex::new(ConsoleBuffer {
                next_seq: 1,
                entries: Vec::new(),
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConsoleBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `text` and return its sequence number. Empty text is ignored
    /// and returns `None`.
    pub fn append(&self, source: ConsoleSource, text: impl Into<String>) -> Option<u64> {
        let text = text.into();
        if text.is_empty() {
            return None;
        }
        let mut buffer = self.lock();
        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        let entry = ConsoleEntry {
            seq,
            source,
            text,
            at: Utc::now(),
        };
        broadcast_message(&self.events, &PreviewEvent::ConsoleAppended { entry: entry.clone() });
        buffer.entries.push(entry);
        Some(seq)
    }

    /// Append a status line from the orchestrator itself.
    pub fn system(&self, message: impl std::fmt::Display) -> Option<u64> {
        self.append(ConsoleSource::System, format!("{}\n", message))
    }

    /// Drop all entries. Only the lifecycle controller calls this, at the
    /// start of a deploy attempt. Sequence numbers keep increasing.
    pub(crate) fn clear(&self) {
        let mut buffer = self.lock();
        buffer.entries.clear();
        broadcast_message(&self.events, &PreviewEvent::ConsoleCleared);
    }

    /// Full console text in recorded order.
    pub fn text(&self) -> String {
        self.lock().entries.iter().map(|e| e.text.as_str()).collect()
    }

    pub fn entries(&self) -> Vec<ConsoleEntry> {
        self.lock().entries.clone()
    }

    /// Entries recorded after `seq`, for polling clients.
    pub fn entries_since(&self, seq: u64) -> Vec<ConsoleEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Incremental UTF-8 decoder for byte chunks that may split a character.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Truncated character at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left, replacing an incomplete trailing character.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Decode a process output stream and hand each piece of text to `sink`
/// until the stream closes.
pub async fn pump_output_with(
    mut output: mpsc::UnboundedReceiver<Vec<u8>>,
    mut sink: impl FnMut(String),
) {
    let mut decoder = ChunkDecoder::default();
    while let Some(chunk) = output.recv().await {
        let text = decoder.decode(&chunk);
        if !text.is_empty() {
            sink(text);
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        sink(rest);
    }
}
