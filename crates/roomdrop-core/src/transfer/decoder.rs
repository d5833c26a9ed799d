//! Receiver-side reassembly.
//!
//! The [`Decoder`] is a pure state machine: it never suspends and never
//! touches the channel. [`receive_loop`] is the task that drives it.
//!
//! A file is finalized exactly once, when both its `done` has been seen and
//! exactly its declared size has been received, in whichever order those
//! happen. Chunks and `done` markers for a file whose header has not
//! arrived yet wait in a pending buffer and are replayed, in arrival order,
//! once it does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::{self, ChunkFraming, ControlMessage, FileMeta, Message};

use super::TransferConfig;

/// Bytes of chunk data a decoder holds for files whose header has not
/// arrived yet, across the whole channel.
pub const DEFAULT_PENDING_LIMIT: usize = 64 * 1024 * 1024;

/// Messages a decoder holds ahead of their headers, across the channel.
const MAX_PENDING_MESSAGES: usize = 4096;

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// File id, `None` for untagged transfers
    pub file_id: Option<String>,
    /// Metadata from the header
    pub meta: FileMeta,
    /// File contents
    pub data: Vec<u8>,
    /// Number of chunks the file arrived in
    pub chunks: u64,
    /// When the file was finalized
    pub completed_at: DateTime<Utc>,
}

impl ReceivedFile {
    /// Write the file into `dir` under its announced name.
    ///
    /// Path components in the name are stripped, and an existing file is
    /// never overwritten: `name (1).ext`, `name (2).ext` and so on are
    /// tried instead. Returns the path written.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let name = Path::new(&self.meta.filename)
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().to_string());
        let stem = Path::new(&name)
            .file_stem()
            .map_or_else(|| name.clone(), |s| s.to_string_lossy().to_string());
        let extension = Path::new(&name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()));

        let mut path = dir.join(&name);
        let mut attempt = 1;
        while tokio::fs::try_exists(&path).await? {
            path = dir.join(format!(
                "{stem} ({attempt}){}",
                extension.as_deref().unwrap_or_default()
            ));
            attempt += 1;
        }

        tokio::fs::write(&path, &self.data).await?;
        tracing::info!("Saved {} ({} bytes)", path.display(), self.data.len());
        Ok(path)
    }
}

/// Something the decoder wants its owner to know or do.
#[derive(Debug)]
pub enum DecoderEvent {
    /// A header opened a file
    Started {
        /// File id, `None` for untagged transfers
        file_id: Option<String>,
        /// Announced metadata
        meta: FileMeta,
    },
    /// A chunk was applied
    Progress {
        /// File id, `None` for untagged transfers
        file_id: Option<String>,
        /// Bytes received so far
        received: u64,
        /// Declared size
        size: u64,
    },
    /// A file was finalized
    Completed(ReceivedFile),
    /// A file was abandoned; the channel stays usable
    Failed {
        /// File id, `None` for untagged transfers
        file_id: Option<String>,
        /// Why the file was abandoned
        error: Error,
    },
    /// An acknowledgment to send back to the sender
    SendAck(ControlMessage),
}

#[derive(Debug)]
struct IncomingFile {
    meta: FileMeta,
    data: Vec<u8>,
    received: u64,
    chunks: u64,
    acked_chunks: u64,
    done_observed: bool,
}

impl IncomingFile {
    fn new(meta: FileMeta) -> Self {
        let capacity = usize::try_from(meta.size).unwrap_or(0).min(64 * 1024 * 1024);
        Self {
            meta,
            data: Vec::with_capacity(capacity),
            received: 0,
            chunks: 0,
            acked_chunks: 0,
            done_observed: false,
        }
    }
}

#[derive(Debug)]
enum Slot {
    Open(IncomingFile),
    /// Completed; `chunks` keeps counting late arrivals so they are re-acked
    Finalized { chunks: u64 },
    /// Given up on after a protocol violation
    Abandoned { chunks: u64 },
}

#[derive(Debug)]
enum Pending {
    Chunk(Vec<u8>),
    Done,
}

/// Receiver-side state for one channel.
///
/// State is keyed by file id. Untagged transfers use the implicit `None`
/// key and carry one file at a time: after a file is finalized the key is
/// free for the next header, and binary data arriving in between is
/// buffered for it.
#[derive(Debug)]
pub struct Decoder {
    framing: ChunkFraming,
    ack_batch: Option<u64>,
    slots: HashMap<Option<String>, Slot>,
    pending: HashMap<Option<String>, Vec<Pending>>,
    pending_bytes: usize,
    pending_messages: usize,
    pending_limit: usize,
    /// Files that lost early messages to the pending limit, with the
    /// number of chunks dropped
    overflowed: HashMap<Option<String>, u64>,
    /// Chunks applied on the channel since the last ack flush
    unacked: u64,
    completed: usize,
}

impl Decoder {
    /// Create a decoder. `ack_batch` enables acknowledgments every that
    /// many chunks per file.
    #[must_use]
    pub fn new(framing: ChunkFraming, ack_batch: Option<u64>) -> Self {
        Self {
            framing,
            ack_batch: ack_batch.filter(|batch| *batch > 0),
            slots: HashMap::new(),
            pending: HashMap::new(),
            pending_bytes: 0,
            pending_messages: 0,
            pending_limit: DEFAULT_PENDING_LIMIT,
            overflowed: HashMap::new(),
            unacked: 0,
            completed: 0,
        }
    }

    /// Cap the chunk bytes buffered ahead of their headers.
    ///
    /// A file that would exceed it is failed when its header arrives.
    #[must_use]
    pub fn with_pending_limit(mut self, bytes: usize) -> Self {
        self.pending_limit = bytes;
        self
    }

    /// Create a decoder matching a sender's configuration.
    #[must_use]
    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.framing, config.ack_batch())
    }

    /// Number of files finalized so far.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed
    }

    /// Number of files currently open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Open(_)))
            .count()
    }

    /// Number of buffered messages still waiting for a header.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Consume one message from the channel.
    pub fn on_message(&mut self, message: Message) -> Vec<DecoderEvent> {
        let mut events = Vec::new();

        match message {
            Message::Text(text) => match ControlMessage::parse(&text) {
                Ok(ControlMessage::Header { file_id, meta }) => {
                    self.on_header(file_id, meta, &mut events);
                }
                Ok(ControlMessage::Done { file_id }) => self.on_done(file_id, &mut events),
                Ok(ControlMessage::Ack { .. }) => {
                    tracing::debug!("Ignoring ack received by a decoder");
                }
                Err(e) => tracing::warn!("Dropping unparseable control message: {}", e),
            },
            Message::Binary(data) => match self.framing {
                ChunkFraming::Untagged => self.on_chunk(None, data, &mut events),
                ChunkFraming::Tagged => match protocol::decode_tagged_chunk(&data) {
                    Ok((file_id, payload)) => {
                        self.on_chunk(Some(file_id), payload.to_vec(), &mut events);
                    }
                    Err(e) => tracing::warn!("Dropping malformed tagged chunk: {}", e),
                },
            },
        }

        events
    }

    /// Abandon every open file; called when the channel closes.
    pub fn finish(&mut self) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        for (file_id, slot) in &mut self.slots {
            if let Slot::Open(file) = slot {
                tracing::warn!(
                    "Channel closed with {} of {} bytes of {} received",
                    file.received,
                    file.meta.size,
                    file.meta.filename
                );
                let chunks = file.chunks;
                events.push(DecoderEvent::Failed {
                    file_id: file_id.clone(),
                    error: Error::ChannelClosedMidTransfer,
                });
                *slot = Slot::Abandoned { chunks };
            }
        }

        let pending = self.pending_count();
        if pending > 0 {
            tracing::debug!("Discarding {} messages that never saw a header", pending);
        }
        self.pending.clear();
        self.pending_bytes = 0;
        self.pending_messages = 0;
        self.overflowed.clear();
        events
    }

    fn on_header(&mut self, key: Option<String>, meta: FileMeta, events: &mut Vec<DecoderEvent>) {
        match self.slots.get(&key) {
            Some(Slot::Open(file)) => {
                let chunks = file.chunks;
                self.slots.insert(key.clone(), Slot::Abandoned { chunks });
                let error = Error::DuplicateHeader {
                    file_id: label(key.as_deref()),
                };
                tracing::warn!("{}", error);
                events.push(DecoderEvent::Failed {
                    file_id: key,
                    error,
                });
                return;
            }
            Some(Slot::Finalized { .. } | Slot::Abandoned { .. }) if key.is_some() => {
                tracing::warn!(
                    "Ignoring header for closed file {}",
                    label(key.as_deref())
                );
                return;
            }
            _ => {}
        }

        if let Some(dropped) = self.overflowed.remove(&key) {
            let buffered = self
                .take_pending(&key)
                .iter()
                .filter(|item| matches!(item, Pending::Chunk(_)))
                .count() as u64;
            let chunks = buffered + dropped;
            let error = Error::ProtocolError(format!(
                "{} sent more data ahead of its header than the receiver buffers",
                meta.filename
            ));
            tracing::warn!("{}", error);
            events.push(DecoderEvent::Failed {
                file_id: key.clone(),
                error,
            });
            self.slots.insert(key.clone(), Slot::Abandoned { chunks });
            if chunks > 0 {
                self.ack(key, chunks - 1, events);
            }
            return;
        }

        tracing::debug!(
            "Receiving {} ({} bytes, {})",
            meta.filename,
            meta.size,
            meta.mime_type
        );
        events.push(DecoderEvent::Started {
            file_id: key.clone(),
            meta: meta.clone(),
        });
        self.slots
            .insert(key.clone(), Slot::Open(IncomingFile::new(meta)));

        let items = self.take_pending(&key);
        if !items.is_empty() {
            tracing::debug!(
                "Replaying {} buffered messages for {}",
                items.len(),
                label(key.as_deref())
            );
            for item in items {
                match item {
                    Pending::Chunk(data) => self.on_chunk(key.clone(), data, events),
                    Pending::Done => self.on_done(key.clone(), events),
                }
            }
        }
    }

    fn on_chunk(&mut self, key: Option<String>, data: Vec<u8>, events: &mut Vec<DecoderEvent>) {
        let slot = match self.slots.get_mut(&key) {
            None => {
                self.buffer(key, Pending::Chunk(data));
                return;
            }
            Some(Slot::Finalized { .. }) if key.is_none() => {
                // the next untagged file's chunk overtook its header
                self.buffer(key, Pending::Chunk(data));
                return;
            }
            Some(slot) => slot,
        };

        let file = match slot {
            Slot::Open(file) => file,
            Slot::Finalized { chunks } | Slot::Abandoned { chunks } => {
                let seq = *chunks;
                *chunks += 1;
                tracing::debug!(
                    "Discarding {}-byte chunk for closed file {}",
                    data.len(),
                    label(key.as_deref())
                );
                self.ack(key, seq, events);
                return;
            }
        };

        let seq = file.chunks;
        file.chunks += 1;
        let received = file.received + data.len() as u64;

        if received > file.meta.size {
            let error = Error::SizeMismatch {
                file_id: label(key.as_deref()),
                expected: file.meta.size,
                received,
            };
            tracing::warn!("{}", error);
            *slot = Slot::Abandoned { chunks: seq + 1 };
            events.push(DecoderEvent::Failed {
                file_id: key.clone(),
                error,
            });
            self.ack(key, seq, events);
            return;
        }

        file.received = received;
        file.data.extend_from_slice(&data);
        events.push(DecoderEvent::Progress {
            file_id: key.clone(),
            received,
            size: file.meta.size,
        });

        let complete = file.done_observed && file.received == file.meta.size;
        self.unacked += 1;
        if complete {
            self.finalize(key, events);
        }
        if self.ack_batch.is_some_and(|batch| self.unacked >= batch) {
            self.flush_acks(events);
        }
    }

    /// Ack everything applied so far on every open file.
    ///
    /// Batches count chunks across the whole channel, so pipelined files
    /// that each hold fewer than a batch still get acknowledged.
    fn flush_acks(&mut self, events: &mut Vec<DecoderEvent>) {
        self.unacked = 0;
        for (key, slot) in &mut self.slots {
            if let Slot::Open(file) = slot {
                if file.acked_chunks < file.chunks {
                    file.acked_chunks = file.chunks;
                    events.push(DecoderEvent::SendAck(ControlMessage::Ack {
                        file_id: key.clone(),
                        through_seq: Some(file.chunks - 1),
                    }));
                }
            }
        }
    }

    fn on_done(&mut self, key: Option<String>, events: &mut Vec<DecoderEvent>) {
        match self.slots.get_mut(&key) {
            None => self.buffer(key, Pending::Done),
            Some(Slot::Open(file)) => {
                if file.done_observed {
                    tracing::debug!("Duplicate done for {}", label(key.as_deref()));
                    return;
                }
                file.done_observed = true;
                if file.received == file.meta.size {
                    self.finalize(key, events);
                } else {
                    tracing::debug!(
                        "Done for {} with {} of {} bytes, waiting for the rest",
                        file.meta.filename,
                        file.received,
                        file.meta.size
                    );
                }
            }
            Some(Slot::Finalized { .. }) => {
                // An untagged `done` with nothing pending is a duplicate.
                // This relies on the channel delivering in order: the
                // sender always writes a file's header before its `done`,
                // so the next untagged file's `done` cannot overtake it.
                if key.is_none() && self.pending.get(&key).is_some_and(|p| !p.is_empty()) {
                    self.buffer(key, Pending::Done);
                } else {
                    tracing::debug!("Duplicate done for finalized {}", label(key.as_deref()));
                }
            }
            Some(Slot::Abandoned { chunks }) => {
                // done closes an abandoned untagged file, freeing the key
                if key.is_none() {
                    let chunks = *chunks;
                    self.slots.insert(key, Slot::Finalized { chunks });
                }
            }
        }
    }

    fn finalize(&mut self, key: Option<String>, events: &mut Vec<DecoderEvent>) {
        let Some(Slot::Open(file)) = self.slots.remove(&key) else {
            return;
        };
        debug_assert_eq!(file.received, file.meta.size);

        let chunks = file.chunks;
        self.slots.insert(key.clone(), Slot::Finalized { chunks });
        self.completed += 1;

        tracing::info!(
            "Received {} ({} bytes in {} chunks)",
            file.meta.filename,
            file.received,
            chunks
        );
        events.push(DecoderEvent::Completed(ReceivedFile {
            file_id: key.clone(),
            meta: file.meta,
            data: file.data,
            chunks,
            completed_at: Utc::now(),
        }));

        if file.acked_chunks < chunks {
            self.ack(key, chunks - 1, events);
        }
    }

    fn buffer(&mut self, key: Option<String>, item: Pending) {
        let size = match &item {
            Pending::Chunk(data) => data.len(),
            Pending::Done => 0,
        };
        if self.overflowed.contains_key(&key)
            || self.pending_messages >= MAX_PENDING_MESSAGES
            || self.pending_bytes + size > self.pending_limit
        {
            let dropped = self.overflowed.entry(key.clone()).or_insert_with(|| {
                tracing::warn!(
                    "Pending buffer full, dropping early messages for {}",
                    label(key.as_deref())
                );
                0
            });
            if matches!(item, Pending::Chunk(_)) {
                *dropped += 1;
            }
            return;
        }

        tracing::trace!("Buffering early message for {}", label(key.as_deref()));
        self.pending_bytes += size;
        self.pending_messages += 1;
        self.pending.entry(key).or_default().push(item);
    }

    fn take_pending(&mut self, key: &Option<String>) -> Vec<Pending> {
        let items = self.pending.remove(key).unwrap_or_default();
        for item in &items {
            if let Pending::Chunk(data) = item {
                self.pending_bytes -= data.len();
            }
        }
        self.pending_messages -= items.len();
        items
    }

    fn ack(&self, key: Option<String>, seq: u64, events: &mut Vec<DecoderEvent>) {
        if self.ack_batch.is_some() {
            events.push(DecoderEvent::SendAck(ControlMessage::Ack {
                file_id: key,
                through_seq: Some(seq),
            }));
        }
    }
}

fn label(key: Option<&str>) -> String {
    key.unwrap_or("(untagged)").to_string()
}

/// Drive a decoder from a channel until the channel closes.
///
/// Acknowledgments go back on the same channel; every other event is
/// forwarded to `events`. Files still open when the channel closes are
/// reported as failed. Returns the number of files completed.
///
/// # Errors
///
/// Returns an error if an acknowledgment cannot be encoded.
pub async fn receive_loop<C: Channel>(
    channel: &C,
    mut decoder: Decoder,
    events: mpsc::UnboundedSender<DecoderEvent>,
) -> Result<usize> {
    while let Some(message) = channel.recv().await {
        for event in decoder.on_message(message) {
            match event {
                DecoderEvent::SendAck(ack) => {
                    if let Err(e) = channel.send(ack.to_message()?) {
                        tracing::debug!("Could not send ack: {}", e);
                    }
                }
                other => {
                    let _ = events.send(other);
                }
            }
        }
    }

    for event in decoder.finish() {
        let _ = events.send(event);
    }

    tracing::debug!(
        "Receive loop finished after {} file(s)",
        decoder.completed_count()
    );
    Ok(decoder.completed_count())
}
