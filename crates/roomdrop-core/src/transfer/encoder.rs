//! Sender-side fan-out.
//!
//! Every destination gets its own task with its own read cursors, so one
//! slow receiver never holds back the others. A destination that closes,
//! times out or errors is dropped on its own; the rest carry on.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::{self, ChunkFraming, ControlMessage, Message};

use super::flow::{self, AckWindow};
use super::source::{ChunkReader, FileSource};
use super::{
    DestinationOutcome, FlowStrategy, TransferConfig, TransferProgress, TransferReport,
    TransferState,
};

/// Sends files to any number of destination channels.
#[derive(Debug)]
pub struct Encoder {
    config: TransferConfig,
    progress_tx: Arc<watch::Sender<Vec<TransferProgress>>>,
}

impl Encoder {
    /// Create an encoder with the given configuration.
    #[must_use]
    pub fn new(config: TransferConfig) -> Self {
        let (progress_tx, _) = watch::channel(Vec::new());
        Self {
            config,
            progress_tx: Arc::new(progress_tx),
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Subscribe to per-destination progress, indexed like the destinations
    /// of the running send.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<Vec<TransferProgress>> {
        self.progress_tx.subscribe()
    }

    /// Send one file to every destination.
    pub async fn send_file<C: Channel>(
        &self,
        file: FileSource,
        destinations: Vec<Arc<C>>,
        cancel: CancellationToken,
    ) -> TransferReport {
        self.send_files(vec![file], destinations, cancel).await
    }

    /// Send files, in order, to every destination.
    ///
    /// Resolves once every destination has finished: succeeded, failed or
    /// been cancelled. Never fails as a whole; see the per-destination
    /// outcomes in the returned report.
    pub async fn send_files<C: Channel>(
        &self,
        files: Vec<FileSource>,
        destinations: Vec<Arc<C>>,
        cancel: CancellationToken,
    ) -> TransferReport {
        if destinations.is_empty() {
            tracing::debug!("No destinations, nothing to send");
            return TransferReport::default();
        }

        let files: Arc<[FileSource]> = files.into();
        let total_bytes: u64 = files.iter().map(FileSource::size).sum();
        self.progress_tx.send_replace(
            (0..destinations.len())
                .map(|_| TransferProgress::new(files.len(), total_bytes))
                .collect(),
        );

        tracing::info!(
            "Sending {} file(s), {} bytes, to {} destination(s)",
            files.len(),
            total_bytes,
            destinations.len()
        );

        let handles: Vec<JoinHandle<DestinationOutcome>> = destinations
            .into_iter()
            .enumerate()
            .map(|(index, channel)| {
                let task = DestinationTask {
                    index,
                    channel,
                    files: Arc::clone(&files),
                    config: self.config.clone(),
                    cancel: cancel.clone(),
                    progress: Arc::clone(&self.progress_tx),
                };
                tokio::spawn(task.run())
            })
            .collect();

        let mut report = TransferReport::default();
        for (index, handle) in handles.into_iter().enumerate() {
            let outcome = handle.await.unwrap_or_else(|e| DestinationOutcome::Failed {
                reason: Error::Internal(format!("destination task {index} panicked: {e}")),
            });
            match &outcome {
                DestinationOutcome::Succeeded { .. } => {
                    tracing::info!("Destination {}: {}", index, outcome);
                }
                _ => tracing::warn!("Destination {}: {}", index, outcome),
            }
            report.outcomes.push(outcome);
        }
        report
    }
}

/// A file open on one destination.
struct OpenFile {
    index: usize,
    file_id: Option<String>,
    reader: ChunkReader,
}

struct DestinationTask<C> {
    index: usize,
    channel: Arc<C>,
    files: Arc<[FileSource]>,
    config: TransferConfig,
    cancel: CancellationToken,
    progress: Arc<watch::Sender<Vec<TransferProgress>>>,
}

impl<C: Channel> DestinationTask<C> {
    async fn run(self) -> DestinationOutcome {
        self.set_state(TransferState::Transferring);

        let window = match self.config.flow {
            FlowStrategy::Windowed { .. } => Some(Arc::new(AckWindow::new())),
            FlowStrategy::Threshold { low_water, .. } => {
                self.channel.set_buffered_amount_low_threshold(low_water);
                None
            }
        };
        let ack_reader = window.as_ref().map(|window| {
            tokio::spawn(read_acks(Arc::clone(&self.channel), Arc::clone(window)))
        });

        let result = self.send_all(window.as_deref()).await;

        if let Some(reader) = ack_reader {
            reader.abort();
        }

        match result {
            Ok(bytes) => {
                self.set_state(TransferState::Completed);
                DestinationOutcome::Succeeded {
                    files: self.files.len(),
                    bytes,
                }
            }
            Err(Error::TransferCancelled) => {
                self.set_state(TransferState::Cancelled);
                DestinationOutcome::Cancelled
            }
            Err(reason) => {
                if matches!(reason, Error::FlowControlTimeout(_)) {
                    // an unresponsive destination is treated as closed
                    self.channel.close();
                }
                self.set_state(TransferState::Failed);
                DestinationOutcome::Failed { reason }
            }
        }
    }

    async fn send_all(&self, window: Option<&AckWindow>) -> Result<u64> {
        self.config.validate()?;

        let limit = self.config.max_inflight_files.max(1);
        let mut queue = (0..self.files.len()).collect::<VecDeque<_>>();
        let mut open: VecDeque<OpenFile> = VecDeque::with_capacity(limit);
        let mut bytes = 0u64;

        loop {
            while open.len() < limit {
                let Some(index) = queue.pop_front() else {
                    break;
                };
                open.push_back(self.open_file(index).await?);
            }

            let Some(mut file) = open.pop_front() else {
                break;
            };

            match file.reader.next_chunk(self.config.chunk_size).await? {
                Some(chunk) => {
                    self.send_chunk(&file, &chunk, window).await?;
                    bytes += chunk.len() as u64;
                    let name = &self.files[file.index].meta().filename;
                    self.update(|p| {
                        p.bytes_sent += chunk.len() as u64;
                        if p.current_file_name != *name {
                            p.current_file_name.clone_from(name);
                        }
                    });
                    open.push_back(file);
                }
                None => self.finish_file(&file, window).await?,
            }
        }

        if let Some(window) = window {
            self.set_state(TransferState::Draining);
            window
                .wait_drained(self.config.flow_timeout, &self.cancel)
                .await?;
        }

        Ok(bytes)
    }

    async fn open_file(&self, index: usize) -> Result<OpenFile> {
        let source = &self.files[index];
        let file_id = match self.config.framing {
            ChunkFraming::Untagged => None,
            ChunkFraming::Tagged => Some(Uuid::new_v4().to_string()),
        };
        let reader = source.open().await?;

        self.send(
            ControlMessage::Header {
                file_id: file_id.clone(),
                meta: source.meta().clone(),
            }
            .to_message()?,
        )?;

        tracing::debug!(
            "Destination {}: header for {} ({} bytes)",
            self.index,
            source.meta().filename,
            source.size()
        );

        Ok(OpenFile {
            index,
            file_id,
            reader,
        })
    }

    async fn send_chunk(&self, file: &OpenFile, chunk: &[u8], window: Option<&AckWindow>) -> Result<()> {
        match (self.config.flow, window) {
            (FlowStrategy::Windowed { window: size, .. }, Some(window)) => {
                window
                    .wait_for_slot(size, self.config.flow_timeout, &self.cancel)
                    .await?;
            }
            (FlowStrategy::Threshold { high_water, .. }, _) => {
                flow::wait_for_buffer(
                    self.channel.as_ref(),
                    high_water,
                    self.config.flow_timeout,
                    &self.cancel,
                )
                .await?;
            }
            (FlowStrategy::Windowed { .. }, None) => {
                return Err(Error::Internal("windowed flow without a window".to_string()));
            }
        }

        let message = match &file.file_id {
            Some(file_id) => Message::Binary(protocol::encode_tagged_chunk(file_id, chunk)?),
            None => Message::Binary(chunk.to_vec()),
        };
        // counted before the send so an ack can never overtake it
        if let Some(window) = window {
            window.on_sent(file.file_id.as_deref());
        }
        self.send(message)
    }

    async fn finish_file(&self, file: &OpenFile, window: Option<&AckWindow>) -> Result<()> {
        self.send(
            ControlMessage::Done {
                file_id: file.file_id.clone(),
            }
            .to_message()?,
        )?;
        self.update(|p| p.files_done += 1);

        tracing::debug!(
            "Destination {}: done for {}",
            self.index,
            self.files[file.index].meta().filename
        );

        let Some(window) = window else {
            return Ok(());
        };
        match &file.file_id {
            Some(file_id) => window.on_finished(Some(file_id.as_str())),
            // Untagged acks carry no file id, so the next file may only
            // start once this one is fully acknowledged.
            None => {
                window
                    .wait_drained(self.config.flow_timeout, &self.cancel)
                    .await?;
                window.forget(None);
            }
        }
        Ok(())
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::TransferCancelled);
        }
        self.channel
            .send(message)
            .map_err(|_| Error::ChannelClosedMidTransfer)
    }

    fn update(&self, apply: impl FnOnce(&mut TransferProgress)) {
        self.progress.send_modify(|all| {
            if let Some(progress) = all.get_mut(self.index) {
                apply(progress);
            }
        });
    }

    fn set_state(&self, state: TransferState) {
        self.update(|p| p.state = state);
    }
}

/// Feed acknowledgments from a destination into its window until the
/// channel closes.
async fn read_acks<C: Channel>(channel: Arc<C>, window: Arc<AckWindow>) {
    while let Some(message) = channel.recv().await {
        let Message::Text(text) = message else {
            tracing::debug!("Ignoring binary message from a receiver");
            continue;
        };
        match ControlMessage::parse(&text) {
            Ok(ControlMessage::Ack {
                file_id,
                through_seq: Some(seq),
            }) => window.on_ack(file_id.as_deref(), seq),
            Ok(other) => tracing::debug!("Ignoring {} from a receiver", other.type_name()),
            Err(e) => tracing::warn!("Dropping unparseable message from a receiver: {}", e),
        }
    }
    window.close();
}
