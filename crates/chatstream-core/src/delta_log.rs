//! Append-only log of delta records, one per stream.
//!
//! The log is also the fan-out point: every append is offered to the live
//! subscribers of that stream with a non-blocking send. A subscriber whose
//! buffer is full is dropped from fan-out and its [`Subscription`] catches up
//! by reading the log from its own cursor, so the producer never waits and no
//! consumer sees a gap or a duplicate.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::delta::{DeltaPayload, DeltaRecord, FeedItem, StreamOutcome};
use crate::errors::EngineError;
use crate::ids::{ConversationId, StreamId};
use crate::journal::{Journal, JournalEntry};

struct StreamLog {
    conversation_id: ConversationId,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    records: Vec<DeltaRecord>,
    outcome: Option<StreamOutcome>,
    closed_at: Option<DateTime<Utc>>,
    subscribers: Vec<mpsc::Sender<DeltaRecord>>,
    // Set once on close. Dropped with the log on purge.
    terminal: watch::Sender<Option<StreamOutcome>>,
}

impl StreamLog {
    fn new(conversation_id: ConversationId, at: DateTime<Utc>) -> Self {
        Self {
            conversation_id,
            created_at: at,
            last_activity: at,
            records: Vec::new(),
            outcome: None,
            closed_at: None,
            subscribers: Vec::new(),
            terminal: watch::channel(None).0,
        }
    }

    fn summary(&self, stream_id: StreamId) -> LogSummary {
        LogSummary {
            stream_id,
            conversation_id: self.conversation_id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            next_seq: self.records.len() as u64,
            outcome: self.outcome.clone(),
            closed_at: self.closed_at,
        }
    }
}

/// Metadata of one stream's log, without the records.
#[derive(Clone, Debug, PartialEq)]
pub struct LogSummary {
    pub stream_id: StreamId,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Sequence number the next append will receive.
    pub next_seq: u64,
    pub outcome: Option<StreamOutcome>,
    pub closed_at: Option<DateTime<Utc>>,
}

struct Attachment {
    backlog: Vec<DeltaRecord>,
    live: Option<mpsc::Receiver<DeltaRecord>>,
    outcome: Option<StreamOutcome>,
}

struct LogInner {
    streams: DashMap<StreamId, StreamLog>,
    subscriber_buffer: usize,
    journal: Option<Arc<dyn Journal>>,
}

/// Shared handle to every stream's delta log.
#[derive(Clone)]
pub struct DeltaLog {
    inner: Arc<LogInner>,
}

impl DeltaLog {
    pub fn new(subscriber_buffer: usize, journal: Option<Arc<dyn Journal>>) -> Self {
        Self {
            inner: Arc::new(LogInner {
                streams: DashMap::new(),
                subscriber_buffer: subscriber_buffer.max(1),
                journal,
            }),
        }
    }

    pub(crate) fn open(
        &self,
        stream_id: StreamId,
        conversation_id: &ConversationId,
    ) -> Result<(), EngineError> {
        let at = Utc::now();
        if let Some(journal) = &self.inner.journal {
            journal.record(&JournalEntry::StreamOpened {
                stream_id,
                conversation_id: conversation_id.clone(),
                at,
            })?;
        }
        self.inner
            .streams
            .insert(stream_id, StreamLog::new(conversation_id.clone(), at));
        Ok(())
    }

    /// Appends a payload and returns its sequence number.
    ///
    /// Fails with [`EngineError::StreamClosed`] once the stream is terminal.
    pub fn append(&self, stream_id: StreamId, payload: DeltaPayload) -> Result<u64, EngineError> {
        let mut log = self
            .inner
            .streams
            .get_mut(&stream_id)
            .ok_or(EngineError::StreamNotFound(stream_id))?;
        if let Some(outcome) = &log.outcome {
            return Err(EngineError::StreamClosed {
                stream_id,
                outcome: outcome.clone(),
            });
        }
        let now = Utc::now();
        let record = DeltaRecord {
            stream_id,
            seq: log.records.len() as u64,
            timestamp: now,
            payload,
        };
        if let Some(journal) = &self.inner.journal {
            journal.record(&JournalEntry::DeltaAppended {
                record: record.clone(),
            })?;
        }
        log.last_activity = now;
        log.subscribers.retain(|tx| match tx.try_send(record.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(
                    event = "stream.subscriber_lagged",
                    domain = "stream",
                    stream_id = %stream_id,
                    seq = record.seq,
                    "subscriber buffer full, falling back to log catch-up"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        let seq = record.seq;
        log.records.push(record);
        Ok(seq)
    }

    /// Opens a lazy reader positioned at `from_seq`.
    ///
    /// The reader yields every record from that point, suspends while the
    /// stream is live, and ends with one [`FeedItem::End`] once it is terminal.
    pub fn read_from(&self, stream_id: StreamId, from_seq: u64) -> Result<Subscription, EngineError> {
        let attachment = self.attach_parts(stream_id, from_seq)?;
        Ok(Subscription {
            log: self.clone(),
            stream_id,
            next_seq: from_seq,
            backlog: attachment.backlog.into(),
            live: attachment.live,
            outcome: attachment.outcome,
            finished: false,
        })
    }

    // Snapshot and live registration happen under the same entry lock, so the
    // live channel starts exactly where the backlog ends.
    fn attach_parts(&self, stream_id: StreamId, from_seq: u64) -> Result<Attachment, EngineError> {
        let mut log = self
            .inner
            .streams
            .get_mut(&stream_id)
            .ok_or(EngineError::StreamNotFound(stream_id))?;
        let start = usize::try_from(from_seq)
            .unwrap_or(usize::MAX)
            .min(log.records.len());
        let backlog = log.records[start..].to_vec();
        if let Some(outcome) = &log.outcome {
            return Ok(Attachment {
                backlog,
                live: None,
                outcome: Some(outcome.clone()),
            });
        }
        let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer);
        log.subscribers.push(tx);
        Ok(Attachment {
            backlog,
            live: Some(rx),
            outcome: None,
        })
    }

    /// Marks the stream terminal. Returns the effective outcome and whether
    /// this call changed it; a second close keeps the first outcome.
    pub(crate) fn close(
        &self,
        stream_id: StreamId,
        outcome: StreamOutcome,
    ) -> Result<(StreamOutcome, bool), EngineError> {
        let mut log = self
            .inner
            .streams
            .get_mut(&stream_id)
            .ok_or(EngineError::StreamNotFound(stream_id))?;
        if let Some(existing) = &log.outcome {
            return Ok((existing.clone(), false));
        }
        let at = Utc::now();
        if let Some(journal) = &self.inner.journal {
            journal.record(&JournalEntry::StreamClosed {
                stream_id,
                outcome: outcome.clone(),
                at,
            })?;
        }
        log.outcome = Some(outcome.clone());
        log.closed_at = Some(at);
        // Dropping the senders wakes every live reader; they finish from the log.
        log.subscribers.clear();
        log.terminal.send_replace(Some(outcome.clone()));
        Ok((outcome, true))
    }

    /// Deletes a stream's records. Returns whether it existed.
    pub(crate) fn purge(&self, stream_id: StreamId) -> Result<bool, EngineError> {
        if !self.inner.streams.contains_key(&stream_id) {
            return Ok(false);
        }
        if let Some(journal) = &self.inner.journal {
            journal.record(&JournalEntry::StreamPurged { stream_id })?;
        }
        Ok(self.inner.streams.remove(&stream_id).is_some())
    }

    pub fn summary(&self, stream_id: StreamId) -> Option<LogSummary> {
        self.inner
            .streams
            .get(&stream_id)
            .map(|log| log.summary(stream_id))
    }

    pub(crate) fn summaries(&self) -> Vec<LogSummary> {
        self.inner
            .streams
            .iter()
            .map(|entry| entry.value().summary(*entry.key()))
            .collect()
    }

    /// Copy of every record currently in the stream's log.
    pub fn records(&self, stream_id: StreamId) -> Result<Vec<DeltaRecord>, EngineError> {
        self.inner
            .streams
            .get(&stream_id)
            .map(|log| log.records.clone())
            .ok_or(EngineError::StreamNotFound(stream_id))
    }

    /// Watches for the stream's terminal outcome. The value is `None` while
    /// the stream is live; the sender goes away if the log is purged.
    pub fn watch_outcome(
        &self,
        stream_id: StreamId,
    ) -> Result<watch::Receiver<Option<StreamOutcome>>, EngineError> {
        self.inner
            .streams
            .get(&stream_id)
            .map(|log| log.terminal.subscribe())
            .ok_or(EngineError::StreamNotFound(stream_id))
    }

    #[cfg(test)]
    pub(crate) fn live_subscribers(&self, stream_id: StreamId) -> usize {
        self.inner
            .streams
            .get(&stream_id)
            .map(|log| log.subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Minimal journal entries that rebuild every retained stream, oldest
    /// stream first.
    pub(crate) fn snapshot(&self) -> Vec<JournalEntry> {
        let mut streams: Vec<(DateTime<Utc>, Vec<JournalEntry>)> = self
            .inner
            .streams
            .iter()
            .map(|entry| {
                let stream_id = *entry.key();
                let log = entry.value();
                let mut entries = Vec::with_capacity(log.records.len() + 2);
                entries.push(JournalEntry::StreamOpened {
                    stream_id,
                    conversation_id: log.conversation_id.clone(),
                    at: log.created_at,
                });
                entries.extend(
                    log.records
                        .iter()
                        .cloned()
                        .map(|record| JournalEntry::DeltaAppended { record }),
                );
                if let Some(outcome) = &log.outcome {
                    entries.push(JournalEntry::StreamClosed {
                        stream_id,
                        outcome: outcome.clone(),
                        at: log.closed_at.unwrap_or(log.last_activity),
                    });
                }
                (log.created_at, entries)
            })
            .collect();
        streams.sort_by_key(|(created_at, _)| *created_at);
        streams.into_iter().flat_map(|(_, entries)| entries).collect()
    }

    pub(crate) fn restore_open(
        &self,
        stream_id: StreamId,
        conversation_id: ConversationId,
        at: DateTime<Utc>,
    ) {
        self.inner
            .streams
            .insert(stream_id, StreamLog::new(conversation_id, at));
    }

    pub(crate) fn restore_append(&self, record: DeltaRecord) -> Result<(), EngineError> {
        let mut log = self
            .inner
            .streams
            .get_mut(&record.stream_id)
            .ok_or(EngineError::StreamNotFound(record.stream_id))?;
        if record.seq != log.records.len() as u64 {
            return Err(EngineError::Journal(format!(
                "sequence gap in stream {}: expected {}, got {}",
                record.stream_id,
                log.records.len(),
                record.seq
            )));
        }
        log.last_activity = record.timestamp;
        log.records.push(record);
        Ok(())
    }

    pub(crate) fn restore_close(
        &self,
        stream_id: StreamId,
        outcome: StreamOutcome,
        at: DateTime<Utc>,
    ) {
        if let Some(mut log) = self.inner.streams.get_mut(&stream_id) {
            log.terminal.send_replace(Some(outcome.clone()));
            log.outcome = Some(outcome);
            log.closed_at = Some(at);
        }
    }

    pub(crate) fn restore_purge(&self, stream_id: StreamId) {
        self.inner.streams.remove(&stream_id);
    }
}

/// Ordered reader over one stream: backlog first, then live records, then a
/// single terminal marker.
pub struct Subscription {
    log: DeltaLog,
    stream_id: StreamId,
    next_seq: u64,
    backlog: VecDeque<DeltaRecord>,
    live: Option<mpsc::Receiver<DeltaRecord>>,
    outcome: Option<StreamOutcome>,
    finished: bool,
}

impl Subscription {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Sequence number of the next record this reader will yield.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Waits for the next item. Returns `None` after the terminal marker, or
    /// if the stream's log was purged.
    pub async fn next(&mut self) -> Option<FeedItem> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(record) = self.backlog.pop_front() {
                self.next_seq = record.seq + 1;
                return Some(FeedItem::Delta(record));
            }
            if let Some(live) = self.live.as_mut() {
                match live.recv().await {
                    Some(record) if record.seq == self.next_seq => {
                        self.next_seq += 1;
                        return Some(FeedItem::Delta(record));
                    }
                    Some(record) if record.seq < self.next_seq => continue,
                    // Out of step with the log: re-read from our cursor.
                    Some(_) | None => self.live = None,
                }
            }
            if let Some(outcome) = self.outcome.take() {
                self.finished = true;
                return Some(FeedItem::End(outcome));
            }
            match self.log.attach_parts(self.stream_id, self.next_seq) {
                Ok(attachment) => {
                    self.backlog = attachment.backlog.into();
                    self.live = attachment.live;
                    self.outcome = attachment.outcome;
                }
                Err(_) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Drains the reader into a vector. Only returns once the stream is terminal.
    pub async fn collect_all(mut self) -> Vec<FeedItem> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }

    /// Adapts the reader into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = FeedItem> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        })
    }
}
