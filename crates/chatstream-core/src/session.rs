//! Lifecycle of generation streams.
//!
//! At most one stream per conversation is live (pending or active). The
//! `active` table maps a conversation to its live stream; `begin` swaps the
//! entry while holding that conversation's table lock, aborting the previous
//! stream before the new one becomes visible.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::delta::{AbortReason, DeltaPayload, StreamOutcome};
use crate::delta_log::{DeltaLog, LogSummary, Subscription};
use crate::errors::EngineError;
use crate::ids::{ConversationId, StreamId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Begun, no delta yet.
    Pending,
    /// At least one delta appended.
    Active,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

/// Point-in-time view of one stream session.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSession {
    pub stream_id: StreamId,
    pub conversation_id: ConversationId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Sequence number the next delta will receive.
    pub next_seq: u64,
    pub outcome: Option<StreamOutcome>,
}

impl From<LogSummary> for StreamSession {
    fn from(summary: LogSummary) -> Self {
        let status = match &summary.outcome {
            Some(StreamOutcome::Completed) => SessionStatus::Completed,
            Some(StreamOutcome::Aborted { .. }) => SessionStatus::Aborted,
            None if summary.next_seq == 0 => SessionStatus::Pending,
            None => SessionStatus::Active,
        };
        Self {
            stream_id: summary.stream_id,
            conversation_id: summary.conversation_id,
            status,
            created_at: summary.created_at,
            last_activity: summary.last_activity,
            next_seq: summary.next_seq,
            outcome: summary.outcome,
        }
    }
}

struct ManagerInner {
    log: DeltaLog,
    active: DashMap<ConversationId, StreamId>,
}

/// Owns stream sessions and the per-conversation active table.
#[derive(Clone)]
pub struct StreamSessionManager {
    inner: Arc<ManagerInner>,
}

impl StreamSessionManager {
    pub fn new(log: DeltaLog) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                log,
                active: DashMap::new(),
            }),
        }
    }

    pub fn log(&self) -> &DeltaLog {
        &self.inner.log
    }

    /// Starts a new stream for the conversation, aborting any live one.
    pub fn begin(&self, conversation_id: &ConversationId) -> Result<StreamId, EngineError> {
        let stream_id = StreamId::new();
        match self.inner.active.entry(conversation_id.clone()) {
            Entry::Occupied(mut slot) => {
                let previous = *slot.get();
                let (outcome, changed) = self.inner.log.close(
                    previous,
                    StreamOutcome::aborted(AbortReason::Superseded { by: stream_id }),
                )?;
                if changed {
                    info!(
                        event = "stream.superseded",
                        domain = "stream",
                        conversation_id = %conversation_id,
                        stream_id = %previous,
                        superseded_by = %stream_id
                    );
                } else {
                    debug!(
                        event = "stream.stale_active_entry",
                        domain = "stream",
                        stream_id = %previous,
                        outcome = %outcome
                    );
                }
                self.inner.log.open(stream_id, conversation_id)?;
                slot.insert(stream_id);
            }
            Entry::Vacant(slot) => {
                self.inner.log.open(stream_id, conversation_id)?;
                slot.insert(stream_id);
            }
        }
        info!(
            event = "stream.begin",
            domain = "stream",
            conversation_id = %conversation_id,
            stream_id = %stream_id
        );
        Ok(stream_id)
    }

    /// Appends a delta to a live stream.
    pub fn append(&self, stream_id: StreamId, payload: DeltaPayload) -> Result<u64, EngineError> {
        let seq = self.inner.log.append(stream_id, payload)?;
        if seq == 0 {
            debug!(event = "stream.active", domain = "stream", stream_id = %stream_id);
        }
        Ok(seq)
    }

    /// Live feed starting at `from_seq` (0 when omitted: full replay).
    pub fn attach(
        &self,
        stream_id: StreamId,
        from_seq: Option<u64>,
    ) -> Result<Subscription, EngineError> {
        let from_seq = from_seq.unwrap_or(0);
        let subscription = self.inner.log.read_from(stream_id, from_seq)?;
        debug!(
            event = "stream.attach",
            domain = "stream",
            stream_id = %stream_id,
            from_seq
        );
        Ok(subscription)
    }

    /// Reconnect helper: resumes right after the last sequence number the
    /// client already rendered, so nothing is delivered twice.
    pub fn resume_after(
        &self,
        stream_id: StreamId,
        last_seen: u64,
    ) -> Result<Subscription, EngineError> {
        self.attach(stream_id, Some(last_seen.saturating_add(1)))
    }

    /// Marks the stream completed. Idempotent: a second call (or a call on an
    /// already aborted stream) returns the existing outcome unchanged.
    pub fn complete(&self, stream_id: StreamId) -> Result<StreamOutcome, EngineError> {
        self.finish(stream_id, StreamOutcome::Completed)
    }

    /// Marks the stream aborted. Idempotent like [`Self::complete`].
    pub fn abort(
        &self,
        stream_id: StreamId,
        reason: AbortReason,
    ) -> Result<StreamOutcome, EngineError> {
        self.finish(stream_id, StreamOutcome::aborted(reason))
    }

    fn finish(&self, stream_id: StreamId, outcome: StreamOutcome) -> Result<StreamOutcome, EngineError> {
        let (outcome, changed) = self.inner.log.close(stream_id, outcome)?;
        if changed {
            if let Some(summary) = self.inner.log.summary(stream_id) {
                self.inner
                    .active
                    .remove_if(&summary.conversation_id, |_, active| *active == stream_id);
            }
            info!(
                event = "stream.closed",
                domain = "stream",
                stream_id = %stream_id,
                outcome = %outcome
            );
        }
        Ok(outcome)
    }

    /// The live stream of a conversation, if any.
    pub fn active_stream_id(&self, conversation_id: &ConversationId) -> Option<StreamId> {
        let stream_id = *self.inner.active.get(conversation_id)?;
        self.inner
            .log
            .summary(stream_id)
            .filter(|summary| summary.outcome.is_none())
            .map(|_| stream_id)
    }

    pub fn session(&self, stream_id: StreamId) -> Result<StreamSession, EngineError> {
        self.inner
            .log
            .summary(stream_id)
            .map(StreamSession::from)
            .ok_or(EngineError::StreamNotFound(stream_id))
    }

    /// Producer-side status check. A driver calls this after each batch of
    /// appends and stops on error.
    pub fn ensure_producing(&self, stream_id: StreamId) -> Result<(), EngineError> {
        let summary = self
            .inner
            .log
            .summary(stream_id)
            .ok_or(EngineError::StreamNotFound(stream_id))?;
        match summary.outcome {
            None => Ok(()),
            Some(StreamOutcome::Aborted {
                reason: AbortReason::Superseded { by },
            }) => Err(EngineError::SessionSuperseded {
                stream_id,
                superseded_by: by,
            }),
            Some(outcome) => Err(EngineError::StreamClosed { stream_id, outcome }),
        }
    }

    /// Aborts live sessions whose last activity is older than `idle`.
    pub fn reap_idle(&self, now: DateTime<Utc>, idle: chrono::Duration) -> Vec<StreamId> {
        let idle_streams: Vec<StreamId> = self
            .inner
            .log
            .summaries()
            .into_iter()
            .filter(|s| s.outcome.is_none() && now - s.last_activity > idle)
            .map(|s| s.stream_id)
            .collect();
        let mut reaped = Vec::new();
        for stream_id in idle_streams {
            match self.abort(stream_id, AbortReason::Idle) {
                Ok(StreamOutcome::Aborted {
                    reason: AbortReason::Idle,
                }) => reaped.push(stream_id),
                Ok(_) => {}
                Err(err) => warn!(
                    event = "stream.reap_failed",
                    domain = "stream",
                    stream_id = %stream_id,
                    error = %err
                ),
            }
        }
        reaped
    }

    /// Deletes logs of terminal sessions closed longer than `retention` ago.
    pub fn purge_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> Vec<StreamId> {
        let expired: Vec<StreamId> = self
            .inner
            .log
            .summaries()
            .into_iter()
            .filter(|s| s.closed_at.is_some_and(|closed| now - closed > retention))
            .map(|s| s.stream_id)
            .collect();
        let mut purged = Vec::new();
        for stream_id in expired {
            match self.inner.log.purge(stream_id) {
                Ok(true) => purged.push(stream_id),
                Ok(false) => {}
                Err(err) => warn!(
                    event = "stream.purge_failed",
                    domain = "stream",
                    stream_id = %stream_id,
                    error = %err
                ),
            }
        }
        if !purged.is_empty() {
            info!(event = "stream.purged", domain = "stream", count = purged.len() as u64);
        }
        purged
    }
}
