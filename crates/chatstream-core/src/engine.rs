//! Coordinator façade used by generation drivers and viewer/editor channels.
//!
//! Every mutation returns the canonical new state (sequence number, outcome,
//! version stamp, suggestion) so callers never need a read-after-write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::delta::{AbortReason, DeltaPayload, StreamOutcome};
use crate::delta_log::{DeltaLog, Subscription};
use crate::errors::EngineError;
use crate::ids::{ArtifactId, ConversationId, StreamId, SuggestionId};
use crate::journal::{Journal, JournalEntry, JsonlJournal};
use crate::rebase::TextRange;
use crate::session::{StreamSession, StreamSessionManager};
use crate::suggestion::{Suggestion, SuggestionResolver};
use crate::version::{ArtifactKind, ArtifactVersion, VersionChainStore, VersionStamp};

/// Result of a rollback: what was removed and which suggestions lost their anchor.
#[derive(Clone, Debug, PartialEq)]
pub struct RollbackOutcome {
    pub removed: Vec<VersionStamp>,
    pub invalidated: Vec<SuggestionId>,
    pub head: Option<VersionStamp>,
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    sessions: StreamSessionManager,
    versions: VersionChainStore,
    suggestions: SuggestionResolver,
}

impl Engine {
    /// Creates an engine. With `journal_path` set, the journal is replayed,
    /// compacted down to the retained state, and then appended to.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        match config.journal_path.clone() {
            Some(path) => {
                let entries = JsonlJournal::recover(&path)?;
                let before = entries.len();
                let compacted = Self::replay(config.clone(), None, entries)?.snapshot();
                JsonlJournal::rewrite(&path, &compacted)?;
                info!(
                    event = "journal.compacted",
                    domain = "engine",
                    before = before as u64,
                    after = compacted.len() as u64
                );
                let journal = Arc::new(JsonlJournal::open(&path)?);
                Self::restore(config, journal, compacted)
            }
            None => Ok(Self::build(config, None)),
        }
    }

    /// Creates an empty engine writing to a caller-provided journal.
    pub fn with_journal(config: EngineConfig, journal: Arc<dyn Journal>) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self::build(config, Some(journal)))
    }

    fn build(config: EngineConfig, journal: Option<Arc<dyn Journal>>) -> Self {
        let log = DeltaLog::new(config.subscriber_buffer, journal.clone());
        let versions = VersionChainStore::new(journal);
        let suggestions = SuggestionResolver::new(versions.clone(), config.max_rebase_distance);
        Self {
            config: Arc::new(config),
            sessions: StreamSessionManager::new(log),
            versions,
            suggestions,
        }
    }

    /// Rebuilds logs and version chains from journal entries. Streams that
    /// were still live are closed as interrupted.
    pub fn restore(
        config: EngineConfig,
        journal: Arc<dyn Journal>,
        entries: Vec<JournalEntry>,
    ) -> Result<Self, EngineError> {
        let total = entries.len();
        let engine = Self::replay(config, Some(journal), entries)?;
        info!(event = "engine.restored", domain = "engine", entries = total as u64);
        Ok(engine)
    }

    fn replay(
        config: EngineConfig,
        journal: Option<Arc<dyn Journal>>,
        entries: Vec<JournalEntry>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let engine = Self::build(config, journal);
        let log = engine.sessions.log();
        for entry in entries {
            match entry {
                JournalEntry::StreamOpened {
                    stream_id,
                    conversation_id,
                    at,
                } => log.restore_open(stream_id, conversation_id, at),
                JournalEntry::DeltaAppended { record } => log.restore_append(record)?,
                JournalEntry::StreamClosed {
                    stream_id,
                    outcome,
                    at,
                } => log.restore_close(stream_id, outcome, at),
                JournalEntry::StreamPurged { stream_id } => log.restore_purge(stream_id),
                JournalEntry::VersionCommitted { version } => engine.versions.restore_version(version),
                JournalEntry::VersionsRolledBack { artifact_id, to } => {
                    engine.versions.restore_rollback(&artifact_id, to)
                }
                JournalEntry::ChainWatermark {
                    artifact_id,
                    next_seq,
                    last_at,
                } => engine.versions.restore_watermark(&artifact_id, next_seq, last_at),
            }
        }
        let interrupted: Vec<StreamId> = log
            .summaries()
            .into_iter()
            .filter(|s| s.outcome.is_none())
            .map(|s| s.stream_id)
            .collect();
        for stream_id in &interrupted {
            engine.sessions.abort(*stream_id, AbortReason::Interrupted)?;
        }
        if !interrupted.is_empty() {
            info!(
                event = "engine.streams_interrupted",
                domain = "engine",
                interrupted = interrupted.len() as u64
            );
        }
        Ok(engine)
    }

    /// Journal entries equivalent to the current retained state.
    fn snapshot(&self) -> Vec<JournalEntry> {
        let mut entries = self.sessions.log().snapshot();
        entries.extend(self.versions.snapshot());
        entries
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &StreamSessionManager {
        &self.sessions
    }

    pub fn versions(&self) -> &VersionChainStore {
        &self.versions
    }

    pub fn suggestions(&self) -> &SuggestionResolver {
        &self.suggestions
    }

    // ---- streams ----

    pub fn begin(&self, conversation_id: &ConversationId) -> Result<StreamId, EngineError> {
        self.sessions.begin(conversation_id)
    }

    /// Appends one fragment. A `finish` fragment also completes the stream.
    pub fn push(&self, stream_id: StreamId, payload: DeltaPayload) -> Result<u64, EngineError> {
        let finish = payload.is_finish();
        let seq = self.sessions.append(stream_id, payload)?;
        if finish {
            self.sessions.complete(stream_id)?;
        }
        Ok(seq)
    }

    pub fn complete(&self, stream_id: StreamId) -> Result<StreamOutcome, EngineError> {
        self.sessions.complete(stream_id)
    }

    pub fn abort(&self, stream_id: StreamId, reason: AbortReason) -> Result<StreamOutcome, EngineError> {
        self.sessions.abort(stream_id, reason)
    }

    pub fn attach(&self, stream_id: StreamId, from_seq: Option<u64>) -> Result<Subscription, EngineError> {
        self.sessions.attach(stream_id, from_seq)
    }

    pub fn resume_after(&self, stream_id: StreamId, last_seen: u64) -> Result<Subscription, EngineError> {
        self.sessions.resume_after(stream_id, last_seen)
    }

    pub fn active_stream_id(&self, conversation_id: &ConversationId) -> Option<StreamId> {
        self.sessions.active_stream_id(conversation_id)
    }

    pub fn session(&self, stream_id: StreamId) -> Result<StreamSession, EngineError> {
        self.sessions.session(stream_id)
    }

    pub fn ensure_producing(&self, stream_id: StreamId) -> Result<(), EngineError> {
        self.sessions.ensure_producing(stream_id)
    }

    /// Resolves to the stream's outcome when it closes by any path:
    /// completion, supersession, an explicit abort or the idle reaper.
    pub fn watch_outcome(
        &self,
        stream_id: StreamId,
    ) -> Result<watch::Receiver<Option<StreamOutcome>>, EngineError> {
        self.sessions.log().watch_outcome(stream_id)
    }

    // ---- artifacts ----

    /// Commits a new version and re-checks pending suggestions against it.
    pub fn commit_version(
        &self,
        artifact_id: &ArtifactId,
        kind: ArtifactKind,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<VersionStamp, EngineError> {
        let stamp = self.versions.commit(artifact_id, kind, title, content)?;
        let flagged = self.suggestions.revalidate(artifact_id);
        if !flagged.is_empty() {
            debug!(
                event = "suggestion.revalidated",
                domain = "suggestion",
                artifact_id = %artifact_id,
                flagged = flagged.len() as u64
            );
        }
        Ok(stamp)
    }

    pub fn head_of(&self, artifact_id: &ArtifactId) -> Option<ArtifactVersion> {
        self.versions.head_of(artifact_id)
    }

    pub fn list_versions(&self, artifact_id: &ArtifactId) -> Vec<ArtifactVersion> {
        self.versions.list_versions(artifact_id)
    }

    pub fn version(&self, artifact_id: &ArtifactId, stamp: VersionStamp) -> Option<ArtifactVersion> {
        self.versions.get(artifact_id, stamp)
    }

    /// Removes versions newer than `to` and invalidates suggestions anchored
    /// on them.
    pub fn rollback(&self, artifact_id: &ArtifactId, to: VersionStamp) -> Result<RollbackOutcome, EngineError> {
        let removed = self.versions.rollback(artifact_id, to)?;
        let invalidated = self.suggestions.invalidate_after(artifact_id, to);
        self.suggestions.revalidate(artifact_id);
        Ok(RollbackOutcome {
            removed,
            invalidated,
            head: self.versions.head_of(artifact_id).map(|v| v.created_at),
        })
    }

    // ---- suggestions ----

    pub fn propose(
        &self,
        artifact_id: &ArtifactId,
        anchor: VersionStamp,
        range: TextRange,
        suggested_text: impl Into<String>,
    ) -> Result<SuggestionId, EngineError> {
        self.suggestions.propose(artifact_id, anchor, range, suggested_text)
    }

    pub fn apply(&self, suggestion_id: SuggestionId) -> Result<VersionStamp, EngineError> {
        let stamp = self.suggestions.apply(suggestion_id)?;
        if let Some(applied) = self.suggestions.get(suggestion_id) {
            self.suggestions.revalidate(&applied.artifact_id);
        }
        Ok(stamp)
    }

    pub fn dismiss(&self, suggestion_id: SuggestionId) -> Result<Suggestion, EngineError> {
        self.suggestions.dismiss(suggestion_id)
    }

    pub fn suggestion(&self, suggestion_id: SuggestionId) -> Option<Suggestion> {
        self.suggestions.get(suggestion_id)
    }

    pub fn list_pending(&self, artifact_id: &ArtifactId) -> Vec<Suggestion> {
        self.suggestions.list_pending(artifact_id)
    }

    // ---- maintenance ----

    /// Aborts sessions idle past the configured window.
    pub fn reap_idle(&self, now: DateTime<Utc>) -> Vec<StreamId> {
        self.sessions.reap_idle(now, to_chrono(self.config.idle_timeout))
    }

    /// Purges terminal logs older than the retention window.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<StreamId> {
        self.sessions.purge_expired(now, to_chrono(self.config.retention))
    }

    /// Runs idle reaping and retention purging on a timer until the handle is
    /// stopped or dropped.
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let engine = self.clone();
        let period = self.config.reap_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let reaped = engine.reap_idle(now);
                let purged = engine.purge_expired(now);
                if !reaped.is_empty() || !purged.is_empty() {
                    debug!(
                        event = "engine.maintenance",
                        domain = "engine",
                        reaped = reaped.len() as u64,
                        purged = purged.len() as u64
                    );
                }
            }
        });
        MaintenanceHandle { handle }
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Background maintenance task. Aborted on drop.
pub struct MaintenanceHandle {
    handle: JoinHandle<()>,
}

impl MaintenanceHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::FeedItem;
    use crate::suggestion::SuggestionStatus;
    use std::time::Duration;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).expect("engine")
    }

    fn texts(items: &[FeedItem]) -> Vec<String> {
        items
            .iter()
            .filter_map(FeedItem::as_delta)
            .filter_map(|r| match &r.payload {
                DeltaPayload::TextDelta { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn completed_stream_replays_fragments_then_terminal_marker() {
        let engine = engine();
        let s1 = engine.begin(&"c1".into()).expect("begin");
        for text in ["a", "b", "c"] {
            engine.push(s1, DeltaPayload::text(text)).expect("push");
        }
        engine.complete(s1).expect("complete");

        let items = engine.attach(s1, None).expect("attach").collect_all().await;
        assert_eq!(items.len(), 4);
        assert_eq!(texts(&items), vec!["a", "b", "c"]);
        assert_eq!(items[3], FeedItem::End(StreamOutcome::Completed));
    }

    #[tokio::test]
    async fn second_begin_supersedes_and_closes_the_first_stream() {
        let engine = engine();
        let c1 = ConversationId::new("c1");
        let s1 = engine.begin(&c1).expect("s1");
        engine.push(s1, DeltaPayload::text("partial")).expect("push");
        let s2 = engine.begin(&c1).expect("s2");

        assert_eq!(engine.active_stream_id(&c1), Some(s2));
        assert_eq!(
            engine.session(s1).expect("s1").status,
            crate::session::SessionStatus::Aborted
        );
        let err = engine.push(s1, DeltaPayload::text("late")).expect_err("closed");
        assert!(matches!(err, EngineError::StreamClosed { stream_id, .. } if stream_id == s1));
        assert!(matches!(
            engine.ensure_producing(s1),
            Err(EngineError::SessionSuperseded { .. })
        ));

        let items = engine.attach(s1, Some(0)).expect("attach").collect_all().await;
        assert_eq!(
            items.last(),
            Some(&FeedItem::End(StreamOutcome::aborted(AbortReason::Superseded { by: s2 })))
        );
    }

    #[tokio::test]
    async fn finish_fragment_completes_the_stream() {
        let engine = engine();
        let c1 = ConversationId::new("c1");
        let s1 = engine.begin(&c1).expect("begin");
        engine.push(s1, DeltaPayload::text("hi")).expect("push");
        engine
            .push(s1, DeltaPayload::Finish { reason: Some("stop".into()) })
            .expect("finish");
        assert_eq!(engine.active_stream_id(&c1), None);
        let items = engine.attach(s1, None).expect("attach").collect_all().await;
        assert_eq!(items.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replay_matches_what_a_live_viewer_saw() {
        let engine = Engine::new(EngineConfig::default().subscriber_buffer(2)).expect("engine");
        let s1 = engine.begin(&"c1".into()).expect("begin");
        let live = engine.attach(s1, None).expect("live attach");
        let viewer = tokio::spawn(live.collect_all());

        let producer = engine.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                producer
                    .push(s1, DeltaPayload::text(format!("chunk-{i}")))
                    .expect("push");
                if i % 17 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            producer.complete(s1).expect("complete");
        })
        .await
        .expect("producer");

        let live_items = viewer.await.expect("viewer");
        let replayed = engine.attach(s1, Some(0)).expect("replay").collect_all().await;
        assert_eq!(live_items.len(), 201);
        assert_eq!(live_items, replayed);
    }

    #[tokio::test]
    async fn second_tab_joining_mid_stream_sees_the_whole_turn() {
        let engine = engine();
        let s1 = engine.begin(&"c1".into()).expect("begin");
        engine.push(s1, DeltaPayload::text("early")).expect("push");
        let second_tab = engine.attach(s1, None).expect("second tab");
        engine.push(s1, DeltaPayload::text("late")).expect("push");
        engine.complete(s1).expect("complete");
        let items = second_tab.collect_all().await;
        assert_eq!(texts(&items), vec!["early", "late"]);
    }

    fn doc_with_history(engine: &Engine) -> (ArtifactId, VersionStamp, VersionStamp) {
        let doc = ArtifactId::new("doc1");
        let t1 = engine
            .commit_version(&doc, ArtifactKind::Text, "Greeting", "Hello world")
            .expect("t1");
        let t2 = engine
            .commit_version(&doc, ArtifactKind::Text, "Greeting", "Hello world!")
            .expect("t2");
        (doc, t1, t2)
    }

    #[test]
    fn suggestion_is_rebased_onto_a_head_edited_elsewhere() {
        let engine = engine();
        let (doc, t1, _t2) = doc_with_history(&engine);
        let id = engine
            .propose(&doc, t1, TextRange::new(0, 5), "Howdy")
            .expect("propose");
        let t3 = engine
            .commit_version(&doc, ArtifactKind::Text, "Greeting", "Hello brave world!")
            .expect("t3");

        let t4 = engine.apply(id).expect("apply");
        assert!(t4 > t3);
        let head = engine.head_of(&doc).expect("head");
        assert_eq!(head.created_at, t4);
        assert_eq!(head.content, "Howdy brave world!");
        assert_eq!(
            engine.suggestion(id).expect("suggestion").status,
            SuggestionStatus::Applied
        );
    }

    #[test]
    fn suggestion_conflicts_when_its_range_was_edited() {
        let engine = engine();
        let (doc, t1, _t2) = doc_with_history(&engine);
        let id = engine
            .propose(&doc, t1, TextRange::new(0, 5), "Howdy")
            .expect("propose");
        engine
            .commit_version(&doc, ArtifactKind::Text, "Greeting", "Jello world!")
            .expect("t3");

        let err = engine.apply(id).expect_err("conflict");
        assert!(matches!(err, EngineError::RebaseConflict { suggestion_id, .. } if suggestion_id == id));
        assert!(err.is_recoverable());
        let suggestion = engine.suggestion(id).expect("suggestion");
        assert_eq!(suggestion.status, SuggestionStatus::Pending);
        assert!(suggestion.needs_review());
        assert_eq!(engine.head_of(&doc).expect("head").content, "Jello world!");
    }

    #[test]
    fn rollback_invalidates_suggestions_anchored_after_the_target() {
        let engine = engine();
        let (doc, t1, t2) = doc_with_history(&engine);
        let t3 = engine
            .commit_version(&doc, ArtifactKind::Text, "Greeting", "Hello world!!")
            .expect("t3");
        let kept = engine
            .propose(&doc, t1, TextRange::new(0, 5), "Howdy")
            .expect("kept");
        let lost = engine
            .propose(&doc, t3, TextRange::new(6, 11), "there")
            .expect("lost");

        let outcome = engine.rollback(&doc, t2).expect("rollback");
        assert_eq!(outcome.removed, vec![t3]);
        assert_eq!(outcome.invalidated, vec![lost]);
        assert_eq!(outcome.head, Some(t2));
        assert!(matches!(engine.apply(lost), Err(EngineError::StaleAnchor { .. })));
        assert_eq!(
            engine.list_pending(&doc).iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![kept]
        );
    }

    #[test]
    fn dismiss_twice_is_a_no_op() {
        let engine = engine();
        let (doc, t1, _) = doc_with_history(&engine);
        let id = engine
            .propose(&doc, t1, TextRange::new(0, 5), "Howdy")
            .expect("propose");
        let first = engine.dismiss(id).expect("dismiss");
        let second = engine.dismiss(id).expect("dismiss again");
        assert_eq!(first, second);
        assert_eq!(engine.list_versions(&doc).len(), 2);
    }

    #[tokio::test]
    async fn journal_restores_logs_and_versions_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::default().journal_path(dir.path().join("journal.jsonl"));
        let c2 = ConversationId::new("c2");
        let doc = ArtifactId::new("doc1");

        let (s1, s2, kept, removed_stamp) = {
            let engine = Engine::new(config.clone()).expect("engine");
            let s1 = engine.begin(&"c1".into()).expect("s1");
            engine.push(s1, DeltaPayload::text("one")).expect("push");
            engine.push(s1, DeltaPayload::text("two")).expect("push");
            engine.complete(s1).expect("complete");
            let s2 = engine.begin(&c2).expect("s2");
            engine.push(s2, DeltaPayload::text("cut off")).expect("push");

            let v1 = engine
                .commit_version(&doc, ArtifactKind::Code, "main.rs", "fn main() {}")
                .expect("v1");
            let v2 = engine
                .commit_version(&doc, ArtifactKind::Code, "main.rs", "fn main() { run() }")
                .expect("v2");
            let v3 = engine
                .commit_version(&doc, ArtifactKind::Code, "main.rs", "broken")
                .expect("v3");
            engine.rollback(&doc, v2).expect("rollback");
            (s1, s2, vec![v1, v2], v3)
        };

        let engine = Engine::new(config).expect("restored engine");
        let items = engine.attach(s1, None).expect("attach").collect_all().await;
        assert_eq!(texts(&items), vec!["one", "two"]);
        assert_eq!(items.last(), Some(&FeedItem::End(StreamOutcome::Completed)));

        assert_eq!(
            engine.session(s2).expect("s2").outcome,
            Some(StreamOutcome::aborted(AbortReason::Interrupted))
        );
        assert_eq!(engine.active_stream_id(&c2), None);

        let stamps: Vec<VersionStamp> =
            engine.list_versions(&doc).iter().map(|v| v.created_at).collect();
        assert_eq!(stamps, kept);
        let next = engine
            .commit_version(&doc, ArtifactKind::Code, "main.rs", "fn main() { run(); }")
            .expect("commit after restore");
        assert!(next > removed_stamp);
    }

    #[tokio::test]
    async fn restart_compacts_the_journal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.jsonl");
        let config = EngineConfig::default().journal_path(&path);
        let doc = ArtifactId::new("doc1");

        let (purged, kept, t1, t2) = {
            let engine = Engine::new(config.clone()).expect("engine");
            let purged = engine.begin(&"c1".into()).expect("begin");
            for i in 0..50 {
                engine
                    .push(purged, DeltaPayload::text(format!("chunk {i}")))
                    .expect("push");
            }
            engine.complete(purged).expect("complete");
            let t1 = engine
                .commit_version(&doc, ArtifactKind::Text, "notes", "first")
                .expect("t1");
            let t2 = engine
                .commit_version(&doc, ArtifactKind::Text, "notes", "second")
                .expect("t2");
            engine.rollback(&doc, t1).expect("rollback");
            assert_eq!(
                engine.purge_expired(Utc::now() + chrono::Duration::hours(2)),
                vec![purged]
            );
            let kept = engine.begin(&"c2".into()).expect("begin");
            engine.push(kept, DeltaPayload::text("kept")).expect("push");
            engine.complete(kept).expect("complete");
            (purged, kept, t1, t2)
        };
        let before = std::fs::metadata(&path).expect("metadata").len();

        let engine = Engine::new(config.clone()).expect("restored engine");
        let after = std::fs::metadata(&path).expect("metadata").len();
        assert!(after < before, "journal did not shrink: {before} -> {after}");

        assert!(matches!(
            engine.attach(purged, None).err(),
            Some(EngineError::StreamNotFound(id)) if id == purged
        ));
        let items = engine.attach(kept, None).expect("attach").collect_all().await;
        assert_eq!(texts(&items), vec!["kept"]);
        assert_eq!(engine.head_of(&doc).expect("head").created_at, t1);

        let t3 = engine
            .commit_version(&doc, ArtifactKind::Text, "notes", "third")
            .expect("t3");
        assert!(t3 > t2);
        drop(engine);

        let engine = Engine::new(config).expect("second restart");
        let stamps: Vec<VersionStamp> =
            engine.list_versions(&doc).iter().map(|v| v.created_at).collect();
        assert_eq!(stamps, vec![t1, t3]);
    }

    #[tokio::test]
    async fn torn_journal_tail_does_not_block_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.jsonl");
        let config = EngineConfig::default().journal_path(&path);

        let s1 = {
            let engine = Engine::new(config.clone()).expect("engine");
            let s1 = engine.begin(&"c1".into()).expect("begin");
            engine.push(s1, DeltaPayload::text("saved")).expect("push");
            s1
        };
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        std::io::Write::write_all(&mut file, b"{\"entry\":\"delta_appended\",\"rec")
            .expect("torn write");
        drop(file);

        let engine = Engine::new(config.clone()).expect("startup after crash");
        let items = engine.attach(s1, None).expect("attach").collect_all().await;
        assert_eq!(texts(&items), vec!["saved"]);
        let s2 = engine.begin(&"c1".into()).expect("begin");
        engine.push(s2, DeltaPayload::text("after")).expect("push");
        drop(engine);

        let engine = Engine::new(config).expect("second restart");
        assert_eq!(
            engine.session(s2).expect("s2").outcome,
            Some(StreamOutcome::aborted(AbortReason::Interrupted))
        );
    }

    #[tokio::test]
    async fn maintenance_task_reaps_idle_sessions() {
        let config = EngineConfig {
            idle_timeout: Duration::from_millis(30),
            reap_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let engine = Engine::new(config).expect("engine");
        let c1 = ConversationId::new("c1");
        let s1 = engine.begin(&c1).expect("begin");
        let maintenance = engine.spawn_maintenance();

        let mut outcome = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            outcome = engine.session(s1).expect("session").outcome;
            if outcome.is_some() {
                break;
            }
        }
        maintenance.stop();
        assert_eq!(outcome, Some(StreamOutcome::aborted(AbortReason::Idle)));
        assert_eq!(engine.active_stream_id(&c1), None);
    }
}
