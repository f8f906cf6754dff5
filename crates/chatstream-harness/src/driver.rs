use std::sync::Arc;
use std::time::Duration;

use chatstream_core::{
    AbortReason, ConversationId, DeltaPayload, Engine, EngineError, StreamId, Subscription,
};
use futures::StreamExt as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::content::{ArtifactDraft, CommittedArtifact, GenerationOutput, InputPart};
use crate::errors::{DriverFailure, HarnessError};
use crate::harness::HarnessInner;
use crate::model::{DriverOptions, ModelRef};
use crate::provider::{ProviderAdapter, ProviderEvent, ProviderRequest};

/// Requests cancellation of a running generation.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Best effort. The stream ends aborted with reason `cancelled`.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Configures one generation before it starts.
pub struct GenerationBuilder {
    harness: Arc<HarnessInner>,
    conversation_id: ConversationId,
    model: ModelRef,
    system_prompt: Option<String>,
    input_parts: Vec<InputPart>,
    options: DriverOptions,
}

impl GenerationBuilder {
    pub(crate) fn new(harness: Arc<HarnessInner>, conversation_id: ConversationId, model: ModelRef) -> Self {
        Self {
            harness,
            conversation_id,
            model,
            system_prompt: None,
            input_parts: Vec::new(),
            options: DriverOptions::default(),
        }
    }

    pub fn system_prompt(mut self, text: impl Into<String>) -> Self {
        self.system_prompt = Some(text.into());
        self
    }

    pub fn user_text(mut self, text: impl Into<String>) -> Self {
        self.input_parts.push(InputPart::Text(text.into()));
        self
    }

    pub fn user_json(mut self, value: serde_json::Value) -> Self {
        self.input_parts.push(InputPart::Json(value));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn check_every(mut self, fragments: usize) -> Self {
        self.options.check_every = fragments;
        self
    }

    /// Begins a stream for the conversation (superseding any live one) and
    /// spawns the driver task feeding it.
    pub async fn start(self) -> Result<GenerationHandle, HarnessError> {
        let harness = self.harness.clone();
        let request = self.validate_and_build_request()?;
        let provider = harness
            .provider(&request.model.provider)
            .ok_or_else(|| HarnessError::ProviderNotFound {
                provider: request.model.provider.clone(),
            })?;

        let engine = harness.engine.clone();
        let stream_id = engine.begin(&request.conversation_id)?;
        let (abort_tx, abort_rx) = watch::channel(false);
        info!(
            event = "generation.started",
            domain = "driver",
            stream_id = %stream_id,
            conversation_id = %request.conversation_id,
            provider = %request.model.provider,
            model = %request.model.model
        );
        let task = tokio::spawn(drive(engine.clone(), provider, request, stream_id, abort_rx));

        Ok(GenerationHandle {
            stream_id,
            engine,
            abort_handle: AbortHandle {
                tx: Arc::new(abort_tx),
            },
            task,
        })
    }

    /// Starts and waits for the final output.
    pub async fn run(self) -> Result<GenerationOutput, HarnessError> {
        self.start().await?.finish().await
    }

    fn validate_and_build_request(self) -> Result<ProviderRequest, HarnessError> {
        if self.conversation_id.as_str().trim().is_empty() {
            return Err(HarnessError::Validation(
                "conversation id must not be empty".into(),
            ));
        }
        if self.model.provider.as_str().trim().is_empty() {
            return Err(HarnessError::Validation(
                "model provider must not be empty".into(),
            ));
        }
        if self.model.model.trim().is_empty() {
            return Err(HarnessError::Validation("model must not be empty".into()));
        }
        if self.options.check_every == 0 {
            return Err(HarnessError::Validation(
                "check_every must be greater than 0".into(),
            ));
        }
        if self.input_parts.is_empty() {
            return Err(HarnessError::Validation(
                "at least one input part is required".into(),
            ));
        }
        for part in &self.input_parts {
            if let InputPart::Text(text) = part
                && text.trim().is_empty()
            {
                return Err(HarnessError::Validation(
                    "text input must not be empty".into(),
                ));
            }
        }
        Ok(ProviderRequest {
            generation_id: uuid::Uuid::new_v4(),
            conversation_id: self.conversation_id,
            model: self.model,
            system_prompt: self.system_prompt.filter(|s| !s.trim().is_empty()),
            input_parts: self.input_parts,
            options: self.options,
        })
    }
}

/// Running generation. Viewers attach through the engine with the stream id.
pub struct GenerationHandle {
    stream_id: StreamId,
    engine: Engine,
    abort_handle: AbortHandle,
    task: JoinHandle<Result<GenerationOutput, HarnessError>>,
}

impl GenerationHandle {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Subscribes to the generation from its first fragment.
    pub fn subscribe(&self) -> Result<Subscription, HarnessError> {
        Ok(self.engine.attach(self.stream_id, None)?)
    }

    /// Waits for the driver task and returns its result.
    pub async fn finish(self) -> Result<GenerationOutput, HarnessError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(HarnessError::Protocol(format!(
                "driver task for stream {} ended abnormally: {err}",
                self.stream_id
            ))),
        }
    }
}

/// Feeds one provider stream into the engine until it completes, fails, is
/// cancelled, times out, or is superseded.
async fn drive(
    engine: Engine,
    provider: Arc<dyn ProviderAdapter>,
    request: ProviderRequest,
    stream_id: StreamId,
    mut abort_rx: watch::Receiver<bool>,
) -> Result<GenerationOutput, HarnessError> {
    let provider_id = request.model.provider.clone();
    let options = request.options.clone();
    let mut terminal = match engine.watch_outcome(stream_id) {
        Ok(terminal) => terminal,
        Err(err) => return Err(HarnessError::from_push(err)),
    };
    let mut pusher = Pusher::new(engine, stream_id, options.check_every);

    let mut handle = match provider.start_stream(request).await {
        Ok(handle) => handle,
        Err(err) => return Err(pusher.fail(DriverFailure::from(&err))),
    };
    let closed_early = terminal.borrow_and_update().clone();
    if let Some(outcome) = closed_early {
        return Err(pusher.stopped(EngineError::StreamClosed { stream_id, outcome }));
    }

    let deadline = async move {
        match options.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut abort_open = true;
    let mut drafts: Vec<ArtifactDraft> = Vec::new();
    loop {
        tokio::select! {
            biased;
            changed = abort_rx.changed(), if abort_open => {
                match changed {
                    Ok(()) if *abort_rx.borrow() => {
                        return Err(pusher.close(AbortReason::Cancelled, DriverFailure::Cancelled));
                    }
                    Ok(()) => {}
                    Err(_) => abort_open = false,
                }
            }
            // Closed from outside: superseded, aborted or reaped while the
            // provider is silent.
            changed = terminal.changed() => {
                let outcome = match changed {
                    Ok(()) => terminal.borrow_and_update().clone(),
                    Err(_) => return Err(pusher.stopped(EngineError::StreamNotFound(stream_id))),
                };
                if let Some(outcome) = outcome {
                    return Err(pusher.stopped(EngineError::StreamClosed { stream_id, outcome }));
                }
            }
            _ = &mut deadline => {
                let reason = AbortReason::Driver { message: "generation timed out".into() };
                return Err(pusher.close(reason, DriverFailure::TimedOut));
            }
            next = handle.stream.next() => {
                match next {
                    Some(Ok(ProviderEvent::TextDelta { text })) => {
                        if text.is_empty() {
                            continue;
                        }
                        pusher.text.push_str(&text);
                        pusher.push(DeltaPayload::TextDelta { text })?;
                    }
                    Some(Ok(ProviderEvent::ToolCall { call_id, name, arguments })) => {
                        pusher.push(DeltaPayload::ToolCall { call_id, name, arguments })?;
                    }
                    Some(Ok(ProviderEvent::ArtifactDelta { artifact_id, kind, title, delta })) => {
                        ArtifactDraft::accumulate(&mut drafts, artifact_id.clone(), kind, title.clone(), &delta);
                        pusher.push(DeltaPayload::ArtifactPatch { artifact_id, kind, title, delta })?;
                    }
                    Some(Ok(ProviderEvent::Completed { finish_reason })) => {
                        return pusher.complete(drafts, finish_reason);
                    }
                    Some(Err(err)) => {
                        return Err(pusher.fail(DriverFailure::from(&err)));
                    }
                    None => {
                        let failure = DriverFailure::Protocol {
                            message: format!("provider stream ended without completion ({provider_id})"),
                        };
                        return Err(pusher.fail(failure));
                    }
                }
            }
        }
    }
}

/// Producer side of one stream: pushes fragments and re-checks ownership in
/// batches.
struct Pusher {
    engine: Engine,
    stream_id: StreamId,
    check_every: usize,
    since_check: usize,
    fragments: u64,
    text: String,
}

impl Pusher {
    fn new(engine: Engine, stream_id: StreamId, check_every: usize) -> Self {
        Self {
            engine,
            stream_id,
            check_every,
            since_check: 0,
            fragments: 0,
            text: String::new(),
        }
    }

    fn push(&mut self, payload: DeltaPayload) -> Result<u64, HarnessError> {
        let seq = self
            .engine
            .push(self.stream_id, payload)
            .map_err(|err| self.stopped(err))?;
        self.fragments += 1;
        self.since_check += 1;
        debug!(stream_id = %self.stream_id, seq, "fragment pushed");
        if self.since_check >= self.check_every {
            self.since_check = 0;
            self.engine
                .ensure_producing(self.stream_id)
                .map_err(|err| self.stopped(err))?;
        }
        Ok(seq)
    }

    fn stopped(&self, err: EngineError) -> HarnessError {
        let err = HarnessError::from_push(err);
        info!(
            event = "generation.stopped",
            domain = "driver",
            stream_id = %self.stream_id,
            error = %err
        );
        err
    }

    /// Commits artifact drafts, then pushes the finish fragment which
    /// completes the stream.
    ///
    /// Ownership is re-checked before every draft, so a turn superseded
    /// mid-way stops committing. Commits are not transactional: drafts
    /// committed before a failure stay in their chains.
    fn complete(
        mut self,
        drafts: Vec<ArtifactDraft>,
        finish_reason: Option<String>,
    ) -> Result<GenerationOutput, HarnessError> {
        let mut artifacts = Vec::with_capacity(drafts.len());
        for draft in drafts {
            self.engine
                .ensure_producing(self.stream_id)
                .map_err(|err| self.stopped(err))?;
            let committed = self.engine.commit_version(
                &draft.artifact_id,
                draft.kind,
                draft.title,
                draft.content,
            );
            match committed {
                Ok(stamp) => artifacts.push(CommittedArtifact {
                    artifact_id: draft.artifact_id,
                    stamp,
                }),
                Err(err) => {
                    let reason = AbortReason::Driver {
                        message: format!("artifact commit failed: {err}"),
                    };
                    self.abort_quietly(reason);
                    return Err(HarnessError::Engine(err));
                }
            }
        }
        self.push(DeltaPayload::Finish {
            reason: finish_reason.clone(),
        })?;
        info!(
            event = "generation.completed",
            domain = "driver",
            stream_id = %self.stream_id,
            fragments = self.fragments,
            artifacts = artifacts.len() as u64
        );
        Ok(GenerationOutput {
            stream_id: self.stream_id,
            text: self.text,
            artifacts,
            finish_reason,
            fragments: self.fragments,
        })
    }

    /// Ends the stream after a provider-side failure.
    fn fail(&self, failure: DriverFailure) -> HarnessError {
        let reason = AbortReason::Driver {
            message: failure.to_string(),
        };
        self.close(reason, failure)
    }

    fn close(&self, reason: AbortReason, failure: DriverFailure) -> HarnessError {
        self.abort_quietly(reason);
        warn!(
            event = "generation.failed",
            domain = "driver",
            stream_id = %self.stream_id,
            failure = %failure
        );
        HarnessError::Failed(failure)
    }

    fn abort_quietly(&self, reason: AbortReason) {
        if let Err(err) = self.engine.abort(self.stream_id, reason) {
            warn!(
                event = "generation.abort_failed",
                domain = "driver",
                stream_id = %self.stream_id,
                error = %err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::harness::Harness;
    use crate::model::ProviderId;
    use crate::provider::{ProviderResponseMeta, ProviderStreamHandle};
    use chatstream_core::{
        ArtifactId, ArtifactKind, FeedItem, SessionStatus, StreamOutcome,
    };
    use futures::channel::mpsc as fmpsc;
    use futures::stream;
    use std::sync::Mutex;

    enum Script {
        Events(Vec<Result<ProviderEvent, ProviderError>>),
        Channel(Mutex<Option<fmpsc::UnboundedReceiver<Result<ProviderEvent, ProviderError>>>>),
        Pending,
        Refuse(ProviderError),
    }

    struct FakeProvider {
        script: Script,
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for FakeProvider {
        fn id(&self) -> ProviderId {
            ProviderId::new("fake")
        }

        async fn start_stream(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderStreamHandle, ProviderError> {
            let stream: crate::provider::ProviderEventStream = match &self.script {
                Script::Events(events) => Box::pin(stream::iter(events.clone())),
                Script::Channel(rx) => match rx.lock().expect("lock").take() {
                    Some(rx) => Box::pin(rx),
                    None => return Err(ProviderError::protocol("fake", "channel already taken")),
                },
                Script::Pending => Box::pin(stream::pending()),
                Script::Refuse(err) => return Err(err.clone()),
            };
            Ok(ProviderStreamHandle {
                stream,
                metadata: ProviderResponseMeta::default(),
            })
        }
    }

    fn harness(script: Script) -> Harness {
        Harness::builder()
            .register_provider(Arc::new(FakeProvider { script }))
            .build()
            .expect("harness")
    }

    fn generation(harness: &Harness) -> GenerationBuilder {
        harness
            .generate("c1", ModelRef::new("fake", "model-a"))
            .user_text("hello")
    }

    fn text(t: &str) -> Result<ProviderEvent, ProviderError> {
        Ok(ProviderEvent::TextDelta { text: t.into() })
    }

    fn completed() -> Result<ProviderEvent, ProviderError> {
        Ok(ProviderEvent::Completed {
            finish_reason: Some("stop".into()),
        })
    }

    #[tokio::test]
    async fn text_generation_completes_the_stream() {
        let harness = harness(Script::Events(vec![text("a"), text(""), text("b"), completed()]));
        let output = generation(&harness).run().await.expect("run");
        assert_eq!(output.text, "ab");
        assert_eq!(output.fragments, 3);
        assert_eq!(output.finish_reason.as_deref(), Some("stop"));

        let items = harness
            .engine()
            .attach(output.stream_id, None)
            .expect("attach")
            .collect_all()
            .await;
        assert_eq!(items.len(), 4);
        assert!(matches!(
            &items[2],
            FeedItem::Delta(record) if record.payload.is_finish()
        ));
        assert_eq!(items[3], FeedItem::End(StreamOutcome::Completed));
        assert_eq!(harness.engine().active_stream_id(&"c1".into()), None);
    }

    #[tokio::test]
    async fn artifact_deltas_are_committed_before_the_stream_ends() {
        let doc = ArtifactId::new("doc1");
        let delta = |d: &str| -> Result<ProviderEvent, ProviderError> {
            Ok(ProviderEvent::ArtifactDelta {
                artifact_id: doc.clone(),
                kind: ArtifactKind::Code,
                title: Some("main.rs".into()),
                delta: d.into(),
            })
        };
        let harness = harness(Script::Events(vec![
            delta("fn main() "),
            Ok(ProviderEvent::ToolCall {
                call_id: "call-1".into(),
                name: "format".into(),
                arguments: serde_json::json!({"lang": "rust"}),
            }),
            delta("{}"),
            completed(),
        ]));
        let output = generation(&harness).run().await.expect("run");
        assert_eq!(output.artifacts.len(), 1);

        let head = harness.engine().head_of(&doc).expect("head");
        assert_eq!(head.content, "fn main() {}");
        assert_eq!(head.title, "main.rs");
        assert_eq!(head.created_at, output.artifacts[0].stamp);
    }

    #[tokio::test]
    async fn provider_error_aborts_the_stream() {
        let harness = harness(Script::Events(vec![
            text("partial"),
            Err(ProviderError::provider("fake", "boom", Some(500))),
        ]));
        let handle = generation(&harness).start().await.expect("start");
        let stream_id = handle.stream_id();
        let err = handle.finish().await.expect_err("failure");
        assert!(matches!(err, HarnessError::Failed(DriverFailure::Provider { .. })));

        let session = harness.engine().session(stream_id).expect("session");
        assert_eq!(session.status, SessionStatus::Aborted);
        assert!(matches!(
            session.outcome,
            Some(StreamOutcome::Aborted { reason: AbortReason::Driver { .. } })
        ));
    }

    #[tokio::test]
    async fn refused_start_aborts_the_begun_stream() {
        let harness = harness(Script::Refuse(ProviderError::transport("fake", "offline")));
        let handle = generation(&harness).start().await.expect("start");
        let stream_id = handle.stream_id();
        let err = handle.finish().await.expect_err("failure");
        assert!(matches!(err, HarnessError::Failed(DriverFailure::Transport { .. })));
        assert_eq!(
            harness.engine().session(stream_id).expect("session").status,
            SessionStatus::Aborted
        );
    }

    #[tokio::test]
    async fn stream_ending_without_completion_is_a_protocol_failure() {
        let harness = harness(Script::Events(vec![text("a")]));
        let err = generation(&harness).run().await.expect_err("failure");
        assert!(matches!(err, HarnessError::Failed(DriverFailure::Protocol { .. })));
    }

    #[tokio::test]
    async fn cancellation_aborts_with_cancelled_reason() {
        let harness = harness(Script::Pending);
        let handle = generation(&harness).start().await.expect("start");
        let stream_id = handle.stream_id();
        handle.abort_handle().abort();
        let err = handle.finish().await.expect_err("cancelled");
        assert_eq!(err, HarnessError::Failed(DriverFailure::Cancelled));
        assert_eq!(
            harness.engine().session(stream_id).expect("session").outcome,
            Some(StreamOutcome::aborted(AbortReason::Cancelled))
        );
    }

    #[tokio::test]
    async fn timeout_aborts_the_stream() {
        let harness = harness(Script::Pending);
        let handle = generation(&harness)
            .timeout(Duration::from_millis(20))
            .start()
            .await
            .expect("start");
        let stream_id = handle.stream_id();
        let err = handle.finish().await.expect_err("timed out");
        assert_eq!(err, HarnessError::Failed(DriverFailure::TimedOut));
        assert_eq!(
            harness.engine().session(stream_id).expect("session").status,
            SessionStatus::Aborted
        );
    }

    #[tokio::test]
    async fn superseded_driver_stops_producing() {
        let (tx, rx) = fmpsc::unbounded();
        let harness = harness(Script::Channel(Mutex::new(Some(rx))));
        let first = generation(&harness).start().await.expect("start");
        let s1 = first.stream_id();

        tx.unbounded_send(text("one")).expect("send");
        let mut viewer = first.subscribe().expect("subscribe");
        assert!(matches!(viewer.next().await, Some(FeedItem::Delta(_))));

        let s2 = harness.engine().begin(&"c1".into()).expect("second turn");
        tx.unbounded_send(text("two")).expect("send");
        let err = first.finish().await.expect_err("superseded");
        assert_eq!(err, HarnessError::Failed(DriverFailure::Superseded { by: s2 }));

        assert_eq!(
            viewer.next().await,
            Some(FeedItem::End(StreamOutcome::aborted(AbortReason::Superseded { by: s2 })))
        );
        assert_eq!(harness.engine().active_stream_id(&"c1".into()), Some(s2));
        assert_eq!(harness.engine().session(s1).expect("s1").next_seq, 1);
    }

    #[tokio::test]
    async fn silent_provider_notices_supersede() {
        let harness = harness(Script::Pending);
        let first = generation(&harness).start().await.expect("start");
        let s1 = first.stream_id();

        let s2 = harness.engine().begin(&"c1".into()).expect("second turn");
        let err = tokio::time::timeout(Duration::from_secs(5), first.finish())
            .await
            .expect("driver returned")
            .expect_err("superseded");
        assert_eq!(err, HarnessError::Failed(DriverFailure::Superseded { by: s2 }));
        assert_eq!(
            harness.engine().session(s1).expect("s1").outcome,
            Some(StreamOutcome::aborted(AbortReason::Superseded { by: s2 }))
        );
    }

    #[tokio::test]
    async fn silent_provider_notices_idle_reap() {
        let harness = harness(Script::Pending);
        let handle = generation(&harness).start().await.expect("start");
        let stream_id = handle.stream_id();

        let reaped = harness
            .engine()
            .reap_idle(chrono::Utc::now() + chrono::Duration::seconds(600));
        assert_eq!(reaped, vec![stream_id]);
        let err = tokio::time::timeout(Duration::from_secs(5), handle.finish())
            .await
            .expect("driver returned")
            .expect_err("reaped");
        assert!(matches!(
            err,
            HarnessError::Engine(chatstream_core::EngineError::StreamClosed {
                outcome: StreamOutcome::Aborted { reason: AbortReason::Idle },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn silent_provider_notices_external_abort() {
        let harness = harness(Script::Pending);
        let handle = generation(&harness).start().await.expect("start");
        harness
            .engine()
            .abort(handle.stream_id(), AbortReason::Cancelled)
            .expect("abort");
        let err = tokio::time::timeout(Duration::from_secs(5), handle.finish())
            .await
            .expect("driver returned")
            .expect_err("cancelled");
        assert_eq!(err, HarnessError::Failed(DriverFailure::Cancelled));
    }

    #[tokio::test]
    async fn superseded_turn_commits_no_artifacts() {
        let doc = ArtifactId::new("doc1");
        let (tx, rx) = fmpsc::unbounded();
        let harness = harness(Script::Channel(Mutex::new(Some(rx))));
        let first = generation(&harness).start().await.expect("start");

        tx.unbounded_send(Ok(ProviderEvent::ArtifactDelta {
            artifact_id: doc.clone(),
            kind: ArtifactKind::Text,
            title: None,
            delta: "draft".into(),
        }))
        .expect("send");
        let mut viewer = first.subscribe().expect("subscribe");
        assert!(matches!(viewer.next().await, Some(FeedItem::Delta(_))));

        let s2 = harness.engine().begin(&"c1".into()).expect("second turn");
        tx.unbounded_send(completed()).expect("send");
        let err = first.finish().await.expect_err("superseded");
        assert_eq!(err, HarnessError::Failed(DriverFailure::Superseded { by: s2 }));
        assert!(harness.engine().head_of(&doc).is_none());
    }

    #[tokio::test]
    async fn validation_and_unknown_provider_fail_before_begin() {
        let harness = harness(Script::Pending);
        let err = harness
            .generate("c1", ModelRef::new("fake", "m"))
            .start()
            .await
            .err()
            .expect("missing input");
        assert!(matches!(err, HarnessError::Validation(msg) if msg.contains("at least one input")));

        let err = harness
            .generate("c1", ModelRef::new("fake", "m"))
            .user_text("   ")
            .start()
            .await
            .err()
            .expect("blank input");
        assert!(matches!(err, HarnessError::Validation(msg) if msg.contains("text input")));

        let err = harness
            .generate("c1", ModelRef::new("missing", "m"))
            .user_text("hello")
            .start()
            .await
            .err()
            .expect("missing provider");
        assert!(matches!(err, HarnessError::ProviderNotFound { .. }));
        assert_eq!(harness.engine().active_stream_id(&"c1".into()), None);
    }
}
