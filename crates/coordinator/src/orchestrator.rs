//! Worker pool orchestration
//!
//! The orchestrator owns `world_size` long-lived shard threads. Each request
//! waits for the primary shard's `Ready` marker, is broadcast to every
//! shard's private queue, and is relayed back to the caller from the shared
//! response channel. Requests are served one at a time.

use crate::stream::ResponseStream;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;
use shardchat_common::config::OrchestratorConfig;
use shardchat_common::metrics::LatencyTimer;
use shardchat_common::{Result, ShardChatConfig, ShardChatError, METRICS};
use shardchat_proto::{GenerateRequest, PartialResult};
use shardchat_worker::{
    BackendLoader, ConversationPromptBuilder, Role, SamplingParams, ShardTopology, ShardWorker,
    WorkerMessage, WorkerRequest,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrator side of one shard thread
#[derive(Debug)]
struct WorkerHandle {
    rank: usize,
    is_primary: bool,
    requests: Option<Sender<WorkerRequest>>,
    thread: Option<JoinHandle<()>>,
}

/// Coordinates the shard pool behind a single streaming entry point.
pub struct Orchestrator {
    builder: ConversationPromptBuilder,
    workers: Vec<WorkerHandle>,
    responses: Mutex<Receiver<WorkerMessage>>,
    ready_timeout: Duration,
    item_timeout: Duration,
    metrics_enabled: bool,
}

impl Orchestrator {
    /// Spawn and load every shard, returning once all of them are initialized.
    ///
    /// Fails if any shard fails to load; the shards that did load are shut
    /// down again.
    pub fn start<L>(
        config: &OrchestratorConfig,
        builder: ConversationPromptBuilder,
        loader: Arc<L>,
    ) -> Result<Self>
    where
        L: BackendLoader + 'static,
    {
        let world_size = config.world_size;
        if world_size == 0 {
            return Err(ShardChatError::config("world_size must be at least 1"));
        }

        info!("Starting shard pool: world_size={}", world_size);

        let (responses_tx, responses_rx) = unbounded();
        let (digests_tx, digests_rx) = unbounded();
        let (startup_tx, startup_rx) = unbounded();
        let barrier = WaitGroup::new();

        let mut workers = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let topology = ShardTopology::new(rank, world_size);
            let role = if topology.is_primary() {
                Role::Primary {
                    digests: digests_rx.clone(),
                    replicas: world_size - 1,
                }
            } else {
                Role::Replica {
                    digests: digests_tx.clone(),
                }
            };
            let (requests_tx, requests_rx) = unbounded::<WorkerRequest>();

            let loader = loader.clone();
            let builder = builder.clone();
            let responses = responses_tx.clone();
            let startup: Sender<(usize, Result<()>)> = startup_tx.clone();
            let barrier = barrier.clone();
            let desync_check_timeout = config.desync_check_timeout();

            let thread = thread::Builder::new()
                .name(format!("shard-{}", rank))
                .spawn(move || {
                    let backend = match loader.load(topology) {
                        Ok(backend) => backend,
                        Err(e) => {
                            let _ = startup.send((rank, Err(e.into())));
                            drop(startup);
                            barrier.wait();
                            return;
                        }
                    };
                    let _ = startup.send((rank, Ok(())));
                    drop(startup);
                    barrier.wait();

                    ShardWorker::new(topology, backend, builder, role, responses, desync_check_timeout)
                        .run(requests_rx);
                })?;

            workers.push(WorkerHandle {
                rank,
                is_primary: topology.is_primary(),
                requests: Some(requests_tx),
                thread: Some(thread),
            });
        }
        drop(startup_tx);
        drop(digests_tx);
        drop(digests_rx);
        drop(responses_tx);

        barrier.wait();

        let orchestrator = Self {
            builder,
            workers,
            responses: Mutex::new(responses_rx),
            ready_timeout: config.ready_timeout(),
            item_timeout: config.item_timeout(),
            metrics_enabled: true,
        };

        let mut loaded = 0;
        let mut failure = None;
        for (rank, outcome) in startup_rx.iter() {
            match outcome {
                Ok(()) => loaded += 1,
                Err(e) => {
                    error!("Shard {} failed to load: {}", rank, e);
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if loaded != world_size {
            return Err(ShardChatError::worker_unavailable(format!(
                "only {} of {} shards finished loading",
                loaded, world_size
            )));
        }

        info!("Shard pool ready: {} shards", world_size);
        Ok(orchestrator)
    }

    /// Start a pool with the configured deadlines and conversation template.
    pub fn from_config<L>(config: &ShardChatConfig, loader: Arc<L>) -> Result<Self>
    where
        L: BackendLoader + 'static,
    {
        config.validate()?;
        let builder = ConversationPromptBuilder::from_config(&config.conversation)?;
        let mut orchestrator = Self::start(&config.orchestrator, builder, loader)?;
        orchestrator.metrics_enabled = config.observability.enable_metrics;
        Ok(orchestrator)
    }

    /// Prometheus text exposition, unless metrics export is disabled
    pub fn metrics(&self) -> Option<String> {
        self.metrics_enabled.then(|| METRICS.gather())
    }

    pub fn world_size(&self) -> usize {
        self.workers.len()
    }

    pub fn builder(&self) -> &ConversationPromptBuilder {
        &self.builder
    }

    /// Start a request and return its response stream.
    ///
    /// Malformed conversations and parameters are rejected here, before any
    /// shard sees the request.
    pub fn stream(&self, request: GenerateRequest) -> Result<ResponseStream<'_>> {
        self.stream_with_cancel(request, CancellationToken::new())
    }

    pub fn stream_with_cancel(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream<'_>> {
        self.validate(&request)?;
        METRICS.inference.requests_total.inc();

        let deadline = Instant::now() + self.ready_timeout;
        let wait = METRICS.coordinator.ready_wait.time(|| -> Result<_> {
            let responses = self.responses.try_lock_until(deadline).ok_or_else(|| {
                METRICS.coordinator.worker_timeouts_total.inc();
                ShardChatError::worker_timeout(format!(
                    "another request held the shard pool for {:?}",
                    self.ready_timeout
                ))
            })?;
            wait_for_ready(&responses, deadline, self.ready_timeout)?;
            Ok(responses)
        });
        let responses = match wait {
            Ok(responses) => responses,
            Err(e) => {
                METRICS.inference.requests_failed.inc();
                return Err(e);
            }
        };

        let job = WorkerRequest::new(request, cancel.clone());
        debug!(
            "Dispatching request {} to {} shards",
            job.id,
            self.workers.len()
        );
        for worker in &self.workers {
            let sent = worker
                .requests
                .as_ref()
                .map(|requests| requests.send(job.clone()).is_ok())
                .unwrap_or(false);
            if !sent {
                METRICS.inference.requests_failed.inc();
                cancel.cancel();
                return Err(ShardChatError::worker_unavailable(format!(
                    "shard {} is not accepting requests",
                    worker.rank
                )));
            }
        }

        Ok(ResponseStream::new(job.id, responses, cancel, self.item_timeout))
    }

    /// Run a request to completion and return the final text.
    pub fn generate(&self, request: GenerateRequest) -> Result<String> {
        let mut last = None;
        for item in self.stream(request)? {
            last = Some(item?);
        }

        last.filter(|item| item.end_of_content)
            .map(|item| item.text)
            .ok_or_else(|| ShardChatError::internal("response ended without a terminal item"))
    }

    /// Relay a request onto the async runtime.
    ///
    /// Validation errors are returned directly; everything after dispatch is
    /// delivered through the stream. Must be called from within a tokio
    /// runtime. Dropping the returned stream cancels the request.
    pub fn stream_async(
        self: &Arc<Self>,
        request: GenerateRequest,
    ) -> Result<ReceiverStream<Result<PartialResult>>> {
        self.validate(&request)?;

        let (tx, rx) = mpsc::channel(16);
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let stream = match this.stream(request) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            for item in stream {
                if tx.blocking_send(item).is_err() {
                    debug!("Async consumer went away");
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    fn validate(&self, request: &GenerateRequest) -> Result<()> {
        match request.turns.last() {
            Some(turn) if self.builder.is_open(turn) => {}
            Some(_) => {
                return Err(ShardChatError::invalid_conversation(
                    "the last turn must be awaiting a response",
                ));
            }
            None => return Err(ShardChatError::invalid_conversation("conversation has no turns")),
        }
        self.builder.render(&request.turns)?;
        SamplingParams::from_request(request).validate()?;

        if request.image.as_ref().is_some_and(|image| image.is_empty()) {
            return Err(ShardChatError::invalid_input("image is empty"));
        }
        Ok(())
    }
}

/// Drain stale items until the primary shard reports ready or `deadline` passes.
fn wait_for_ready(responses: &Receiver<WorkerMessage>, deadline: Instant, timeout: Duration) -> Result<()> {
    loop {
        match responses.recv_deadline(deadline) {
            Ok(WorkerMessage::Ready) => return Ok(()),
            Ok(stale) => {
                debug!("Discarding stale message while waiting for ready: {:?}", stale);
                METRICS.coordinator.stale_markers_total.inc();
            }
            Err(RecvTimeoutError::Timeout) => {
                METRICS.coordinator.worker_timeouts_total.inc();
                return Err(ShardChatError::worker_timeout(format!(
                    "primary shard not ready within {:?}",
                    timeout
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ShardChatError::worker_unavailable("all shards have exited"));
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.requests.take();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!(
                        "Shard {} ({}) panicked",
                        worker.rank,
                        if worker.is_primary { "primary" } else { "replica" }
                    );
                }
            }
        }
        info!("Shard pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardchat_proto::Turn;
    use shardchat_worker::testing::{CharTokenizer, ScriptedModel};
    use shardchat_worker::{ConversationTemplate, ShardBackend, Tokenizer};
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    fn config(world_size: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            world_size,
            ready_timeout_ms: 2_000,
            item_timeout_ms: 2_000,
            desync_check_timeout_ms: 1_000,
        }
    }

    fn builder() -> ConversationPromptBuilder {
        ConversationPromptBuilder::new(ConversationTemplate::single("S", ("Human", "Assistant"), "###"))
    }

    fn request() -> GenerateRequest {
        GenerateRequest::new(
            vec![Turn::new("Human", "Hi"), Turn::pending("Assistant")],
            32,
            0.0,
            0.75,
        )
    }

    fn backend(model: ScriptedModel) -> anyhow::Result<ShardBackend> {
        Ok(ShardBackend::new(Box::new(model), Box::new(CharTokenizer::new())))
    }

    fn scripted(script: &str) -> ScriptedModel {
        let tokenizer = CharTokenizer::new();
        ScriptedModel::new(256, tokenizer.script(script), tokenizer.eos_id())
    }

    fn start<F>(world_size: usize, model_for: F) -> Orchestrator
    where
        F: Fn(ShardTopology) -> ScriptedModel + Send + Sync + 'static,
    {
        start_with(config(world_size), model_for).unwrap()
    }

    fn start_with<F>(config: OrchestratorConfig, model_for: F) -> Result<Orchestrator>
    where
        F: Fn(ShardTopology) -> ScriptedModel + Send + Sync + 'static,
    {
        let loader = Arc::new(move |topology: ShardTopology| backend(model_for(topology)));
        Orchestrator::start(&config, builder(), loader)
    }

    #[test]
    fn test_two_shards_relay_primary_stream() {
        let orchestrator = start(2, |_| scripted("Hello there###"));

        let items: Vec<PartialResult> = orchestrator
            .stream(request())
            .unwrap()
            .map(|item| item.unwrap())
            .collect();

        let terminal = items.last().unwrap();
        assert_eq!(terminal, &PartialResult::terminal("Hello there\n"));
        assert_eq!(items.iter().filter(|item| item.end_of_content).count(), 1);
        for pair in items.windows(2) {
            assert!(pair[1].text.starts_with(pair[0].text.trim_end()));
        }
    }

    #[test]
    fn test_generate_returns_final_text() {
        let orchestrator = start(3, |_| scripted("Fine, thanks."));

        assert_eq!(orchestrator.generate(request()).unwrap(), "Fine, thanks.");
        assert_eq!(orchestrator.generate(request()).unwrap(), "Fine, thanks.");
        assert_eq!(orchestrator.world_size(), 3);
    }

    #[test]
    fn test_replica_failure_is_single_terminal_error() {
        let orchestrator = start(2, |topology| {
            if topology.is_primary() {
                scripted("ok").with_prefill_delay(Duration::from_millis(300))
            } else {
                scripted("ok").failing_at_times(0, 1)
            }
        });

        let items: Vec<Result<PartialResult>> = orchestrator.stream(request()).unwrap().collect();

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ShardChatError::ModelFailure(_))));

        assert_eq!(orchestrator.generate(request()).unwrap(), "ok");
    }

    #[test]
    fn test_diverging_replica_is_desync() {
        let orchestrator = start(2, |topology| {
            if topology.is_primary() {
                scripted("yes")
            } else {
                scripted("yep")
            }
        });

        let items: Vec<Result<PartialResult>> = orchestrator.stream(request()).unwrap().collect();

        assert!(matches!(items.last(), Some(Err(ShardChatError::ShardDesync(_)))));
        assert!(items.iter().all(|item| match item {
            Ok(partial) => !partial.end_of_content,
            Err(_) => true,
        }));
    }

    #[test]
    fn test_stalled_shard_times_out() {
        let mut config = config(1);
        config.item_timeout_ms = 50;
        let orchestrator = start_with(config, |_| {
            scripted("ok").with_prefill_delay(Duration::from_millis(400))
        })
        .unwrap();

        let mut stream = orchestrator.stream(request()).unwrap();

        assert!(matches!(stream.next(), Some(Err(ShardChatError::WorkerTimeout(_)))));
        assert!(stream.next().is_none());
        assert!(stream.cancellation().is_cancelled());
    }

    #[test]
    fn test_busy_pool_times_out_second_caller() {
        let mut config = config(1);
        config.ready_timeout_ms = 100;
        let orchestrator = start_with(config, |_| scripted("ok")).unwrap();

        let held = orchestrator.stream(request()).unwrap();
        let started = Instant::now();
        let outcome = thread::scope(|scope| {
            scope
                .spawn(|| orchestrator.stream(request()).map(|_| ()))
                .join()
                .unwrap()
        });

        assert!(matches!(outcome, Err(ShardChatError::WorkerTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));

        drop(held);
        assert_eq!(orchestrator.generate(request()).unwrap(), "ok");
    }

    #[test]
    fn test_ready_deadline_holds_under_stale_traffic() {
        let (tx, rx) = unbounded();
        let feeder = thread::spawn(move || {
            for _ in 0..50 {
                let stale = WorkerMessage::Partial {
                    request_id: Uuid::new_v4(),
                    item: PartialResult::partial("x"),
                };
                if tx.send(stale).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        });

        let started = Instant::now();
        let timeout = Duration::from_millis(100);
        let result = wait_for_ready(&rx, started + timeout, timeout);

        assert!(matches!(result, Err(ShardChatError::WorkerTimeout(_))));
        assert!(started.elapsed() < Duration::from_millis(400));

        drop(rx);
        feeder.join().unwrap();
    }

    #[test]
    fn test_seeded_sampling_agrees_across_shards() {
        let orchestrator = start(3, |_| scripted("abcdefghij").with_margin(1.0));
        let sampled = || {
            let mut request = request().with_seed(42);
            request.temperature = 0.8;
            request.top_p = 0.95;
            request.max_gen_len = 16;
            orchestrator.generate(request)
        };

        let first = sampled().unwrap();
        let second = sampled().unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_metrics_export_follows_config() {
        let loader = Arc::new(|_: ShardTopology| backend(scripted("ok")));
        let mut config = ShardChatConfig::default();
        config.observability.enable_metrics = false;
        let orchestrator = Orchestrator::from_config(&config, loader.clone()).unwrap();
        assert!(orchestrator.metrics().is_none());
        drop(orchestrator);

        config.observability.enable_metrics = true;
        let orchestrator = Orchestrator::from_config(&config, loader).unwrap();
        orchestrator.generate(request()).unwrap();
        let exported = orchestrator.metrics().unwrap();
        assert!(exported.contains("inference_requests_total"));
    }

    #[test]
    fn test_paired_template_accepts_empty_open_turn() {
        let template = ConversationTemplate::paired("SYS", ("USER", "ASSISTANT"), " ", "</s>");
        let loader = Arc::new(|_: ShardTopology| backend(scripted("Hi</s>")));
        let orchestrator =
            Orchestrator::start(&config(1), ConversationPromptBuilder::new(template), loader).unwrap();
        let request = GenerateRequest::new(
            vec![Turn::new("USER", "Hello"), Turn::new("ASSISTANT", "")],
            16,
            0.0,
            0.75,
        );

        assert_eq!(orchestrator.generate(request).unwrap(), "Hi\n");
    }

    #[test]
    fn test_invalid_conversation_rejected_before_dispatch() {
        let orchestrator = start(1, |_| scripted("ok"));
        let answered = GenerateRequest::new(
            vec![Turn::new("Human", "Hi"), Turn::new("Assistant", "Hello")],
            8,
            0.0,
            0.75,
        );
        let gap = GenerateRequest::new(
            vec![Turn::pending("Human"), Turn::pending("Assistant")],
            8,
            0.0,
            0.75,
        );

        assert!(matches!(
            orchestrator.stream(answered),
            Err(ShardChatError::InvalidConversation(_))
        ));
        assert!(matches!(
            orchestrator.stream(gap),
            Err(ShardChatError::InvalidConversation(_))
        ));
        assert!(matches!(
            orchestrator.stream(GenerateRequest::new(Vec::new(), 8, 0.0, 0.75)),
            Err(ShardChatError::InvalidConversation(_))
        ));

        assert_eq!(orchestrator.generate(request()).unwrap(), "ok");
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let orchestrator = start(1, |_| scripted("ok"));
        let mut bad = request();
        bad.top_p = 0.0;

        let err = orchestrator.stream(bad).err().unwrap();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_abandoned_stream_does_not_block_next_request() {
        let orchestrator = start(2, |_| scripted("a long answer that keeps going"));

        {
            let mut stream = orchestrator.stream(request()).unwrap();
            assert!(stream.next().unwrap().is_ok());
        }

        assert_eq!(
            orchestrator.generate(request()).unwrap(),
            "a long answer that keeps going"
        );
    }

    #[test]
    fn test_failed_load_fails_start() {
        let loader = Arc::new(|topology: ShardTopology| -> anyhow::Result<ShardBackend> {
            if topology.rank == 1 {
                anyhow::bail!("weights for shard {} are missing", topology);
            }
            backend(scripted("ok"))
        });

        let result = Orchestrator::start(&config(3), builder(), loader);

        assert!(matches!(result, Err(ShardChatError::ModelFailure(_))));
    }

    #[test]
    fn test_from_config_uses_generation_defaults() {
        let mut config = ShardChatConfig::default();
        config.orchestrator.world_size = 2;
        let loader = Arc::new(|_: ShardTopology| backend(scripted("Sure.###")));
        let orchestrator = Orchestrator::from_config(&config, loader).unwrap();

        let turns = orchestrator.builder().qas_to_turns(&[("Hi".to_string(), None)]);
        let text = orchestrator.generate(config.generation.request(turns)).unwrap();

        assert_eq!(text, "Sure.\n");
    }

    #[test]
    fn test_zero_world_size_rejected() {
        let result = start_with(config(0), |_| scripted("ok"));
        assert!(matches!(result, Err(ShardChatError::Config(_))));
    }

    #[tokio::test]
    async fn test_async_stream_relays_items() {
        let orchestrator = Arc::new(start(2, |_| scripted("async")));

        let items: Vec<PartialResult> = orchestrator
            .stream_async(request())
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(items.last(), Some(&PartialResult::terminal("async")));
        assert!(items[..items.len() - 1].iter().all(|item| !item.end_of_content));
    }

    #[tokio::test]
    async fn test_async_stream_validates_synchronously() {
        let orchestrator = Arc::new(start(1, |_| scripted("ok")));
        let mut bad = request();
        bad.turns.pop();

        assert!(matches!(
            orchestrator.stream_async(bad),
            Err(ShardChatError::InvalidConversation(_))
        ));
    }
}
