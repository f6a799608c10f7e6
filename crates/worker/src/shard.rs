//! Shard worker loop
//!
//! Every shard runs the same request through its own backend with the same
//! seed. The primary shard (rank 0) is the only one whose output reaches the
//! orchestrator; replicas compute silently and send the primary a digest of
//! their generated tokens so that divergence is detected before the terminal
//! item is released.

use crate::backend::{ShardBackend, ShardTopology};
use crate::conversation::ConversationPromptBuilder;
use crate::decoder::SamplingDecoder;
use crate::sampling::{Sampler, SamplingParams};
use crate::trimmer::StreamTrimmer;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use shardchat_common::{Result, ShardChatError, METRICS};
use shardchat_proto::{GenerateRequest, PartialResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// One request as broadcast to every shard.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub id: Uuid,
    pub request: Arc<GenerateRequest>,
    pub cancel: CancellationToken,
}

impl WorkerRequest {
    pub fn new(request: GenerateRequest, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: Arc::new(request),
            cancel,
        }
    }
}

/// Unrecoverable error of one shard on one request
#[derive(Debug, thiserror::Error)]
#[error("shard {rank} failed request {request_id}: {error}")]
pub struct ShardFailure {
    pub request_id: Uuid,
    pub rank: usize,
    pub error: ShardChatError,
}

/// Items on the shared response channel.
#[derive(Debug)]
pub enum WorkerMessage {
    /// The primary shard is idle and accepts the next request
    Ready,

    /// Trimmed output of the primary shard
    Partial { request_id: Uuid, item: PartialResult },

    /// Posted by any shard that gave up on a request
    Failure(ShardFailure),
}

/// Replica output summary, compared by the primary.
///
/// `tokens` is `None` when the replica aborted the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDigest {
    pub request_id: Uuid,
    pub rank: usize,
    pub tokens: Option<Vec<u32>>,
}

/// What a shard does with its output
#[derive(Debug)]
pub enum Role {
    Primary {
        digests: Receiver<ShardDigest>,
        replicas: usize,
    },
    Replica {
        digests: Sender<ShardDigest>,
    },
}

impl Role {
    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Role::Primary { .. } => "primary",
            Role::Replica { .. } => "replica",
        }
    }
}

/// A loaded shard, ready to serve requests until its queue closes.
pub struct ShardWorker {
    topology: ShardTopology,
    backend: ShardBackend,
    builder: ConversationPromptBuilder,
    role: Role,
    responses: Sender<WorkerMessage>,
    desync_check_timeout: Duration,
}

impl ShardWorker {
    pub fn new(
        topology: ShardTopology,
        backend: ShardBackend,
        builder: ConversationPromptBuilder,
        role: Role,
        responses: Sender<WorkerMessage>,
        desync_check_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            backend,
            builder,
            role,
            responses,
            desync_check_timeout,
        }
    }

    pub fn topology(&self) -> ShardTopology {
        self.topology
    }

    /// Serve requests until the request queue or the response channel closes.
    pub fn run(mut self, requests: Receiver<WorkerRequest>) {
        info!("Shard {} serving as {}", self.topology, self.role.name());

        loop {
            if self.role.is_primary() && self.responses.send(WorkerMessage::Ready).is_err() {
                debug!("Response channel closed");
                break;
            }

            let job = match requests.recv() {
                Ok(job) => job,
                Err(_) => break,
            };
            debug!("Shard {} received request {}", self.topology, job.id);

            if let Err(e) = self.serve(&job) {
                self.report_failure(job.id, e);
            }
        }

        info!("Shard {} shutting down", self.topology);
    }

    fn serve(&mut self, job: &WorkerRequest) -> Result<()> {
        let Self {
            topology,
            backend,
            builder,
            role,
            responses,
            desync_check_timeout,
        } = self;
        let request = job.request.as_ref();

        let image = match (&request.image, backend.images.as_ref()) {
            (None, _) => None,
            (Some(raw), Some(pipeline)) => {
                Some(pipeline.preprocess(raw, request.transform, backend.model.image_size())?)
            }
            (Some(_), None) => {
                return Err(ShardChatError::invalid_input("shard has no image pipeline"));
            }
        };

        let rendered = builder.render(&request.turns)?;
        let prompt_tokens = backend.tokenizer.encode(&rendered.prompt, true, false)?;
        let params = SamplingParams::from_request(request);
        let sampler = Sampler::new(request.seed, params.temperature, params.top_p);
        let trimmer = StreamTrimmer::new(rendered.response_end_signal);

        let mut stream = SamplingDecoder::open(
            backend.model.as_mut(),
            backend.tokenizer.as_ref(),
            prompt_tokens,
            image,
            &params,
            sampler,
            job.cancel.clone(),
        )?;

        let mut terminal = None;
        while let Some(event) = stream.next() {
            let item = match trimmer.apply(event?) {
                Some(item) => item,
                None => continue,
            };
            if item.end_of_content {
                terminal = Some(item);
                break;
            }
            if role.is_primary() {
                send(responses, job.id, item)?;
            }
        }
        let generated = stream.generated_tokens().to_vec();
        drop(stream);

        let terminal = terminal
            .ok_or_else(|| ShardChatError::internal("decode ended without a terminal item"))?;

        match role {
            Role::Primary { digests, replicas } => {
                if job.cancel.is_cancelled() {
                    debug!("Request {} cancelled; skipping replica check", job.id);
                } else {
                    verify_replicas(digests, *replicas, job.id, &generated, *desync_check_timeout)?;
                }
                send(responses, job.id, terminal)
            }
            Role::Replica { digests } => digests
                .send(ShardDigest {
                    request_id: job.id,
                    rank: topology.rank,
                    tokens: Some(generated),
                })
                .map_err(|_| ShardChatError::worker_unavailable("primary shard is gone")),
        }
    }

    fn report_failure(&self, request_id: Uuid, error: ShardChatError) {
        METRICS.worker.shard_failures_total.inc();

        let failure = ShardFailure {
            request_id,
            rank: self.topology.rank,
            error,
        };
        error!("{}", failure);

        if let Role::Replica { digests } = &self.role {
            let _ = digests.send(ShardDigest {
                request_id,
                rank: self.topology.rank,
                tokens: None,
            });
        }
        if self.responses.send(WorkerMessage::Failure(failure)).is_err() {
            warn!("Shard {} could not report a failure: response channel closed", self.topology);
        }
    }
}

fn send(responses: &Sender<WorkerMessage>, request_id: Uuid, item: PartialResult) -> Result<()> {
    responses
        .send(WorkerMessage::Partial { request_id, item })
        .map_err(|_| ShardChatError::worker_unavailable("response channel closed"))
}

/// Wait for one digest per replica and compare it against `expected`.
fn verify_replicas(
    digests: &Receiver<ShardDigest>,
    replicas: usize,
    request_id: Uuid,
    expected: &[u32],
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut reported = HashSet::new();

    while reported.len() < replicas {
        let digest = match digests.recv_deadline(deadline) {
            Ok(digest) => digest,
            Err(RecvTimeoutError::Timeout) => {
                METRICS.coordinator.worker_timeouts_total.inc();
                return Err(ShardChatError::worker_timeout(format!(
                    "{} of {} replicas reported within {:?}",
                    reported.len(),
                    replicas,
                    timeout
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ShardChatError::worker_unavailable("replica shards are gone"));
            }
        };

        if digest.request_id != request_id {
            trace!("Discarding stale digest from replica {}", digest.rank);
            continue;
        }

        match digest.tokens {
            None => {
                return Err(ShardChatError::model_failure(format!(
                    "replica {} aborted the request",
                    digest.rank
                )));
            }
            Some(tokens) if tokens != expected => {
                METRICS.coordinator.shard_desyncs_total.inc();
                let diverged_at = tokens
                    .iter()
                    .zip(expected)
                    .position(|(a, b)| a != b)
                    .unwrap_or_else(|| tokens.len().min(expected.len()));
                return Err(ShardChatError::shard_desync(format!(
                    "replica {} diverged from the primary at generated token {}",
                    digest.rank, diverged_at
                )));
            }
            Some(_) => {
                reported.insert(digest.rank);
            }
        }
    }

    Ok(())
}
