//! Response relay
//!
//! A `ResponseStream` holds the shared response channel for the lifetime of
//! one request and yields the primary shard's items in order: zero or more
//! partials, then exactly one terminal item or exactly one error.

use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::MutexGuard;
use shardchat_common::{Result, ShardChatError, METRICS};
use shardchat_proto::PartialResult;
use shardchat_worker::WorkerMessage;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Abandoned,
}

/// Streaming handle of one in-flight request.
///
/// Dropping the stream before its terminal item cancels the request.
pub struct ResponseStream<'a> {
    request_id: Uuid,
    responses: MutexGuard<'a, Receiver<WorkerMessage>>,
    cancel: CancellationToken,
    item_timeout: Duration,
    started: Instant,
    finished: bool,
}

impl<'a> ResponseStream<'a> {
    pub(crate) fn new(
        request_id: Uuid,
        responses: MutexGuard<'a, Receiver<WorkerMessage>>,
        cancel: CancellationToken,
        item_timeout: Duration,
    ) -> Self {
        METRICS.inference.active_requests.inc();
        Self {
            request_id,
            responses,
            cancel,
            item_timeout,
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Token that cancels this request at the next decode step
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self, outcome: Outcome) {
        if self.finished {
            return;
        }
        self.finished = true;

        METRICS.inference.active_requests.dec();
        METRICS
            .inference
            .request_duration
            .observe(self.started.elapsed().as_secs_f64());
        match outcome {
            Outcome::Completed => METRICS.inference.requests_success.inc(),
            Outcome::Failed => METRICS.inference.requests_failed.inc(),
            Outcome::Abandoned => {}
        }
        debug!(
            "Request {} finished ({:?}) after {:?}",
            self.request_id,
            outcome,
            self.started.elapsed()
        );
    }

    fn fail(&mut self, error: ShardChatError) -> ShardChatError {
        self.cancel.cancel();
        self.finish(Outcome::Failed);
        error
    }
}

impl Iterator for ResponseStream<'_> {
    type Item = Result<PartialResult>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let message = match self.responses.recv_timeout(self.item_timeout) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    METRICS.coordinator.worker_timeouts_total.inc();
                    let error = ShardChatError::worker_timeout(format!(
                        "no output for request {} within {:?}",
                        self.request_id, self.item_timeout
                    ));
                    return Some(Err(self.fail(error)));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let error = ShardChatError::worker_unavailable("all shards have exited");
                    return Some(Err(self.fail(error)));
                }
            };

            match message {
                WorkerMessage::Partial { request_id, item } if request_id == self.request_id => {
                    METRICS.coordinator.items_relayed_total.inc();
                    if item.end_of_content {
                        self.finish(Outcome::Completed);
                    }
                    return Some(Ok(item));
                }
                WorkerMessage::Failure(failure) if failure.request_id == self.request_id => {
                    warn!("{}", failure);
                    return Some(Err(self.fail(failure.error)));
                }
                WorkerMessage::Ready => {
                    let error = ShardChatError::internal(format!(
                        "primary shard went idle before finishing request {}",
                        self.request_id
                    ));
                    return Some(Err(self.fail(error)));
                }
                stale => {
                    trace!("Discarding stale message {:?}", stale);
                    METRICS.coordinator.stale_markers_total.inc();
                }
            }
        }
    }
}

impl Drop for ResponseStream<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Request {} abandoned; cancelling", self.request_id);
            self.cancel.cancel();
            self.finish(Outcome::Abandoned);
        }
    }
}
