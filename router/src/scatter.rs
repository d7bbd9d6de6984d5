//! Scatter/gather dispatch.
//!
//! [`ScatterGather`] runs one episode per inbound request:
//!
//! `created -> dispatching -> (all_completed | deadline_exceeded) -> reducing -> done`
//!
//! Every shard call runs on its own Tokio task, so an episode costs roughly the latency of the
//! slowest shard. Each episode owns a [`CancellationToken`]; calls hold child tokens, so
//! cancelling an episode (deadline, explicit [`ScatterGather::cancel`], or the caller dropping the
//! request future) stops all of its calls and none of any other episode.

use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::body::Body;
use dashmap::DashMap;
use futures::FutureExt as _;
use http::Request;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    call::{self, OutboundCall, PreparedCall, WorkId},
    client::ShardClient,
    outcome::{ShardError, ShardOutcome, ShardResponse},
    reducer::ResponseReducer,
    response::ReducedResponse,
    snapshot::{HeaderForwardPolicy, RequestSnapshot, SnapshotError},
    targets::TargetResolver,
};

#[derive(Debug, Clone)]
/// Limits applied to every episode.
pub struct ScatterConfig {
    /// Deadline used when a request doesn't carry its own.
    pub default_deadline: Duration,
    /// Concurrent shard calls across all episodes.
    pub max_inflight_calls: usize,
    /// Largest inbound body that will be captured for replay.
    pub max_body_bytes: usize,
}

#[derive(Debug)]
/// One inbound request addressed to a logical sharded service.
pub struct ScatterRequest {
    work_id: WorkId,
    service: String,
    request: Request<Body>,
    deadline: Option<Duration>,
}

impl ScatterRequest {
    pub fn new(service: impl Into<String>, request: Request<Body>) -> Self {
        Self {
            work_id: WorkId::new(),
            service: service.into(),
            request,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Identifier of the episode this request will run as. Pass it to
    /// [`ScatterGather::cancel`] to cancel the episode from elsewhere.
    pub fn work_id(&self) -> &WorkId {
        &self.work_id
    }
}

#[derive(Clone)]
pub struct ScatterGather {
    client: Arc<dyn ShardClient>,
    resolver: Arc<dyn TargetResolver>,
    forward_headers: Arc<HeaderForwardPolicy>,
    cfg: ScatterConfig,
    inflight: Arc<Semaphore>,
    episodes: Arc<DashMap<WorkId, CancellationToken>>,
}

impl ScatterGather {
    pub fn new(
        client: Arc<dyn ShardClient>,
        resolver: Arc<dyn TargetResolver>,
        forward_headers: HeaderForwardPolicy,
        cfg: ScatterConfig,
    ) -> Self {
        let inflight = Arc::new(Semaphore::new(cfg.max_inflight_calls));
        Self {
            client,
            resolver,
            forward_headers: Arc::new(forward_headers),
            cfg,
            inflight,
            episodes: Arc::new(DashMap::new()),
        }
    }

    /// Run one episode and return its single response.
    ///
    /// Never fails: setup errors, shard failures and reducer failures all come back as a
    /// [`ReducedResponse`] with `is_error` set.
    pub async fn request<R>(&self, req: ScatterRequest, reducer: &R) -> ReducedResponse
    where
        R: ResponseReducer + ?Sized,
    {
        let ScatterRequest {
            work_id,
            service,
            request,
            deadline,
        } = req;
        let deadline = deadline.unwrap_or(self.cfg.default_deadline);
        let started = Instant::now();
        let episode = EpisodeGuard::register(&self.episodes, work_id.clone());
        tracing::debug!(
            event = "episode_state",
            work_id = %work_id,
            service = %service,
            state = "created"
        );

        let resolved = tokio::select! {
            biased;
            () = episode.token.cancelled() => None,
            resolved = self.resolver.resolve_targets(&service) => Some(resolved),
        };
        let Some(resolved) = resolved else {
            return cancelled_before_dispatch(&work_id, &service, "resolving");
        };
        let targets = match resolved {
            Ok(targets) if !targets.is_empty() => targets,
            Ok(_) => {
                tracing::warn!(
                    event = "no_targets",
                    work_id = %work_id,
                    service = %service,
                    "service resolved to no targets"
                );
                return ReducedResponse::no_targets(&service);
            }
            Err(err) => {
                tracing::warn!(
                    event = "no_targets",
                    work_id = %work_id,
                    service = %service,
                    error = %format!("{err:#}"),
                    "target resolution failed"
                );
                return ReducedResponse::no_targets(&service);
            }
        };

        let built = tokio::select! {
            biased;
            () = episode.token.cancelled() => None,
            built = RequestSnapshot::build(request, &self.forward_headers, self.cfg.max_body_bytes) => {
                Some(built)
            }
        };
        let Some(built) = built else {
            return cancelled_before_dispatch(&work_id, &service, "capturing");
        };
        let snapshot = match built {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    event = "snapshot_failed",
                    work_id = %work_id,
                    service = %service,
                    error = %err,
                    "failed to capture inbound request"
                );
                return match err {
                    SnapshotError::TooLarge { limit } => {
                        ReducedResponse::payload_too_large(limit)
                    }
                    err => ReducedResponse::internal_error(format!(
                        "failed to capture request: {err}"
                    )),
                };
            }
        };

        if episode.token.is_cancelled() {
            return cancelled_before_dispatch(&work_id, &service, "dispatching");
        }
        let calls = call::create_calls(&work_id, &targets, &snapshot);
        drop(snapshot);

        let outcomes = self.dispatch(&work_id, &episode.token, calls, deadline).await;
        drop(episode);
        debug_assert_eq!(outcomes.len(), targets.len());

        tracing::debug!(
            event = "episode_state",
            work_id = %work_id,
            state = "reducing",
            outcomes = outcomes.len(),
            succeeded = outcomes.iter().filter(|o| o.is_success()).count()
        );
        let reduced = reduce(&work_id, &outcomes, reducer);

        tracing::info!(
            event = "episode_state",
            work_id = %work_id,
            service = %service,
            state = "done",
            targets = targets.len(),
            status = reduced.status.as_u16(),
            is_error = reduced.is_error,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scatter complete"
        );
        reduced
    }

    /// Cancel a running episode. Returns `false` if no episode with this id is in flight.
    pub fn cancel(&self, work_id: &WorkId) -> bool {
        match self.episodes.get(work_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of episodes currently running, from creation until their shard calls settle.
    pub fn in_flight_episodes(&self) -> usize {
        self.episodes.len()
    }

    /// Execute every ready call concurrently and return one outcome per call, in call order.
    async fn dispatch(
        &self,
        work_id: &WorkId,
        token: &CancellationToken,
        calls: Vec<PreparedCall>,
        deadline: Duration,
    ) -> Vec<ShardOutcome> {
        let mut shards = Vec::with_capacity(calls.len());
        let mut slots: Vec<Option<ShardOutcome>> = Vec::with_capacity(calls.len());
        let mut tasks = JoinSet::new();
        for (idx, prepared) in calls.into_iter().enumerate() {
            shards.push(prepared.tag().shard.clone());
            match prepared {
                PreparedCall::Rejected { tag, error } => {
                    slots.push(Some(ShardOutcome::failure(tag.shard, error)));
                }
                PreparedCall::Ready(call) => {
                    slots.push(None);
                    let client = Arc::clone(&self.client);
                    let inflight = Arc::clone(&self.inflight);
                    let cancel = token.child_token();
                    tasks.spawn(async move {
                        let outcome = AssertUnwindSafe(execute_call(client, inflight, cancel, call))
                            .catch_unwind()
                            .await;
                        (idx, outcome)
                    });
                }
            }
        }

        tracing::debug!(
            event = "episode_state",
            work_id = %work_id,
            state = "dispatching",
            calls = tasks.len()
        );

        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);
        let mut timed_out = false;
        while !tasks.is_empty() {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((idx, Ok(outcome)))) => slots[idx] = Some(outcome),
                    Some(Ok((idx, Err(_)))) => {
                        tracing::error!(
                            event = "call_task_failed",
                            work_id = %work_id,
                            shard = %shards[idx],
                            "shard call panicked"
                        );
                        slots[idx] = Some(ShardOutcome::failure(
                            shards[idx].clone(),
                            ShardError::Aborted,
                        ));
                    }
                    Some(Err(err)) => {
                        tracing::error!(
                            event = "call_task_failed",
                            work_id = %work_id,
                            error = %err,
                            "shard call task failed"
                        );
                    }
                    None => break,
                },
                () = &mut timer => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            token.cancel();
            tracing::warn!(
                event = "episode_state",
                work_id = %work_id,
                state = "deadline_exceeded",
                deadline_ms = deadline.as_millis() as u64,
                outstanding = slots.iter().filter(|s| s.is_none()).count(),
                "deadline exceeded; cancelling outstanding calls"
            );
        } else {
            tracing::debug!(
                event = "episode_state",
                work_id = %work_id,
                state = "all_completed"
            );
        }

        slots
            .into_iter()
            .zip(shards)
            .map(|(slot, shard)| {
                slot.unwrap_or_else(|| {
                    let err = if timed_out {
                        ShardError::Timeout
                    } else {
                        ShardError::Aborted
                    };
                    ShardOutcome::failure(shard, err)
                })
            })
            .collect()
    }
}

/// Registers an episode's token from creation until its calls settle. Dropping it cancels the token,
/// which also covers the caller abandoning the request future.
struct EpisodeGuard<'a> {
    episodes: &'a DashMap<WorkId, CancellationToken>,
    work_id: WorkId,
    token: CancellationToken,
}

impl<'a> EpisodeGuard<'a> {
    fn register(episodes: &'a DashMap<WorkId, CancellationToken>, work_id: WorkId) -> Self {
        let token = CancellationToken::new();
        episodes.insert(work_id.clone(), token.clone());
        Self {
            episodes,
            work_id,
            token,
        }
    }
}

impl Drop for EpisodeGuard<'_> {
    fn drop(&mut self) {
        self.token.cancel();
        self.episodes.remove(&self.work_id);
    }
}

async fn execute_call(
    client: Arc<dyn ShardClient>,
    inflight: Arc<Semaphore>,
    cancel: CancellationToken,
    call: OutboundCall,
) -> ShardOutcome {
    let tag = call.tag.clone();
    let started = Instant::now();

    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ShardError::Cancelled),
        result = async {
            let Ok(_permit) = inflight.acquire().await else {
                return Err(ShardError::Cancelled);
            };
            classify(client.execute(call).await)
        } => result,
    };

    match &result {
        Ok(resp) => tracing::debug!(
            event = "shard_call",
            call = %tag,
            status = resp.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "shard call succeeded"
        ),
        Err(err) => tracing::debug!(
            event = "shard_call",
            call = %tag,
            error = %err,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "shard call failed"
        ),
    }

    ShardOutcome {
        shard: tag.shard,
        result,
    }
}

fn cancelled_before_dispatch(work_id: &WorkId, service: &str, stage: &str) -> ReducedResponse {
    tracing::info!(
        event = "episode_state",
        work_id = %work_id,
        service = %service,
        state = "cancelled",
        stage = stage,
        "episode cancelled before dispatch"
    );
    ReducedResponse::cancelled()
}

fn classify(result: anyhow::Result<ShardResponse>) -> Result<ShardResponse, ShardError> {
    match result {
        Ok(resp) if resp.status.is_success() => Ok(resp),
        Ok(resp) => Err(ShardError::Status(resp)),
        Err(err) => Err(ShardError::Transport(format!("{err:#}"))),
    }
}

fn reduce<R>(work_id: &WorkId, outcomes: &[ShardOutcome], reducer: &R) -> ReducedResponse
where
    R: ResponseReducer + ?Sized,
{
    match std::panic::catch_unwind(AssertUnwindSafe(|| reducer.reduce(outcomes))) {
        Ok(Ok(reduced)) => reduced,
        Ok(Err(err)) => {
            tracing::error!(
                event = "reduce_failed",
                work_id = %work_id,
                error = %format!("{err:#}"),
                "reducer failed"
            );
            ReducedResponse::aggregation_failure()
        }
        Err(_) => {
            tracing::error!(
                event = "reduce_failed",
                work_id = %work_id,
                "reducer panicked"
            );
            ReducedResponse::aggregation_failure()
        }
    }
}
