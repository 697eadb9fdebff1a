use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::{future, lock::Mutex, prelude::*};
use tarpc::{
    context,
    server::{self, incoming::Incoming, Channel},
    tokio_serde::formats::Json,
};
use tokio::sync::Notify;

use crate::rpc::{MapReduce, TaskError};
use crate::task::{Task, TaskPhase};

/// Task state buckets, all behind one lock. A map task lives in exactly
/// one of pending/in-progress (completed is its absence from both); a
/// reduce task additionally has an explicit completed bucket because the
/// terminal condition counts it.
///
/// In-progress entries carry the generation of the dispatch that created
/// them, so a timeout watcher belonging to an older dispatch of the same
/// task recognizes itself as stale.
#[derive(Debug, Default)]
struct State {
    map_pending: BTreeMap<usize, String>,
    map_in_progress: BTreeMap<usize, (String, u64)>,
    reduce_pending: BTreeSet<usize>,
    reduce_in_progress: BTreeMap<usize, u64>,
    reduce_completed: BTreeSet<usize>,
    dispatches: u64,
}

impl State {
    fn next_dispatch(&mut self) -> u64 {
        self.dispatches += 1;
        self.dispatches
    }

    fn maps_done(&self) -> bool {
        self.map_pending.is_empty() && self.map_in_progress.is_empty()
    }

    fn job_done(&self, n_reduce: usize) -> bool {
        self.maps_done()
            && self.reduce_pending.is_empty()
            && self.reduce_in_progress.is_empty()
            && self.reduce_completed.len() == n_reduce
    }
}

struct Inner {
    n_reduce: usize,
    task_timeout: Duration,
    state: Mutex<State>,
    // Single wake-everyone signal for blocked get_task callers: fired when
    // a timed-out task returns to pending, when the last map completes and
    // when the job reaches its terminal state. Waiters re-check under the
    // lock, so spurious wakes are harmless.
    state_changed: Notify,
}

/// Owns the job's task lifecycle. Cheap to clone; every clone shares the
/// same state, so the RPC server and the embedding loop can each hold one.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// One map task per input file, `n_reduce` reduce partitions. A task
    /// dispatched but not completed within `task_timeout` is handed to
    /// another worker.
    pub fn new(files: Vec<String>, n_reduce: usize, task_timeout: Duration) -> Self {
        let state = State {
            map_pending: files.into_iter().enumerate().collect(),
            reduce_pending: (0..n_reduce).collect(),
            ..State::default()
        };
        Coordinator {
            inner: Arc::new(Inner {
                n_reduce,
                task_timeout,
                state: Mutex::new(state),
                state_changed: Notify::new(),
            }),
        }
    }

    pub fn reduce_n(&self) -> usize {
        self.inner.n_reduce
    }

    /// True iff every reduce task has completed. The embedding process
    /// polls this to decide when to tear the server down.
    pub async fn done(&self) -> bool {
        let inner = &self.inner;
        inner.state.lock().await.job_done(inner.n_reduce)
    }

    /// Core dispatch. Map tasks drain first; reduce tasks become eligible
    /// only once no map task is pending or in progress. When the only
    /// possible progress is some in-progress task completing or timing
    /// out, the caller is parked until the state changes.
    pub async fn get_task(&self) -> Task {
        let inner = &self.inner;
        let notified = inner.state_changed.notified();
        tokio::pin!(notified);
        loop {
            // Register for a wake-up before checking state, otherwise a
            // notification between the check and the await would be lost.
            notified.as_mut().enable();
            {
                let mut state = inner.state.lock().await;
                if state.job_done(inner.n_reduce) {
                    return Task::Exit;
                }
                if let Some((task_num, filename)) = state.map_pending.pop_first() {
                    let generation = state.next_dispatch();
                    state
                        .map_in_progress
                        .insert(task_num, (filename.clone(), generation));
                    log::debug!("dispatching map task {task_num} ({filename})");
                    self.watch(TaskPhase::Map, task_num, generation);
                    return Task::Map { task_num, filename };
                }
                if state.maps_done() {
                    if let Some(task_num) = state.reduce_pending.pop_first() {
                        let generation = state.next_dispatch();
                        state.reduce_in_progress.insert(task_num, generation);
                        log::debug!("dispatching reduce task {task_num}");
                        self.watch(TaskPhase::Reduce, task_num, generation);
                        return Task::Reduce { task_num };
                    }
                }
            }
            notified.as_mut().await;
            notified.set(inner.state_changed.notified());
        }
    }

    /// Deadline for one dispatch. If the task is still in progress from
    /// that same dispatch when the deadline fires, it goes back to the
    /// pending pool; a watcher whose dispatch was superseded or completed
    /// is a no-op. Watchers for several dispatches of one task coexist
    /// harmlessly since each re-checks under the lock.
    fn watch(&self, phase: TaskPhase, task_num: usize, generation: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.task_timeout).await;
            let mut state = inner.state.lock().await;
            match phase {
                TaskPhase::Map => {
                    let current = matches!(
                        state.map_in_progress.get(&task_num),
                        Some((_, g)) if *g == generation
                    );
                    if current {
                        if let Some((filename, _)) = state.map_in_progress.remove(&task_num) {
                            log::warn!(
                                "map task {task_num} ({filename}) took longer than {:?}, rescheduling",
                                inner.task_timeout
                            );
                            state.map_pending.insert(task_num, filename);
                            inner.state_changed.notify_waiters();
                        }
                    }
                }
                TaskPhase::Reduce => {
                    if state.reduce_in_progress.get(&task_num) == Some(&generation) {
                        state.reduce_in_progress.remove(&task_num);
                        log::warn!(
                            "reduce task {task_num} took longer than {:?}, rescheduling",
                            inner.task_timeout
                        );
                        state.reduce_pending.insert(task_num);
                        inner.state_changed.notify_waiters();
                    }
                }
            }
        });
    }

    /// Records a map completion. Rejected if the task is not in progress,
    /// i.e. it already timed out and was reassigned, or another worker's
    /// report won.
    pub async fn complete_map_task(&self, task_num: usize) -> Result<(), TaskError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.map_in_progress.remove(&task_num).is_none() {
            return Err(TaskError::NotInProgress {
                phase: TaskPhase::Map,
                task_num,
            });
        }
        log::info!("map task {task_num} completed");
        if state.maps_done() {
            log::info!("map phase complete, reduce tasks now eligible");
            inner.state_changed.notify_waiters();
        }
        Ok(())
    }

    /// Records a reduce completion; same rejection rule as the map case.
    /// Crossing the terminal condition wakes parked get_task callers so
    /// they pick up their exit notice.
    pub async fn complete_reduce_task(&self, task_num: usize) -> Result<(), TaskError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.reduce_in_progress.remove(&task_num).is_none() {
            return Err(TaskError::NotInProgress {
                phase: TaskPhase::Reduce,
                task_num,
            });
        }
        state.reduce_completed.insert(task_num);
        log::info!("reduce task {task_num} completed");
        if state.job_done(inner.n_reduce) {
            log::info!("all reduce tasks completed, job done");
            inner.state_changed.notify_waiters();
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct CoordinatorServer {
    coordinator: Coordinator,
}

impl MapReduce for CoordinatorServer {
    async fn get_reduce_n(self, _: context::Context) -> usize {
        self.coordinator.reduce_n()
    }

    async fn get_task(self, _: context::Context) -> Task {
        self.coordinator.get_task().await
    }

    async fn complete_map_task(self, _: context::Context, task_num: usize) -> Result<(), TaskError> {
        self.coordinator.complete_map_task(task_num).await
    }

    async fn complete_reduce_task(
        self,
        _: context::Context,
        task_num: usize,
    ) -> Result<(), TaskError> {
        self.coordinator.complete_reduce_task(task_num).await
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

/// Starts serving worker RPCs on the given loopback port (0 picks a free
/// one) and returns the bound address. The accept loop runs until the
/// process exits; the embedding loop decides when that is by polling
/// [`Coordinator::done`].
pub async fn serve(coordinator: Coordinator, port: u16) -> anyhow::Result<SocketAddr> {
    let server_addr: (IpAddr, u16) = (IpAddr::V6(Ipv6Addr::LOCALHOST), port);

    let mut listener = tarpc::serde_transport::tcp::listen(&server_addr, Json::default).await?;
    let local_addr = listener.local_addr();
    listener.config_mut().max_frame_length(usize::MAX);
    tokio::spawn(
        listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            // All workers connect from loopback, so the per-IP cap is the
            // effective worker-count cap.
            .max_channels_per_key(64, |t| t.transport().peer_addr().unwrap().ip())
            .map(move |channel| {
                let server = CoordinatorServer {
                    coordinator: coordinator.clone(),
                };
                channel.execute(MapReduce::serve(server)).for_each(spawn)
            })
            .buffer_unordered(64)
            .for_each(|_| async {}),
    );
    Ok(local_addr)
}
