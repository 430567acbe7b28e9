//! Worker cluster membership.
//!
//! Every process may start a cluster member; the members elect one active
//! instance through a role lock. The others stay down and can try again
//! later. The active member runs each worker in its own loop and renews the
//! role while it is up.

use async_trait::async_trait;
use quiver_distributed::{JobRunner, LeaderElection};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{ConsumerReaper, DelayWorker, JobWorker, PurgeRunner, RequeueWorker, ScheduleWorker, Worker};
use crate::broker::BrokerContext;
use crate::error::{QueueError, QueueResult};
use crate::events::BrokerEvent;
use crate::lifecycle::{Hook, Lifecycle, LifecycleState, Task};

const ROLE: &str = "workers";

struct ClusterCore {
    ctx: Arc<BrokerContext>,
    election: LeaderElection,
    jobs: Arc<JobWorker>,
    workers: Vec<Arc<dyn Worker>>,
    lifecycle: OnceLock<Weak<Lifecycle>>,
}

impl ClusterCore {
    /// Shut the member down from one of its own tasks.
    fn halt(&self) {
        if let Some(lifecycle) = self.lifecycle.get().and_then(Weak::upgrade) {
            tokio::spawn(async move {
                if let Err(e) = lifecycle.shutdown().await {
                    warn!(error = %e, "worker cluster shutdown failed");
                }
            });
        }
    }
}

async fn run_worker(core: Arc<ClusterCore>, worker: Arc<dyn Worker>, mut stop: watch::Receiver<bool>) {
    let interval = worker.interval();
    loop {
        if *stop.borrow() {
            return;
        }
        if let Err(e) = worker.tick().await {
            let fatal = e.is_fatal();
            core.ctx.events.emit(BrokerEvent::WorkerError {
                worker: worker.name().to_string(),
                error: e.to_string(),
                fatal,
            });
            if fatal {
                error!(worker = worker.name(), error = %e, "fatal worker error, shutting the cluster down");
                core.halt();
                return;
            }
            warn!(worker = worker.name(), error = %e, "worker tick failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn keep_leadership(core: Arc<ClusterCore>, mut stop: watch::Receiver<bool>) {
    let interval = core.election.refresh_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        if *stop.borrow() {
            return;
        }
        match core.election.renew().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(node = %core.election.node_id(), "worker cluster leadership lost, stepping down");
                core.halt();
                return;
            }
            Err(e) => warn!(error = %e, "leadership renewal failed"),
        }
    }
}

struct LeadershipHook {
    core: Arc<ClusterCore>,
    task: Task,
}

#[async_trait]
impl Hook for LeadershipHook {
    fn name(&self) -> &str {
        "leadership"
    }

    async fn up(&self) -> QueueResult<()> {
        let core = Arc::clone(&self.core);
        self.task.spawn(|stop| keep_leadership(core, stop));
        Ok(())
    }

    async fn down(&self) -> QueueResult<()> {
        self.task.stop().await;
        self.core.election.resign().await?;
        Ok(())
    }
}

struct WorkersHook {
    core: Arc<ClusterCore>,
    tasks: Vec<Task>,
}

#[async_trait]
impl Hook for WorkersHook {
    fn name(&self) -> &str {
        "workers"
    }

    async fn up(&self) -> QueueResult<()> {
        for worker in &self.core.workers {
            worker.start().await?;
        }
        for (worker, task) in self.core.workers.iter().zip(&self.tasks) {
            let (core, worker) = (Arc::clone(&self.core), Arc::clone(worker));
            task.spawn(|stop| run_worker(core, worker, stop));
        }
        Ok(())
    }

    async fn down(&self) -> QueueResult<()> {
        for task in &self.tasks {
            task.stop().await;
        }
        Ok(())
    }
}

/// This process's member of the maintenance worker cluster.
///
/// The member runs the delay, schedule and requeue promotion workers, the
/// consumer reaper and the background job worker (with the purge runner
/// registered).
pub struct WorkerCluster {
    core: Arc<ClusterCore>,
    lifecycle: Arc<Lifecycle>,
}

impl WorkerCluster {
    pub(crate) fn new(ctx: Arc<BrokerContext>) -> Self {
        let election = LeaderElection::new(
            Arc::clone(&ctx.store),
            ctx.keys.role_lock(ROLE),
            ctx.config.workers.leader_ttl,
        );
        let jobs = Arc::new(JobWorker::new(Arc::clone(&ctx)));
        jobs.register(Arc::new(PurgeRunner::new(Arc::clone(&ctx))));
        let workers: Vec<Arc<dyn Worker>> = vec![
            Arc::new(DelayWorker::new(Arc::clone(&ctx))),
            Arc::new(ScheduleWorker::new(Arc::clone(&ctx))),
            Arc::new(RequeueWorker::new(Arc::clone(&ctx))),
            Arc::new(ConsumerReaper::new(Arc::clone(&ctx))),
            Arc::clone(&jobs) as Arc<dyn Worker>,
        ];
        let core = Arc::new(ClusterCore {
            ctx,
            election,
            jobs,
            workers,
            lifecycle: OnceLock::new(),
        });

        let hooks: Vec<Arc<dyn Hook>> = vec![
            Arc::new(LeadershipHook {
                core: Arc::clone(&core),
                task: Task::new(),
            }),
            Arc::new(WorkersHook {
                core: Arc::clone(&core),
                tasks: core.workers.iter().map(|_| Task::new()).collect(),
            }),
        ];
        let lifecycle = Arc::new(Lifecycle::new(
            format!("worker-cluster:{}", core.election.node_id()),
            hooks,
        ));
        // set once right after construction
        let _ = core.lifecycle.set(Arc::downgrade(&lifecycle));
        Self { core, lifecycle }
    }

    /// Node id used in the election.
    pub fn node_id(&self) -> &str {
        self.core.election.node_id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Check if this member is the active one.
    pub fn is_leader(&self) -> bool {
        self.core.election.is_leader()
    }

    /// Add a runner for another background job kind.
    pub fn register_runner(&self, runner: Arc<dyn JobRunner>) {
        self.core.jobs.register(runner);
    }

    /// Become the active member and start every worker.
    ///
    /// Returns `false`, staying down, when another member is active or a
    /// shutdown interrupted the start-up.
    pub async fn start(&self) -> QueueResult<bool> {
        let state = self.lifecycle.state();
        if state != LifecycleState::Down {
            return Err(QueueError::Lifecycle(format!("worker cluster is {}", state)));
        }
        if !self.core.election.try_elect().await? {
            info!(node = %self.node_id(), "another worker cluster member is active, staying idle");
            return Ok(false);
        }
        match self.lifecycle.start().await {
            Ok(true) => Ok(true),
            other => {
                self.core.election.resign().await?;
                other
            }
        }
    }

    /// Stop every worker and give the role up.
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.lifecycle.shutdown().await
    }

    /// Tick every worker once, in order, without an election.
    ///
    /// Returns the number of items handled. Suits tests and hosts that
    /// drive maintenance from their own scheduler.
    pub async fn run_once(&self) -> QueueResult<usize> {
        let mut handled = 0;
        for worker in &self.core.workers {
            handled += worker.tick().await?;
        }
        Ok(handled)
    }
}
