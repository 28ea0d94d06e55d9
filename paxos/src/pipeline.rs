//! A staged executor: bounded-concurrency, bounded-backlog stages linked by
//! explicit continuation decisions.
//!
//! Each registered stage owns a queue of `backlog` items and a semaphore of
//! `max_concurrent` permits. A dispatcher task per stage pulls items off the
//! queue and drives each on its own task while it holds a permit. What
//! happens next is decided by the [`NextAction`] returned from
//! [`StageMachine::run`]:
//!
//! - [`NextAction::Advance`] queues the item on another stage
//! - [`NextAction::Suspend`] releases the permit, waits for the future, then
//!   queues the item on the stage the future yields
//! - [`NextAction::Terminate`] hands the item to [`StageMachine::finish`]

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use error_stack::Report;
use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, trace, warn};

use crate::error::PipelineError;

/// Continuation decision returned by a stage.
pub enum NextAction<S> {
    Advance(S),
    /// Park the item without holding a stage slot until the future resolves
    /// to the stage it should run next.
    Suspend(BoxFuture<'static, S>),
    Terminate,
}

impl<S: Debug> Debug for NextAction<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advance(s) => f.debug_tuple("Advance").field(s).finish(),
            Self::Suspend(_) => f.write_str("Suspend"),
            Self::Terminate => f.write_str("Terminate"),
        }
    }
}

/// The per-stage logic driven by a [`PipelineExecutor`].
pub trait StageMachine: Send + Sync + 'static {
    type Stage: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    type Item: Send + 'static;

    fn run(
        &self,
        stage: Self::Stage,
        item: &mut Self::Item,
    ) -> impl Future<Output = NextAction<Self::Stage>> + Send;

    /// Called exactly once per item, after a stage terminates it.
    fn finish(&self, item: Self::Item);
}

#[derive(Debug, Clone)]
pub struct StageConfig<S> {
    pub stage: S,
    pub name: &'static str,
    pub max_concurrent: usize,
    pub backlog: usize,
}

impl<S> StageConfig<S> {
    pub fn new(stage: S, name: &'static str, max_concurrent: usize, backlog: usize) -> Self {
        Self {
            stage,
            name,
            max_concurrent,
            backlog,
        }
    }
}

struct StageQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

struct Inner<M: StageMachine> {
    machine: M,
    stages: HashMap<M::Stage, StageQueue<M::Item>>,
}

pub struct PipelineExecutor<M: StageMachine> {
    inner: Arc<Inner<M>>,
}

impl<M: StageMachine> Clone for PipelineExecutor<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: StageMachine> PipelineExecutor<M> {
    /// Registers the stages and spawns their dispatchers.
    ///
    /// Must be called from within a tokio runtime. Dispatchers exit once
    /// every executor handle and in-flight item is gone.
    pub fn start(machine: M, configs: impl IntoIterator<Item = StageConfig<M::Stage>>) -> Self {
        let mut stages = HashMap::new();
        let mut receivers = Vec::new();
        for config in configs {
            let (tx, rx) = mpsc::channel(config.backlog.max(1));
            stages.insert(
                config.stage,
                StageQueue {
                    name: config.name,
                    tx,
                },
            );
            receivers.push((config, rx));
        }

        let inner = Arc::new(Inner { machine, stages });
        for (config, rx) in receivers {
            let weak = Arc::downgrade(&inner);
            let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
            tokio::spawn(dispatch(weak, config.stage, config.name, rx, permits));
        }

        Self { inner }
    }

    pub fn machine(&self) -> &M {
        &self.inner.machine
    }

    /// Queues `item` on `stage` without waiting.
    ///
    /// # Errors
    /// [`PipelineError::Overloaded`] if the stage's backlog is full, or
    /// [`PipelineError::StageNotRegistered`].
    pub fn enqueue(&self, stage: M::Stage, item: M::Item) -> Result<(), Report<PipelineError>> {
        let queue = self.inner.stages.get(&stage).ok_or_else(|| {
            Report::new(PipelineError::StageNotRegistered).attach(format!("{stage:?}"))
        })?;
        queue.tx.try_send(item).map_err(|_| {
            Report::new(PipelineError::Overloaded).attach(format!("stage {}", queue.name))
        })
    }
}

impl<M: StageMachine> Inner<M> {
    async fn route(&self, stage: M::Stage, item: M::Item) {
        let Some(queue) = self.stages.get(&stage) else {
            warn!(?stage, "item routed to unregistered stage; finishing it");
            self.machine.finish(item);
            return;
        };
        if let Err(mpsc::error::SendError(item)) = queue.tx.send(item).await {
            warn!(stage = queue.name, "stage closed; finishing item");
            self.machine.finish(item);
        }
    }
}

async fn dispatch<M: StageMachine>(
    inner: Weak<Inner<M>>,
    stage: M::Stage,
    name: &'static str,
    mut rx: mpsc::Receiver<M::Item>,
    permits: Arc<Semaphore>,
) {
    // items leave the queue only once they hold a slot
    while let Ok(permit) = permits.clone().acquire_owned().await {
        let Some(item) = rx.recv().await else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        trace!(stage = name, "dispatching item");
        tokio::spawn(drive(inner, stage, item, permit));
    }
    debug!(stage = name, "stage dispatcher stopped");
}

async fn drive<M: StageMachine>(
    inner: Arc<Inner<M>>,
    stage: M::Stage,
    mut item: M::Item,
    permit: OwnedSemaphorePermit,
) {
    let action = inner.machine.run(stage, &mut item).await;
    drop(permit);

    match action {
        NextAction::Advance(next) => inner.route(next, item).await,
        NextAction::Suspend(wake) => {
            let next = wake.await;
            inner.route(next, item).await;
        }
        NextAction::Terminate => inner.machine.finish(item),
    }
}
