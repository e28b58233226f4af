//! Dependency-ordered worker supervisor.
//!
//! A [`Supervisor`] runs a set of named [`Worker`]s as tokio tasks. Each
//! worker declares the workers it requires; it is only started once every
//! prerequisite has called [`Process::ready`]. Any worker failing (returning
//! an error or panicking) triggers a supervisor-wide [`Shutdown`], which every
//! running worker observes through its [`Process`] handle.
//!
//! Prerequisites are [`WorkerId`] handles returned by
//! [`Supervisor::supervise`], and a worker can only require workers that were
//! registered before it. Dependency graphs are therefore acyclic by
//! construction; anything else is rejected at registration time.
//!
//! ```text
//!   supervise(rpc)  ──▶ WorkerId(0)
//!   supervise(setup.requires(0)) ──▶ WorkerId(1)
//!
//!   run():  rpc ──ready()──▶ setup starts
//!           any error ──▶ Shutdown::trigger() ──▶ all workers wind down
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{Instrument, Span, debug, error, info, info_span};

use crate::BoxFuture;

/// Error type returned by worker bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type WorkFn = Box<dyn FnOnce(Process) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Errors reported by the supervisor, either at registration or as the
/// terminal outcome of a worker.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker name {0:?} is already registered")]
    DuplicateName(String),

    #[error("worker {worker:?} requires a worker that is not registered before it")]
    UnknownPrerequisite { worker: String },

    #[error("worker {worker:?} failed: {source}")]
    Worker {
        worker: String,
        #[source]
        source: BoxError,
    },

    #[error("worker {worker:?} panicked: {message}")]
    Panicked { worker: String, message: String },

    #[error("worker {worker:?} not started: prerequisite {prerequisite:?} exited before it was ready")]
    PrerequisiteExited {
        worker: String,
        prerequisite: String,
    },
}

impl SupervisorError {
    /// Name of the worker this error belongs to.
    pub fn worker(&self) -> &str {
        match self {
            Self::DuplicateName(worker)
            | Self::UnknownPrerequisite { worker }
            | Self::Worker { worker, .. }
            | Self::Panicked { worker, .. }
            | Self::PrerequisiteExited { worker, .. } => worker,
        }
    }
}

/// Typed handle to a registered worker, used to declare prerequisites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

/// A named unit of background work.
pub struct Worker {
    name: String,
    requires: Vec<WorkerId>,
    work: WorkFn,
}

impl Worker {
    /// Create a worker that runs `work` once its prerequisites are ready.
    pub fn new<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            requires: Vec::new(),
            work: Box::new(move |process| Box::pin(work(process))),
        }
    }

    /// Declare that this worker must not start before `prerequisite` is ready.
    pub fn requires(mut self, prerequisite: WorkerId) -> Self {
        self.requires.push(prerequisite);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Idempotent, broadcast shutdown signal shared by the supervisor and every
/// worker. Late subscribers still observe a shutdown triggered earlier.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns `true` for the call that actually initiated it.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle given to a running worker.
pub struct Process {
    name: Arc<str>,
    ready: Arc<watch::Sender<bool>>,
    shutdown: Shutdown,
}

impl Process {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal that this worker is initialized; dependents may start.
    pub fn ready(&self) {
        if !self.ready.send_replace(true) {
            debug!("ready");
        }
    }

    /// The supervisor-wide shutdown signal.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Resolve once the supervisor has been asked to shut down.
    pub async fn shutdown_requested(&self) {
        self.shutdown.wait().await
    }
}

struct Slot {
    name: String,
    requires: Vec<WorkerId>,
    work: WorkFn,
    ready: watch::Sender<bool>,
}

/// Runs registered workers in dependency order and collects their failures.
pub struct Supervisor {
    span: Span,
    shutdown: Shutdown,
    slots: Vec<Slot>,
}

impl Supervisor {
    /// Create a supervisor whose diagnostics are all emitted under `span`.
    pub fn new(span: Span) -> Self {
        Self {
            span,
            shutdown: Shutdown::new(),
            slots: Vec::new(),
        }
    }

    /// The shutdown signal shared with every worker.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Register a worker. Must be called before [`run`](Self::run).
    pub fn supervise(&mut self, worker: Worker) -> Result<WorkerId, SupervisorError> {
        if self.slots.iter().any(|slot| slot.name == worker.name) {
            return Err(SupervisorError::DuplicateName(worker.name));
        }
        let id = WorkerId(self.slots.len());
        if worker.requires.iter().any(|prerequisite| prerequisite.0 >= id.0) {
            return Err(SupervisorError::UnknownPrerequisite {
                worker: worker.name,
            });
        }

        let (ready, _rx) = watch::channel(false);
        self.slots.push(Slot {
            name: worker.name,
            requires: worker.requires,
            work: worker.work,
            ready,
        });
        Ok(id)
    }

    /// Run every worker until all of them have terminated.
    ///
    /// Returns one error per failing worker. Workers that were never started
    /// because shutdown came first are not errors.
    pub async fn run(self) -> Vec<SupervisorError> {
        let Supervisor {
            span,
            shutdown,
            slots,
        } = self;

        let readiness: Vec<(String, watch::Receiver<bool>)> = slots
            .iter()
            .map(|slot| (slot.name.clone(), slot.ready.subscribe()))
            .collect();

        let mut handles = Vec::with_capacity(slots.len());
        for slot in slots {
            let prerequisites = slot
                .requires
                .iter()
                .map(|id| readiness[id.0].clone())
                .collect();
            let worker_span = info_span!(parent: &span, "worker", name = %slot.name);
            let name = slot.name.clone();
            let task = run_worker(slot, prerequisites, shutdown.clone()).instrument(worker_span);
            handles.push((name, tokio::spawn(task)));
        }
        drop(readiness);

        let mut errors = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => {
                    shutdown.trigger();
                    errors.push(SupervisorError::Panicked {
                        worker: name,
                        message: join_err.to_string(),
                    });
                }
            }
        }

        span.in_scope(|| debug!(failed = errors.len(), "all workers terminated"));
        errors
    }
}

async fn run_worker(
    slot: Slot,
    prerequisites: Vec<(String, watch::Receiver<bool>)>,
    shutdown: Shutdown,
) -> Result<(), SupervisorError> {
    let Slot {
        name, work, ready, ..
    } = slot;

    for (prerequisite, mut prerequisite_ready) in prerequisites {
        tokio::select! {
            became_ready = wait_ready(&mut prerequisite_ready) => {
                if became_ready {
                    continue;
                }
                if shutdown.is_triggered() {
                    debug!(%prerequisite, "prerequisite stopped during shutdown, not starting");
                    return Ok(());
                }
                let err = SupervisorError::PrerequisiteExited {
                    worker: name,
                    prerequisite,
                };
                error!(error = %err, "shutting down");
                shutdown.trigger();
                return Err(err);
            }
            _ = shutdown.wait() => {
                debug!("shutdown requested before start");
                return Ok(());
            }
        }
    }

    info!("starting");
    // Held until this function returns so dependents never see the readiness
    // channel close before a failure has triggered shutdown.
    let ready = Arc::new(ready);
    let process = Process {
        name: Arc::from(name.as_str()),
        ready: ready.clone(),
        shutdown: shutdown.clone(),
    };

    let err = match AssertUnwindSafe(work(process)).catch_unwind().await {
        Ok(Ok(())) => {
            info!("exited");
            return Ok(());
        }
        Ok(Err(source)) => SupervisorError::Worker {
            worker: name,
            source,
        },
        Err(panic) => SupervisorError::Panicked {
            worker: name,
            message: panic_message(panic),
        },
    };

    error!(error = %err, "shutting down");
    shutdown.trigger();
    Err(err)
}

async fn wait_ready(ready: &mut watch::Receiver<bool>) -> bool {
    ready.wait_for(|ready| *ready).await.is_ok()
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
