//! Ordered teardown.
//!
//! Every acquired resource pushes a finalizer tagged with a [`Stage`].
//! [`Finalizers::run`] executes stages in order (clients, services, the
//! connection drain check, namespace deletion) and, within a stage, the most
//! recently registered finalizer first. All finalizers run; failures are
//! collected into a [`TeardownReport`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::{HarnessError, LifecycleError, Result};

/// Teardown stage. Earlier stages finish before later ones start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Websocket handles and rpc clients.
    Clients,
    /// Containers and runners.
    Services,
    /// Leak assertion per namespace.
    Inventory,
    /// Namespace deletion.
    Namespace,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Clients => "clients",
            Self::Services => "services",
            Self::Inventory => "inventory",
            Self::Namespace => "namespace",
        };
        f.write_str(name)
    }
}

/// A teardown action.
pub type Finalizer = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Entry {
    stage: Stage,
    sequence: u64,
    label: String,
    action: Finalizer,
}

/// One failed teardown action.
#[derive(Debug)]
pub struct TeardownFailure {
    pub stage: Stage,
    pub label: String,
    pub error: HarnessError,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.label, self.error)
    }
}

/// Outcome of a teardown run.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Labels of finalizers that succeeded, in execution order.
    pub completed: Vec<String>,
    /// Finalizers that failed, in execution order.
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Whether every finalizer succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok` if clean, the only failure if there was one, otherwise
    /// [`HarnessError::Teardown`] with all of them.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn into_result(mut self) -> Result<()> {
        match self.failures.len() {
            0 => Ok(()),
            1 => Err(self.failures.remove(0).error),
            _ => Err(HarnessError::Teardown {
                failures: self.failures,
            }),
        }
    }
}

/// Stack of pending finalizers.
#[derive(Default)]
pub struct Finalizers {
    pending: Mutex<Vec<Entry>>,
    sequence: AtomicU64,
}

impl Finalizers {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` to run at `stage`.
    pub fn push<F>(&self, stage: Stage, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        let entry = Entry {
            stage,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            action: Box::new(action),
        };
        debug!(stage = %entry.stage, label = %entry.label, "finalizer registered");
        self.lock().push(entry);
    }

    /// Number of finalizers not yet run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run and clear every pending finalizer.
    ///
    /// Finalizers registered while this runs are left for the next call.
    pub async fn run(&self) -> TeardownReport {
        let mut entries = std::mem::take(&mut *self.lock());
        entries.sort_by(|a, b| a.stage.cmp(&b.stage).then(b.sequence.cmp(&a.sequence)));

        let mut report = TeardownReport::default();
        for entry in entries {
            let Entry {
                stage,
                label,
                action,
                ..
            } = entry;

            let outcome = AssertUnwindSafe(action())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(LifecycleError::StopFailed {
                        service: label.clone(),
                        message: "finalizer panicked".to_string(),
                    }
                    .into())
                });

            match outcome {
                Ok(()) => {
                    debug!(stage = %stage, label = %label, "finalizer done");
                    report.completed.push(label);
                }
                Err(error) => {
                    warn!(stage = %stage, label = %label, error = %error, "finalizer failed");
                    report.failures.push(TeardownFailure {
                        stage,
                        label,
                        error,
                    });
                }
            }
        }
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Finalizers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizers")
            .field("pending", &self.len())
            .finish()
    }
}
