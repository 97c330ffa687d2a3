//! Call-id generation for worker contexts.
//!
//! Every dispatched call gets an id of the form
//! `"<service>.<method>.<suffix>"`. The suffix comes from one of two
//! interchangeable generators:
//!
//! - [`RandomCallIds`] - an opaque uuid per call, no ordering guarantee.
//! - [`SequentialCallIds`] - one counter shared by every container of a
//!   test scope, starting at 1, so tests can assert on dispatch order.
//!
//! The generator is chosen through a [`CallIdSelector`] and fixed the moment
//! the first container using it starts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, ConfigResult};

/// Produces call ids for dispatched calls.
pub trait CallIdGenerator: Send + Sync + fmt::Debug {
    /// Allocate the id for the next call of `service.method`.
    fn next_id(&self, service: &str, method: &str) -> String;
}

/// Opaque, process-unique call ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCallIds;

impl CallIdGenerator for RandomCallIds {
    fn next_id(&self, service: &str, method: &str) -> String {
        format!("{service}.{method}.{}", Uuid::new_v4())
    }
}

/// Gap-free, strictly increasing call ids.
#[derive(Debug)]
pub struct SequentialCallIds {
    next: AtomicU64,
}

impl SequentialCallIds {
    /// Create a counter whose first id ends in `.1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// How many ids have been handed out.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::SeqCst) - 1
    }
}

impl Default for SequentialCallIds {
    fn default() -> Self {
        Self::new()
    }
}

impl CallIdGenerator for SequentialCallIds {
    fn next_id(&self, service: &str, method: &str) -> String {
        let sequence = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{service}.{method}.{sequence}")
    }
}

/// Which generator a scope uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallIdStrategy {
    /// [`RandomCallIds`].
    #[default]
    Random,
    /// [`SequentialCallIds`].
    Sequential,
}

impl CallIdStrategy {
    /// Build a fresh generator for this strategy.
    #[must_use]
    pub fn generator(self) -> Arc<dyn CallIdGenerator> {
        match self {
            Self::Random => Arc::new(RandomCallIds),
            Self::Sequential => Arc::new(SequentialCallIds::new()),
        }
    }
}

impl fmt::Display for CallIdStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => f.write_str("random"),
            Self::Sequential => f.write_str("sequential"),
        }
    }
}

/// Split a call id into `(service, method, suffix)`.
#[must_use]
pub fn split_call_id(call_id: &str) -> Option<(&str, &str, &str)> {
    let mut parts = call_id.splitn(3, '.');
    let service = parts.next()?;
    let method = parts.next()?;
    let suffix = parts.next()?;
    Some((service, method, suffix))
}

/// The per-scope choice of call-id generator.
///
/// Selection is open until [`freeze`](Self::freeze) is called, which happens
/// when the first container of the scope starts. From then on every
/// container shares the same generator instance and selection is rejected.
#[derive(Debug)]
pub struct CallIdSelector {
    state: Mutex<SelectorState>,
}

#[derive(Debug)]
struct SelectorState {
    strategy: CallIdStrategy,
    frozen: Option<Arc<dyn CallIdGenerator>>,
}

impl CallIdSelector {
    /// Create a selector with an initial strategy.
    #[must_use]
    pub fn new(strategy: CallIdStrategy) -> Self {
        Self {
            state: Mutex::new(SelectorState {
                strategy,
                frozen: None,
            }),
        }
    }

    /// Choose the strategy for containers that have not started yet.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CallIdStrategyFrozen`] once any container of
    /// the scope has started.
    pub fn select(&self, strategy: CallIdStrategy) -> ConfigResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.frozen.is_some() {
            return Err(ConfigError::CallIdStrategyFrozen {
                current: state.strategy.to_string(),
                requested: strategy.to_string(),
            });
        }
        state.strategy = strategy;
        Ok(())
    }

    /// Fix the strategy and return the shared generator.
    pub fn freeze(&self) -> Arc<dyn CallIdGenerator> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let strategy = state.strategy;
        Arc::clone(state.frozen.get_or_insert_with(|| strategy.generator()))
    }

    /// The currently selected strategy.
    #[must_use]
    pub fn strategy(&self) -> CallIdStrategy {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .strategy
    }

    /// Whether a container has already fixed the strategy.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frozen
            .is_some()
    }
}

impl Default for CallIdSelector {
    fn default() -> Self {
        Self::new(CallIdStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequential_starts_at_one() {
        let ids = SequentialCallIds::new();
        assert_eq!(ids.next_id("x", "method"), "x.method.1");
        assert_eq!(ids.next_id("y", "method"), "y.method.2");
        assert_eq!(ids.issued(), 2);
    }

    #[test]
    fn test_random_ids_are_unique() {
        let ids = RandomCallIds;
        let a = ids.next_id("x", "method");
        let b = ids.next_id("x", "method");
        assert_ne!(a, b);
        assert!(a.starts_with("x.method."));
    }

    #[test]
    fn test_split_call_id() {
        assert_eq!(split_call_id("x.method.7"), Some(("x", "method", "7")));
        assert_eq!(split_call_id("broken"), None);
    }

    #[test]
    fn test_select_rejected_after_freeze() {
        let selector = CallIdSelector::default();
        selector.select(CallIdStrategy::Sequential).unwrap();
        let _generator = selector.freeze();

        let err = selector.select(CallIdStrategy::Random).unwrap_err();
        assert!(matches!(err, ConfigError::CallIdStrategyFrozen { .. }));
        assert_eq!(selector.strategy(), CallIdStrategy::Sequential);
    }

    #[test]
    fn test_freeze_shares_one_generator() {
        let selector = CallIdSelector::new(CallIdStrategy::Sequential);
        let first = selector.freeze();
        let second = selector.freeze();
        assert_eq!(first.next_id("a", "m"), "a.m.1");
        assert_eq!(second.next_id("b", "m"), "b.m.2");
    }

    #[test]
    fn test_sequential_is_gap_free_across_threads() {
        let ids = Arc::new(SequentialCallIds::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| ids.next_id(&format!("svc{t}"), "m"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                let (_, _, seq) = split_call_id(&id).unwrap();
                assert!(seen.insert(seq.parse::<u64>().unwrap()));
            }
        }
        assert_eq!(seen.len(), 2000);
        assert_eq!(seen.iter().min(), Some(&1));
        assert_eq!(seen.iter().max(), Some(&2000));
    }
}
