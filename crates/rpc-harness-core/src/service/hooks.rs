//! Extension points around worker execution.

use std::fmt;

use crate::wire::ContextData;

use super::context::CallContext;
use super::definition::{EntrypointKind, HandlerResult};

/// Observes workers of a service.
///
/// Hooks run on the worker task: `worker_setup` before the handler,
/// `worker_result` after it, in the order hooks were attached.
pub trait WorkerHook: Send + Sync {
    /// Called before the handler runs.
    fn worker_setup(&self, _ctx: &CallContext) {}

    /// Called with the handler's outcome. Http handlers report `Ok(null)` on
    /// success.
    fn worker_result(&self, _ctx: &CallContext, _result: &HandlerResult) {}
}

/// Computes the context data a worker sees from what its caller sent.
pub trait WorkerContextBuilder: Send + Sync + fmt::Debug {
    /// Context data for a worker of `service.method` triggered by `entrypoint`.
    fn context_data(
        &self,
        service: &str,
        method: &str,
        entrypoint: EntrypointKind,
        inherited: ContextData,
    ) -> ContextData;
}

/// Passes the caller's context data through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct InheritContext;

impl WorkerContextBuilder for InheritContext {
    fn context_data(
        &self,
        _service: &str,
        _method: &str,
        _entrypoint: EntrypointKind,
        inherited: ContextData,
    ) -> ContextData {
        inherited
    }
}
