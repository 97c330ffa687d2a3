//! Per-call worker context.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::RpcResult;
use crate::wire::ContextData;

use super::definition::EntrypointKind;
use super::hub::WebSocketHub;
use super::rpc::RpcTransport;

/// Everything a handler knows about the call it is serving.
///
/// Cheap to clone. Nested calls made through [`rpc_proxy`](Self::rpc_proxy)
/// carry this call's id stack and context data to the callee.
#[derive(Clone)]
pub struct CallContext {
    info: Arc<CallInfo>,
    transport: Arc<RpcTransport>,
    hub: Arc<WebSocketHub>,
}

#[derive(Debug)]
pub(crate) struct CallInfo {
    pub(crate) service: String,
    pub(crate) method: String,
    pub(crate) call_id: String,
    pub(crate) parent_call_ids: Vec<String>,
    pub(crate) entrypoint: EntrypointKind,
    pub(crate) data: ContextData,
    pub(crate) socket_id: Option<String>,
}

impl CallContext {
    pub(crate) fn new(info: CallInfo, transport: Arc<RpcTransport>, hub: Arc<WebSocketHub>) -> Self {
        Self {
            info: Arc::new(info),
            transport,
            hub,
        }
    }

    /// Name of the service serving the call.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.info.service
    }

    /// Method (or http route name) being served.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.info.method
    }

    /// Id assigned to this call, `<service>.<method>.<suffix>`.
    #[must_use]
    pub fn call_id(&self) -> &str {
        &self.info.call_id
    }

    /// Ids of the calls that led here, outermost first.
    #[must_use]
    pub fn parent_call_ids(&self) -> &[String] {
        &self.info.parent_call_ids
    }

    /// Parent ids followed by this call's id.
    #[must_use]
    pub fn call_id_stack(&self) -> Vec<String> {
        let mut stack = self.info.parent_call_ids.clone();
        stack.push(self.info.call_id.clone());
        stack
    }

    /// Entrypoint kind that triggered the call.
    #[must_use]
    pub fn entrypoint(&self) -> EntrypointKind {
        self.info.entrypoint
    }

    /// Context data computed for this worker.
    #[must_use]
    pub fn data(&self) -> &ContextData {
        &self.info.data
    }

    /// Socket that sent the request, for websocket calls.
    #[must_use]
    pub fn socket_id(&self) -> Option<&str> {
        self.info.socket_id.as_deref()
    }

    /// The hosting container's websocket hub.
    #[must_use]
    pub fn websocket_hub(&self) -> &Arc<WebSocketHub> {
        &self.hub
    }

    /// Proxy for calling `service` from inside this worker.
    #[must_use]
    pub fn rpc_proxy(&self, service: impl Into<String>) -> ServiceProxy {
        ServiceProxy {
            ctx: self.clone(),
            service: service.into(),
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("call_id", &self.info.call_id)
            .field("entrypoint", &self.info.entrypoint)
            .field("parents", &self.info.parent_call_ids)
            .finish_non_exhaustive()
    }
}

/// Calls another service on behalf of a worker.
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    ctx: CallContext,
    service: String,
}

impl ServiceProxy {
    /// Target service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Call `method` and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns the callee's error, [`RpcError::UnknownService`] if nothing
    /// serves the target, or [`RpcError::Timeout`].
    ///
    /// [`RpcError::UnknownService`]: crate::error::RpcError::UnknownService
    /// [`RpcError::Timeout`]: crate::error::RpcError::Timeout
    pub async fn call(&self, method: &str, args: Value) -> RpcResult<Value> {
        self.ctx
            .transport
            .call(
                &self.service,
                method,
                args,
                self.ctx.call_id_stack(),
                self.ctx.data().clone(),
            )
            .await
    }
}
