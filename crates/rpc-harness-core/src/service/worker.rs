//! Worker dispatch for one running container.
//!
//! Call ids are assigned when a request is taken off its entrypoint, before
//! the worker task is spawned, so ids follow dispatch order. Workers run on
//! the container's task tracker and are bounded by its worker semaphore.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::broker::Delivery;
use crate::call_id::CallIdGenerator;
use crate::metrics::HarnessMetrics;
use crate::wire::{ClientFrame, ContextData, RemoteError, RpcReply, RpcRequest, ServerFrame};

use super::context::{CallContext, CallInfo};
use super::definition::{EntrypointKind, HandlerResult, HttpRequest, HttpResponse, HttpRoute, ServiceDefinition};
use super::hooks::WorkerContextBuilder;
use super::hub::WebSocketHub;
use super::rpc::RpcTransport;

/// Shared state of a running container's workers.
pub(crate) struct WorkerRuntime {
    pub(crate) definition: Arc<ServiceDefinition>,
    pub(crate) call_ids: Arc<dyn CallIdGenerator>,
    pub(crate) context_builder: Arc<dyn WorkerContextBuilder>,
    pub(crate) transport: Arc<RpcTransport>,
    pub(crate) hub: Arc<WebSocketHub>,
    pub(crate) tracker: TaskTracker,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) metrics: Arc<HarnessMetrics>,
}

impl WorkerRuntime {
    fn service(&self) -> &str {
        self.definition.name()
    }

    fn prepare(
        &self,
        entrypoint: EntrypointKind,
        method: &str,
        parent_call_ids: Vec<String>,
        inherited: ContextData,
        socket_id: Option<String>,
    ) -> CallContext {
        let service = self.service();
        let call_id = self.call_ids.next_id(service, method);
        let data = self
            .context_builder
            .context_data(service, method, entrypoint, inherited);
        CallContext::new(
            CallInfo {
                service: service.to_string(),
                method: method.to_string(),
                call_id,
                parent_call_ids,
                entrypoint,
                data,
                socket_id,
            },
            Arc::clone(&self.transport),
            Arc::clone(&self.hub),
        )
    }

    /// Run one worker: hooks, handler, metrics. Panics become remote errors.
    async fn execute(&self, ctx: &CallContext, work: BoxFuture<'static, HandlerResult>) -> HandlerResult {
        let _permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| RemoteError::new("ContainerStopped", self.service()))?;

        for hook in self.definition.hooks() {
            hook.worker_setup(ctx);
        }

        let result = AssertUnwindSafe(work)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                warn!(call_id = %ctx.call_id(), "worker panicked");
                Err(RemoteError::new("WorkerPanic", panic_message(panic.as_ref())))
            });

        for hook in self.definition.hooks() {
            hook.worker_result(ctx, &result);
        }
        self.metrics
            .record_worker_call(self.service(), ctx.entrypoint().as_str());
        debug!(call_id = %ctx.call_id(), ok = result.is_ok(), "worker finished");
        result
    }

    /// Handle a request taken off `rpc-<service>`.
    pub(crate) fn dispatch_rpc(self: &Arc<Self>, delivery: Delivery) {
        let Delivery {
            correlation_id,
            reply_to,
            body,
            ..
        } = delivery;

        let request: RpcRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                self.send_reply(reply_to.as_deref(), correlation_id, Err(RemoteError::malformed_request(e.to_string())));
                return;
            }
        };

        let Some(handler) = self.definition.rpc_handler(&request.method).cloned() else {
            let err = RemoteError::method_not_found(self.service(), &request.method);
            self.send_reply(reply_to.as_deref(), correlation_id, Err(err));
            return;
        };

        let ctx = self.prepare(
            EntrypointKind::Rpc,
            &request.method,
            request.call_id_stack,
            request.context,
            None,
        );
        debug!(call_id = %ctx.call_id(), "rpc dispatched");

        let runtime = Arc::clone(self);
        let args = request.args;
        self.tracker.spawn(async move {
            let work = handler(ctx.clone(), args);
            let result = runtime.execute(&ctx, work).await;
            runtime.send_reply(reply_to.as_deref(), correlation_id, result);
        });
    }

    fn send_reply(&self, reply_to: Option<&str>, correlation_id: Option<String>, result: HandlerResult) {
        let Some(reply_to) = reply_to else {
            debug!(service = %self.service(), "request without reply queue, result dropped");
            return;
        };
        if let Err(e) = self
            .transport
            .reply(reply_to, correlation_id, &RpcReply::from_result(result))
        {
            warn!(service = %self.service(), reply_to = %reply_to, error = %e, "failed to publish reply");
        }
    }

    /// Handle a request frame received on socket `socket_id`.
    pub(crate) fn dispatch_websocket(
        self: &Arc<Self>,
        socket_id: &str,
        frame: ClientFrame,
        outbound: mpsc::UnboundedSender<ServerFrame>,
    ) {
        let ClientFrame {
            method,
            data,
            correlation_id,
        } = frame;

        let Some(handler) = self.definition.websocket_handler(&method).cloned() else {
            let err = RemoteError::method_not_found(self.service(), &method);
            let _ = outbound.send(ServerFrame::result(Some(correlation_id), Err(err)));
            return;
        };

        let ctx = self.prepare(
            EntrypointKind::WebSocket,
            &method,
            Vec::new(),
            ContextData::new(),
            Some(socket_id.to_string()),
        );

        let runtime = Arc::clone(self);
        self.tracker.spawn(async move {
            let work = handler(ctx.clone(), data);
            let result = runtime.execute(&ctx, work).await;
            if outbound
                .send(ServerFrame::result(Some(correlation_id), result))
                .is_err()
            {
                debug!(call_id = %ctx.call_id(), "socket closed before result");
            }
        });
    }

    /// Run the handler of `route` for `request` on the current task.
    pub(crate) async fn dispatch_http(&self, route: &HttpRoute, request: HttpRequest) -> Result<HttpResponse, RemoteError> {
        let ctx = self.prepare(
            EntrypointKind::Http,
            &route.name,
            Vec::new(),
            ContextData::new(),
            None,
        );

        let handler = Arc::clone(&route.handler);
        let (tx, rx) = futures::channel::oneshot::channel();
        let work = {
            let ctx = ctx.clone();
            async move {
                match handler(ctx, request).await {
                    Ok(response) => {
                        let _ = tx.send(response);
                        Ok(Value::Null)
                    }
                    Err(err) => Err(err),
                }
            }
            .boxed()
        };

        self.execute(&ctx, work).await?;
        rx.await
            .map_err(|_| RemoteError::new("HandlerError", "http handler produced no response"))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
