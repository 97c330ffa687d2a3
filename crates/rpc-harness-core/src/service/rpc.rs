//! Request/reply over the broker.
//!
//! An [`RpcTransport`] owns a private reply queue on one connection. Requests
//! go to `rpc-<service>` with the reply queue and a fresh correlation id;
//! a listener task routes each reply to the waiter registered under its
//! correlation id.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{reply_queue, rpc_queue, BrokerConnection, Delivery, MemoryBroker};
use crate::config::ServiceConfig;
use crate::error::{BrokerError, BrokerResult, HarnessError, Result, RpcError, RpcResult};
use crate::wire::{ContextData, RpcReply, RpcRequest};

type Pending = DashMap<String, oneshot::Sender<RpcReply>>;

/// Caller side of rpc on one connection.
#[derive(Debug)]
pub(crate) struct RpcTransport {
    connection: Arc<BrokerConnection>,
    reply_queue: String,
    pending: Arc<Pending>,
    timeout: Duration,
}

impl RpcTransport {
    /// Declare a reply queue on `connection` and start routing replies.
    ///
    /// The listener ends when the connection closes; waiters still pending
    /// then see [`RpcError::Disconnected`].
    pub(crate) fn open(
        connection: Arc<BrokerConnection>,
        timeout: Duration,
    ) -> BrokerResult<(Arc<Self>, JoinHandle<()>)> {
        let reply_queue = reply_queue();
        let mut replies = connection.consume(&reply_queue)?;
        let pending: Arc<Pending> = Arc::new(DashMap::new());

        let listener = {
            let pending = Arc::clone(&pending);
            let queue = reply_queue.clone();
            tokio::spawn(async move {
                while let Some(delivery) = replies.recv().await {
                    route_reply(&pending, delivery);
                }
                debug!(queue = %queue, "reply queue closed");
                pending.clear();
            })
        };

        let transport = Arc::new(Self {
            connection,
            reply_queue,
            pending,
            timeout,
        });
        Ok((transport, listener))
    }

    /// The connection requests are published on.
    pub(crate) fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Publish a reply to a request received on another queue.
    pub(crate) fn reply(&self, to: &str, correlation_id: Option<String>, reply: &RpcReply) -> BrokerResult<()> {
        let body = serde_json::to_vec(reply).map_err(|e| BrokerError::Transport(e.to_string()))?;
        let mut delivery = Delivery::new(body);
        delivery.correlation_id = correlation_id;
        self.connection.publish(to, delivery)
    }

    /// Call `service.method` and wait for the reply.
    pub(crate) async fn call(
        &self,
        service: &str,
        method: &str,
        args: serde_json::Value,
        call_id_stack: Vec<String>,
        context: ContextData,
    ) -> RpcResult<serde_json::Value> {
        let request = RpcRequest {
            method: method.to_string(),
            args,
            call_id_stack,
            context,
        };
        let body = serde_json::to_vec(&request).map_err(|e| RpcError::Encode(e.to_string()))?;

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        let delivery = Delivery::new(body)
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.reply_queue.clone());
        if let Err(err) = self.connection.publish(&rpc_queue(service), delivery) {
            self.pending.remove(&correlation_id);
            return Err(match err {
                BrokerError::NoSuchQueue { .. } => RpcError::UnknownService(service.to_string()),
                other => RpcError::Broker(other),
            });
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result().map_err(RpcError::Remote),
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(RpcError::Timeout {
                    service: service.to_string(),
                    method: method.to_string(),
                    after: self.timeout,
                })
            }
        }
    }
}

fn route_reply(pending: &Pending, delivery: Delivery) {
    let Some(correlation_id) = delivery.correlation_id else {
        warn!("reply without correlation id dropped");
        return;
    };
    let Some((_, waiter)) = pending.remove(&correlation_id) else {
        debug!(correlation_id = %correlation_id, "reply for abandoned call");
        return;
    };
    let reply = serde_json::from_slice::<RpcReply>(&delivery.body).unwrap_or_else(|e| RpcReply {
        result: None,
        error: Some(crate::wire::RemoteError::new("MalformedReply", e.to_string())),
    });
    // The waiter may have timed out in the meantime.
    let _ = waiter.send(reply);
}

/// Standalone rpc client: the test-side proxy for calling services.
///
/// Holds its own connection in the namespace, so it must be closed (or
/// dropped) before the namespace can be deleted.
#[derive(Debug)]
pub struct RpcClient {
    transport: Arc<RpcTransport>,
    listener: JoinHandle<()>,
}

impl RpcClient {
    /// Connect to the namespace `config` points at.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not name a vhost or the
    /// broker refuses the connection.
    pub fn connect(broker: &MemoryBroker, config: &ServiceConfig, timeout: Duration) -> Result<Self> {
        let vhost = config.vhost()?;
        let user = config.username().unwrap_or_else(|| "guest".to_string());
        let connection = broker.connect(&vhost, &user, Some("rpc-client"))?;
        let (transport, listener) = RpcTransport::open(Arc::new(connection), timeout)?;
        Ok(Self { transport, listener })
    }

    /// Call `service.method` with `args`.
    ///
    /// # Errors
    ///
    /// See [`RpcError`]; a missed deadline is [`HarnessError::Timeout`].
    pub async fn call(&self, service: &str, method: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        self.call_with_context(service, method, args, ContextData::new()).await
    }

    /// Call `service.method` with `args` and caller context data.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with_context(
        &self,
        service: &str,
        method: &str,
        args: serde_json::Value,
        context: ContextData,
    ) -> Result<serde_json::Value> {
        self.transport
            .call(service, method, args, Vec::new(), context)
            .await
            .map_err(HarnessError::from)
    }

    /// Name of the client's broker connection.
    #[must_use]
    pub fn connection_name(&self) -> &str {
        self.transport.connection().name()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if self.transport.connection().close() {
            debug!(connection = %self.transport.connection().name(), "rpc client closed");
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerAdmin;
    use serde_json::json;

    async fn setup() -> (Arc<MemoryBroker>, ServiceConfig) {
        let broker = MemoryBroker::new("localhost");
        broker.create_vhost("ns").await.unwrap();
        let config = ServiceConfig::for_namespace("localhost", "guest", "ns");
        (broker, config)
    }

    #[tokio::test]
    async fn test_call_unknown_service() {
        let (broker, config) = setup().await;
        let client = RpcClient::connect(&broker, &config, Duration::from_millis(100)).unwrap();

        let err = client.call("nobody", "m", json!(null)).await.unwrap_err();
        assert!(matches!(err, HarnessError::Rpc(RpcError::UnknownService(ref s)) if s == "nobody"));
    }

    #[tokio::test]
    async fn test_call_times_out_without_reply() {
        let (broker, config) = setup().await;
        let silent = broker.connect("ns", "guest", None).unwrap();
        let _requests = silent.consume(&rpc_queue("slow")).unwrap();
        let client = RpcClient::connect(&broker, &config, Duration::from_millis(30)).unwrap();

        let err = client.call("slow", "m", json!(null)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_reply_is_routed_by_correlation_id() {
        let (broker, config) = setup().await;
        let server = broker.connect("ns", "guest", None).unwrap();
        let mut requests = server.consume(&rpc_queue("echo")).unwrap();
        let client = RpcClient::connect(&broker, &config, Duration::from_secs(2)).unwrap();

        let responder = tokio::spawn(async move {
            let delivery = requests.recv().await.unwrap();
            let request: RpcRequest = serde_json::from_slice(&delivery.body).unwrap();
            let reply = RpcReply::from_result(Ok(request.args));
            let mut out = Delivery::new(serde_json::to_vec(&reply).unwrap());
            out.correlation_id = delivery.correlation_id;
            server.publish(delivery.reply_to.as_deref().unwrap(), out).unwrap();
        });

        let result = client.call("echo", "m", json!({"v": 1})).await.unwrap();
        assert_eq!(result, json!({"v": 1}));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let (broker, config) = setup().await;
        let client = RpcClient::connect(&broker, &config, Duration::from_secs(1)).unwrap();
        assert_eq!(broker.connection_count("ns"), 1);
        client.close();
        client.close();
        assert_eq!(broker.connection_count("ns"), 0);
    }
}
