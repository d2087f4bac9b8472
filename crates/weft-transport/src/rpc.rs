//! The datagram RPC endpoint.
//!
//! An [`RpcEndpoint`] owns a UDP socket and three pieces of state:
//!
//! - the **pending map**, correlating outbound request ids with the tasks
//!   awaiting their replies;
//! - the **dispatch table**, an explicit map from method name to handler
//!   (a method is RPC-exposed if and only if it is registered here; absence
//!   produces an `InvalidMethod` error reply);
//! - the **sender observer**, a hook the node installs so every inbound
//!   datagram refreshes the routing table with the sender's contact.
//!
//! Outbound calls time out after the configured RPC timeout; the timeout
//! failure carries the destination's node id so callers can evict the dead
//! peer. Remote error replies are re-raised locally with the original error
//! kind preserved as a string.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use weft_types::Key;

use crate::wire::{Message, MessageId, Value, MAX_DATAGRAM_SIZE};
use crate::{Result, TransportError};

/// Error kind name for requests naming an unregistered method.
pub const INVALID_METHOD_KIND: &str = "InvalidMethod";

/// A raw RPC reply: the responder's claimed node id, the socket address
/// that actually delivered the reply, and the result payload.
///
/// The source address matters to the lookup engine: bootstrap contacts are
/// synthesised with fake ids, and the contact is rebuilt from the address
/// the reply really came from.
#[derive(Clone, Debug)]
pub struct RawResponse {
    /// The responder's node id as claimed in the reply envelope.
    pub sender: Key,
    /// The socket address the reply arrived from.
    pub source: SocketAddr,
    /// The result payload.
    pub result: Value,
}

/// A handler failure, sent back to the caller as an error reply with the
/// kind preserved.
#[derive(Clone, Debug)]
pub struct RpcFault {
    /// The error kind name carried across the wire.
    pub kind: String,
    /// Human-readable error text.
    pub text: String,
}

impl RpcFault {
    /// Create a fault with the given kind and text.
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
        }
    }
}

/// Context passed to an RPC handler.
pub struct RpcContext {
    /// The requesting node's id, from the request envelope.
    pub sender: Key,
    /// The socket address the request arrived from.
    pub source: SocketAddr,
    /// Positional arguments.
    pub args: Vec<Value>,
}

/// The future type returned by RPC handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, RpcFault>> + Send>>;

/// An RPC handler: a callable registered in the dispatch table.
pub type Handler = Arc<dyn Fn(RpcContext) -> HandlerFuture + Send + Sync>;

/// Hook invoked with the sender id and source address of every decodable
/// inbound datagram.
pub type SenderObserver = Box<dyn Fn(Key, SocketAddr) + Send + Sync>;

type PendingTx = oneshot::Sender<Result<RawResponse>>;

/// A bound UDP RPC endpoint.
pub struct RpcEndpoint {
    socket: UdpSocket,
    local_id: Key,
    rpc_timeout: Duration,
    pending: Mutex<HashMap<MessageId, PendingTx>>,
    handlers: Mutex<HashMap<String, Handler>>,
    observer: Mutex<Option<SenderObserver>>,
}

impl RpcEndpoint {
    /// Bind a UDP socket and create the endpoint.
    ///
    /// The receive loop is not started until [`RpcEndpoint::start`] is
    /// called, giving the owner a chance to register handlers first.
    pub async fn bind(
        local_id: Key,
        bind_addr: SocketAddr,
        rpc_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Arc::new(Self {
            socket,
            local_id,
            rpc_timeout,
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
        }))
    }

    /// The local node id this endpoint speaks for.
    pub fn local_id(&self) -> Key {
        self.local_id
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    /// The configured per-request timeout.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Register an RPC handler. Registering marks the method as
    /// RPC-exposed; unregistered methods produce `InvalidMethod` replies.
    pub fn register_handler(&self, method: impl Into<String>, handler: Handler) {
        self.handlers
            .lock()
            .expect("handler table lock poisoned")
            .insert(method.into(), handler);
    }

    /// Install the sender observer.
    pub fn set_observer(&self, observer: SenderObserver) {
        *self.observer.lock().expect("observer lock poisoned") = Some(observer);
    }

    /// Number of requests currently awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map lock poisoned").len()
    }

    /// Spawn the datagram receive loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
            loop {
                let (len, src) = match endpoint.socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "datagram receive failed");
                        continue;
                    }
                };
                endpoint.handle_datagram(&buf[..len], src).await;
            }
        })
    }

    /// Issue an RPC to a peer and await its reply.
    ///
    /// `peer_id` is the *believed* node id of the destination (it may be a
    /// synthesised bootstrap id); it is only used to label a timeout
    /// failure so the caller can evict the dead contact.
    pub async fn call(
        &self,
        peer_id: &Key,
        peer_addr: SocketAddr,
        method: &str,
        args: Vec<Value>,
    ) -> Result<RawResponse> {
        let id = MessageId::random();
        let request = Message::Request {
            id,
            sender: self.local_id,
            method: method.to_string(),
            args,
        };
        let bytes = request.to_bytes()?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(id, tx);

        if let Err(e) = self.socket.send_to(&bytes, peer_addr).await {
            self.forget(&id);
            return Err(TransportError::Io(e.to_string()));
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::Internal(
                "endpoint dropped a pending request".to_string(),
            )),
            Err(_) => {
                self.forget(&id);
                Err(TransportError::Timeout { node_id: *peer_id })
            }
        }
    }

    async fn handle_datagram(self: &Arc<Self>, data: &[u8], src: SocketAddr) {
        let msg = match Message::from_bytes(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(source = %src, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        {
            let observer = self.observer.lock().expect("observer lock poisoned");
            if let Some(observe) = observer.as_ref() {
                observe(msg.sender(), src);
            }
        }

        match msg {
            Message::Request {
                id,
                sender,
                method,
                args,
            } => self.handle_request(id, sender, src, method, args).await,
            Message::Response { id, sender, result } => self.resolve(
                id,
                Ok(RawResponse {
                    sender,
                    source: src,
                    result,
                }),
            ),
            Message::Error { id, kind, text, .. } => {
                self.resolve(id, Err(TransportError::Remote { kind, text }));
            }
        }
    }

    async fn handle_request(
        &self,
        id: MessageId,
        sender: Key,
        src: SocketAddr,
        method: String,
        args: Vec<Value>,
    ) {
        let handler = self
            .handlers
            .lock()
            .expect("handler table lock poisoned")
            .get(&method)
            .cloned();

        let reply = match handler {
            Some(handler) => {
                let ctx = RpcContext {
                    sender,
                    source: src,
                    args,
                };
                match handler(ctx).await {
                    Ok(result) => Message::Response {
                        id,
                        sender: self.local_id,
                        result,
                    },
                    Err(fault) => {
                        debug!(method = %method, kind = %fault.kind, "rpc handler failed");
                        Message::Error {
                            id,
                            sender: self.local_id,
                            kind: fault.kind,
                            text: fault.text,
                        }
                    }
                }
            }
            None => Message::Error {
                id,
                sender: self.local_id,
                kind: INVALID_METHOD_KIND.to_string(),
                text: format!("invalid method: {method}"),
            },
        };

        match reply.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, src).await {
                    debug!(dest = %src, error = %e, "failed to send reply");
                }
            }
            Err(e) => warn!(method = %method, error = %e, "failed to encode reply"),
        }
    }

    fn resolve(&self, id: MessageId, outcome: Result<RawResponse>) {
        let tx = self
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&id);
        match tx {
            Some(tx) => {
                // The caller may have timed out and dropped the receiver.
                let _ = tx.send(outcome);
            }
            None => debug!("reply for unknown or already timed-out request"),
        }
    }

    fn forget(&self, id: &MessageId) {
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(id);
    }
}
