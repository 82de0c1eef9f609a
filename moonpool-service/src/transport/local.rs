//! LocalNode: in-process transport hosting many services on one thread.
//!
//! Every service gets an unbounded inbox and a message loop spawned with
//! `spawn_local`, so a node must run inside a `tokio::task::LocalSet`.
//!
//! ```text
//!   LocalTransport::send ──► NodeShared::post ──► inbox (mpsc) ──► loop
//!                                                                   │
//!                                            ServiceContext::dispatch
//! ```
//!
//! Native requests (timers, spawn, kill, scan) are answered from separate
//! local tasks, never from inside the call that made them.
//!
//! # Example
//!
//! ```rust,ignore
//! let local = tokio::task::LocalSet::new();
//! local.run_until(async {
//!     let node = LocalNode::builder()
//!         .kind("echo", service_init(|ctx, _config| async move {
//!             ctx.set_dispatch("lua", echo_handler())?;
//!             Ok(())
//!         }))
//!         .build()?;
//!     let echo = node.spawn(ServiceConfig::new("echo", "echo").unique(true))?;
//!     node.shutdown();
//!     node.wait_all_exited().await;
//!     Ok::<_, ServiceError>(())
//! }).await?;
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::protocol::LocalBoxFuture;
use crate::service::{ServiceContext, SERVICE_EXIT};
use crate::types::{Address, ProtocolTag, SessionId, TimerId};

use super::{Message, Transport};

/// Creates the behavior of one kind of service.
pub type ServiceInit = Rc<dyn Fn(ServiceContext, ServiceConfig) -> LocalBoxFuture<Result<()>>>;

/// Wrap an async closure into a [`ServiceInit`].
pub fn service_init<F, Fut>(init: F) -> ServiceInit
where
    F: Fn(ServiceContext, ServiceConfig) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Rc::new(
        move |ctx: ServiceContext, config: ServiceConfig| -> LocalBoxFuture<Result<()>> {
            Box::pin(init(ctx, config))
        },
    )
}

/// Header of the error bounced back for a request to a dead address.
pub const DEAD_SERVICE: &str = "call dead service";

/// Builder for [`LocalNode`].
pub struct LocalNodeBuilder {
    workers: u32,
    kinds: HashMap<String, ServiceInit>,
}

impl Default for LocalNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNodeBuilder {
    /// Create a builder with one worker and no service kinds.
    pub fn new() -> Self {
        Self {
            workers: 1,
            kinds: HashMap::new(),
        }
    }

    /// Number of workers services are spread over. Only used to label
    /// services for [`scan_services`](crate::ServiceContext::scan_services).
    pub fn workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    /// Register a service kind.
    pub fn kind(mut self, name: impl Into<String>, init: ServiceInit) -> Self {
        self.kinds.insert(name.into(), init);
        self
    }

    /// Build the node.
    ///
    /// # Errors
    ///
    /// `Config` if `workers` is 0.
    pub fn build(self) -> Result<LocalNode> {
        if self.workers == 0 {
            return Err(ServiceError::Config("workers must be at least 1".to_string()));
        }
        tracing::debug!(workers = self.workers, kinds = self.kinds.len(), "local node built");
        Ok(LocalNode {
            shared: Rc::new(NodeShared {
                kinds: self.kinds,
                workers: self.workers,
                services: RefCell::new(HashMap::new()),
                names: RefCell::new(HashMap::new()),
                next_address: Cell::new(1),
                next_worker: Cell::new(0),
                started: Instant::now(),
                exited: Notify::new(),
            }),
        })
    }
}

struct ServiceEntry {
    name: String,
    kind: String,
    worker: u32,
    unique: bool,
    inbox: mpsc::UnboundedSender<Message>,
    ctx: ServiceContext,
}

struct NodeShared {
    kinds: HashMap<String, ServiceInit>,
    workers: u32,
    services: RefCell<HashMap<Address, ServiceEntry>>,
    names: RefCell<HashMap<String, Address>>,
    next_address: Cell<u32>,
    next_worker: Cell<u32>,
    started: Instant,
    exited: Notify,
}

/// In-process transport and service host.
#[derive(Clone)]
pub struct LocalNode {
    shared: Rc<NodeShared>,
}

impl LocalNode {
    /// Start building a node.
    pub fn builder() -> LocalNodeBuilder {
        LocalNodeBuilder::new()
    }

    /// Create a service directly. Its init runs until it first suspends.
    pub fn spawn(&self, config: ServiceConfig) -> Result<Address> {
        self.shared.create_service(config)
    }

    /// Deliver a message as if a service had sent it.
    pub fn post(&self, message: Message) {
        self.shared.post(message);
    }

    /// Address of a uniquely named service.
    pub fn query(&self, name: &str) -> Option<Address> {
        self.shared.names.borrow().get(name).copied()
    }

    /// Context of a live service.
    pub fn context(&self, address: Address) -> Option<ServiceContext> {
        self.shared
            .services
            .borrow()
            .get(&address)
            .map(|entry| entry.ctx.clone())
    }

    /// Number of live services.
    pub fn service_count(&self) -> usize {
        self.shared.services.borrow().len()
    }

    /// Remove a service at once.
    pub fn kill(&self, address: Address) -> bool {
        self.shared.remove_service(address)
    }

    /// Send a shutdown message to every service.
    pub fn shutdown(&self) {
        let addresses: Vec<Address> = self.shared.services.borrow().keys().copied().collect();
        tracing::info!(services = addresses.len(), "local node shutting down");
        for address in addresses {
            self.shared.post(Message::new(
                Address::NONE,
                address,
                SessionId::NONE,
                ProtocolTag::SHUTDOWN,
                "",
                Vec::new(),
            ));
        }
    }

    /// Resolve once no service is left.
    pub async fn wait_all_exited(&self) {
        loop {
            let notified = self.shared.exited.notified();
            if self.shared.services.borrow().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl NodeShared {
    fn now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn post(&self, message: Message) {
        let undelivered = {
            let services = self.services.borrow();
            match services.get(&message.receiver) {
                Some(entry) => entry.inbox.send(message).err().map(|err| err.0),
                None => Some(message),
            }
        };
        if let Some(message) = undelivered {
            self.bounce(message);
        }
    }

    /// Answer a request to a dead address with an error so the caller does
    /// not wait forever. Anything else is dropped.
    fn bounce(&self, message: Message) {
        if message.session >= 0 {
            tracing::debug!(receiver = %message.receiver, sender = %message.sender, "message to dead service dropped");
            return;
        }
        tracing::debug!(receiver = %message.receiver, sender = %message.sender, "request to dead service bounced");
        self.post(Message::new(
            message.receiver,
            message.sender,
            message.reply_session(),
            ProtocolTag::ERROR,
            DEAD_SERVICE,
            message.receiver.to_string().into_bytes(),
        ));
    }

    fn reply_text(&self, receiver: Address, session: SessionId, text: String) {
        if !session.expects_response() {
            return;
        }
        self.post(Message::new(
            Address::NONE,
            receiver,
            session,
            ProtocolTag::TEXT,
            "",
            text.into_bytes(),
        ));
    }

    fn pick_worker(&self, hint: u32) -> u32 {
        if (1..=self.workers).contains(&hint) {
            return hint;
        }
        let next = self.next_worker.get() % self.workers + 1;
        self.next_worker.set(next);
        next
    }

    fn create_service(self: &Rc<Self>, config: ServiceConfig) -> Result<Address> {
        config.validate()?;
        let init = self
            .kinds
            .get(&config.kind)
            .cloned()
            .ok_or_else(|| ServiceError::SpawnFailed(format!("unknown service kind '{}'", config.kind)))?;
        if config.unique && self.names.borrow().contains_key(&config.name) {
            return Err(ServiceError::SpawnFailed(format!(
                "unique service '{}' already exists",
                config.name
            )));
        }

        let address = Address::new(self.next_address.get());
        self.next_address.set(address.as_u32() + 1);
        let worker = self.pick_worker(config.worker_hint);

        let transport = Rc::new(LocalTransport {
            node: Rc::downgrade(self),
            address,
        });
        let ctx = ServiceContext::new(address, config.name.clone(), transport)?;
        let (inbox, rx) = mpsc::unbounded_channel();

        self.services.borrow_mut().insert(
            address,
            ServiceEntry {
                name: config.name.clone(),
                kind: config.kind.clone(),
                worker,
                unique: config.unique,
                inbox,
                ctx: ctx.clone(),
            },
        );
        if config.unique {
            self.names.borrow_mut().insert(config.name.clone(), address);
        }
        tokio::task::spawn_local(message_loop(ctx.clone(), rx));

        tracing::info!(service = %address, name = %config.name, kind = %config.kind, worker, "service created");
        if let Err(err) = ctx.spawn(init(ctx.clone(), config)) {
            tracing::error!(service = %address, %err, "service init failed");
            self.remove_service(address);
            return Err(err);
        }
        Ok(address)
    }

    fn remove_service(&self, address: Address) -> bool {
        let Some(entry) = self.services.borrow_mut().remove(&address) else {
            return false;
        };
        if entry.unique && self.names.borrow().get(&entry.name) == Some(&address) {
            self.names.borrow_mut().remove(&entry.name);
        }
        entry.ctx.teardown();
        tracing::info!(service = %address, name = %entry.name, "service removed");
        drop(entry);

        let others: Vec<Address> = self.services.borrow().keys().copied().collect();
        for other in others {
            self.post(Message::new(
                address,
                other,
                SessionId::NONE,
                ProtocolTag::SYSTEM,
                SERVICE_EXIT,
                format!("service {address} exited").into_bytes(),
            ));
        }
        self.exited.notify_waiters();
        true
    }

    fn describe_worker(&self, worker_id: u32) -> String {
        let services = self.services.borrow();
        let mut listing: Vec<_> = services
            .iter()
            .filter(|(_, entry)| worker_id == 0 || entry.worker == worker_id)
            .map(|(address, entry)| {
                (
                    address.as_u32(),
                    json!({
                        "address": address.as_u32(),
                        "name": entry.name,
                        "kind": entry.kind,
                        "worker": entry.worker,
                    }),
                )
            })
            .collect();
        listing.sort_by_key(|(address, _)| *address);
        let listing: Vec<_> = listing.into_iter().map(|(_, entry)| entry).collect();
        serde_json::Value::Array(listing).to_string()
    }
}

async fn message_loop(ctx: ServiceContext, mut inbox: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = inbox.recv().await {
        if ctx.is_exited() {
            break;
        }
        if let Err(err) = ctx.dispatch(message) {
            tracing::error!(service = %ctx.address(), %err, "dispatch failed");
        }
    }
    tracing::trace!(service = %ctx.address(), "message loop finished");
}

/// Per-service handle into the node.
struct LocalTransport {
    node: Weak<NodeShared>,
    address: Address,
}

impl LocalTransport {
    fn node(&self) -> Result<Rc<NodeShared>> {
        self.node
            .upgrade()
            .ok_or_else(|| ServiceError::Transport("local node dropped".to_string()))
    }
}

impl Transport for LocalTransport {
    fn address(&self) -> Address {
        self.address
    }

    fn now(&self) -> u64 {
        self.node().map(|node| node.now()).unwrap_or_default()
    }

    fn send(
        &self,
        receiver: Address,
        payload: Vec<u8>,
        header: &str,
        session: i32,
        ptype: ProtocolTag,
    ) -> Result<()> {
        self.node()?.post(Message::with_wire_session(
            self.address,
            receiver,
            session,
            ptype,
            header,
            payload,
        ));
        Ok(())
    }

    fn schedule_timer(&self, delay_ms: u64, timer: TimerId) -> Result<()> {
        let node = self.node.clone();
        let owner = self.address;
        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(node) = node.upgrade() {
                node.post(Message::new(
                    Address::new(timer.as_u32()),
                    owner,
                    SessionId::NONE,
                    ProtocolTag::TIMER,
                    "",
                    Vec::new(),
                ));
            }
        });
        Ok(())
    }

    fn spawn_service(
        &self,
        _kind: &str,
        config: &str,
        _unique: bool,
        _worker_hint: u32,
        session: SessionId,
    ) -> Result<()> {
        let node = self.node()?;
        let owner = self.address;
        let config = ServiceConfig::from_json(config);
        tokio::task::spawn_local(async move {
            let address = config
                .and_then(|config| node.create_service(config))
                .unwrap_or_else(|err| {
                    tracing::warn!(requester = %owner, %err, "service creation failed");
                    Address::NONE
                });
            node.reply_text(owner, session, address.as_u32().to_string());
        });
        Ok(())
    }

    fn query_service(&self, name: &str) -> Option<Address> {
        self.node().ok()?.names.borrow().get(name).copied()
    }

    fn kill(&self, address: Address, session: SessionId) -> Result<()> {
        let node = self.node()?;
        let owner = self.address;
        tokio::task::spawn_local(async move {
            let removed = node.remove_service(address);
            let text = if removed {
                format!("service {address} removed")
            } else {
                format!("service {address} not found")
            };
            node.reply_text(owner, session, text);
        });
        Ok(())
    }

    fn scan_services(&self, worker_id: u32, session: SessionId) -> Result<()> {
        let node = self.node()?;
        let owner = self.address;
        tokio::task::spawn_local(async move {
            let listing = node.describe_worker(worker_id);
            node.reply_text(owner, session, listing);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_hint_and_round_robin() {
        let node = LocalNode::builder().workers(3).build().unwrap();
        let shared = &node.shared;
        assert_eq!(shared.pick_worker(2), 2);
        assert_eq!(
            [0, 0, 9, 0].map(|hint| shared.pick_worker(hint)),
            [1, 2, 3, 1]
        );
    }

    #[test]
    fn test_unmatched_fire_and_forget_is_dropped() {
        let node = LocalNode::builder().build().unwrap();
        node.post(Message::new(
            Address::new(1),
            Address::new(2),
            SessionId::NONE,
            ProtocolTag::TEXT,
            "",
            b"nobody home".to_vec(),
        ));
        assert_eq!(node.service_count(), 0);
    }
}
