//! Object command plumbing: packet types, the per-node command dispatch loop,
//!  and the one-shot request registry used by asynchronous commits.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Identifies the handler an object command is dispatched to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommandId(pub u16);

pub const CMD_OBJECT_INSTANCE: CommandId = CommandId(1);
pub const CMD_OBJECT_SLAVE_DELTA: CommandId = CommandId(2);
pub const CMD_OBJECT_COMMIT: CommandId = CommandId(3);
pub const CMD_OBJECT_VERSION: CommandId = CommandId(4);

/// Identifies a node in the session; opaque to the change manager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u64);

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// The object-level packets the change manager produces and consumes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ObjectPacket {
    /// full object state pushed to a new slave
    Instance {
        instance_id: u32,
        version: u32,
        data: Bytes,
    },
    /// one packet of a slave's commit stream
    SlaveDelta {
        instance_id: u32,
        commit_id: u64,
        sequence: u32,
        last: bool,
        data: Bytes,
    },
    /// asynchronous commit request, carried to the master's command loop
    Commit {
        instance_id: u32,
        request_id: u32,
    },
    /// announces a new object version to a subscriber
    Version {
        instance_id: u32,
        version: u32,
    },
}

impl ObjectPacket {
    pub fn command_id(&self) -> CommandId {
        match self {
            ObjectPacket::Instance { .. } => CMD_OBJECT_INSTANCE,
            ObjectPacket::SlaveDelta { .. } => CMD_OBJECT_SLAVE_DELTA,
            ObjectPacket::Commit { .. } => CMD_OBJECT_COMMIT,
            ObjectPacket::Version { .. } => CMD_OBJECT_VERSION,
        }
    }
}

/// One command as delivered to a handler: the packet plus its sender.
#[derive(Clone, Debug)]
pub struct Command {
    pub from: NodeId,
    pub packet: ObjectPacket,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn on_command(&self, command: Command) -> anyhow::Result<()>;
}

/// Maps command ids to handlers. Handlers are held weakly so that a handler
///  owning its node (the usual arrangement) does not form a reference cycle.
pub struct CommandDispatcher {
    handlers: RwLock<FxHashMap<CommandId, Weak<dyn CommandHandler>>>,
}

impl CommandDispatcher {
    pub fn new() -> CommandDispatcher {
        CommandDispatcher {
            handlers: RwLock::new(FxHashMap::default()),
        }
    }

    pub async fn register_command(
        &self,
        id: CommandId,
        handler: &Arc<dyn CommandHandler>,
    ) -> anyhow::Result<()> {
        match self.handlers.write().await.entry(id) {
            Entry::Occupied(_) => {
                Err(anyhow!("a handler is already registered for command {:?}", id))
            }
            Entry::Vacant(e) => {
                e.insert(Arc::downgrade(handler));
                Ok(())
            }
        }
    }

    pub async fn deregister_command(&self, id: CommandId) -> anyhow::Result<()> {
        if self.handlers.write().await.remove(&id).is_none() {
            bail!("deregistering command {:?} that was not registered", id);
        }
        Ok(())
    }

    pub async fn dispatch(&self, command: Command) {
        let id = command.packet.command_id();
        let handler = self.handlers.read().await.get(&id).cloned();

        let Some(handler) = handler.and_then(|weak| weak.upgrade()) else {
            warn!("no handler for command {:?} - dropping", id);
            return;
        };

        trace!("dispatching command {:?} from {:?}", id, command.from);
        if let Err(e) = handler.on_command(command).await {
            warn!("command {:?} failed: {}", id, e);
        }
    }
}

/// One-shot requests registered by a caller and served by the command loop.
pub struct RequestRegistry {
    next_id: AtomicU32,
    senders: Mutex<FxHashMap<u32, oneshot::Sender<u32>>>,
    receivers: Mutex<FxHashMap<u32, oneshot::Receiver<u32>>>,
}

impl RequestRegistry {
    pub fn new() -> RequestRegistry {
        RequestRegistry {
            next_id: AtomicU32::new(1),
            senders: Mutex::new(FxHashMap::default()),
            receivers: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn register(&self) -> u32 {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.senders.lock().unwrap().insert(request_id, tx);
        self.receivers.lock().unwrap().insert(request_id, rx);
        request_id
    }

    /// resolves a registered request; false if the request is unknown
    pub fn serve(&self, request_id: u32, value: u32) -> bool {
        let Some(tx) = self.senders.lock().unwrap().remove(&request_id) else {
            return false;
        };
        tx.send(value).is_ok()
    }

    pub async fn wait(&self, request_id: u32) -> anyhow::Result<u32> {
        let rx = self
            .receivers
            .lock()
            .unwrap()
            .remove(&request_id)
            .ok_or_else(|| anyhow!("request {} was not registered", request_id))?;
        Ok(rx.await?)
    }
}

/// The local node as the change manager sees it: a command loop processing
///  object packets in arrival order, plus the request registry.
pub struct LocalNode {
    node_id: NodeId,
    dispatcher: Arc<CommandDispatcher>,
    requests: RequestRegistry,
    command_tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalNode {
    pub fn spawn(node_id: NodeId) -> Arc<LocalNode> {
        let dispatcher = Arc::new(CommandDispatcher::new());
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Command>();

        let loop_dispatcher = dispatcher.clone();
        let worker = tokio::spawn(async move {
            debug!("command loop for {:?} started", node_id);
            while let Some(command) = command_rx.recv().await {
                loop_dispatcher.dispatch(command).await;
            }
            debug!("command loop for {:?} terminated", node_id);
        });

        Arc::new(LocalNode {
            node_id,
            dispatcher,
            requests: RequestRegistry::new(),
            command_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub async fn register_command(
        &self,
        id: CommandId,
        handler: &Arc<dyn CommandHandler>,
    ) -> anyhow::Result<()> {
        self.dispatcher.register_command(id, handler).await
    }

    /// Hands a command to this node's command loop.
    pub fn deliver(&self, command: Command) -> anyhow::Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| anyhow!("command loop of {:?} is gone", self.node_id))
    }

    pub fn register_request(&self) -> u32 {
        self.requests.register()
    }

    pub fn serve_request(&self, request_id: u32, value: u32) {
        if !self.requests.serve(request_id, value) {
            warn!("served unknown request {}", request_id);
        }
    }

    pub async fn wait_request(&self, request_id: u32) -> anyhow::Result<u32> {
        self.requests.wait(request_id).await
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}
