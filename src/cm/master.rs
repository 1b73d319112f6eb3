//! The master side of object change management.
//!
//! Slave commits arrive as `SlaveDelta` command packets on the local node's
//!  command loop. The change manager reassembles them into input streams keyed
//!  by commit id, queues completed streams in completion order and applies
//!  them to the owning object when the application calls [MasterCm::sync].
//!  Commits of the master's own state are asynchronous: [MasterCm::commit_nb]
//!  registers a one-shot request that the command loop serves with the newly
//!  assigned version.

use crate::cm::command::{
    Command, CommandHandler, NodeId, ObjectPacket, CMD_OBJECT_COMMIT, CMD_OBJECT_INSTANCE,
    CMD_OBJECT_SLAVE_DELTA,
};
use crate::cm::input_stream::InputStream;
use crate::cm::object::MasterObject;
use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub const VERSION_NONE: u32 = 0;

/// Upper bound on commits whose packets are still arriving. A slave exceeding
///  this is misbehaving (or the master is badly overloaded); further commits
///  are rejected with an error rather than buffered without bound.
pub const MAX_PENDING_COMMITS: usize = 100;

/// Which version `sync` advances to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VersionSpec {
    /// apply exactly one queued commit, waiting for it if necessary
    Next,
    /// apply all queued commits without waiting
    Head,
}

/// Subscribers to version announcements, sorted and de-duplicated; the count
///  map tracks multiple subscriptions from the same node.
struct SubscriberList {
    nodes: Vec<NodeId>,
    counts: FxHashMap<NodeId, usize>,
}

impl SubscriberList {
    fn new() -> SubscriberList {
        SubscriberList {
            nodes: Vec::new(),
            counts: FxHashMap::default(),
        }
    }

    fn add(&mut self, node: NodeId) {
        *self.counts.entry(node).or_insert(0) += 1;
        if let Err(index) = self.nodes.binary_search(&node) {
            self.nodes.insert(index, node);
        }
    }
}

pub struct MasterCm {
    object: Arc<dyn MasterObject>,
    version: Mutex<u32>,
    /// commits whose packets are still arriving; command-loop access only
    pending: Mutex<Vec<(u64, InputStream)>>,
    queued_tx: mpsc::UnboundedSender<InputStream>,
    /// completed commits in completion order; consumed by `sync`
    queued_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InputStream>>,
    slaves: Mutex<SubscriberList>,
}

impl MasterCm {
    pub fn new(object: Arc<dyn MasterObject>) -> Arc<MasterCm> {
        let (queued_tx, queued_rx) = mpsc::unbounded_channel();
        Arc::new(MasterCm {
            object,
            version: Mutex::new(VERSION_NONE),
            pending: Mutex::new(Vec::new()),
            queued_tx,
            queued_rx: tokio::sync::Mutex::new(queued_rx),
            slaves: Mutex::new(SubscriberList::new()),
        })
    }

    /// Registers this change manager's command handlers with the local node.
    pub async fn attach(self: &Arc<Self>) -> anyhow::Result<()> {
        let node = self.object.local_node();
        let handler: Arc<dyn CommandHandler> = self.clone();
        node.register_command(CMD_OBJECT_INSTANCE, &handler).await?;
        node.register_command(CMD_OBJECT_SLAVE_DELTA, &handler).await?;
        node.register_command(CMD_OBJECT_COMMIT, &handler).await?;
        Ok(())
    }

    pub fn version(&self) -> u32 {
        *self.version.lock().unwrap()
    }

    /// Starts an asynchronous commit: sends the commit request to the local
    ///  node's command loop and returns the request id to wait on.
    pub async fn commit_nb(&self) -> anyhow::Result<u32> {
        let node = self.object.local_node();
        let request_id = node.register_request();

        self.object
            .send(
                node.node_id(),
                ObjectPacket::Commit {
                    instance_id: self.object.instance_id(),
                    request_id,
                },
            )
            .await?;
        Ok(request_id)
    }

    /// Blocks until the commit behind `request_id` has been processed and
    ///  returns the version it produced.
    pub async fn commit_sync(&self, request_id: u32) -> anyhow::Result<u32> {
        self.object.local_node().wait_request(request_id).await
    }

    /// Applies queued slave commits to the object; see [VersionSpec].
    pub async fn sync(&self, version: VersionSpec) -> anyhow::Result<u32> {
        trace!("sync to {:?}, object {}.{}", version, self.object.object_id(), self.object.instance_id());

        let mut queued_rx = self.queued_rx.lock().await;
        match version {
            VersionSpec::Next => {
                let Some(stream) = queued_rx.recv().await else {
                    bail!("change manager is shut down");
                };
                self.unpack(stream)?;
            }
            VersionSpec::Head => {
                while let Ok(stream) = queued_rx.try_recv() {
                    self.unpack(stream)?;
                }
            }
        }
        Ok(self.version())
    }

    fn unpack(&self, mut stream: InputStream) -> anyhow::Result<()> {
        let commit_id = stream.commit_id();
        self.object.unpack(&mut stream)?;

        if stream.remaining() != 0 || stream.n_remaining_buffers() != 0 {
            bail!(
                "object {} did not unpack all data of commit {}: {} bytes in {} buffers left",
                self.object.object_id(),
                commit_id,
                stream.remaining(),
                stream.n_remaining_buffers()
            );
        }
        Ok(())
    }

    /// On promotion of a new master, the previous master becomes a subscriber
    ///  and is told the current version.
    pub async fn add_old_master(&self, node: NodeId, instance_id: u32) -> anyhow::Result<()> {
        let version = self.version();
        if version == VERSION_NONE {
            bail!("no version to publish yet");
        }

        self.slaves.lock().unwrap().add(node);

        self.object
            .send(node, ObjectPacket::Version { instance_id, version })
            .await
    }

    fn on_slave_delta(&self, commit_id: u64, sequence: u32, last: bool, data: Bytes) -> anyhow::Result<()> {
        let ready = {
            let mut pending = self.pending.lock().unwrap();

            let position = pending.iter().position(|(id, _)| *id == commit_id);
            let position = match position {
                Some(position) => position,
                None => {
                    if pending.len() >= MAX_PENDING_COMMITS {
                        bail!(
                            "more than {} unfinished slave commits - rejecting commit {}",
                            MAX_PENDING_COMMITS,
                            commit_id
                        );
                    }
                    debug!("new incomplete slave commit {}", commit_id);
                    pending.push((commit_id, InputStream::new(commit_id)));
                    pending.len() - 1
                }
            };

            pending[position].1.add_packet(sequence, last, data);

            if pending[position].1.is_ready() {
                let (_, stream) = pending.remove(position);
                Some(stream)
            }
            else {
                None
            }
        };

        if let Some(stream) = ready {
            debug!("queued slave commit {} for object {}", commit_id, self.object.object_id());
            if self.queued_tx.send(stream).is_err() {
                bail!("commit queue is gone");
            }
            self.object.notify_new_version();
        }
        Ok(())
    }

    async fn on_commit(&self, request_id: u32) -> anyhow::Result<()> {
        let version = {
            let mut version = self.version.lock().unwrap();
            *version += 1;
            *version
        };
        debug!("object {} committed version {}", self.object.object_id(), version);

        let subscribers = self.slaves.lock().unwrap().nodes.clone();
        for node in subscribers {
            let packet = ObjectPacket::Version {
                instance_id: self.object.instance_id(),
                version,
            };
            if let Err(e) = self.object.send(node, packet).await {
                warn!("failed to announce version {} to {:?}: {}", version, node, e);
            }
        }

        self.object.local_node().serve_request(request_id, version);
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for MasterCm {
    async fn on_command(&self, command: Command) -> anyhow::Result<()> {
        match command.packet {
            ObjectPacket::Instance { .. } => {
                // instance data is broadcast to all attached instances; the
                //  master discards its own copy
                trace!("discarding instance data at the master");
                Ok(())
            }
            ObjectPacket::SlaveDelta { commit_id, sequence, last, data, .. } => {
                self.on_slave_delta(commit_id, sequence, last, data)
            }
            ObjectPacket::Commit { request_id, .. } => self.on_commit(request_id).await,
            ObjectPacket::Version { .. } => {
                warn!("version announcement addressed at the master - dropping");
                Ok(())
            }
        }
    }
}

impl Drop for MasterCm {
    fn drop(&mut self) {
        let pending = self.pending.lock().unwrap();
        if !pending.is_empty() {
            warn!("{} incomplete slave commits pending at teardown", pending.len());
        }
    }
}
