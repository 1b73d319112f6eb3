use crate::cm::command::{LocalNode, NodeId, ObjectPacket};
use crate::cm::input_stream::InputStream;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

/// The seam between the change manager and the object layer above it. These
///  are the only calls the change manager makes back into its owning object.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MasterObject: Send + Sync + 'static {
    /// the object's session-wide identifier
    fn object_id(&self) -> u32;

    /// distinguishes instances of the same object on different nodes
    fn instance_id(&self) -> u32;

    fn local_node(&self) -> Arc<LocalNode>;

    /// Deserializes one queued commit into the object. The object must
    ///  consume the stream completely.
    fn unpack(&self, stream: &mut InputStream) -> anyhow::Result<()>;

    /// A completed slave commit was queued; the application may want to sync.
    fn notify_new_version(&self);

    /// Sends an object packet to a node in the session.
    async fn send(&self, to: NodeId, packet: ObjectPacket) -> anyhow::Result<()>;
}
