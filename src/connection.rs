//! The RSM connection: one participant on a multicast group.
//!
//! A connection joins the group with `listen`, discovers its peers, and from
//!  then on is both a writer (its own sequenced stream, delivered reliably to
//!  every peer) and a receiver (one reassembly slot ring per peer, handed out
//!  as child connections by `accept_sync`).
//!
//! Two tasks touch a connection: the caller's task drives `write` / `read_sync`
//!  / `accept_sync` / `close`, and an internal I/O task owns the receive side
//!  of the socket, parses datagrams, maintains membership, fills slots and
//!  feeds retransmission requests to a blocked writer. The I/O task never
//!  surfaces errors to the caller except by closing the connection and waking
//!  every blocked operation.

use crate::config::{EffectiveRsmConfig, RsmConfig};
use crate::datagram::{Datagram, FragmentRange, NodeCommand, DATA_HEADER_LEN};
use crate::pacing::{RateAdapter, SendPacer};
use crate::peer::{random_connection_id, Peer, PeerSet};
use crate::repeat::{merge_ranges, RepeatRequest};
use crate::seq::SequenceId;
use crate::slots::{AckRequestOutcome, FragmentOutcome, ReadOutcome};
use crate::socket::McastSocket;
use crate::stats::ConnectionStats;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, trace, warn};

/// discovery runs in ticks of this length
const DISCOVERY_TICK: Duration = Duration::from_millis(10);
/// quiet ticks after which a discovery phase is considered settled
const DISCOVERY_TIMEOUTS: u32 = 20;

const REPEAT_QUEUE_CAPACITY: usize = 1024;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Listening,
    Connected,
}

struct WriteState {
    sequence_id: SequenceId,
    n_fragments: u16,
    num_acks: usize,
}

/// State shared between the caller-facing handles and the I/O task.
///
/// Lock order, where locks nest: `write` before `peers` before per-peer
///  fields. Slot rings are never held across another lock acquisition.
pub(crate) struct ConnectionInner {
    config: EffectiveRsmConfig,
    socket: Arc<dyn McastSocket>,
    state: Mutex<ConnectionState>,
    self_id: AtomicU16,
    peers: Mutex<PeerSet>,
    accept_wake: Notify,
    /// wakes the I/O task out of an untimed receive so it re-arms the ack
    ///  timeout when a write starts (the self-pipe of the select loop)
    io_interrupt: Notify,
    write: Mutex<WriteState>,
    writing: AtomicBool,
    timeouts: AtomicU32,
    repeat_tx: mpsc::Sender<RepeatRequest>,
    repeat_rx: tokio::sync::Mutex<mpsc::Receiver<RepeatRequest>>,
    pacer: SendPacer,
    adapter: RateAdapter,
    stats: ConnectionStats,
}

/// A participant on an RSM multicast group.
pub struct RsmConnection {
    inner: Arc<ConnectionInner>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RsmConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.io_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl RsmConnection {
    /// Joins the group: acquires a unique connection id, learns the current
    ///  membership and starts the I/O task. On return the connection is
    ///  `Listening` and `accept_sync` will hand out the local child first.
    pub async fn listen(config: RsmConfig, socket: Arc<dyn McastSocket>) -> anyhow::Result<RsmConnection> {
        Self::listen_with_id(config, socket, random_connection_id()).await
    }

    /// Joining an RSM group is symmetric - connecting is listening.
    pub async fn connect(config: RsmConfig, socket: Arc<dyn McastSocket>) -> anyhow::Result<RsmConnection> {
        Self::listen(config, socket).await
    }

    async fn listen_with_id(
        config: RsmConfig,
        socket: Arc<dyn McastSocket>,
        initial_id: u16,
    ) -> anyhow::Result<RsmConnection> {
        config.validate()?;
        let config = config.effective();

        let (repeat_tx, repeat_rx) = mpsc::channel(REPEAT_QUEUE_CAPACITY);
        let inner = Arc::new(ConnectionInner {
            pacer: SendPacer::new(config.bandwidth),
            adapter: RateAdapter::new(
                config.error_base_rate,
                config.error_upscale,
                config.error_downscale,
                config.error_max,
            ),
            config,
            socket,
            state: Mutex::new(ConnectionState::Connecting),
            self_id: AtomicU16::new(initial_id),
            peers: Mutex::new(PeerSet::new()),
            accept_wake: Notify::new(),
            io_interrupt: Notify::new(),
            write: Mutex::new(WriteState {
                sequence_id: SequenceId::ZERO,
                n_fragments: 0,
                num_acks: 0,
            }),
            writing: AtomicBool::new(false),
            timeouts: AtomicU32::new(0),
            repeat_tx,
            repeat_rx: tokio::sync::Mutex::new(repeat_rx),
            stats: ConnectionStats::default(),
        });

        inner.acquire_id().await?;
        inner.learn_peers().await?;

        *inner.state.lock().unwrap() = ConnectionState::Listening;
        info!("listening on the group as {}", inner.id());

        let io_task = tokio::spawn(Self::io_loop(inner.clone()));

        Ok(RsmConnection {
            inner,
            io_task: Mutex::new(Some(io_task)),
        })
    }

    pub fn id(&self) -> u16 {
        self.inner.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// current send rate in bytes per second
    pub fn send_rate(&self) -> u64 {
        self.inner.pacer.send_rate()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.inner.stats
    }

    /// Waits for the next peer on the group and returns a child connection
    ///  for reading its stream. The local node's own stream is handed out
    ///  first - a writer reads its own multicast like everybody else.
    pub async fn accept_sync(&self) -> anyhow::Result<RsmChildConnection> {
        loop {
            if self.inner.state() == ConnectionState::Closed {
                bail!("connection is closed");
            }

            let peer = self.inner.peers.lock().unwrap().next_unaccepted();
            if let Some(peer) = peer {
                info!("accepted peer {}", peer.id());
                self.inner.send_count().await;
                return Ok(RsmChildConnection {
                    peer,
                    parent: Arc::downgrade(&self.inner),
                });
            }

            self.inner.accept_wake.notified().await;
        }
    }

    /// Writes one sequence to the group. Blocks until every peer has
    ///  acknowledged it or the timeout budget is exhausted (in which case the
    ///  connection is closed and an error returned). At most
    ///  `payload_size * ack_frequency` bytes are consumed per call.
    pub async fn write(&self, buf: &[u8]) -> anyhow::Result<usize> {
        self.inner.write(buf).await
    }

    /// Closes the connection: announces the exit on the group, stops the I/O
    ///  task and wakes every blocked reader / acceptor / writer.
    pub async fn close(&self) {
        if !self.inner.transition_closed() {
            return;
        }

        let exit = Datagram::Node {
            command: NodeCommand::Exit,
            connection_id: self.inner.id(),
        };
        self.inner.send_datagram(&exit).await;

        let handle = self.io_task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        self.inner.wake_all();
        debug!("closed connection {}: {:?}", self.inner.id(), self.inner.stats);
    }

    async fn io_loop(inner: Arc<ConnectionInner>) {
        debug!("started I/O loop for connection {}", inner.id());
        let mut buf = vec![0u8; inner.config.mtu];

        while inner.state() != ConnectionState::Closed {
            let received = if inner.writing.load(Ordering::Acquire) {
                match timeout(inner.config.ack_timeout, inner.socket.recv_datagram(&mut buf)).await {
                    Ok(received) => received,
                    Err(_elapsed) => {
                        // the write may just have completed - only a timeout
                        //  during a write counts against the budget
                        if !inner.writing.load(Ordering::Acquire) || inner.on_ack_timeout() {
                            continue;
                        }
                        break;
                    }
                }
            }
            else {
                tokio::select! {
                    received = inner.socket.recv_datagram(&mut buf) => received,
                    _ = inner.io_interrupt.notified() => continue,
                }
            };

            let num_read = match received {
                Ok(num_read) => num_read,
                Err(e) => {
                    error!("socket error: {}", e);
                    inner.fail("socket error");
                    break;
                }
            };

            match Datagram::deser(&mut &buf[..num_read]) {
                Ok(datagram) => inner.on_datagram(datagram).await,
                Err(e) => warn!("received unparseable datagram - dropping: {}", e),
            }
        }

        debug!("I/O loop for connection {} terminated", inner.id());
    }
}

/// A peer's stream, handed out by [RsmConnection::accept_sync]. Reading
///  consumes the peer's reassembled sequences in write order. The parent link
///  is non-owning; writes delegate to the parent connection.
pub struct RsmChildConnection {
    peer: Arc<Peer>,
    parent: Weak<ConnectionInner>,
}

impl RsmChildConnection {
    pub fn id(&self) -> u16 {
        self.peer.id()
    }

    /// Reads from this peer's stream, blocking until data is available.
    ///  Returns 0 when the connection is closed.
    pub async fn read_sync(&self, buf: &mut [u8]) -> usize {
        loop {
            let outcome = self.peer.ring.lock().unwrap().read(buf);
            match outcome {
                ReadOutcome::Closed => return 0,
                ReadOutcome::Read { n, next_ready, .. } => {
                    if next_ready {
                        // the next sequence is already waiting - re-arm the reader
                        self.peer.wake.notify_one();
                    }
                    if let Some(parent) = self.parent.upgrade() {
                        ConnectionStats::count(&parent.stats.bytes_read, n as u64);
                    }
                    return n;
                }
                ReadOutcome::NotReady => self.peer.wake.notified().await,
            }
        }
    }

    /// Writing through a child writes the parent's own stream.
    pub async fn write(&self, buf: &[u8]) -> anyhow::Result<usize> {
        let Some(parent) = self.parent.upgrade() else {
            bail!("parent connection is gone");
        };
        parent.write(buf).await
    }
}

impl ConnectionInner {
    fn id(&self) -> u16 {
        self.self_id.load(Ordering::Relaxed)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn transition_closed(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        true
    }

    fn wake_all(&self) {
        for peer in self.peers.lock().unwrap().iter() {
            peer.close();
        }
        self.accept_wake.notify_one();
        self.push_done();
    }

    fn fail(&self, reason: &str) {
        error!("fatal: {} - closing connection {}", reason, self.id());
        if self.transition_closed() {
            self.wake_all();
        }
    }

    fn push_done(&self) {
        if self.repeat_tx.try_send(RepeatRequest::Done).is_err() {
            // the queue is full of stale requests - DONE must still arrive
            let tx = self.repeat_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(RepeatRequest::Done).await;
            });
        }
    }

    fn push_repeat(&self, request: RepeatRequest) {
        if self.repeat_tx.try_send(request).is_err() {
            warn!("repeat queue full - dropping {:?}", request);
        }
    }

    // ------------------------------------------------------------------
    // discovery
    // ------------------------------------------------------------------

    /// Discovery phase A: announce a random id until nobody has denied it for
    ///  [DISCOVERY_TIMEOUTS] consecutive ticks, then confirm it.
    async fn acquire_id(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.config.mtu];

        debug!("announcing id {}", self.id());
        self.send_node(NodeCommand::Hello, self.id()).await;

        let mut timeouts = 0u32;
        loop {
            match timeout(DISCOVERY_TICK, self.socket.recv_datagram(&mut buf)).await {
                Err(_elapsed) => {
                    timeouts += 1;
                    if timeouts < DISCOVERY_TIMEOUTS {
                        trace!("announcing id {}", self.id());
                        self.send_node(NodeCommand::Hello, self.id()).await;
                    }
                    else {
                        info!("confirming id {}", self.id());
                        self.send_node(NodeCommand::Confirm, self.id()).await;
                        self.add_peer(self.id()).await;
                        return Ok(());
                    }
                }
                Ok(Err(e)) => bail!("socket error during discovery: {}", e),
                Ok(Ok(num_read)) => match Datagram::deser(&mut &buf[..num_read]) {
                    Ok(Datagram::Node { command: NodeCommand::Hello, connection_id }) => {
                        self.check_new_id(connection_id).await;
                    }
                    Ok(Datagram::Node { command: NodeCommand::Deny, connection_id }) => {
                        if connection_id == self.id() {
                            // our candidate id is taken - try another one
                            timeouts = 0;
                            self.self_id.store(random_connection_id(), Ordering::Relaxed);
                            debug!("id denied, announcing new id {}", self.id());
                            self.send_node(NodeCommand::Hello, self.id()).await;
                        }
                    }
                    Ok(Datagram::Node { command: NodeCommand::Exit, connection_id }) => {
                        self.remove_peer(connection_id).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("unparseable datagram during discovery - dropping: {}", e),
                },
            }
        }
    }

    /// Discovery phase B: exchange membership counts until the view is stable
    ///  for [DISCOVERY_TIMEOUTS] consecutive ticks. A count that matches our
    ///  own child set saturates the counter - that is the convergence signal.
    async fn learn_peers(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.config.mtu];

        self.send_count().await;

        let mut timeouts = 0u32;
        loop {
            match timeout(DISCOVERY_TICK, self.socket.recv_datagram(&mut buf)).await {
                Err(_elapsed) => {
                    timeouts += 1;
                    if timeouts >= DISCOVERY_TIMEOUTS {
                        debug!("discovery complete, {} peers", self.peers.lock().unwrap().len());
                        return Ok(());
                    }
                    self.send_count().await;
                }
                Ok(Err(e)) => bail!("socket error during discovery: {}", e),
                Ok(Ok(num_read)) => match Datagram::deser(&mut &buf[..num_read]) {
                    Ok(Datagram::Node { command: NodeCommand::Hello, connection_id }) => {
                        timeouts = 0;
                        self.check_new_id(connection_id).await;
                    }
                    Ok(Datagram::Node { command: NodeCommand::Confirm, connection_id }) => {
                        timeouts = 0;
                        self.add_peer(connection_id).await;
                    }
                    Ok(Datagram::Node { command: NodeCommand::Exit, connection_id }) => {
                        self.remove_peer(connection_id).await;
                    }
                    Ok(Datagram::Count { connection_id, n_children }) => {
                        if self.on_count(connection_id, n_children).await {
                            timeouts = DISCOVERY_TIMEOUTS;
                        }
                        else {
                            timeouts = 0;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("unparseable datagram during discovery - dropping: {}", e),
                },
            }
        }
    }

    /// Deny a hello that collides with our id or a known peer's.
    async fn check_new_id(&self, id: u16) {
        let collides = id == self.id() || self.peers.lock().unwrap().contains(id);
        if collides {
            debug!("denying id {}", id);
            self.send_node(NodeCommand::Deny, id).await;
        }
    }

    async fn add_peer(&self, id: u16) {
        let added = {
            let mut peers = self.peers.lock().unwrap();
            peers.add(Arc::new(Peer::new(id, &self.config)))
        };
        if added {
            self.accept_wake.notify_one();
            self.send_count().await;
        }
    }

    async fn remove_peer(&self, id: u16) {
        let removed = self.peers.lock().unwrap().remove(id);
        if let Some(peer) = removed {
            peer.close();
            self.send_count().await;
        }
    }

    /// returns true if the reported count matches our own child set
    async fn on_count(&self, connection_id: u16, n_children: u32) -> bool {
        trace!("peer {} reports {} children", connection_id, n_children);

        let known = {
            let peers = self.peers.lock().unwrap();
            if peers.len() == n_children as usize {
                return true;
            }
            peers.contains(connection_id)
        };
        if !known {
            self.add_peer(connection_id).await;
        }
        false
    }

    // ------------------------------------------------------------------
    // datagram handling (I/O task; the writing task re-enters for
    // self-delivery)
    // ------------------------------------------------------------------

    async fn on_datagram(&self, datagram: Datagram) {
        match datagram {
            Datagram::Data { writer_id, sequence_id, fragment_index, payload } => {
                self.on_data(writer_id, sequence_id, fragment_index, &payload).await;
            }
            Datagram::Ack { reader_id, writer_id, sequence_id } => {
                self.on_ack(reader_id, writer_id, sequence_id);
            }
            Datagram::Nack { reader_id, writer_id, sequence_id, ranges } => {
                self.on_nack(reader_id, writer_id, sequence_id, ranges);
            }
            Datagram::AckReq { writer_id, last_fragment, sequence_id } => {
                self.on_ack_request(writer_id, last_fragment, sequence_id).await;
            }
            Datagram::Node { command: NodeCommand::Hello, connection_id } => {
                self.check_new_id(connection_id).await;
            }
            Datagram::Node { command: NodeCommand::Confirm, connection_id } => {
                self.add_peer(connection_id).await;
            }
            Datagram::Node { command: NodeCommand::Exit, connection_id } => {
                self.remove_peer(connection_id).await;
            }
            Datagram::Node { command: NodeCommand::Deny, .. } => {
                // only meaningful while acquiring an id
            }
            Datagram::Count { connection_id, n_children } => {
                self.on_count(connection_id, n_children).await;
            }
        }
    }

    async fn on_data(&self, writer_id: u16, sequence_id: SequenceId, fragment_index: u16, payload: &[u8]) {
        let peer = self.peers.lock().unwrap().find(writer_id);
        let Some(peer) = peer else {
            warn!("DATA from unknown writer {} - dropping", writer_id);
            return;
        };

        let last_acked = *peer.last_sequence_acked.lock().unwrap();
        let outcome = peer.ring.lock().unwrap().on_fragment(sequence_id, fragment_index, payload, last_acked);

        match outcome {
            FragmentOutcome::Stored { early_nack: Some(range) } => {
                debug!("gap before fragment {} of {} from {} - early NACK {:?}", fragment_index, sequence_id, writer_id, range);
                self.send_nack(writer_id, sequence_id, vec![range]).await;
            }
            FragmentOutcome::Stored { early_nack: None } => {}
            FragmentOutcome::Ignored | FragmentOutcome::NoSlot => {
                trace!("dropped fragment {} of {} from {}: {:?}", fragment_index, sequence_id, writer_id, outcome);
            }
        }
    }

    async fn on_ack_request(&self, writer_id: u16, last_fragment: u16, sequence_id: SequenceId) {
        trace!("ACK request from {} for {}", writer_id, sequence_id);

        let peer = self.peers.lock().unwrap().find(writer_id);
        let Some(peer) = peer else {
            warn!("ACK request from unknown writer {} - dropping", writer_id);
            return;
        };

        let outcome = peer.ring.lock().unwrap().on_ack_request(
            sequence_id,
            last_fragment,
            self.config.max_nack_ranges,
        );

        match outcome {
            AckRequestOutcome::Behind => {
                // we have nothing of this sequence - ask for all of it
                debug!("behind writer {}: requesting all of {}", writer_id, sequence_id);
                self.send_nack(writer_id, sequence_id, vec![FragmentRange::new(0, last_fragment)]).await;
            }
            AckRequestOutcome::AlreadyAcked => {
                trace!("repeating ACK for {} to {}", sequence_id, writer_id);
                self.send_ack(writer_id, sequence_id).await;
            }
            AckRequestOutcome::Missing(ranges) => {
                debug!("missing fragments of {} from {}: {:?}", sequence_id, writer_id, ranges);
                self.send_nack(writer_id, sequence_id, ranges).await;
            }
            AckRequestOutcome::Completed => {
                *peer.last_sequence_acked.lock().unwrap() = Some(sequence_id);
                // the slot became readable - wake the reader exactly once
                peer.wake.notify_one();
                trace!("sequence {} from {} complete - ACK", sequence_id, writer_id);
                self.send_ack(writer_id, sequence_id).await;
            }
        }
    }

    fn on_ack(&self, reader_id: u16, writer_id: u16, sequence_id: SequenceId) {
        ConnectionStats::count(&self.stats.acks_read, 1);

        if writer_id != self.id() || !self.writing.load(Ordering::Acquire) {
            trace!("ignoring ACK for writer {} sequence {}", writer_id, sequence_id);
            return;
        }

        let all_acked = {
            let mut write = self.write.lock().unwrap();
            if sequence_id != write.sequence_id {
                trace!("ignoring ACK for stale sequence {}", sequence_id);
                return;
            }

            let peers = self.peers.lock().unwrap();
            let Some(peer) = peers.find(reader_id) else {
                warn!("ACK from unknown reader {} - dropping", reader_id);
                return;
            };

            let mut ack_received = peer.ack_received.lock().unwrap();
            if *ack_received == Some(sequence_id) {
                return;
            }
            *ack_received = Some(sequence_id);

            write.num_acks += 1;
            self.timeouts.store(0, Ordering::Relaxed);
            ConnectionStats::count(&self.stats.acks_accepted, 1);
            trace!("ACK {}/{} for sequence {}", write.num_acks, peers.len(), sequence_id);

            write.num_acks == peers.len()
        };

        if all_acked {
            debug!("all peers acknowledged sequence {} - unblocking writer", sequence_id);
            self.push_done();
        }
    }

    fn on_nack(&self, reader_id: u16, writer_id: u16, sequence_id: SequenceId, ranges: Vec<FragmentRange>) {
        ConnectionStats::count(&self.stats.nacks_read, ranges.len() as u64);

        if writer_id != self.id() || !self.writing.load(Ordering::Acquire) {
            trace!("ignoring NACK for writer {}", writer_id);
            return;
        }

        let n_fragments = {
            let write = self.write.lock().unwrap();
            if sequence_id != write.sequence_id {
                trace!("ignoring NACK for stale sequence {}", sequence_id);
                return;
            }

            let peers = self.peers.lock().unwrap();
            if let Some(peer) = peers.find(reader_id) {
                if *peer.ack_received.lock().unwrap() == Some(sequence_id) {
                    trace!("ignoring NACK from {} - it already acknowledged", reader_id);
                    return;
                }
            }
            write.n_fragments
        };

        self.timeouts.store(0, Ordering::Relaxed);

        for range in ranges {
            if range.end >= n_fragments {
                warn!("NACK range {:?} beyond the {} fragments of {} - dropping", range, n_fragments, sequence_id);
                continue;
            }
            self.push_repeat(RepeatRequest::Nack(range));
        }
    }

    /// consecutive ack timeout while a write is in flight; false means the
    ///  budget is exhausted and the connection is gone
    fn on_ack_timeout(&self) -> bool {
        let timeouts = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionStats::count(&self.stats.write_timeouts, 1);

        if timeouts >= self.config.max_timeouts {
            self.fail("too many ack timeouts during write");
            return false;
        }

        trace!("ack timeout {}/{}", timeouts, self.config.max_timeouts);
        self.push_repeat(RepeatRequest::AckReq);
        true
    }

    // ------------------------------------------------------------------
    // writing
    // ------------------------------------------------------------------

    async fn write(&self, buf: &[u8]) -> anyhow::Result<usize> {
        match self.state() {
            ConnectionState::Listening | ConnectionState::Connected => {}
            state => bail!("cannot write in state {:?}", state),
        }

        // serializes concurrent writers and gives this write the repeat queue
        let mut repeat_rx = self.repeat_rx.lock().await;

        // discard stragglers from the previous sequence
        while repeat_rx.try_recv().is_ok() {}

        let size = buf.len().min(self.config.buffer_size);
        let data = &buf[..size];
        let n_fragments = (size.div_ceil(self.config.payload_size).max(1)) as u16;

        let sequence_id = {
            let mut write = self.write.lock().unwrap();
            write.sequence_id = write.sequence_id.next();
            write.n_fragments = n_fragments;
            write.num_acks = 0;
            write.sequence_id
        };
        self.timeouts.store(0, Ordering::Relaxed);
        self.writing.store(true, Ordering::Release);
        self.io_interrupt.notify_one();

        debug!("write sequence {}: {} bytes in {} fragments", sequence_id, size, n_fragments);

        for index in 0..n_fragments {
            self.send_fragment(data, sequence_id, index, false).await;
        }
        self.send_ack_request(sequence_id, n_fragments).await;

        let result = self.handle_repeats(&mut repeat_rx, data, sequence_id, n_fragments).await;
        self.writing.store(false, Ordering::Release);

        let total_repeats = result?;
        self.adapt_rate(total_repeats, n_fragments as u64);
        ConnectionStats::count(&self.stats.bytes_written, size as u64);

        trace!("wrote sequence {}", sequence_id);
        Ok(size)
    }

    /// The retransmission loop of a blocked write: coalesce NACKs, merge their
    ///  ranges, repeat the fragments, re-request the ack - until every peer
    ///  has acknowledged or the connection failed.
    async fn handle_repeats(
        &self,
        repeat_rx: &mut mpsc::Receiver<RepeatRequest>,
        data: &[u8],
        sequence_id: SequenceId,
        n_fragments: u16,
    ) -> anyhow::Result<u64> {
        let mut total_repeats = 0u64;

        loop {
            // wait for the first request of a round
            let first = loop {
                match repeat_rx.recv().await {
                    None => bail!("write of sequence {} aborted: connection closed", sequence_id),
                    Some(RepeatRequest::Done) => return self.check_write_done(sequence_id, total_repeats),
                    Some(RepeatRequest::AckReq) => self.send_ack_request(sequence_id, n_fragments).await,
                    Some(RepeatRequest::Nack(range)) => break range,
                }
            };

            // let NACKs from other receivers coalesce into this round
            if !self.config.nack_delay.is_zero() {
                sleep(self.config.nack_delay).await;
            }

            let mut ranges = vec![first];
            loop {
                match repeat_rx.try_recv() {
                    Ok(RepeatRequest::Done) => return self.check_write_done(sequence_id, total_repeats),
                    Ok(RepeatRequest::AckReq) => {} // one is re-sent below anyway
                    Ok(RepeatRequest::Nack(range)) => ranges.push(range),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        bail!("write of sequence {} aborted: connection closed", sequence_id)
                    }
                }
            }

            let merged = merge_ranges(ranges);
            let errors: u64 = merged.iter().map(|r| r.num_fragments()).sum();
            total_repeats += errors;
            self.adapt_rate(errors, n_fragments as u64);

            debug!("repeating {:?} of sequence {}", merged, sequence_id);
            for range in &merged {
                for index in range.start..=range.end.min(n_fragments - 1) {
                    self.send_fragment(data, sequence_id, index, true).await;
                }
            }

            if repeat_rx.is_empty() {
                self.send_ack_request(sequence_id, n_fragments).await;
            }
        }
    }

    fn check_write_done(&self, sequence_id: SequenceId, total_repeats: u64) -> anyhow::Result<u64> {
        if self.state() == ConnectionState::Closed {
            bail!("write of sequence {} failed: connection closed", sequence_id);
        }
        Ok(total_repeats)
    }

    fn adapt_rate(&self, errors: u64, n_fragments: u64) {
        let delta = self.adapter.delta_percent(errors, n_fragments);
        self.pacer.adapt_send_rate(delta);
    }

    // ------------------------------------------------------------------
    // sending
    // ------------------------------------------------------------------

    async fn send_datagram(&self, datagram: &Datagram) {
        let mut buf = BytesMut::with_capacity(self.config.mtu);
        datagram.ser(&mut buf);
        self.socket.send_datagram(&buf).await;
    }

    async fn send_node(&self, command: NodeCommand, connection_id: u16) {
        self.send_datagram(&Datagram::Node { command, connection_id }).await;
    }

    /// Announce our child count - only meaningful once we are a member of our
    ///  own child set.
    async fn send_count(&self) {
        let n_children = {
            let peers = self.peers.lock().unwrap();
            if !peers.contains(self.id()) {
                return;
            }
            peers.len() as u32
        };
        self.send_datagram(&Datagram::Count { connection_id: self.id(), n_children }).await;
    }

    async fn send_fragment(&self, data: &[u8], sequence_id: SequenceId, index: u16, repeat: bool) {
        let pos = index as usize * self.config.payload_size;
        let end = (pos + self.config.payload_size).min(data.len());

        // self-delivery: the local reader runs the same slot state machine as
        //  every remote receiver
        self.on_data(self.id(), sequence_id, index, &data[pos..end]).await;

        let datagram = Datagram::Data {
            writer_id: self.id(),
            sequence_id,
            fragment_index: index,
            payload: Bytes::copy_from_slice(&data[pos..end]),
        };

        self.pacer.wait_writable(DATA_HEADER_LEN + (end - pos)).await;
        self.send_datagram(&datagram).await;

        if repeat {
            ConnectionStats::count(&self.stats.datagrams_repeated, 1);
        }
        else {
            ConnectionStats::count(&self.stats.datagrams_sent, 1);
        }
    }

    async fn send_ack_request(&self, sequence_id: SequenceId, n_fragments: u16) {
        ConnectionStats::count(&self.stats.ack_requests_sent, 1);

        self.on_ack_request(self.id(), n_fragments - 1, sequence_id).await;

        self.send_datagram(&Datagram::AckReq {
            writer_id: self.id(),
            last_fragment: n_fragments - 1,
            sequence_id,
        })
        .await;
    }

    async fn send_ack(&self, writer_id: u16, sequence_id: SequenceId) {
        if writer_id == self.id() {
            // our own ACK never needs the wire
            self.on_ack(self.id(), writer_id, sequence_id);
            return;
        }
        self.send_datagram(&Datagram::Ack {
            reader_id: self.id(),
            writer_id,
            sequence_id,
        })
        .await;
    }

    async fn send_nack(&self, writer_id: u16, sequence_id: SequenceId, ranges: Vec<FragmentRange>) {
        ConnectionStats::count(&self.stats.nacks_sent, 1);

        if writer_id == self.id() {
            // shortcut: we are the writer - queue the repeats directly
            for range in ranges {
                self.push_repeat(RepeatRequest::Nack(range));
            }
            return;
        }

        match Datagram::nack(self.id(), writer_id, sequence_id, ranges, self.config.mtu) {
            Ok(datagram) => self.send_datagram(&datagram).await,
            Err(e) => warn!("not sending NACK: {}", e),
        }
    }
}
