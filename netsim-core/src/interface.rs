//! Endpoints of the virtual point-to-point wires between nodes.
//!
//! An [`Interface`] belongs to one [`Node`] and is connected to at most one
//! peer interface on another (or the same) node. Sending on an interface
//! serializes the message and queues the frame on the peer; receiving takes
//! the next frame off the interface's own queue.
//!
//! Connecting and disconnecting must update two independently owned
//! interfaces at once. Both operations go through a short-lived `Wire` that
//! always locks the interface with the lower creation id first, so two
//! concurrent operations on overlapping pairs can never wait on each other in
//! a cycle.

use crate::{
    message::MessageError,
    node::{Node, NodeStatus},
    simulator::SimId,
    Address, Message,
};
use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    time::{timeout_at, Instant},
};

static NEXT_INTERFACE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WIRE_ID: AtomicU64 = AtomicU64::new(1);

/// A process-wide, monotonically increasing creation sequence number.
/// Interfaces are locked in ascending id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(u64);

impl InterfaceId {
    fn next() -> Self {
        Self(NEXT_INTERFACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for InterfaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WireId(u64);

impl WireId {
    fn next() -> Self {
        Self(NEXT_WIRE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A serialized message, stamped with the wire it travelled over.
struct Frame {
    wire: WireId,
    bytes: Vec<u8>,
}

/// The connection state of an interface. Present only while connected.
#[derive(Debug)]
struct Link {
    wire: WireId,
    peer: Weak<Interface>,
}

/// One endpoint of a virtual wire on a node.
pub struct Interface {
    id: InterfaceId,
    index: usize,
    sim: SimId,
    node_address: Address,
    node: Weak<Node>,
    status: Arc<NodeStatus>,
    link: Mutex<Option<Link>>,
    /// Peers push frames here
    inbound: mpsc::UnboundedSender<Frame>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    queued: AtomicUsize,
}

impl Interface {
    pub(crate) fn new(
        index: usize,
        sim: SimId,
        node_address: Address,
        node: Weak<Node>,
        status: Arc<NodeStatus>,
    ) -> Self {
        let (inbound, inbox) = mpsc::unbounded_channel();
        Self {
            id: InterfaceId::next(),
            index,
            sim,
            node_address,
            node,
            status,
            link: Mutex::new(None),
            inbound,
            inbox: tokio::sync::Mutex::new(inbox),
            queued: AtomicUsize::new(0),
        }
    }

    /// The creation sequence number of the interface.
    pub fn id(&self) -> InterfaceId {
        self.id
    }

    /// The index of the interface within its node. It is guaranteed that
    /// `node.interfaces()[iface.index()]` is `iface`.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The address of the node owning the interface.
    pub fn node_address(&self) -> Address {
        self.node_address
    }

    /// The node owning the interface, unless it has been dropped.
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.upgrade()
    }

    pub(crate) fn sim(&self) -> SimId {
        self.sim
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().unwrap().is_some()
    }

    /// The interface on the other end of the wire.
    pub fn peer(&self) -> Option<Arc<Interface>> {
        self.connection().map(|(_, peer)| peer)
    }

    /// The number of frames waiting to be received.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn connection(&self) -> Option<(WireId, Arc<Interface>)> {
        let link = self.link.lock().unwrap();
        let link = link.as_ref()?;
        Some((link.wire, link.peer.upgrade()?))
    }

    fn check_running(&self) -> Result<(), InterfaceError> {
        if self.status.is_running() {
            Ok(())
        } else {
            Err(InterfaceError::NotRunning(self.node_address))
        }
    }

    /// Sends a message to the peer. Never blocks: the peer's queue is
    /// unbounded.
    pub fn send(&self, message: &Message) -> Result<(), InterfaceError> {
        self.check_running()?;
        let (wire, peer) = self.connection().ok_or(InterfaceError::Disconnected)?;
        let bytes = message.to_bytes().map_err(|e| {
            tracing::error!("Failed to serialize {}: {}", message, e);
            e
        })?;
        peer.enqueue(Frame { wire, bytes })
    }

    fn enqueue(&self, frame: Frame) -> Result<(), InterfaceError> {
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.inbound.send(frame).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            InterfaceError::Disconnected
        })
    }

    /// Receives the next message, waiting at most `timeout` if one is given.
    /// Returns `Ok(None)` on timeout.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    pub async fn receive(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, InterfaceError> {
        self.check_running()?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut inbox = match deadline {
            Some(deadline) => match timeout_at(deadline, self.inbox.lock()).await {
                Ok(inbox) => inbox,
                Err(_) => return Ok(None),
            },
            None => self.inbox.lock().await,
        };
        loop {
            let frame = match deadline {
                Some(deadline) => match timeout_at(deadline, inbox.recv()).await {
                    Ok(frame) => frame,
                    Err(_) => return Ok(None),
                },
                None => inbox.recv().await,
            };
            // The interface holds a sender itself, so the channel never closes
            let Some(frame) = frame else {
                return Err(InterfaceError::Disconnected);
            };
            if let Some(message) = self.accept(frame)? {
                return Ok(Some(message));
            }
        }
    }

    /// Receives the next message if one is already queued.
    pub fn try_receive(&self) -> Result<Option<Message>, InterfaceError> {
        self.check_running()?;
        // Someone else is waiting on the queue; they get the next message
        let Ok(mut inbox) = self.inbox.try_lock() else {
            return Ok(None);
        };
        loop {
            match inbox.try_recv() {
                Ok(frame) => {
                    if let Some(message) = self.accept(frame)? {
                        return Ok(Some(message));
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(None),
            }
        }
    }

    /// Decodes a dequeued frame, discarding frames from an earlier
    /// connection.
    fn accept(&self, frame: Frame) -> Result<Option<Message>, InterfaceError> {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        let current = self.link.lock().unwrap().as_ref().map(|link| link.wire);
        if current != Some(frame.wire) {
            tracing::trace!("{}: dropping a frame from a previous connection", self);
            return Ok(None);
        }
        match Message::from_bytes(&frame.bytes) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                tracing::error!("{}: received a corrupt frame: {}", self, e);
                Err(e.into())
            }
        }
    }

    /// Throws away whatever is queued, unless a receiver is waiting on the
    /// queue; frames it sees later are stale and get discarded then.
    fn drain(&self) {
        if let Ok(mut inbox) = self.inbox.try_lock() {
            while inbox.try_recv().is_ok() {
                self.queued.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Connects this interface to `other`.
    pub(crate) fn connect(self: &Arc<Self>, other: &Arc<Self>) -> Result<(), WireError> {
        Wire::new(WireId::next(), self.clone(), other.clone()).connect()
    }

    /// Disconnects this interface and its peer.
    pub(crate) fn disconnect(self: &Arc<Self>) -> Result<(), WireError> {
        let (wire, peer) = {
            let link = self.link.lock().unwrap();
            let link = link.as_ref().ok_or(WireError::NotConnected)?;
            (link.wire, link.peer.upgrade())
        };
        match peer {
            Some(peer) => Wire::new(wire, self.clone(), peer).disconnect(),
            None => {
                // The peer's node is gone entirely; only our half is left
                let mut link = self.link.lock().unwrap();
                match link.as_ref() {
                    Some(current) if current.wire == wire => *link = None,
                    _ => return Err(WireError::NotConnectedToThisWire),
                }
                drop(link);
                self.drain();
                if let Some(node) = self.node() {
                    node.disconnected(self);
                }
                Ok(())
            }
        }
    }
}

impl Display for Interface {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Interface {:x}/{}", self.node_address, self.index)?;
        match self.peer() {
            Some(peer) => write!(f, " -> {:x}/{}", peer.node_address, peer.index),
            None => f.write_str(" (disconnected)"),
        }
    }
}

impl Debug for Interface {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("node_address", &self.node_address)
            .field("link", &self.link)
            .field("queued", &self.queued)
            .finish()
    }
}

/// Unites exactly two interfaces while they are connected or disconnected.
/// The interfaces are kept in lock order: `left` has the lower id.
struct Wire {
    id: WireId,
    left: Arc<Interface>,
    right: Arc<Interface>,
}

impl Wire {
    fn new(id: WireId, a: Arc<Interface>, b: Arc<Interface>) -> Self {
        let (left, right) = if a.id <= b.id { (a, b) } else { (b, a) };
        Self { id, left, right }
    }

    fn connect(self) -> Result<(), WireError> {
        if self.left.id == self.right.id {
            return Err(WireError::Loopback);
        }
        {
            let mut left = self.left.link.lock().unwrap();
            let mut right = self.right.link.lock().unwrap();
            // Checked under the locks so a node that starts shutting down
            // either sees this connection or refuses it
            for side in [&self.left, &self.right] {
                if side.status.is_shutting_down() {
                    return Err(WireError::NodeShuttingDown(side.node_address));
                }
            }
            if left.is_some() || right.is_some() {
                return Err(WireError::AlreadyConnected);
            }
            *left = Some(Link {
                wire: self.id,
                peer: Arc::downgrade(&self.right),
            });
            *right = Some(Link {
                wire: self.id,
                peer: Arc::downgrade(&self.left),
            });
        }
        tracing::debug!("Connected {} and {}", self.left, self.right);
        for side in [&self.left, &self.right] {
            if let Some(node) = side.node() {
                node.connected(side);
            }
        }
        Ok(())
    }

    fn disconnect(self) -> Result<(), WireError> {
        {
            let mut left = self.left.link.lock().unwrap();
            let mut right = self.right.link.lock().unwrap();
            let on_this_wire =
                |link: &Option<Link>| link.as_ref().map(|link| link.wire) == Some(self.id);
            if !on_this_wire(&left) || !on_this_wire(&right) {
                return Err(WireError::NotConnectedToThisWire);
            }
            *left = None;
            *right = None;
        }
        tracing::debug!(
            "Disconnected {:x}/{} and {:x}/{}",
            self.left.node_address,
            self.left.index,
            self.right.node_address,
            self.right.index
        );
        for side in [&self.left, &self.right] {
            side.drain();
            if let Some(node) = side.node() {
                node.disconnected(side);
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("Interface is disconnected")]
    Disconnected,
    #[error("Node {0:x} is not running")]
    NotRunning(Address),
    #[error(transparent)]
    Codec(#[from] MessageError),
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("Interface is already connected")]
    AlreadyConnected,
    #[error("Interface is not connected")]
    NotConnected,
    #[error("Interface is not connected to this wire")]
    NotConnectedToThisWire,
    #[error("Node {0:x} is shutting down")]
    NodeShuttingDown(Address),
    #[error("Cannot connect an interface to itself")]
    Loopback,
}
