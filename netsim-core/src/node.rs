use crate::{
    interface::WireError, simulator::SimId, Address, Interface, Kernel, KernelError,
};
use std::{
    collections::VecDeque,
    fmt::{self, Debug, Display, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Lifecycle flags of a node, shared with its interfaces.
#[derive(Debug, Default)]
pub(crate) struct NodeStatus {
    running: AtomicBool,
    shutting_down: AtomicBool,
}

impl NodeStatus {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

enum Lifecycle {
    Created,
    Started(JoinHandle<()>),
    Stopped,
}

/// A simulated machine: an address, a kernel and the interfaces that connect
/// it to other nodes.
///
/// Nodes are created by a [`Simulator`](crate::Simulator). Interfaces are
/// created lazily when the node is connected and recycled through a free list
/// when disconnected, so `node.interfaces()[i].index() == i` always holds and
/// the interface list only ever grows.
pub struct Node {
    sim: SimId,
    address: Address,
    name: String,
    kernel: Arc<dyn Kernel>,
    span: Span,
    status: Arc<NodeStatus>,
    interfaces: RwLock<Vec<Arc<Interface>>>,
    unused: Mutex<VecDeque<Arc<Interface>>>,
    main_task: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    shutdown_grace: Duration,
    me: Weak<Node>,
}

impl Node {
    /// Creates a node and attaches the kernel to it.
    pub(crate) fn new(
        sim: SimId,
        address: Address,
        name: String,
        kernel: Arc<dyn Kernel>,
        shutdown_grace: Duration,
    ) -> Result<Arc<Self>, KernelError> {
        let span = tracing::info_span!("node", %name, address);
        let main_task = CancellationToken::new();
        let base = kernel.base();
        base.set_address(address)?;
        base.set_name(name.clone())?;
        base.set_span(span.clone())?;
        base.set_main_task(main_task.clone())?;
        Ok(Arc::new_cyclic(|me| Self {
            sim,
            address,
            name,
            kernel,
            span,
            status: Default::default(),
            interfaces: RwLock::new(Vec::new()),
            unused: Mutex::new(VecDeque::new()),
            main_task,
            lifecycle: Mutex::new(Lifecycle::Created),
            shutdown_grace,
            me: me.clone(),
        }))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    /// The span the node's kernel logs in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// A snapshot of the node's interfaces, in index order.
    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        self.interfaces.read().unwrap().clone()
    }

    pub fn interface(&self, index: usize) -> Option<Arc<Interface>> {
        self.interfaces.read().unwrap().get(index).cloned()
    }

    /// Whether the kernel is currently running.
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Whether teardown has begun. Stays set once the node is shut down,
    /// since a destroyed node can not be connected or started again.
    pub fn is_shutting_down(&self) -> bool {
        self.status.is_shutting_down()
    }

    pub(crate) fn sim(&self) -> SimId {
        self.sim
    }

    /// Connects a fresh or recycled interface of this node to one of
    /// `other`. Returns this node's end of the wire.
    pub(crate) fn connect_to(&self, other: &Node) -> Result<Arc<Interface>, WireError> {
        let mine = self.unused_interface()?;
        let theirs = match other.unused_interface() {
            Ok(theirs) => theirs,
            Err(e) => {
                self.recycle(mine);
                return Err(e);
            }
        };
        if let Err(e) = mine.connect(&theirs) {
            self.recycle(mine);
            other.recycle(theirs);
            return Err(e);
        }
        Ok(mine)
    }

    /// Pops an interface off the free list, or creates one with the next
    /// index.
    fn unused_interface(&self) -> Result<Arc<Interface>, WireError> {
        if let Some(iface) = self.unused.lock().unwrap().pop_front() {
            return Ok(iface);
        }
        let mut interfaces = self.interfaces.write().unwrap();
        // Checked under the same lock `shut_down` raises the flag with
        if self.status.is_shutting_down() {
            return Err(WireError::NodeShuttingDown(self.address));
        }
        let iface = Arc::new(Interface::new(
            interfaces.len(),
            self.sim,
            self.address,
            self.me.clone(),
            self.status.clone(),
        ));
        interfaces.push(iface.clone());
        drop(interfaces);
        self.kernel.interface_added(&iface);
        Ok(iface)
    }

    /// Returns an interface that was taken but never connected.
    fn recycle(&self, iface: Arc<Interface>) {
        self.unused.lock().unwrap().push_front(iface);
    }

    pub(crate) fn connected(&self, iface: &Arc<Interface>) {
        self.kernel.interface_connected(iface);
    }

    pub(crate) fn disconnected(&self, iface: &Arc<Interface>) {
        self.unused.lock().unwrap().push_back(iface.clone());
        self.kernel.interface_disconnected(iface);
    }

    /// Starts the kernel on its own task. Does nothing if the node has
    /// already been started or stopped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub(crate) fn start_up(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if !matches!(*lifecycle, Lifecycle::Created) || self.status.is_shutting_down() {
            return;
        }
        let kernel = self.kernel.clone();
        let status = self.status.clone();
        let main_task = self.main_task.clone();
        // Set before the task runs so the kernel can send right away
        status.running.store(true, Ordering::Release);
        let handle = tokio::spawn(
            async move {
                tokio::select! {
                    result = kernel.start() => match result {
                        Ok(()) | Err(KernelError::Cancelled) => tracing::debug!("Kernel stopped"),
                        Err(e) => tracing::error!("Kernel failed: {}", e),
                    },
                    _ = main_task.cancelled() => tracing::debug!("Kernel interrupted"),
                }
                status.running.store(false, Ordering::Release);
            }
            .instrument(self.span.clone()),
        );
        *lifecycle = Lifecycle::Started(handle);
    }

    /// Stops the node: disconnects every interface, asks the kernel to shut
    /// down and waits for the main task within the grace period. A main task
    /// that outlives the grace period is interrupted, then aborted.
    ///
    /// The node stays shutting down afterwards and can not be connected or
    /// restarted.
    pub(crate) async fn shut_down(&self) {
        {
            let _interfaces = self.interfaces.write().unwrap();
            self.status.shutting_down.store(true, Ordering::Release);
        }
        for iface in self.interfaces() {
            match iface.disconnect() {
                Ok(()) | Err(WireError::NotConnected) => {}
                Err(e) => {
                    tracing::debug!(parent: &self.span, "Could not disconnect {}: {}", iface, e)
                }
            }
        }
        self.kernel.shut_down().await;

        let lifecycle = std::mem::replace(&mut *self.lifecycle.lock().unwrap(), Lifecycle::Stopped);
        if let Lifecycle::Started(mut handle) = lifecycle {
            if tokio::time::timeout(self.shutdown_grace, &mut handle).await.is_err() {
                self.main_task.cancel();
                if tokio::time::timeout(self.shutdown_grace, &mut handle).await.is_err() {
                    tracing::warn!(
                        parent: &self.span,
                        "Kernel did not stop within {:?}, aborting it",
                        self.shutdown_grace
                    );
                    handle.abort();
                }
            }
        }
        self.main_task.cancel();
        self.status.running.store(false, Ordering::Release);
        tracing::info!(parent: &self.span, "Node shut down");
    }

    /// Interrupts the main task without waiting for it.
    pub(crate) fn interrupt(&self) {
        self.main_task.cancel();
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Node {} ({:x})", self.name, self.address)
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("interfaces", &self.interfaces.read().unwrap().len())
            .finish()
    }
}
