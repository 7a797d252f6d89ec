//! The registry and factory of a simulated network.

use crate::{
    interface::WireError, Address, FxDashMap, Interface, Kernel, KernelError, Node, Process,
    RouterKernel, SimConfig, UserKernel,
};
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
    Arc, RwLock,
};

static NEXT_SIM_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the simulator that created a node or interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SimId(u64);

impl SimId {
    fn next() -> Self {
        Self(NEXT_SIM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Creates nodes, wires them together and boots them.
///
/// Nodes created before [`start`](Self::start) boot when it is called; nodes
/// created afterwards boot immediately. Objects of one simulator can not be
/// used with another; doing so fails with [`SimError::ForeignObject`].
///
/// Starting and creating nodes after starting must happen inside a Tokio
/// runtime.
pub struct Simulator {
    id: SimId,
    config: SimConfig,
    /// Wider than an address so it can not wrap into negative addresses
    next_address: AtomicI64,
    next_name: AtomicUsize,
    nodes: FxDashMap<Address, Arc<Node>>,
    /// Addresses handed to builders that have not created their node yet
    reserved: FxDashMap<Address, ()>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    /// Held for reading while a node is registered and for writing while the
    /// simulator changes state, so no node misses a start or a teardown
    lifecycle: RwLock<()>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        Self {
            id: SimId::next(),
            config,
            next_address: AtomicI64::new(1),
            next_name: AtomicUsize::new(1),
            nodes: Default::default(),
            reserved: Default::default(),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            lifecycle: RwLock::new(()),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Starts building a node with the next free address. Once the
    /// addresses run out the builder has address 0 and
    /// [`create`](NodeBuilder::create) fails with
    /// [`SimError::AddressSpaceExhausted`].
    pub fn build_node(&self) -> NodeBuilder<'_> {
        loop {
            let next = self.next_address.fetch_add(1, Ordering::Relaxed);
            let Ok(address) = Address::try_from(next) else {
                return NodeBuilder::exhausted(self);
            };
            if self.reserve(address) {
                return NodeBuilder::new(self, address);
            }
        }
    }

    /// Starts building a node with the given address. The address is
    /// reserved until the builder creates its node or is dropped.
    pub fn build_node_at(&self, address: Address) -> Result<NodeBuilder<'_>, SimError> {
        if address <= 0 {
            return Err(SimError::InvalidAddress(address));
        }
        if !self.reserve(address) {
            return Err(SimError::AddressInUse(address));
        }
        self.next_address
            .fetch_max(i64::from(address) + 1, Ordering::Relaxed);
        Ok(NodeBuilder::new(self, address))
    }

    /// Atomically claims an address that is neither reserved nor in use.
    fn reserve(&self, address: Address) -> bool {
        if address <= 0 {
            return false;
        }
        match self.reserved.entry(address) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                // Nodes are registered before their reservation is released,
                // so this check can not miss one
                if self.nodes.contains_key(&address) {
                    false
                } else {
                    entry.insert(());
                    true
                }
            }
        }
    }

    fn release(&self, address: Address) {
        self.reserved.remove(&address);
    }

    fn check_node(&self, node: &Arc<Node>) -> Result<(), SimError> {
        let registered = node.sim() == self.id
            && self
                .nodes
                .get(&node.address())
                .is_some_and(|known| Arc::ptr_eq(known.value(), node));
        if registered {
            Ok(())
        } else {
            Err(SimError::ForeignObject)
        }
    }

    /// Connects two nodes with a new wire. Returns the interface of `a`.
    pub fn connect(&self, a: &Arc<Node>, b: &Arc<Node>) -> Result<Arc<Interface>, SimError> {
        self.check_node(a)?;
        self.check_node(b)?;
        Ok(a.connect_to(b)?)
    }

    /// Disconnects an interface from its peer.
    pub fn disconnect(&self, iface: &Arc<Interface>) -> Result<(), SimError> {
        if iface.sim() != self.id {
            return Err(SimError::ForeignObject);
        }
        Ok(iface.disconnect()?)
    }

    /// Shuts a node down and removes it from the simulator.
    pub async fn destroy(&self, node: &Arc<Node>) -> Result<(), SimError> {
        self.check_node(node)?;
        self.nodes.remove(&node.address());
        node.shut_down().await;
        Ok(())
    }

    /// Stops accepting new nodes, then shuts every node down.
    pub async fn destroy_all(&self) {
        {
            let _lifecycle = self.lifecycle.write().unwrap();
            self.shutting_down.store(true, Ordering::Release);
        }
        let nodes = self.nodes();
        futures::future::join_all(nodes.iter().map(|node| node.shut_down())).await;
        self.nodes.clear();
        tracing::info!("Destroyed {} nodes", nodes.len());
    }

    /// The node with the given address.
    pub fn node_at(&self, address: Address) -> Option<Arc<Node>> {
        self.nodes.get(&address).map(|node| node.clone())
    }

    /// Every node, sorted by address.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|node| node.clone()).collect();
        nodes.sort_by_key(|node| node.address());
        nodes
    }

    /// A router kernel using this simulator's RIP configuration.
    pub fn create_router_kernel(&self) -> Arc<RouterKernel> {
        RouterKernel::new(self.config.rip)
    }

    pub fn create_user_kernel(&self, process: Option<Arc<dyn Process>>) -> Arc<UserKernel> {
        UserKernel::new(process)
    }

    /// Boots every node. Calling it again has no effect.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(&self) {
        let _lifecycle = self.lifecycle.write().unwrap();
        if self.shutting_down.load(Ordering::Acquire) || self.started.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let nodes = self.nodes();
        for node in &nodes {
            node.start_up();
        }
        tracing::info!("Started {} nodes", nodes.len());
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn register(&self, node: Arc<Node>) -> Result<(), SimError> {
        let _lifecycle = self.lifecycle.read().unwrap();
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SimError::ShuttingDown);
        }
        self.nodes.insert(node.address(), node.clone());
        self.release(node.address());
        if self.started.load(Ordering::Acquire) {
            node.start_up();
        }
        Ok(())
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        for node in self.nodes.iter() {
            node.interrupt();
        }
    }
}

/// Configures a node before it is created. Dropping the builder without
/// calling [`create`](Self::create) releases the address.
#[must_use = "a node is only created by calling `create`"]
pub struct NodeBuilder<'a> {
    sim: &'a Simulator,
    address: Address,
    name: Option<String>,
    kernel: Option<Arc<dyn Kernel>>,
    connections: Vec<Arc<Node>>,
    reserved: bool,
}

impl<'a> NodeBuilder<'a> {
    fn new(sim: &'a Simulator, address: Address) -> Self {
        Self {
            sim,
            address,
            name: None,
            kernel: None,
            connections: Vec::new(),
            reserved: true,
        }
    }

    fn exhausted(sim: &'a Simulator) -> Self {
        let mut builder = Self::new(sim, 0);
        builder.reserved = false;
        builder
    }

    /// The address the node will have, or 0 if no address was left.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The kernel to run. Defaults to a router kernel.
    pub fn kernel(mut self, kernel: Arc<dyn Kernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Nodes to connect the new node to once it is created.
    pub fn connections<'n>(mut self, nodes: impl IntoIterator<Item = &'n Arc<Node>>) -> Self {
        self.connections.extend(nodes.into_iter().cloned());
        self
    }

    /// Creates the node, connects it and boots it if the simulator has
    /// started. On failure nothing is left behind: the node is neither
    /// registered nor connected.
    pub fn create(mut self) -> Result<Arc<Node>, SimError> {
        let sim = self.sim;
        if self.address <= 0 {
            return Err(SimError::AddressSpaceExhausted);
        }
        if sim.shutting_down.load(Ordering::Acquire) {
            return Err(SimError::ShuttingDown);
        }
        for other in &self.connections {
            sim.check_node(other)?;
        }
        let name = self.name.take().unwrap_or_else(|| {
            format!("Node{}", sim.next_name.fetch_add(1, Ordering::Relaxed))
        });
        let kernel = self
            .kernel
            .take()
            .unwrap_or_else(|| sim.create_router_kernel());
        let node = Node::new(sim.id, self.address, name, kernel, sim.config.shutdown_grace)?;
        // Wired before it is registered, so a failure is undone by `abandon`
        for other in &self.connections {
            if let Err(e) = node.connect_to(other) {
                abandon(&node);
                return Err(e.into());
            }
        }
        if let Err(e) = sim.register(node.clone()) {
            abandon(&node);
            return Err(e);
        }
        self.reserved = false;
        tracing::debug!("Created {}", node);
        Ok(node)
    }
}

/// Unwires a node that never made it into the simulator.
fn abandon(node: &Node) {
    for iface in node.interfaces() {
        match iface.disconnect() {
            Ok(()) | Err(WireError::NotConnected) => {}
            Err(e) => tracing::debug!("Could not disconnect {}: {}", iface, e),
        }
    }
}

impl Drop for NodeBuilder<'_> {
    fn drop(&mut self) {
        if self.reserved {
            self.sim.release(self.address);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("The object belongs to another simulator or has been destroyed")]
    ForeignObject,
    #[error("Address {0:x} is already in use")]
    AddressInUse(Address),
    #[error("{0} is not a valid node address")]
    InvalidAddress(Address),
    #[error("No node address is left")]
    AddressSpaceExhausted,
    #[error("The simulator is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}
