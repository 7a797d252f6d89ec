//! The per-node thread of control.
//!
//! Every [`Node`](crate::Node) runs exactly one [`Kernel`] on its own task.
//! Kernels learn about the node's interfaces through callbacks that may arrive
//! before [`Kernel::start`]; until started they only record them. The
//! bookkeeping every kernel needs (address, name, logging span, cancellation
//! and the interface list) lives in a [`KernelBase`] embedded in the
//! implementation.

use crate::{interface::InterfaceError, Address, Interface};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Span;

pub mod router;
pub mod user;

/// The control logic of a node.
///
/// Implementors embed a [`KernelBase`] and return it from [`base`](Self::base);
/// the interface callbacks record into it by default.
#[async_trait]
pub trait Kernel: Send + Sync + 'static {
    /// The bookkeeping shared by all kernels.
    fn base(&self) -> &KernelBase;

    /// Called when the node creates a new interface.
    fn interface_added(&self, iface: &Arc<Interface>) {
        self.base().record(iface);
    }

    /// Called when one of the node's interfaces gets a peer.
    fn interface_connected(&self, iface: &Arc<Interface>) {
        self.base().record(iface);
    }

    /// Called when one of the node's interfaces loses its peer.
    fn interface_disconnected(&self, _iface: &Arc<Interface>) {}

    /// Runs the kernel. Called once, on the node's main task. Returning ends
    /// the node's main task; [`KernelError::Cancelled`] counts as a normal
    /// stop.
    async fn start(self: Arc<Self>) -> Result<(), KernelError>;

    /// Asks the kernel to stop. Must make [`start`](Self::start) return
    /// promptly and must not return before every task the kernel spawned has
    /// stopped.
    async fn shut_down(&self);
}

/// Attachment state and interface bookkeeping for a [`Kernel`].
///
/// The address, name, span and main task token are set exactly once, when
/// the kernel is attached to a node. Setting any of them again fails with
/// [`KernelError::AlreadySet`], so a kernel cannot serve two nodes.
pub struct KernelBase {
    address: OnceLock<Address>,
    name: OnceLock<String>,
    span: OnceLock<Span>,
    main_task: OnceLock<CancellationToken>,
    scope: OnceLock<CancellationToken>,
    /// Sorted by interface index
    interfaces: RwLock<Vec<Arc<Interface>>>,
    added: watch::Sender<usize>,
}

impl KernelBase {
    pub fn new() -> Self {
        Self {
            address: OnceLock::new(),
            name: OnceLock::new(),
            span: OnceLock::new(),
            main_task: OnceLock::new(),
            scope: OnceLock::new(),
            interfaces: RwLock::new(Vec::new()),
            added: watch::channel(0).0,
        }
    }

    pub fn set_address(&self, address: Address) -> Result<(), KernelError> {
        self.address
            .set(address)
            .map_err(|_| KernelError::AlreadySet("address"))
    }

    pub fn set_name(&self, name: String) -> Result<(), KernelError> {
        self.name.set(name).map_err(|_| KernelError::AlreadySet("name"))
    }

    /// Sets the span every event of the kernel is recorded in.
    pub fn set_span(&self, span: Span) -> Result<(), KernelError> {
        self.span.set(span).map_err(|_| KernelError::AlreadySet("span"))
    }

    /// Sets the token that interrupts the node's main task. The kernel's
    /// [`scope`](Self::scope) becomes a child of it.
    pub fn set_main_task(&self, token: CancellationToken) -> Result<(), KernelError> {
        let scope = token.child_token();
        self.main_task
            .set(token)
            .map_err(|_| KernelError::AlreadySet("main task"))?;
        self.scope
            .set(scope)
            .map_err(|_| KernelError::AlreadySet("main task"))
    }

    /// The address of the node, or 0 if the kernel is not attached.
    pub fn address(&self) -> Address {
        self.address.get().copied().unwrap_or(0)
    }

    pub fn name(&self) -> &str {
        self.name.get().map(String::as_str).unwrap_or("")
    }

    pub fn span(&self) -> Span {
        self.span.get().cloned().unwrap_or_else(Span::none)
    }

    /// A token cancelled when the node's main task is interrupted or
    /// [`stop`](Self::stop) is called. Tasks the kernel spawns should run
    /// under a child of it.
    pub fn scope(&self) -> CancellationToken {
        self.scope.get_or_init(CancellationToken::new).clone()
    }

    /// Cancels the kernel's [`scope`](Self::scope).
    pub fn stop(&self) {
        self.scope().cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.scope().is_cancelled()
    }

    /// Records an interface if it is not known yet.
    pub fn record(&self, iface: &Arc<Interface>) {
        let mut interfaces = self.interfaces.write().unwrap();
        let at = interfaces.partition_point(|known| known.index() < iface.index());
        if interfaces.get(at).is_some_and(|known| known.id() == iface.id()) {
            return;
        }
        interfaces.insert(at, iface.clone());
        drop(interfaces);
        self.added.send_modify(|count| *count += 1);
    }

    /// A snapshot of the interfaces recorded so far, sorted by index.
    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        self.interfaces.read().unwrap().clone()
    }

    /// The recorded interface with the given index.
    pub fn interface(&self, index: usize) -> Option<Arc<Interface>> {
        let interfaces = self.interfaces.read().unwrap();
        interfaces
            .binary_search_by_key(&index, |iface| iface.index())
            .ok()
            .map(|at| interfaces[at].clone())
    }

    /// The interface with the lowest index, if any has been recorded.
    pub fn first_interface(&self) -> Option<Arc<Interface>> {
        self.interfaces.read().unwrap().first().cloned()
    }

    /// Waits until the kernel has at least one interface and returns the one
    /// with the lowest index.
    pub async fn wait_for_interface(&self) -> Arc<Interface> {
        let mut added = self.added.subscribe();
        loop {
            if let Some(iface) = self.first_interface() {
                return iface;
            }
            // The sender lives as long as `self`
            if added.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for KernelBase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KernelBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBase")
            .field("address", &self.address.get())
            .field("name", &self.name.get())
            .field("interfaces", &self.interfaces.read().unwrap().len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("The kernel's {0} has already been set")]
    AlreadySet(&'static str),
    #[error("The kernel was cancelled")]
    Cancelled,
    #[error("The node has no interface")]
    NoInterface,
    #[error(transparent)]
    Interface(#[from] InterfaceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_fields_are_set_once() {
        let base = KernelBase::new();
        assert_eq!(base.address(), 0);
        base.set_address(4).unwrap();
        base.set_name("R1".into()).unwrap();
        base.set_main_task(CancellationToken::new()).unwrap();
        assert!(matches!(base.set_address(5), Err(KernelError::AlreadySet("address"))));
        assert!(matches!(base.set_name("R2".into()), Err(KernelError::AlreadySet(_))));
        assert!(base.set_main_task(CancellationToken::new()).is_err());
        assert_eq!(base.address(), 4);
        assert_eq!(base.name(), "R1");
    }

    #[test]
    fn scope_follows_the_main_task() {
        let base = KernelBase::new();
        let main = CancellationToken::new();
        base.set_main_task(main.clone()).unwrap();
        assert!(!base.is_stopped());
        main.cancel();
        assert!(base.is_stopped());
    }

    #[test]
    fn stopping_leaves_the_main_task_alone() {
        let base = KernelBase::new();
        let main = CancellationToken::new();
        base.set_main_task(main.clone()).unwrap();
        base.stop();
        assert!(base.is_stopped());
        assert!(!main.is_cancelled());
    }
}
