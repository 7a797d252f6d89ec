//! A kernel that hosts a swappable [`Process`].
//!
//! The process sees the node through an [`OperatingSystem`] handle: it can
//! send messages, receive them by destination port, fork concurrent tasks and
//! replace itself with another process. All of this is multiplexed over the
//! node's first interface. A dispatcher task runs for as long as the kernel
//! does, sorting inbound traffic into per-port queues and answering router
//! discovery requests, so a node without a process still shows up as a leaf.

use super::{Kernel, KernelBase, KernelError};
use crate::{
    interface::InterfaceError,
    rip::RipDatagram,
    Address, Datum, FxDashMap, Interface, KnownPort, Message, MessageError, Port,
};
use async_trait::async_trait;
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, Span};

/// A unit of user logic, analogous to a program run by an operating system.
#[async_trait]
pub trait Process: Send + Sync + 'static {
    /// Runs the process. Invoked once per activation, on its own task.
    ///
    /// Blocking calls on `os` fail with [`OsError::Cancelled`] once the
    /// process is replaced or the node shuts down; propagate it with `?`.
    async fn run(self: Arc<Self>, os: OperatingSystem) -> Result<(), OsError>;
}

/// One run of a process: its cancellation scope and the tasks it owns.
struct Activation {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Activation {
    /// The tracker is closed once the process is spawned, so an empty closed
    /// tracker means the process and its forks have returned.
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !(self.tracker.is_closed() && self.tracker.is_empty())
    }
}

/// A kernel running one [`Process`] at a time.
pub struct UserKernel {
    base: KernelBase,
    next: Mutex<Option<Arc<dyn Process>>>,
    current: Mutex<Option<Activation>>,
    process_ready: Notify,
    /// Survive process replacement
    ports: FxDashMap<Port, Arc<PortQueue>>,
    dispatcher: TaskTracker,
}

impl UserKernel {
    /// Creates a kernel that will run `process` once started.
    pub fn new(process: Option<Arc<dyn Process>>) -> Arc<Self> {
        Arc::new(Self {
            base: KernelBase::new(),
            next: Mutex::new(process),
            current: Mutex::new(None),
            process_ready: Notify::new(),
            ports: Default::default(),
            dispatcher: TaskTracker::new(),
        })
    }

    /// Installs the next process to run, cancelling the current one.
    pub fn set_process(&self, process: Arc<dyn Process>) {
        let mut next = self.next.lock().unwrap();
        *next = Some(process);
        if let Some(current) = self.current.lock().unwrap().as_ref() {
            current.token.cancel();
        }
        drop(next);
        self.process_ready.notify_one();
    }

    /// Whether a process is waiting to run, or the current process or one of
    /// its forks is still running. Turns false once they have all returned.
    pub fn has_process(&self) -> bool {
        self.next.lock().unwrap().is_some()
            || self
                .current
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(Activation::is_live)
    }

    /// Waits for the next process. Returns `None` once the kernel stops.
    async fn next_process(
        &self,
        scope: &CancellationToken,
    ) -> Option<(Arc<dyn Process>, Activation)> {
        loop {
            {
                let mut next = self.next.lock().unwrap();
                if scope.is_cancelled() {
                    return None;
                }
                if let Some(process) = next.take() {
                    let activation = Activation {
                        token: scope.child_token(),
                        tracker: TaskTracker::new(),
                    };
                    // Stored while `next` is held so a concurrent
                    // `set_process` either sees it or leaves a new process
                    *self.current.lock().unwrap() = Some(Activation {
                        token: activation.token.clone(),
                        tracker: activation.tracker.clone(),
                    });
                    return Some((process, activation));
                }
            }
            tokio::select! {
                _ = self.process_ready.notified() => {}
                _ = scope.cancelled() => return None,
            }
        }
    }

    fn activate(self: &Arc<Self>, process: Arc<dyn Process>, activation: &Activation) {
        let os = OperatingSystem {
            kernel: self.clone(),
            token: activation.token.clone(),
            tracker: activation.tracker.clone(),
        };
        let span = self.base.span();
        let token = activation.token.clone();
        activation.tracker.spawn(
            async move {
                tracing::debug!("Process started");
                let result = tokio::select! {
                    result = process.run(os) => result,
                    _ = token.cancelled() => Err(OsError::Cancelled),
                };
                match result {
                    Ok(()) => tracing::debug!("Process finished"),
                    Err(OsError::Cancelled) => tracing::debug!("Process cancelled"),
                    Err(e) => tracing::error!("Process failed: {}", e),
                }
            }
            .instrument(span),
        );
        activation.tracker.close();
    }

    fn queue(&self, port: Port) -> Arc<PortQueue> {
        self.ports.entry(port).or_default().clone()
    }

    /// Moves traffic from the node's interface into the port queues.
    async fn dispatch(self: Arc<Self>, scope: CancellationToken) {
        let iface = tokio::select! {
            _ = scope.cancelled() => return,
            iface = self.base.wait_for_interface() => iface,
        };
        loop {
            let received = tokio::select! {
                _ = scope.cancelled() => return,
                received = iface.receive(None) => received,
            };
            match received {
                Ok(Some(message)) => self.deliver(&iface, message),
                Ok(None) => {}
                Err(InterfaceError::Codec(e)) => tracing::warn!("Dropping a message: {}", e),
                Err(e) => {
                    tracing::debug!("Stopped dispatching: {}", e);
                    return;
                }
            }
        }
    }

    fn deliver(&self, iface: &Interface, message: Message) {
        if message.sent_to_port(KnownPort::Discovery) {
            if let Ok(datagram) = message.data_as::<RipDatagram>() {
                if datagram.is_from_router() {
                    let reply = Message::new(
                        self.base.address(),
                        KnownPort::Discovery,
                        message.source(),
                        KnownPort::Rip,
                        RipDatagram::not_a_router(),
                    );
                    if let Err(e) = iface.send(&reply) {
                        tracing::debug!("Could not answer a router discovery request: {}", e);
                    }
                } else {
                    tracing::trace!("Ignoring a discovery answer from {:x}", message.source());
                }
                return;
            }
        }
        let queue = self.queue(message.destination_port());
        // The queue holds its own receiver, so this can not fail
        let _ = queue.sender.send(message);
    }
}

#[async_trait]
impl Kernel for UserKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    async fn start(self: Arc<Self>) -> Result<(), KernelError> {
        let scope = self.base.scope();
        self.dispatcher.spawn(
            self.clone()
                .dispatch(scope.clone())
                .instrument(self.base.span()),
        );
        self.dispatcher.close();
        while let Some((process, activation)) = self.next_process(&scope).await {
            self.activate(process, &activation);
            // The activation outlives the process itself; its forks keep
            // running until it is replaced or stopped
            activation.token.cancelled().await;
            activation.tracker.wait().await;
        }
        self.dispatcher.wait().await;
        Ok(())
    }

    async fn shut_down(&self) {
        self.base.stop();
        let tracker = self
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|current| current.tracker.clone());
        if let Some(tracker) = tracker {
            tracker.wait().await;
        }
        self.dispatcher.close();
        self.dispatcher.wait().await;
    }
}

struct PortQueue {
    sender: mpsc::UnboundedSender<Message>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Default for PortQueue {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }
}

/// The system calls available to a [`Process`].
///
/// A cheap handle; clones share the same activation.
#[derive(Clone)]
pub struct OperatingSystem {
    kernel: Arc<UserKernel>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl OperatingSystem {
    /// The address of the node.
    pub fn address(&self) -> Address {
        self.kernel.base.address()
    }

    pub fn name(&self) -> &str {
        self.kernel.base.name()
    }

    /// The span of the node, for processes that log from their own tasks.
    pub fn span(&self) -> Span {
        self.kernel.base.span()
    }

    fn interface(&self) -> Result<Arc<Interface>, OsError> {
        self.kernel
            .base
            .first_interface()
            .ok_or(OsError::NoInterface)
    }

    /// Sends a message on the node's interface.
    pub fn send(&self, message: &Message) -> Result<(), OsError> {
        if self.token.is_cancelled() {
            return Err(OsError::Cancelled);
        }
        Ok(self.interface()?.send(message)?)
    }

    /// Sends `data` from this node to `destination`.
    pub fn send_to<T: Datum>(
        &self,
        destination: Address,
        source_port: impl Into<Port>,
        destination_port: impl Into<Port>,
        data: T,
    ) -> Result<(), OsError> {
        let message = Message::new(
            self.address(),
            source_port,
            destination,
            destination_port,
            data,
        );
        self.send(&message)
    }

    /// Receives the next message sent to `port`, waiting at most `timeout`
    /// if one is given. Returns `Ok(None)` on timeout.
    pub async fn receive(
        &self,
        port: impl Into<Port>,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, OsError> {
        if self.token.is_cancelled() {
            return Err(OsError::Cancelled);
        }
        let queue = self.queue(port.into());
        let receive = async {
            let mut receiver = queue.receiver.lock().await;
            receiver.recv().await
        };
        let received = tokio::select! {
            _ = self.token.cancelled() => return Err(OsError::Cancelled),
            received = maybe_timeout(timeout, receive) => received,
        };
        match received {
            Some(Some(message)) => Ok(Some(message)),
            // The queue holds its own sender
            Some(None) => Err(OsError::Disconnected),
            None => Ok(None),
        }
    }

    /// [`receive`](Self::receive) on a known port.
    pub async fn receive_known(
        &self,
        port: KnownPort,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, OsError> {
        self.receive(port, timeout).await
    }

    /// Sleeps for `duration`, failing early if the process is cancelled.
    pub async fn sleep(&self, duration: Duration) -> Result<(), OsError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(OsError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Runs `task` concurrently with the process. The task lives as long as
    /// the current activation and is cancelled with it.
    pub fn fork<F>(&self, task: F) -> JoinHandle<Result<(), OsError>>
    where
        F: Future<Output = Result<(), OsError>> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(
            async move {
                tokio::select! {
                    result = task => result,
                    _ = token.cancelled() => Err(OsError::Cancelled),
                }
            }
            .instrument(self.span()),
        )
    }

    /// Replaces the running process with `process`. Returns the cancellation
    /// the caller must propagate:
    ///
    /// ```ignore
    /// return Err(os.replace_process(Arc::new(NextStage)));
    /// ```
    pub fn replace_process(&self, process: Arc<dyn Process>) -> OsError {
        self.kernel.set_process(process);
        OsError::Cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the process is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn queue(&self, port: Port) -> Arc<PortQueue> {
        self.kernel.queue(port)
    }
}

async fn maybe_timeout<F: Future>(timeout: Option<Duration>, future: F) -> Option<F::Output> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future).await.ok(),
        None => Some(future.await),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OsError {
    #[error("The node's interface is disconnected")]
    Disconnected,
    #[error("Node {0:x} is not running")]
    NotRunning(Address),
    #[error("The process was cancelled")]
    Cancelled,
    #[error("The node has no interface")]
    NoInterface,
    #[error(transparent)]
    Codec(#[from] MessageError),
}

impl From<InterfaceError> for OsError {
    fn from(e: InterfaceError) -> Self {
        match e {
            InterfaceError::Disconnected => Self::Disconnected,
            InterfaceError::NotRunning(address) => Self::NotRunning(address),
            InterfaceError::Codec(e) => Self::Codec(e),
        }
    }
}
