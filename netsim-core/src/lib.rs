//! A discrete-component network simulator, a library for building and
//! exercising distributed protocols (routing, consensus, leader election)
//! without real hardware.
//!
//! # Organization
//!
//! - [`Simulator`] creates [`Node`]s, wires them together and boots them
//! - [`Interface`]s are the endpoints of the virtual point-to-point wires
//!   between nodes and move [`Message`]s from one node to another
//! - Every node runs exactly one [`Kernel`] on its own task. A
//!   [`RouterKernel`] runs the built-in RIP distance-vector engine over all
//!   of the node's interfaces. A [`UserKernel`] hosts a swappable
//!   [`Process`] behind an [`OperatingSystem`] facade with ports, blocking
//!   receives and forked tasks.
//!
//! # Example
//!
//! ```no_run
//! use netsim_core::{Simulator, KnownPort};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sim = Simulator::new();
//! let router = sim.build_node().name("R1").create()?;
//! let host = sim
//!     .build_node()
//!     .name("H1")
//!     .kernel(sim.create_user_kernel(None))
//!     .connections([&router])
//!     .create()?;
//! sim.start();
//!
//! tokio::time::sleep(Duration::from_secs(3)).await;
//! sim.destroy_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub use config::{RipConfig, SimConfig};

pub mod message;
pub use message::{Datum, Message, MessageError, Payload};

pub mod port;
pub use port::{format_port, KnownPort};

pub mod interface;
pub use interface::{Interface, InterfaceError, InterfaceId, WireError};

mod node;
pub use node::Node;

pub mod simulator;
pub use simulator::{NodeBuilder, SimError, Simulator};

pub mod kernel;
pub use kernel::{
    router::RouterKernel,
    user::{OperatingSystem, OsError, Process, UserKernel},
    Kernel, KernelBase, KernelError,
};

pub mod rip;

/// The address of a node, analogous to an IP address. Every node has
/// exactly one address no matter how many interfaces it has. Valid
/// addresses are positive; `0` means "unknown" or "whoever is on the other
/// end of the link".
pub type Address = i32;

/// A demultiplexing key for messages arriving at a node. See [`KnownPort`]
/// for the reserved values.
pub type Port = i32;

/// A [`DashMap`](dashmap::DashMap) using the fast, non-cryptographic Fx hasher.
pub type FxDashMap<K, V> =
    dashmap::DashMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
