//! Applications, prebuilt simulations and the command line front end for the
//! [`netsim_core`] simulator.

pub use netsim_core as core;

pub mod applications;
pub mod cli;
pub mod simulations;
