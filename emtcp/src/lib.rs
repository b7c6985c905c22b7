//! Runs the emtcp engine on top of tokio.
//!
//! Each host is a [`worker`] task that owns one [`Tcp`](emtcp_core::Tcp)
//! stack. Hosts exchange frames over simulated [`network`] links, and the
//! [`simulations`] wire hosts and links into complete scenarios.

pub mod cli;
pub mod network;
pub mod simulation;
pub mod simulations;
pub mod worker;
