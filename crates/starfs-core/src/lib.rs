//! StarFS Core - proof-of-work gated file transfer
//!
//! This crate provides the pieces a StarFS node is built from: the hash-based
//! work gate, the incentive ledger, the server-side request handler and the
//! client-side download state machine. Transports live in the apps; the core
//! only sees them through [`Signalling`].

mod download;
mod error;
mod handler;
mod ledger;
pub mod pow;
mod registry;
mod scheduler;
mod signalling;

pub use download::*;
pub use error::*;
pub use handler::*;
pub use ledger::*;
pub use registry::*;
pub use scheduler::*;
pub use signalling::*;
