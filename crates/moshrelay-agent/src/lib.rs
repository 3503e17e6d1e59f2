//! moshrelay Agent Library
//!
//! Runs one side of a mosh session whose UDP traffic is relayed through a
//! rendezvous server:
//! - Compatibility installer for the pinned mosh release
//! - `mosh-client` / `mosh-server` subprocess management
//! - Relay and loopback UDP links bridged by packet channels
//! - Orchestrator wiring it all together with ordered teardown

pub mod channel;
pub mod error;
pub mod install;
pub mod link;
pub mod orchestrator;
pub mod session;
pub mod stopper;

pub use error::SessionError;
pub use orchestrator::{Orchestrator, SessionState};
pub use stopper::Stopper;
