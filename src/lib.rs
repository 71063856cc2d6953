//! syncevo-core: sync session core for a SyncML-based personal data
//! synchronizer.
//!
//! This crate implements the pieces described as "the core" of a
//! SyncML (OMA DS) synchronizer: change tracking, the pluggable sync
//! source capability set, a transport contract, a protocol engine state
//! machine, a session controller driving the request/reply loop, and a
//! session manager mediating external control. Concrete backends,
//! HTTP/TLS transports, on-disk config formats, and a GUI are out of
//! scope; this crate defines the interfaces they must satisfy and ships
//! reference implementations used by its own test suite.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod manager;
pub mod report;
pub mod session;
pub mod source;
pub mod tracker;
pub mod transport;

pub use error::{Result, SyncError};
