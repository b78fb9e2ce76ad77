//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load profile cache → Build registry → Executor
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown
//!     SIGHUP → Reload
//!
//! Shutdown (shutdown.rs):
//!     Trigger → reload and drain loops exit → Executor::shutdown
//! ```
//!
//! # Design Decisions
//! - The first apply happens after the registry is complete, never during construction
//! - Shutdown takes the apply lock, so it never interleaves with a reload

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::Signal;
pub use startup::Startup;
