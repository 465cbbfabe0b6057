//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → every background task (pinger, list updater) exits its loop
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → resolve wait_for_shutdown_signal → trigger shutdown
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_shutdown_signal;
