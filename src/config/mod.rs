//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RibbonConfig (validated, immutable)
//!     → client_config.rs (flat property map handed to the load balancer)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new server list pushed to the load balancer
//! ```
//!
//! # Design Decisions
//! - Per-request configs only store overrides; lookups fall back to the
//!   client-wide config, then to the key default
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod client_config;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use client_config::{ClientConfig, ConfigKey};
pub use schema::{ClientSection, ObservabilityConfig, RibbonConfig, ServerEntry};
