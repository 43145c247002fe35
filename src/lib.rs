//! VIGIL - Cache-centric state core for industrial supervision
//!
//! Keeps live tags, alarms and supervised equipment consistent in an
//! event-driven cache. Every entity lives in a typed [`cache::CacheStore`];
//! each mutation fires events to registered listeners, and a write-behind
//! [`storage::BatchPersistenceManager`] keeps durable storage eventually
//! consistent with the cache.
//!
//! # Examples
//!
//! ```rust,no_run
//! use vigil::{Config, Engine};
//!
//! # async fn run() -> vigil::Result<()> {
//! let config = Config::from_file("vigil.yaml")?;
//! let engine = Engine::new(config.clone())?;
//! engine.seed(&config.entities)?;
//! engine.start()?;
//!
//! // ... feed tag updates and alive tags ...
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

/// Crate-wide error type
pub mod error;

/// Typed tag values
pub mod value;

/// YAML configuration with defaults and validation
pub mod config;

/// Typed key/value stores, change events and flow policies
pub mod cache;

/// Task executors and repeating timers
pub mod executor;

/// Immediate and batched event listeners
pub mod listener;

/// Storage backends and write-behind persistence
pub mod storage;

// ============================================================================
// DOMAIN MODULES
// ============================================================================

/// Live tags and the tag update path
pub mod tag;

/// Supervised entities and alive timers
pub mod supervision;

/// Alarm evaluation and oscillation detection
pub mod alarms;

/// Assembly of every store, service and timer
pub mod engine;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::Config;
pub use engine::{Engine, EngineStats};
pub use error::{Result, VigilError};
pub use value::Value;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
