//! A pool of local Tor circuits with round-robin rotation.
//!
//! Each [`CircuitInstance`] supervises one backend process that exposes a
//! SOCKS5 port for traffic and a control port for identity renewal.
//! [`PoolManager`] owns the ordered set of started instances and tracks
//! which one is active; [`PoolManager::rotate`] advances to the next.
//!
//! # Usage
//!
//! ```no_run
//! use rotor_pool::{PoolConfig, PoolManager};
//!
//! # async fn example() -> Result<(), rotor_pool::PoolError> {
//! let pool = PoolManager::new(PoolConfig::default());
//! let started = pool.start().await?;
//! println!("{started} circuits up, active SOCKS port {}", pool.active_port());
//! if let Some(rotation) = pool.rotate() {
//!     println!("{} -> {}", rotation.previous.socks_port(), rotation.current.socks_port());
//! }
//! pool.stop().await;
//! # Ok(())
//! # }
//! ```

mod backend;
pub mod control;
pub mod identity;
mod instance;
mod manager;

pub use backend::kill_strays;
pub use control::{ControlClient, ControlError};
pub use identity::{IdentityCache, PENDING, UNKNOWN_COUNTRY};
pub use instance::{CircuitConfig, CircuitInstance, CircuitState};
pub use manager::{plan_ports, PoolConfig, PoolManager, PortPair, Rotation, RotationKind};

use std::path::PathBuf;

/// Errors from pool and circuit lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No circuit became ready during pool startup.
    #[error("No circuit became ready ({requested} requested)")]
    NoInstances { requested: usize },

    /// `start` was called on a pool that already has instances.
    #[error("Pool already running with {0} instances")]
    AlreadyRunning(usize),

    /// The requested port layout is invalid.
    #[error("Invalid port plan: {0}")]
    PortPlan(String),

    /// The backend executable could not be launched.
    #[error("Failed to spawn backend {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backend did not become usable within the readiness window.
    #[error("Circuit on port {port} not ready after {attempts} attempts")]
    NotReady { port: u16, attempts: u32 },

    /// The backend process exited while we waited for it.
    #[error("Backend on port {port} exited during startup")]
    Exited { port: u16 },

    /// Preparing the instance working directory failed.
    #[error("Working directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Building the lookup HTTP clients failed.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),
}

pub type Result<T> = std::result::Result<T, PoolError>;
