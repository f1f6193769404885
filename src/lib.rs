//! SDS Dock - Multi-backend storage driver dock
//!
//! One lifecycle API for volumes, snapshots, attachments, file shares and
//! replication, served by pluggable drivers for heterogeneous backends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                  REST transport  (POST /v1/dock)                     │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Dock: parse Operation -> validate -> route to backend -> Reply      │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Driver registry (kind -> constructor, sample fallback)              │
//! ├──────────────┬──────────────┬──────────────┬─────────────────────────┤
//! │  ONTAP SAN   │   Ceph RBD   │   ChubaoFS   │  Host replication       │
//! │  (REST+jobs) │   (rbd CLI)  │  (master API)│  (task tool)            │
//! └──────────────┴──────────────┴──────────────┴─────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: dock, registry, drivers and the HTTP API
//! - [`domain`]: records, naming, options and driver ports
//! - [`config`]: dock and driver configuration
//! - [`error`]: error taxonomy and reply codes

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use config::{BackendProperties, DockConfig};

pub use controlplane::{
    init_registry, ApiServer, ApiServerConfig, Dock, DockRequest, DriverContext, DriverRegistry,
    Operation, Reply,
};

pub use domain::ports::{
    BlockDriver, DriverLifecycle, FileShareDriver, MetricsDriver, ReplicationDriver,
};

pub use error::{Error, ErrorKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
