//! Control Plane Module
//!
//! The driver registry, the dock that dispatches to it, the backends it
//! can construct, and the runtime pieces drivers share.

pub mod api;
pub mod backends;
pub mod dispatch;
pub mod exec;
pub mod jobs;
pub mod locks;
pub mod registry;

pub use api::{ApiServer, ApiServerConfig};
pub use dispatch::{Dock, DockRequest, Operation, Reply};
pub use registry::{init_registry, DriverContext, DriverRegistry};
