//! API Module
//!
//! HTTP transport for the dock envelope plus health and readiness.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
