//! Domain layer - Records, naming and driver ports
//!
//! Drivers implement the traits in [`ports`]; everything else here is pure
//! data and pure functions.

pub mod model;
pub mod naming;
pub mod opts;
pub mod ports;
pub mod validate;

pub use model::*;
pub use ports::*;
