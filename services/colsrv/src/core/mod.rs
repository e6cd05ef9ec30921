//! Core collection engine: configuration, the driver contract, managed
//! tasks, device workers, and the downstream pipeline seam.

pub mod config;
pub mod driver;
pub mod pipeline;
pub mod tasks;
pub mod types;
pub mod worker;
