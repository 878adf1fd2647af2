pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod notify;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use client::{MeshClient, join_mesh};
pub use config::MeshConfig;
pub use error::MeshError;
