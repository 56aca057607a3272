//! meshfm Library
//!
//! Remote file manager client for MeshCentral agents: relay tunnel, frame codec,
//! request correlation, and window-1 upload/download pipelines

pub mod classify;
pub mod cli;
pub mod client;
pub mod config;
pub mod correlator;
pub mod download;
pub mod error;
pub mod events;
pub mod journal;
pub mod manager;
pub mod message;
pub mod ops;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod relay;
pub mod transport;
pub mod upload;
pub mod ws;

pub use client::FileClient;
pub use error::{OperationError, TransportError};
pub use manager::{ConnectionState, FileManager};
