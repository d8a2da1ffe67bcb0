// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! xs-sync: Async runtime for the xsync offline-first sync engine
//!
//! Builds on the durable stores in `xs-core` with connectivity monitoring,
//! the background drain loop, and HTTP handlers for the remote API.

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod http;
pub mod network;
pub mod service;

pub use config::{default_state_dir, Config, ConfigError};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{Result, SyncError};
pub use handler::{Ack, HandlerError, HandlerRegistry, SyncHandler};
pub use http::{CredentialProvider, HttpApi, HttpProbe, StaticCredentials};
pub use network::{ConnectivityState, LinkQuality, NetworkMonitor, Probe, ProbeError, StatusChange};
pub use service::{ProgressSync, SyncService, SyncStats};
