//! # Field Device Publisher
//!
//! A managed field-device simulator library providing connection lifecycle
//! management, config/state synchronization, periodic telemetry reporting,
//! and multi-instance swarm orchestration.
//!
//! ## Features
//!
//! - **Connection lifecycle**: MQTT transport with a startup config handshake
//! - **Config/state sync**: inbound config applied atomically, state reports throttled
//! - **Telemetry generation**: periodic pointset events from simulated points
//! - **Error surfacing**: faults become status entries and system log events
//! - **Swarm orchestration**: bootstrap-fed instances with crash restart
//! - **Capture artifacts**: every message mirrored to an on-disk directory
//!
//! ## Quick Start
//!
//! ```rust
//! use fieldpub::config::{self, DeviceConfig};
//!
//! // Describe a device from a site model
//! let device = DeviceConfig::for_device("my-project", "sites/acme", "AHU-1", "SN-0001");
//! assert_eq!(device.device_id.as_deref(), Some("AHU-1"));
//!
//! // Reporting intervals default to ten seconds until config says otherwise
//! assert_eq!(config::effective_interval_ms(None), 10_000);
//! ```
//!
//! ## Architecture
//!
//! The simulator is organized into several key modules:
//!
//! - [`agent`] - Device agent orchestrator and public API
//! - [`connection`] - Topic routing, handlers, and message capture
//! - [`transport`] - MQTT and in-process transports
//! - [`points`] - Per-point value simulation
//! - [`state`] - Device state document store
//! - [`scheduler`] - Report task lifecycle management
//! - [`swarm`] - Multi-instance supervision and the bootstrap feed

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod agent;
pub mod config;
pub mod connection;
pub mod transport;
pub mod messages;
pub mod points;
pub mod state;
pub mod gate;
pub mod scheduler;
pub mod swarm;

// Re-export main public types for convenience
pub use agent::{Pubber, PubberError, PubberOptions};
pub use config::DeviceConfig;
pub use swarm::{RestartPolicy, SwarmOptions, SwarmSupervisor};
