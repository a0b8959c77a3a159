//! Edge node agent library.
//!
//! The agent runs on each edge host and realizes pods as services on the
//! local container engine. It keeps no state of its own: each pod is read
//! back from its containers, whose labels embed the submitted spec.
//!
//! ## Architecture
//!
//! - **Service**: the RPC-facing [`Edgelet`], over a [`PodManager`]
//! - **Engine**: translates pods, applies them under one lock, reads them back
//! - **Backend**: typed container engine access (Docker socket or in-memory)
//! - **Tracker**: watches engine events and records which pods changed
//!
//! ## Modules
//!
//! - `translate`: pod to project (one service per unit)
//! - `reconstruct`: containers to pod status
//! - `labels`: the label scheme tying containers to pods
//! - `node`: node facts reported with status polls

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod labels;
pub mod manager;
pub mod node;
pub mod project;
pub mod reconstruct;
pub mod service;
pub mod tracker;
pub mod translate;

pub use engine::{EngineSettings, PodEngine};
pub use error::PodError;
pub use manager::{HostedPodManager, ManagerKind, PodManager};
pub use service::{Edgelet, LogRequest};
