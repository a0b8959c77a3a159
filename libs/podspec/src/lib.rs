//! # edge-podspec
//!
//! The declarative workload model consumed by the edgelet node agent.
//!
//! ## Design Principles
//!
//! - The JSON shape follows the source orchestrator's pod object (camelCase
//!   field names, optional sections omitted), so a pod received over RPC can
//!   be stored and re-read without loss
//! - Unknown volume source kinds are carried through untouched rather than
//!   rejected
//! - Status is derived state: it is never validated and may be cleared
//!   before a pod is persisted
//!
//! ## Validation
//!
//! [`validate`] enforces the invariants the agent relies on when it turns a
//! pod into runtime services: unit names are unique and never contain the
//! reserved `.` separator, and every volume mount names a declared volume.

mod error;
mod types;
mod validate;

pub use error::SpecError;
pub use types::*;
pub use validate::{validate, UNIT_NAME_SEPARATOR};
