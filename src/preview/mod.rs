//! Ephemeral build-and-preview pipeline.
//!
//! A deploy walks one direction:
//!
//! ```text
//! github (tree) ─▶ selection + assembler (File Node) ─▶ runtime (mount)
//!     ─▶ orchestrator (install, then server) ─▶ readiness (preview URL)
//! ```
//!
//! [`console`] taps every stage. [`controller`] owns the state machine,
//! the single live process, and the start/stop entry points. [`api`],
//! [`ws`] and [`server`] expose the controller over HTTP.

pub mod api;
pub mod assembler;
pub mod console;
pub mod controller;
pub mod github;
pub mod local;
pub mod models;
pub mod orchestrator;
pub mod readiness;
pub mod runtime;
pub mod selection;
pub mod server;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{DeployOutcome, DeployRequest, PreviewController};
pub use models::{DeviceMode, LifecyclePhase, PreviewAddress, RepoRef, Snapshot};
