//! A supervisor for serial-attached board test benches.
//!
//! A test bench (BIB, Board Interface Box) hosts units under test wired to
//! multi-port FTDI serial bridges. This crate discovers those ports, groups
//! them into physical devices, hands them out through a pooled reservation
//! layer, and runs deterministic Start/Test/Stop workflows against each
//! unit with priority-ordered multi-level validation and optional bit-bang
//! GPIO signalling.
//!
//! ```no_run
//! use bib_supervisor::config::{watcher::ConfigWatcher, xml};
//! use bib_supervisor::context::SupervisorContext;
//! use bib_supervisor::settings::SupervisorSettings;
//! use bib_supervisor::workflow::WorkflowEngine;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = SupervisorSettings::load()?;
//! let ctx = SupervisorContext::builder().build();
//! ctx.start_background_tasks();
//!
//! let bib = xml::load_file("configuration/bib_client_demo.xml".as_ref())?;
//! ctx.registry.insert(bib);
//!
//! let (triggers_tx, triggers_rx) = tokio::sync::mpsc::unbounded_channel();
//! let _watcher = ConfigWatcher::spawn(
//!     settings.watcher(),
//!     ctx.registry.clone(),
//!     Some(triggers_tx),
//!     ctx.shutdown_token(),
//! )?;
//!
//! let engine = WorkflowEngine::new(ctx.clone());
//! engine.serve_triggers(triggers_rx, ctx.shutdown_token()).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod discovery;
mod error;
pub mod gpio;
pub mod pool;
pub mod protocol;
pub mod settings;
pub mod validation;
pub mod workflow;

pub use crate::config::{BibConfiguration, BibRegistry, ConfigEvent, ConfigWatcher};
pub use crate::context::SupervisorContext;
pub use crate::discovery::{DeviceGroup, GroupSnapshot, PortInfo, SystemInfoCache};
pub use crate::error::Error;
pub use crate::pool::{PortAllocation, PortPool};
pub use crate::protocol::{ProtocolHandler, ProtocolRegistry};
pub use crate::validation::{ValidationLevel, ValidationOutcome};
pub use crate::workflow::{WorkflowEngine, WorkflowResult};
