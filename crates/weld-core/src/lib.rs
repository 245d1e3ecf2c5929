//! # Weld Core
//!
//! Pipeline weld engine and per-connector session dispatcher for a UTM
//! gateway.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Pipeline foundry** - Welds the ordered connector chain a session traverses
//! - **Policy inheritance** - Closest node instance wins, services apply everywhere
//! - **Session dispatcher** - Per-connector session lifecycle and event routing
//! - **Engine** - Drives welded pipelines from transport events
//! - **Configuration** - TOML topology and tuning
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weld_core::{Config, NewSessionOutcome, SessionRequest, SessionTuple, Topology};
//! use weld_core::transport::NullTransport;
//! use weld_core::tuple::Protocol;
//!
//! let config = Config::load("weld.toml")?;
//! let topology = Topology::build(&config, Arc::new(NullTransport))?;
//! let engine = topology.engine();
//!
//! let tuple = SessionTuple::new(
//!     Protocol::Tcp,
//!     "192.168.1.10:51000".parse()?,
//!     "93.184.216.34:80".parse()?,
//! );
//! if let NewSessionOutcome::Accepted { stages } = engine.new_session_request(SessionRequest::new(1, tuple, Some(1))) {
//!     println!("inspecting through {stages} stages");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connector;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fitting;
pub mod foundry;
pub mod handler;
pub mod node;
pub mod pipeline;
pub mod policy;
pub mod session;
pub mod transport;
pub mod tuple;

// Re-exports for convenience
pub use config::{Config, Topology};
pub use connector::{Affinity, PipelineConnector, Subscription};
pub use dispatch::Dispatcher;
pub use engine::{Engine, NewSessionOutcome};
pub use error::{Error, Result};
pub use fitting::Fitting;
pub use foundry::PipelineFoundry;
pub use handler::{SessionEvent, SessionEventHandler};
pub use node::{Node, NodeManager, NodeState, NodeTable};
pub use pipeline::Pipeline;
pub use policy::{PolicyId, PolicyManager, PolicyTree};
pub use session::{NewSessionRequest, Session, SessionId, SessionRequest};
pub use transport::Transport;
pub use tuple::{SessionTuple, Side};
