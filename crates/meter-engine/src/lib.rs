//! Meter engine: event scheduling, rule lifecycle and the daemon glue.
//!
//! ```text
//! control ─┐
//!          ▼
//!   ┌─── Engine (event loop, scheduler, rule manager) ───┐
//!   │                                                    │
//!  tap ─▶ ring ─▶ classifier ─▶ processor ─▶ records ─▶ exporter ─▶ sinks
//! ```

pub mod config;
pub mod control;
pub mod engine;
pub mod event;
pub mod manager;
pub mod pidfile;
pub mod scheduler;

pub use config::DaemonConfig;
pub use engine::{
    ClassifierKind, ControlHandle, ControlReply, ControlRequest, Engine, EngineConfig,
    TaskSelector,
};
pub use event::Event;
pub use manager::RuleManager;
pub use pidfile::PidFile;
pub use scheduler::EventScheduler;
