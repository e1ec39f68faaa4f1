//! Chainsaga Worker
//!
//! The long-running side of the engine. A [`WorkerRuntime`] owns one
//! `cron_processes` registration, consumes step messages with at most
//! `prefetchCount` running at once, watches for zombie tasks and drains
//! in-flight work on shutdown. The [`Finalizer`] and [`Sweeper`] run next to
//! it and feed completion re-entries back through the broker.

mod config;
mod error;
mod finalizer;
mod inflight;
mod runtime;
mod sweeper;

pub use config::RuntimeParams;
pub use error::WorkerError;
pub use finalizer::Finalizer;
pub use inflight::{InFlight, InFlightGuard};
pub use runtime::{RuntimeState, WorkerRuntime, claim};
pub use sweeper::Sweeper;
