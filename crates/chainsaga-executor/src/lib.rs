//! Chainsaga Executor
//!
//! Drives workflow steps through their graph. For each inbound message the
//! [`StepExecutor`] claims the step row, runs the registered
//! [`StepHandler`], persists the [`StepOutcome`] and publishes the next
//! step's message. The [`Dispatcher`] maps broker topics to executors.

pub mod codes;

mod chain;
mod context;
mod dispatcher;
mod error;
mod events;
mod executor;
mod handler;
mod message;

pub use chain::{ChainRegistry, ChainStrategy, TxStatus};
pub use context::StepContext;
pub use dispatcher::Dispatcher;
pub use error::{ChainError, ExecutorError, HandlerError};
pub use events::{ChannelNotifier, ExecutionEvent, NoopNotifier, WorkflowNotifier};
pub use executor::{DEFAULT_MAX_STEP_RETRIES, Disposition, ExecutorDeps, StepExecutor};
pub use handler::{HandlerRegistry, StepHandler, StepInput, StepOutcome};
pub use message::{MessageStatus, StepMessage};
