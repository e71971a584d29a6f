//! The casting engine: strategy store, mode listener, automation loop and
//! the worker that runs them.

pub mod automation;
pub mod channels;
pub mod effector;
pub mod mode;
pub mod perception;
pub mod strategy_store;
pub mod worker;

pub use worker::{WorkerEvents, WorkerHandle};
