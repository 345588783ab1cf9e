//! Cooperative cancellation.
//!
//! A cancel request never interrupts a worker. It flips a token that the
//! worker checks at the start of each unit of work (a template render, a
//! single executor invocation); the worker then abandons the stage and the
//! coordinator routes the job to cleanup.

mod registry;
mod token;

pub use registry::CancellationRegistry;
pub use token::CancellationToken;
