//! Flow-controlled application trace capture.
//!
//! An app-triggered capture request moves through a Start/Dump/Stop state
//! machine ([`dyntrace`]) that drives the device trace buffer, while
//! [`flow`] enforces per-caller daily byte quotas and the one-capture-per-app
//! -per-day policy on top of an embedded bookkeeping store ([`storage`]).
//! [`agent`] wires the pieces to a request channel and the tokio runtime.

pub mod agent;
pub mod clock;
pub mod config;
pub mod dyntrace;
pub mod error;
pub mod flow;
pub mod storage;
