//! `scatter-router` fans one inbound HTTP request out to every shard of a logical service and
//! reduces the shard responses into a single response, as if one backend had answered.
//!
//! Core modules:
//! - [`snapshot`]: replayable capture of the inbound request
//! - [`call`]: per-shard call construction (scatter marker header, work id tags)
//! - [`scatter`]: concurrent dispatch, deadline and cancellation, reduction
//! - [`reducer`]: the reducer contract + default first-success reducer
//! - [`response`]: the reduced response and the sink it is written to
//! - [`server`]: axum server wiring

pub mod call;
pub mod client;
pub mod config;
pub mod outcome;
pub mod reducer;
pub mod response;
pub mod scatter;
pub mod server;
pub mod snapshot;
pub mod spec;
pub mod targets;
pub mod template;
