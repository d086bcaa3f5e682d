//! # Relay Module
//!
//! Bridges one client websocket to one upstream realtime connection.
//!
//! ## Key Components:
//! - **event**: frame decoding and the closed set of event kinds
//! - **session**: per-connection state machine with ordered queueing and teardown
//! - **upstream**: the outbound websocket to the conversational endpoint
//! - **registry**: non-owning lookup of live sessions

pub mod event;
pub mod registry;
pub mod session;
pub mod upstream;
