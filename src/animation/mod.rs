//! # Animation Module
//!
//! Lip-sync for the relayed assistant voice. Everything here is optional:
//! the relay forwards traffic unchanged whether or not animation is enabled.
//!
//! ## Key Components:
//! - **viseme**: the viseme vocabulary and weight sets
//! - **phonemes**: transcript text → timed viseme events
//! - **scheduler**: clock-free driver turning events and targets into weight updates
//! - **pipeline**: per-session glue from upstream events to client animation messages

pub mod phonemes;
pub mod pipeline;
pub mod scheduler;
pub mod viseme;
