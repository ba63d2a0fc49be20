//! # cadenza-call
//!
//! Client-side call cores.  The two state machines ([`direct::DirectCall`]
//! and [`group::GroupCall`]) are sans-IO: they consume events (registry
//! replies, relayed signals, media/relay completions) and emit action lists
//! the embedding application executes against its transport, its native
//! media stack, and the session store.  Keeping the cores pure makes every
//! ordering and failure property testable without sockets or devices.

pub mod direct;
pub mod group;
pub mod media;
pub mod quality;
pub mod relay;
pub mod rtc_config;
pub mod speaker;
