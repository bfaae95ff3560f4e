//! Realtime pub/sub client modules.
//!
//! - `client`: public client and subscription handles, options and errors.
//! - `connection`: the actor that owns the transport and all session state.
//! - `proto`: request, reply and push messages.
//! - `transport`: transport adapter contract, websocket and in-memory drivers.
//! - `registry`, `calls`, `keepalive`, `handlers`: state the actor keeps
//!   between frames.

/// In-flight request correlation.
pub(crate) mod calls;
/// Client handle, subscription handle, options and errors.
pub mod client;
/// Connection state machine.
pub(crate) mod connection;
/// Subscription and lifecycle handler sets.
pub mod handlers;
/// Keepalive and reconnect timers.
pub(crate) mod keepalive;
/// Protocol messages.
pub mod proto;
/// Desired channel membership.
pub mod registry;
/// Transport adapters.
pub mod transport;
