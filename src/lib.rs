//! Sandgate - keeps a single gateway process alive inside a sandbox
//!
//! This library provides the lifecycle control plane that:
//! - Finds the gateway among the processes a sandbox tracks, ignoring CLI
//!   invocations that share its name
//! - Reuses a tracked gateway that answers on its port, and kills one that doesn't
//! - Adopts a gateway whose port answers even though the tracker lost it
//! - Launches a new gateway otherwise, with a last-chance probe and captured
//!   logs when startup times out
//! - Serializes concurrent launches with TTL-bounded leases
//!
//! The entry point is [`Reconciler::ensure_gateway`] (or the
//! [`ensure_gateway`] shorthand), called by a routing layer before it
//! forwards a request to the gateway.

pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod lease;
pub mod local;
pub mod locator;
pub mod probe;
pub mod reconciler;
pub mod sandbox;
pub mod supervisor;

pub use config::{Config, GatewayConfig};
pub use error::GatewayError;
pub use reconciler::{ensure_gateway, EnsuredGateway, GatewayOrigin, Reconciler};
pub use sandbox::{ProcessRef, ProcessStatus, Sandbox, SandboxError, SandboxProcess};
