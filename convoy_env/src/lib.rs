//! Convoy Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the Convoy engines run
//! against either a **real** platform (tokio clock, a phone's ad-hoc Wi-Fi
//! stack) or the deterministic **simulation** harness.
//!
//! # Core Concept
//!
//! Everything the core needs from the outside world is intercepted here:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Ad-hoc group networking (`discover()`, `connect()`, `create_group()`, ...)
//!
//! Platform callbacks are not closures: they arrive as [`PlatformEvent`] values
//! pulled from [`AdHocNetwork::next_event`], so the session state machine can be
//! driven by a plain channel in tests.
//!
//! # Example
//!
//! ```ignore
//! use convoy_env::{AdHocNetwork, ConvoyContext, PlatformEvent};
//!
//! async fn pump<Ctx: ConvoyContext, Net: AdHocNetwork>(ctx: &Ctx, net: &Net) {
//!     net.discover().await?;
//!     while let Some(event) = net.next_event().await {
//!         handle(event, ctx.now());
//!     }
//! }
//! ```

mod context;
mod error;
mod network;
mod tokio_impl;
mod types;

pub use context::ConvoyContext;
pub use error::{EnvError, ErrorKind};
pub use network::{AdHocNetwork, NetworkController};
pub use tokio_impl::TokioContext;
pub use types::{Candidate, CapabilityStatus, DeviceId, GroupInfo, PlatformEvent};
