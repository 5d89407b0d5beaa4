#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! httptun library, the building blocks behind the `httptun` binary:
//! - `tunnel`: wire codec, registry, gateway exchange and agent forwarder
//! - `auth`: agent admission gate
//! - `config`: configuration loading

pub mod auth;
pub mod config;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use tunnel::error::TunnelError;
pub use tunnel::gateway::{gateway_router, GatewayState};
pub use tunnel::registry::ClientRegistry;
