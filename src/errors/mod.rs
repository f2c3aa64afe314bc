//! Error types and taxonomy for the gateway core.
//!
//! Every failure that crosses a component boundary is a [`GatewayError`];
//! the [`classify`] function maps any error into the closed [`ErrorKind`]
//! taxonomy that retry and admission policy decisions are made on.

mod classify;
mod error;

pub use classify::{classify, parse_retry_after, ErrorKind};
pub use error::{GatewayError, GatewayResult};
