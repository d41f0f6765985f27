//! Typed clients over the external data providers.
//!
//! Every client owns one reqwest `Client`, degrades failures to `None`, and
//! reports broker-level attempts through the shared observability ring.

pub mod alpaca;
pub mod finviz;
pub mod fred;
pub mod observability;
pub mod reddit;
pub mod schwab;
pub mod tavily;
