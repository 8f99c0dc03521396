//! A resilient request layer for the JobHub backend.
//!
//! See [`client::RequestLayer`] for the entry point.

#[macro_use]
pub mod metrics;

pub mod breaker;
pub mod caching;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod retry;
pub mod timeout;
pub mod transport;
pub mod utils;


pub use client::{RequestLayer, RequestOptions};
pub use error::{ErrorKind, RequestError};
