//! # Data Retrieval Module
//!
//! HTTP clients for the remote services the gateway talks to. Request
//! building, timeouts and status handling live here so the uploader only sees
//! the `PushTarget` contract.
//!
//! ## Contained Modules:
//!
//! - **`glideport_http`**: the `reqwest` push client for glideport.aero.
//!   Request timeouts map to the retryable `PushError::Timeout`; non-2xx
//!   answers map to `PushError::Rejected`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// HTTP push client for glideport.aero.
pub mod glideport_http;

pub use glideport_http::{GlideportClient, DEFAULT_PUSH_URL};
