//! FlowVPN Network Layer
//!
//! The two leaf services the session layer is built on:
//!
//! 1. `HttpClient` fetches subscription documents with bounded
//!    connect/read timeouts over plain HTTP or rustls.
//! 2. `HostResolver` resolves proxy server hostnames once and keeps
//!    the answer for the lifetime of the process.

mod client;
mod dns;

pub use client::{HttpClient, HttpClientConfig, HttpError, Response};
pub use dns::{DnsConfig, DnsError, HostResolver};
