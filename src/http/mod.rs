// src/http/mod.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
// HTTP plumbing for the remote endpoint: transport seam, reqwest client,
// request signing and an in-process S3 endpoint

pub mod client;
pub mod memory;
pub mod sigv4;
pub mod transport;

pub use client::{HttpClientConfig, ReqwestTransport};
pub use memory::{Fault, MemoryRemote, RemoteObject};
pub use transport::{Exchange, Headers, HttpRequest, Transport, Verb};
