//! Tollgate - Token-Bucket Request Admission
//!
//! This crate implements a request-admission gate for HTTP servers. A single
//! shared token bucket decides whether each in-scope request is forwarded or
//! rejected, with filters narrowing the limited scope and exceptions exempting
//! requests outright.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod service;

pub use error::{Result, TollgateError};
pub use ratelimit::{AdmissionGate, Decision, RefillPolicy, TokenBucket};
