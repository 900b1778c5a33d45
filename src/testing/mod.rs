//! Testing utilities
//!
//! A scripted [`ServiceClient`](crate::client::ServiceClient) and canonical
//! service responses, so the executor and API can be tested without running
//! the inference services.

pub mod mocks;

pub use mocks::*;
