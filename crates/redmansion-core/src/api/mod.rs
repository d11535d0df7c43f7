//! Remote data service access.
//!
//! The rest of the crate talks to the service only through the
//! [`RemoteService`] trait. [`ApiClient`] is the HTTP implementation used
//! by the binary; tests substitute an in-memory fake.

pub mod client;
pub mod error;
pub mod remote;

pub use client::ApiClient;
pub use error::{ApiError, ApiResult};
pub use remote::RemoteService;
