//! GraphQL API client module for the fitfeed service.
//!
//! This module provides the `ApiClient` for talking to the fitfeed GraphQL
//! endpoint and the `AuthApi` trait, the narrow slice of that API the
//! session manager depends on.
//!
//! Authenticated requests carry the access token as a bearer credential.
//! A request rejected as unauthenticated raises the session's `AuthSignal`
//! so the session manager can refresh out of band.

pub mod client;
pub mod error;

pub use client::{ApiClient, AuthApi, DEFAULT_GRAPHQL_URL};
pub use error::ApiError;
