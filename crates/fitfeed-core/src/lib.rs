//! Core library for fitfeed, a social fitness-tracking client.
//!
//! The interesting part of the client is session handling: keeping a valid
//! bearer token around for every outgoing API call with as little
//! interruption to the user as possible.
//!
//! - [`api`]: GraphQL client for the fitfeed API
//! - [`auth`]: `SessionManager`, token decoding, durable session storage
//! - [`cache`]: on-disk cache of API responses (the signed-in identity)
//! - [`config`]: user configuration and session tuning
//! - [`models`]: wire and domain types shared by the above

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
