//! Data models for fitfeed API entities.
//!
//! - `User`, `UserStatus`: the signed-in identity returned by `me`
//! - `TokenPair`, `AuthPayload`: credentials issued by login/signup/refresh
//! - `LoginInput`, `SignupInput`: mutation inputs

pub mod auth;
pub mod user;

pub use auth::{AuthPayload, LoginInput, SignupInput, TokenPair};
pub use user::{User, UserStatus};
