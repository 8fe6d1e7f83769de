//! OAuth2 authorization-code (PKCE) connector for cloud storage providers.

pub mod auth;
pub mod config;
