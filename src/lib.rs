// Failure taxonomy shared by every layer
pub mod error;

// File and environment configuration
pub mod config;

// Encrypted per-user token storage
pub mod credentials;

// Google authorization-code flow and signed state
pub mod oauth;

// Identifier → valid access token, with single-flight refresh
pub mod resolver;

// MCP tool dispatch to the spreadsheet collaborator
pub mod dispatch;

// HTTP routes
pub mod api;
