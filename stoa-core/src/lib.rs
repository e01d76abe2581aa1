pub mod auth;
pub mod config;
pub mod envsubst;
pub mod mime;
pub mod observability;
pub mod template;
