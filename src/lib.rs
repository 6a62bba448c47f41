pub mod auth;
pub mod common;
pub mod config;
pub mod extractor;
pub mod jobs;
pub mod secrets;
pub mod store;
