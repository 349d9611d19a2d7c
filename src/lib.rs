pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod geo;
pub mod ratelimit;
pub mod service;
pub mod update;
