pub mod auth;
pub mod backfill;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod ratelimit;
pub mod retry;
pub mod validate;
