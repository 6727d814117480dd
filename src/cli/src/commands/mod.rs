pub mod config;
pub mod health;
pub mod request;
pub mod stats;
