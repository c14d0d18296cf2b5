#![recursion_limit = "256"]

pub mod api;
pub mod config;
pub mod twitter;
