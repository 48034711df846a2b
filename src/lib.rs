#![forbid(unsafe_code)]

pub mod app;
pub mod cli;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod prompts;
pub mod server;
