pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod http;
pub mod notify;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod store;
pub mod system;
pub mod tags;
pub mod tui;
pub mod verify;
