pub mod app;
pub mod bids;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fusion;
pub mod layout;
pub mod manifest;
pub mod output;
pub mod provenance;
pub mod split;
pub mod store;
pub mod volume;
