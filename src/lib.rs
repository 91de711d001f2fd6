// ===============================
// src/lib.rs
// ===============================
pub mod analytics;
pub mod api;
pub mod codec;
pub mod config;
pub mod domain;
pub mod feed;
pub mod metrics;
pub mod rpc_client;
pub mod rpc_server;
pub mod service;
pub mod store;
