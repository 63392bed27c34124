//! devhost - a local-development reverse proxy and process supervisor
//!
//! This library provides a proxy for `*.test` style hostnames that:
//! - Routes HTTP traffic based on the Host header to configured apps
//! - Starts command apps and multi-service apps on demand, dependencies first
//! - Shows waiting and failure pages while a process is not yet serving
//! - Proxies fixed-port apps and serves static-file apps directly
//! - Exposes a control API and a live status stream on a dashboard host

pub mod broadcast;
pub mod config;
pub mod context;
pub mod control;
pub mod deps;
pub mod error;
pub mod logbuf;
pub mod pages;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod static_files;
pub mod status;
pub mod supervisor;
