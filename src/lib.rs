//! fngate - A multi-tenant front door for serverless functions
//!
//! This library routes HTTP traffic to per-tenant function units:
//! - Resolves the tenant from the first label of the Host header
//! - Forwards requests for ACTIVE apps as API-gateway style invocation events
//! - Translates function proxy responses back into HTTP responses
//! - Deploys, activates, deactivates and removes apps through a control API
//! - Waits for newly provisioned functions to become invokable
//! - Keeps app records in memory or in SQLite

pub mod backend;
pub mod bridge;
pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod service;
