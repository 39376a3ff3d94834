//! Core session, hub-reconciliation and async completion layer for a
//! client-side IoT platform connector.
//!
//! An integrator builds one [`client::Client`] from a [`config::ConnectorConfig`]
//! and an [`auth::AuthProvider`], then drives hub/device lifecycle over HTTP
//! ([`cloud::hub::HubController`]) and the MQTT session ([`session::SessionManager`])
//! through that facade. Long-running calls are offered in both blocking and
//! [`worker::Future`]-returning async flavors (§2, §4.1).

pub mod auth;
pub mod client;
pub mod cloud;
pub mod config;
pub mod device;
pub mod error;
pub mod message;
pub mod mqtt;
pub mod session;
pub mod util;
pub mod worker;

pub use client::Client;
pub use device::Device;
