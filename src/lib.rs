//! # mqtt-relay
//!
//! `mqtt-relay` bridges MQTT brokers to HTTP webhooks. It keeps one
//! supervised connection per configured broker, records every outbound
//! publish in a durable outbox and forwards inbound messages to the webhooks
//! whose topic filters match.
//!
//! ## Core Modules
//!
//! - `broker`: topic matching, per-broker sessions and the connection supervisor.
//! - `config`: layered configuration from file and environment.
//! - `persistence`: the outbox and webhook storage, backed by SQLite or sled.
//! - `stats`: counters and latency windows shared by every component.
//! - `transport`: the MQTT client abstraction and its `rumqttc` implementation.
//! - `utils`: error types and logging setup.
//! - `webhook`: webhook definitions, the registry and the dispatch engine.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod stats;
pub mod transport;
pub mod utils;
pub mod webhook;

#[cfg(test)]
mod tests;
