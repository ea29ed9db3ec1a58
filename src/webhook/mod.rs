//! The `webhook` module turns inbound MQTT messages into HTTP notifications.
//!
//! - `model`: webhook definitions, defaults and validation.
//! - `registry`: CRUD over stored definitions and topic matching.
//! - `dispatcher`: the delivery engine with per-target retry.

pub mod dispatcher;
pub mod model;
pub mod registry;

pub use dispatcher::{
    DeliveryError, DeliveryOutcome, DeliveryTarget, Dispatcher, Envelope, RELAY_USER_AGENT,
    deliver,
};
pub use model::{WebhookDefinition, WebhookRequest};
pub use registry::Registry;

#[cfg(test)]
mod tests;
