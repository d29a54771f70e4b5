//! Order gateway
//!
//! HTTP front door that validates order payloads and publishes them as
//! `OrderCreated` events, keyed by order id, through the batching publisher
//! and delivery tracker in `event-bus`.

pub mod config;
pub mod envelope;
pub mod gateway;
pub mod health;
pub mod jetstream_setup;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod validation;
