//! Stateful real-time enrichment pipeline for user-login events.
//!
//! Consumes raw login events from a Kafka topic, maintains cumulative
//! aggregates and anomaly detectors keyed by user, app version, locale,
//! and device, and republishes an enriched record per accepted event to
//! a downstream topic.

pub mod agent;
pub mod config;
pub mod consume;
pub mod enrich;
pub mod event;
pub mod export;
pub mod publish;
pub mod state;
pub mod stats;
