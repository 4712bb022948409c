//! freeflow: a NetFlow v5 collector that decodes exporter datagrams and
//! ships them as JSON events to one or more Splunk HTTP Event Collector
//! endpoints.
//!
//! The binary entrypoint (`main.rs`) is a thin supervisor over the
//! modules here: [`receiver`] owns the UDP ingress socket, [`queue`] is
//! the bounded channel between it and the [`worker`] pool, each worker
//! owns a [`hec::session::Session`] to one configured HEC endpoint, and
//! [`logger`] is the single sink every other task's diagnostics funnel
//! through.

pub mod config;
pub mod decoder;
pub mod hec;
pub mod logger;
pub mod queue;
pub mod receiver;
pub mod signals;
pub mod telemetry;
pub mod worker;
