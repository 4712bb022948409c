//! Everything related to shipping decoded events to a single Splunk HTTP
//! Event Collector endpoint: the wire framing (`formatter`) and the
//! persistent, optionally-TLS connection that carries it (`session`).

pub mod formatter;
pub mod session;

pub use formatter::build_request;
pub use session::Session;
