//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most
//! likely to originate from this code, intentionally -- bad configuration
//! should never be allowed to silently degrade into a half-working
//! collector.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Errors produced by [`Config::from_file`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The config file couldn't be opened.
    #[error("unable to read configuration file {path}: {source}")]
    Read {
        /// path that failed to open
        path: PathBuf,
        /// underlying IO failure
        #[source]
        source: std::io::Error,
    },
    /// A required key was never supplied.
    #[error("missing required configuration key: {0}")]
    MissingKey(&'static str),
    /// A key's value failed to parse into its expected type.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// offending key
        key: &'static str,
        /// offending value
        value: String,
    },
    /// `hec_server` and `hec_token` were both given but have different
    /// lengths.
    #[error("hec_server lists {servers} endpoint(s) but hec_token lists {tokens}")]
    HecListLengthMismatch {
        /// number of hec_server entries
        servers: usize,
        /// number of hec_token entries
        tokens: usize,
    },
    /// The `hec_server` list was empty.
    #[error("at least one hec_server endpoint is required")]
    EmptyHecList,
}

/// One Splunk HEC endpoint: a host, a port, and the token used to
/// authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HecEndpoint {
    /// hostname or IPv4 literal
    pub host: String,
    /// TCP port, 1..=65535
    pub port: u16,
    /// HEC authentication token
    pub token: String,
}

/// Immutable, fully-validated program configuration. Built once at startup
/// and shared read-only across every task via `Arc<Config>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// local IPv4 address to bind the NetFlow UDP listener to
    pub bind_addr: Ipv4Addr,
    /// local UDP port to bind to
    pub bind_port: u16,
    /// number of HEC shipping workers to run, 1..=64
    pub threads: u8,
    /// packet queue capacity, in bytes
    pub queue_size: usize,
    /// value copied into every emitted JSON event's `sourcetype` field
    pub sourcetype: String,
    /// ordered list of HEC endpoints; worker `i` ships to `hec[i % len]`
    pub hec_endpoints: Vec<HecEndpoint>,
    /// wrap each HEC connection in a TLS 1.2 client handshake
    pub ssl_enabled: bool,
    /// path the Logger Sink appends lines to
    pub log_file: PathBuf,
    /// emit DEBUG-level log lines in addition to INFO/WARNING/ERROR
    pub debug: bool,
}

impl Config {
    /// Load and validate configuration from a `key = value` text file.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] if the file can't be read, a required key is
    /// missing, a value fails to parse, or the `hec_server`/`hec_token`
    /// lists disagree in length.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&contents)
    }

    fn from_str(contents: &str) -> Result<Self, Error> {
        let mut raw = RawConfig::default();
        for line in contents.lines() {
            let Some((key, value)) = split_line(line) else {
                continue;
            };
            raw.set(key, value);
        }
        raw.finish()
    }
}

/// Accumulates raw `key = value` pairs before they're validated and
/// converted into a [`Config`]. Mirrors the original's single-pass
/// `read_configuration`, which assigns directly into the config struct as
/// each line is parsed.
#[derive(Default)]
struct RawConfig {
    bind_addr: Option<String>,
    bind_port: Option<String>,
    threads: Option<String>,
    queue_size: Option<String>,
    sourcetype: Option<String>,
    hec_server: Option<String>,
    hec_token: Option<String>,
    log_file: Option<String>,
    ssl_enabled: Option<String>,
    debug: Option<String>,
}

impl RawConfig {
    fn set(&mut self, key: &str, value: &str) {
        let value = value.to_string();
        match key {
            "bind_addr" => self.bind_addr = Some(value),
            "bind_port" => self.bind_port = Some(value),
            "threads" => self.threads = Some(value),
            "queue_size" => self.queue_size = Some(value),
            "sourcetype" => self.sourcetype = Some(value),
            "hec_server" => self.hec_server = Some(value),
            "hec_token" => self.hec_token = Some(value),
            "log_file" => self.log_file = Some(value),
            "ssl_enabled" => self.ssl_enabled = Some(value),
            "debug" => self.debug = Some(value),
            _ => {
                // Unknown keys are ignored rather than rejected: a newer
                // config file read by an older binary should still start.
            }
        }
    }

    fn finish(self) -> Result<Config, Error> {
        let bind_addr = self
            .bind_addr
            .as_deref()
            .ok_or(Error::MissingKey("bind_addr"))?
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::InvalidValue {
                key: "bind_addr",
                value: self.bind_addr.clone().unwrap_or_default(),
            })?;

        let bind_port = parse_port(self.bind_port.as_deref(), "bind_port")?;

        let threads: u8 = self
            .threads
            .as_deref()
            .ok_or(Error::MissingKey("threads"))?
            .parse()
            .ok()
            .filter(|&t: &u8| (1..=64).contains(&t))
            .ok_or_else(|| Error::InvalidValue {
                key: "threads",
                value: self.threads.clone().unwrap_or_default(),
            })?;

        let queue_size: usize = self
            .queue_size
            .as_deref()
            .ok_or(Error::MissingKey("queue_size"))?
            .parse()
            .ok()
            .filter(|&q: &usize| q >= 1)
            .ok_or_else(|| Error::InvalidValue {
                key: "queue_size",
                value: self.queue_size.clone().unwrap_or_default(),
            })?;

        let sourcetype = self
            .sourcetype
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingKey("sourcetype"))?;

        let hec_endpoints = parse_hec_endpoints(self.hec_server.as_deref(), self.hec_token.as_deref())?;

        let log_file = self
            .log_file
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .ok_or(Error::MissingKey("log_file"))?;

        let ssl_enabled = parse_flag(self.ssl_enabled.as_deref());
        let debug = parse_flag(self.debug.as_deref());

        Ok(Config {
            bind_addr,
            bind_port,
            threads,
            queue_size,
            sourcetype,
            hec_endpoints,
            ssl_enabled,
            log_file,
            debug,
        })
    }
}

fn parse_port(value: Option<&str>, key: &'static str) -> Result<u16, Error> {
    let raw = value.ok_or(Error::MissingKey(key))?;
    raw.parse::<u16>()
        .ok()
        .filter(|&p| p >= 1)
        .ok_or_else(|| Error::InvalidValue {
            key,
            value: raw.to_string(),
        })
}

fn parse_flag(value: Option<&str>) -> bool {
    matches!(value, Some("1"))
}

/// Parse the `;`-separated `hec_server` (`host:port`) and `hec_token` lists
/// into a positional `Vec<HecEndpoint>`.
fn parse_hec_endpoints(
    hec_server: Option<&str>,
    hec_token: Option<&str>,
) -> Result<Vec<HecEndpoint>, Error> {
    let servers: Vec<&str> = hec_server
        .ok_or(Error::MissingKey("hec_server"))?
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let tokens: Vec<&str> = hec_token
        .ok_or(Error::MissingKey("hec_token"))?
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if servers.is_empty() {
        return Err(Error::EmptyHecList);
    }
    if servers.len() != tokens.len() {
        return Err(Error::HecListLengthMismatch {
            servers: servers.len(),
            tokens: tokens.len(),
        });
    }

    servers
        .into_iter()
        .zip(tokens)
        .map(|(server, token)| {
            let (host, port_str) = server.rsplit_once(':').ok_or_else(|| Error::InvalidValue {
                key: "hec_server",
                value: server.to_string(),
            })?;
            let port = port_str
                .parse::<u16>()
                .ok()
                .filter(|&p| p >= 1)
                .ok_or_else(|| Error::InvalidValue {
                    key: "hec_server",
                    value: server.to_string(),
                })?;
            if host.is_empty() {
                return Err(Error::InvalidValue {
                    key: "hec_server",
                    value: server.to_string(),
                });
            }
            Ok(HecEndpoint {
                host: host.to_string(),
                port,
                token: token.to_string(),
            })
        })
        .collect()
}

/// Split a configuration line into `(key, value)`, skipping comments and
/// blank lines. Accepts both `key = value` and `key=value`, matching the
/// original's fallback between two `sscanf` patterns.
fn split_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"
# comment line is ignored
bind_addr = 0.0.0.0
bind_port=2055
threads = 4
queue_size = 1048576
sourcetype=netflow
hec_server = splunk1.example.com:8088;splunk2.example.com:8088
hec_token = token-one;token-two
log_file = /var/log/freeflow.log
ssl_enabled = 1
debug=0
"#
    }

    #[test]
    fn parses_full_config() {
        let config = Config::from_str(sample()).expect("should parse");
        assert_eq!(config.bind_addr, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(config.bind_port, 2055);
        assert_eq!(config.threads, 4);
        assert_eq!(config.queue_size, 1_048_576);
        assert_eq!(config.sourcetype, "netflow");
        assert_eq!(config.hec_endpoints.len(), 2);
        assert_eq!(config.hec_endpoints[0].host, "splunk1.example.com");
        assert_eq!(config.hec_endpoints[0].port, 8088);
        assert_eq!(config.hec_endpoints[0].token, "token-one");
        assert_eq!(config.hec_endpoints[1].token, "token-two");
        assert!(config.ssl_enabled);
        assert!(!config.debug);
        assert_eq!(config.log_file, PathBuf::from("/var/log/freeflow.log"));
    }

    #[test]
    fn rejects_mismatched_hec_lists() {
        let contents = sample().replace(
            "hec_token = token-one;token-two",
            "hec_token = token-one",
        );
        let err = Config::from_str(&contents).unwrap_err();
        assert!(matches!(err, Error::HecListLengthMismatch { servers: 2, tokens: 1 }));
    }

    #[test]
    fn rejects_missing_required_key() {
        let contents = sample().replace("bind_port=2055", "");
        let err = Config::from_str(&contents).unwrap_err();
        assert!(matches!(err, Error::MissingKey("bind_port")));
    }

    #[test]
    fn rejects_out_of_range_thread_count() {
        let contents = sample().replace("threads = 4", "threads = 0");
        let err = Config::from_str(&contents).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { key: "threads", .. }));
    }

    #[test]
    fn defaults_flags_to_false_when_absent() {
        let contents = sample().replace("ssl_enabled = 1\n", "");
        let config = Config::from_str(&contents).expect("should parse");
        assert!(!config.ssl_enabled);
    }

    #[test]
    fn equals_without_spaces_also_parses() {
        assert_eq!(split_line("threads=8"), Some(("threads", "8")));
        assert_eq!(split_line(" threads = 8 "), Some(("threads", "8")));
        assert_eq!(split_line("# threads = 8"), None);
        assert_eq!(split_line(""), None);
    }
}
