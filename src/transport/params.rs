//! Connection parameters derived from the broker URL.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use lapin::uri::AMQPUri;
use url::Url;

use crate::error::{LayerError, Result};

/// Query parameter carrying the keepalive interval in seconds.
pub const HEARTBEAT_PARAM: &str = "heartbeat_interval";

/// Immutable connection parameters shared by every component of a layer.
#[derive(Clone)]
pub struct ConnectionParams {
    uri: AMQPUri,
    heartbeat: Option<u16>,
}

impl ConnectionParams {
    /// Parse an `amqp://` or `amqps://` URL.
    ///
    /// `heartbeat_interval` is translated to the AMQP heartbeat negotiated at
    /// connection time; lapin's own `heartbeat` parameter is accepted too.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parsed = Url::parse(raw)
            .map_err(|e| LayerError::Configuration(format!("invalid broker URL: {}", e)))?;

        match parsed.scheme() {
            "amqp" | "amqps" => {}
            other => {
                return Err(LayerError::Configuration(format!(
                    "unsupported broker URL scheme '{}'",
                    other
                )))
            }
        }

        let mut heartbeat = None;
        let mut passthrough = Vec::new();
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                HEARTBEAT_PARAM | "heartbeat" => {
                    let secs = value.parse::<u16>().map_err(|_| {
                        LayerError::Configuration(format!(
                            "{} must be an integer number of seconds, got '{}'",
                            key, value
                        ))
                    })?;
                    heartbeat = Some(secs);
                }
                _ => passthrough.push((key.into_owned(), value.into_owned())),
            }
        }

        parsed.set_query(None);
        if !passthrough.is_empty() {
            parsed.query_pairs_mut().extend_pairs(&passthrough);
        }

        let mut uri = AMQPUri::from_str(parsed.as_str())
            .map_err(|e| LayerError::Configuration(format!("invalid broker URL: {}", e)))?;
        if heartbeat.is_some() {
            uri.query.heartbeat = heartbeat;
        }

        Ok(Self { uri, heartbeat })
    }

    /// The URI handed to lapin.
    pub fn uri(&self) -> &AMQPUri {
        &self.uri
    }

    pub fn vhost(&self) -> &str {
        &self.uri.vhost
    }

    pub fn host(&self) -> &str {
        &self.uri.authority.host
    }

    pub fn port(&self) -> u16 {
        self.uri.authority.port
    }

    pub fn username(&self) -> &str {
        &self.uri.authority.userinfo.username
    }

    pub fn password(&self) -> &str {
        &self.uri.authority.userinfo.password
    }

    /// Requested keepalive interval, if any. `None` keeps the broker's proposal.
    pub fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat.map(|secs| Duration::from_secs(secs.into()))
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host())
            .field("port", &self.port())
            .field("vhost", &self.vhost())
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl fmt::Display for ConnectionParams {
    /// Credential-free rendering for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host(), self.port(), self.vhost())
    }
}
