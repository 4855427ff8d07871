//! Session identity and stream URL construction

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::config::StreamConfig;
use crate::constants::{DEFAULT_STREAM_PATH, RELAY_STREAM_PATH};
use crate::error::{ControlError, NetworkError};

/// Endpoint and receiver identifier of one streaming run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    endpoint: String,
    identifier: String,
}

impl SessionIdentity {
    /// Validate and normalize a start request.
    ///
    /// Operators regularly paste the arguments the wrong way round or paste a
    /// full receiver URL as the endpoint, so both cases are repaired:
    /// an identifier that looks like a URL becomes the endpoint when none was
    /// given, and a `serial=` query on the endpoint is stripped and used as
    /// the identifier when none was given.
    pub fn new(endpoint: &str, identifier: &str) -> Result<Self, ControlError> {
        let mut endpoint = endpoint.trim().to_string();
        let mut identifier = identifier.trim().to_string();

        if looks_like_url(&identifier) {
            if endpoint.is_empty() {
                endpoint = identifier;
            }
            identifier = String::new();
        }

        if looks_like_url(&endpoint) {
            if let Some((base, query)) = endpoint.split_once('?') {
                if query.contains("serial=") {
                    if identifier.is_empty() {
                        identifier = query_value(query, "serial").unwrap_or_default();
                    }
                    endpoint = base.to_string();
                }
            }
            endpoint = strip_stream_path(&endpoint).to_string();
        }

        if endpoint.is_empty() {
            return Err(ControlError::MissingEndpoint);
        }
        if identifier.is_empty() {
            return Err(ControlError::MissingIdentifier);
        }

        let identity = Self {
            endpoint,
            identifier,
        };
        Url::parse(&identity.ws_base(&identity.endpoint))
            .map_err(|e| ControlError::InvalidEndpoint(format!("{}: {}", identity.endpoint, e)))?;
        Ok(identity)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// WebSocket URL of the live stream for this identity
    pub fn stream_url(&self, stream: &StreamConfig) -> Result<Url, NetworkError> {
        let (base, path) = match &stream.relay {
            Some(relay) if !relay.base.trim().is_empty() => (relay.base.as_str(), RELAY_STREAM_PATH),
            Some(_) => (self.endpoint.as_str(), RELAY_STREAM_PATH),
            None => (self.endpoint.as_str(), stream.path.as_str()),
        };

        let mut url = Url::parse(&self.ws_base(base))
            .map_err(|e| NetworkError::InvalidUrl(format!("{}: {}", base, e)))?;

        let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
        url.set_path(&joined);

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            match &stream.relay {
                Some(relay) => {
                    query
                        .append_pair("session", &relay.session_code.trim().to_uppercase())
                        .append_pair("serial", &self.identifier)
                        .append_pair("role", "viewer");
                }
                None => {
                    query
                        .append_pair("serial", &self.identifier)
                        .append_pair("mode", "receiver")
                        .append_pair("format", stream.format.trim());
                }
            }
        }

        Ok(url)
    }

    // http -> ws, https -> wss, bare host -> ws://
    fn ws_base(&self, base: &str) -> String {
        let trimmed = base.trim().trim_end_matches('/');
        let lower = trimmed.to_ascii_lowercase();

        if lower.starts_with("wss://") || lower.starts_with("ws://") {
            trimmed.to_string()
        } else if lower.starts_with("https://") {
            format!("wss://{}", &trimmed["https://".len()..])
        } else if lower.starts_with("http://") {
            format!("ws://{}", &trimmed["http://".len()..])
        } else {
            format!("ws://{}", trimmed)
        }
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.identifier)
    }
}

/// Whether `value` looks like a URL rather than an identifier
pub fn looks_like_url(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    v.starts_with("http://") || v.starts_with("https://") || v.contains("://")
}

// A pasted receiver URL already carries the stream path; keep only the base
fn strip_stream_path(endpoint: &str) -> &str {
    let trimmed = endpoint.trim_end_matches('/');
    [DEFAULT_STREAM_PATH, RELAY_STREAM_PATH]
        .iter()
        .find_map(|path| trimmed.strip_suffix(path))
        .filter(|base| !base.is_empty() && !base.ends_with(':') && !base.ends_with('/'))
        .unwrap_or(endpoint)
}

fn query_value(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
