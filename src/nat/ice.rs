//! ICE server URLs and candidates

use serde::{Deserialize, Serialize};

use crate::config::NatConfig;
use crate::error::NegotiationError;

/// One STUN or TURN server with optional credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    /// Parse `scheme:[user:pass@]host[:port][?query]`.
    ///
    /// Inline credentials are lifted out of the URL since transports expect
    /// them as separate fields. Accepted schemes are `stun`, `stuns`,
    /// `turn` and `turns`.
    pub fn parse(raw: &str) -> Result<Self, NegotiationError> {
        let raw = raw.trim();
        let invalid = |why: &str| NegotiationError::InvalidIceServer(format!("{raw}: {why}"));

        let (scheme, rest) = raw.split_once(':').ok_or_else(|| invalid("missing scheme"))?;
        let scheme = scheme.to_ascii_lowercase();
        if !matches!(scheme.as_str(), "stun" | "stuns" | "turn" | "turns") {
            return Err(invalid("unsupported scheme"));
        }

        let (address, query) = match rest.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (rest, None),
        };

        let (credentials, host_port) = match address.rsplit_once('@') {
            Some((credentials, host_port)) => (Some(credentials), host_port),
            None => (None, address),
        };

        let host = match host_port.strip_prefix('[') {
            // Bracketed IPv6 literal
            Some(v6) => v6.split_once(']').map(|(host, _)| host).unwrap_or(""),
            None => host_port.split(':').next().unwrap_or(""),
        };
        if host.is_empty() || host_port.starts_with("//") {
            return Err(invalid("missing host"));
        }

        let (username, credential) = match credentials {
            Some(credentials) => {
                let (user, pass) = credentials
                    .split_once(':')
                    .ok_or_else(|| invalid("credentials must be user:password"))?;
                if user.is_empty() {
                    return Err(invalid("empty username"));
                }
                (Some(user.to_string()), Some(pass.to_string()))
            }
            None => (None, None),
        };

        let mut url = format!("{scheme}:{host_port}");
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        Ok(Self {
            url,
            username,
            credential,
        })
    }

    pub fn is_relay(&self) -> bool {
        self.url.starts_with("turn")
    }
}

/// Parse every STUN and TURN entry of the configuration
pub fn servers_from_config(config: &NatConfig) -> Result<Vec<IceServer>, NegotiationError> {
    config
        .stun_servers
        .iter()
        .chain(config.turn_servers.iter())
        .map(|raw| IceServer::parse(raw))
        .collect()
}

/// A trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
        }
    }

    /// Candidate lines must carry the `candidate:` attribute prefix
    pub fn validate(&self) -> Result<(), NegotiationError> {
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        if !line.starts_with("candidate:") {
            return Err(NegotiationError::InvalidCandidate(self.candidate.clone()));
        }
        Ok(())
    }
}
