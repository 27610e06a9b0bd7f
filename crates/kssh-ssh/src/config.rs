use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct SshConnectConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Agent socket whose identities are offered to the server.
    pub agent_socket: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    pub keepalive_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub term: String,
    pub term_width: u32,
    pub term_height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key and log its fingerprint.
    LogFingerprint,
    /// Only accept a host key with this `SHA256:` fingerprint.
    Pinned(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target has no host")]
    MissingHost,
    #[error("target has an empty user name")]
    EmptyUser,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("unterminated '[' in target")]
    UnterminatedBracket,
}

/// `[user@]host[:port]`, with `[addr]:port` for IPv6 literals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl Target {
    pub fn parse(target: &str) -> Result<Self, TargetError> {
        let (user, rest) = match target.rfind('@') {
            Some(at) => {
                let user = &target[..at];
                if user.is_empty() {
                    return Err(TargetError::EmptyUser);
                }
                (Some(user.to_string()), &target[at + 1..])
            }
            None => (None, target),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let close = bracketed
                .find(']')
                .ok_or(TargetError::UnterminatedBracket)?;
            let host = &bracketed[..close];
            match &bracketed[close + 1..] {
                "" => (host, None),
                tail => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(parse_port(port)?)),
                    None => return Err(TargetError::InvalidPort(tail.to_string())),
                },
            }
        } else if rest.matches(':').count() == 1 {
            let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
            (host, Some(parse_port(port)?))
        } else {
            // Zero colons, or a bare IPv6 literal.
            (rest, None)
        };

        if host.is_empty() {
            return Err(TargetError::MissingHost);
        }
        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

fn parse_port(raw: &str) -> Result<u16, TargetError> {
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(TargetError::InvalidPort(raw.to_string())),
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}
