//! Proxy protocol handshakes shared by inbounds and outbounds
//!
//! Only the handshake lives here; once it completes the stream is relayed
//! unchanged by the tunnel.

pub mod http;
pub mod socks;

use crate::config::UserOptions;

/// Username/password pair for SOCKS5 and HTTP basic auth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials from optional outbound fields; none unless a username is set
    pub fn from_options(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        username
            .filter(|u| !u.is_empty())
            .map(|u| Self::new(u, password.unwrap_or_default()))
    }
}

impl From<&UserOptions> for Credentials {
    fn from(user: &UserOptions) -> Self {
        Self::new(user.username.clone(), user.password.clone())
    }
}
