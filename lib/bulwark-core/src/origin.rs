//! Origin identity.
//!
//! Circuit-breaker and pool state is keyed by origin. Identity deliberately
//! includes scheme and port, not just the hostname: `http://api.example.com`
//! and `https://api.example.com` are distinct endpoints that can fail
//! independently.

use std::fmt;

use url::Url;

/// A scheme + host + port identity derived from a request URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    /// Derive the origin of a URL.
    ///
    /// Returns `None` for URLs without a host (e.g. `data:` or `mailto:`),
    /// or when the port is neither explicit nor known for the scheme.
    #[must_use]
    pub fn of(url: &Url) -> Option<Self> {
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// URL scheme.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port (explicit, or the scheme's default).
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
