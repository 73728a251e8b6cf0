//! Forwarding address types.

/// A host/port pair used by forwarding requests and listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardAddr {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ForwardAddr {
    /// Creates a forwarding address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ForwardAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for ForwardAddr {
    type Err = keel_platform::KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            keel_platform::KeelError::Config(format!("Expected host:port, got '{}'", s))
        })?;
        let port = port.parse().map_err(|_| {
            keel_platform::KeelError::Config(format!("Invalid port in '{}'", s))
        })?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let addr = ForwardAddr::new("localhost", 1080);
        assert_eq!(addr.to_string(), "localhost:1080");

        let parsed: ForwardAddr = "127.0.0.1:2222".parse().unwrap();
        assert_eq!(parsed, ForwardAddr::new("127.0.0.1", 2222));

        assert!("no-port".parse::<ForwardAddr>().is_err());
        assert!("host:notaport".parse::<ForwardAddr>().is_err());
    }
}
