//! UPS identity strings: `upsname@hostname[:port]`, with square brackets
//! for IPv6 literals (`ups@[::1]:3493`).

use std::fmt;

use thiserror::Error;

/// Default port of a UPS status server.
pub const DEFAULT_PORT: u16 = 3493;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no UPS name specified (expected upsname@hostname)")]
    MissingUpsName,
    #[error("no hostname specified")]
    MissingHostname,
    #[error("unclosed IPv6 bracket")]
    UnclosedBracket,
    #[error("invalid port")]
    InvalidPort,
}

/// Where a monitored UPS lives: name on the server, server host, port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpsIdentity {
    upsname: String,
    hostname: String,
    port: u16,
}

impl UpsIdentity {
    /// Parse a user-supplied `upsname@hostname[:port]` string.
    ///
    /// The UPS name and the `@` are mandatory; the port defaults to
    /// [`DEFAULT_PORT`]. An IPv6 host must be bracketed so its colons
    /// are not mistaken for the port separator.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let (upsname, hostspec) = raw.split_once('@').ok_or(IdentityError::MissingUpsName)?;

        if upsname.is_empty() {
            return Err(IdentityError::MissingUpsName);
        }

        let (hostname, portspec) = if let Some(rest) = hostspec.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or(IdentityError::UnclosedBracket)?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(IdentityError::InvalidPort),
            }
        } else {
            match hostspec.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostspec, None),
            }
        };

        if hostname.is_empty() {
            return Err(IdentityError::MissingHostname);
        }

        let port = match portspec {
            Some(p) => p.parse::<u16>().map_err(|_| IdentityError::InvalidPort)?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            upsname: upsname.to_string(),
            hostname: hostname.to_string(),
            port,
        })
    }

    pub fn upsname(&self) -> &str {
        &self.upsname
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for UpsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "{}@[{}]:{}", self.upsname, self.hostname, self.port)
        } else if self.port == DEFAULT_PORT {
            write!(f, "{}@{}", self.upsname, self.hostname)
        } else {
            write!(f, "{}@{}:{}", self.upsname, self.hostname, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_host() {
        let id = UpsIdentity::parse("myups@example.org").unwrap();
        assert_eq!(id.upsname(), "myups");
        assert_eq!(id.hostname(), "example.org");
        assert_eq!(id.port(), DEFAULT_PORT);
    }

    #[test]
    fn parses_explicit_port() {
        let id = UpsIdentity::parse("myups@example.org:3494").unwrap();
        assert_eq!(id.port(), 3494);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let id = UpsIdentity::parse("myups@[fe80::1]:3494").unwrap();
        assert_eq!(id.hostname(), "fe80::1");
        assert_eq!(id.port(), 3494);

        let id = UpsIdentity::parse("myups@[::1]").unwrap();
        assert_eq!(id.hostname(), "::1");
        assert_eq!(id.port(), DEFAULT_PORT);
    }

    #[test]
    fn rejects_missing_at() {
        assert_eq!(
            UpsIdentity::parse("example.org"),
            Err(IdentityError::MissingUpsName)
        );
    }

    #[test]
    fn rejects_empty_name_or_host() {
        assert_eq!(UpsIdentity::parse("@host"), Err(IdentityError::MissingUpsName));
        assert_eq!(UpsIdentity::parse("ups@"), Err(IdentityError::MissingHostname));
    }

    #[test]
    fn rejects_unclosed_bracket() {
        assert_eq!(
            UpsIdentity::parse("myups@[fe80::1"),
            Err(IdentityError::UnclosedBracket)
        );
    }

    #[test]
    fn rejects_bad_port() {
        assert_eq!(
            UpsIdentity::parse("myups@host:notaport"),
            Err(IdentityError::InvalidPort)
        );
        assert_eq!(
            UpsIdentity::parse("myups@[::1]junk"),
            Err(IdentityError::InvalidPort)
        );
    }

    #[test]
    fn displays_canonical_form() {
        for raw in ["myups@host", "myups@host:3494", "myups@[::1]:3493"] {
            let id = UpsIdentity::parse(raw).unwrap();
            assert_eq!(UpsIdentity::parse(&id.to_string()).unwrap(), id);
        }
    }
}
