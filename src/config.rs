//! Runtime configuration of the script host.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::protocol::Limits;


/// Error types that may occur while parsing configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The listen address has no `unix:` or `tcp:` prefix.
    #[error("listen address {0:?} must start with \"unix:\" or \"tcp:\"")]
    UnknownScheme(String),
    /// The listen address has a valid prefix but nothing after it.
    #[error("listen address {0:?} is missing a path or host")]
    EmptyAddress(String),
    /// The socket permissions are not an octal number up to `0o777`.
    #[error("socket mode {0:?} is not an octal permission mask")]
    InvalidMode(String),
}


/// The address the server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// A Unix domain socket at the given path.
    Unix(PathBuf),
    /// A TCP socket bound to `host:port`.
    Tcp(String),
}

impl FromStr for Address {
    type Err = Error;

    /// Parses `unix:<path>` or `tcp:<host:port>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, rest) = if let Some(path) = s.strip_prefix("unix:") {
            (Self::Unix(PathBuf::from(path)), path)
        } else if let Some(host) = s.strip_prefix("tcp:") {
            (Self::Tcp(host.to_owned()), host)
        } else {
            return Err(Error::UnknownScheme(s.to_owned()));
        };

        if rest.is_empty() {
            Err(Error::EmptyAddress(s.to_owned()))
        } else {
            Ok(addr)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unix(p) => write!(f, "unix:{}", p.display()),
            Self::Tcp(h) => write!(f, "tcp:{h}"),
        }
    }
}


/// Configuration of a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where to listen for FastCGI connections.
    pub address: Address,
    /// The maximum number of simultaneously active connections.
    pub max_conns: NonZeroUsize,
    /// The maximum number of active requests on a single connection.
    pub max_reqs: NonZeroUsize,
    /// Permission bits applied to a Unix socket right after binding it.
    pub socket_mode: u32,
}

impl Config {
    /// The listen address used if none is configured.
    pub const DEFAULT_ADDRESS: &'static str = "unix:/var/run/scripthost/scripthost.sock";
    /// Owner and group may connect.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o660;
    const DEFAULT_LIMIT: NonZeroUsize = match NonZeroUsize::new(4) {
        Some(n) => n,
        None => unreachable!(),
    };

    /// Creates a default [`Config`] listening on `address`.
    #[must_use]
    pub fn with_address(address: Address) -> Self {
        Self {
            address,
            max_conns: Self::DEFAULT_LIMIT,
            max_reqs: Self::DEFAULT_LIMIT,
            socket_mode: Self::DEFAULT_SOCKET_MODE,
        }
    }

    /// Returns the capabilities reported to `GetValues` queries.
    ///
    /// Requests are multiplexed on a connection, so `FCGI_MPXS_CONNS` is
    /// always reported as supported.
    #[must_use]
    pub fn limits(&self) -> Limits {
        Limits { max_conns: self.max_conns.get(), max_reqs: self.max_reqs.get(), mpxs_conns: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_address(Address::Unix(PathBuf::from("/var/run/scripthost/scripthost.sock")))
    }
}


/// Parses an octal permission mask such as `660` or `0o660`.
///
/// # Errors
/// Returns [`Error::InvalidMode`] for non-octal input or values above `0o777`.
pub fn parse_mode(s: &str) -> Result<u32, Error> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    match u32::from_str_radix(digits, 8) {
        Ok(m) if m <= 0o777 && !digits.is_empty() => Ok(m),
        _ => Err(Error::InvalidMode(s.to_owned())),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse() -> Result<(), Error> {
        assert_eq!("unix:/tmp/a.sock".parse::<Address>()?, Address::Unix("/tmp/a.sock".into()));
        assert_eq!("tcp:127.0.0.1:9000".parse::<Address>()?, Address::Tcp("127.0.0.1:9000".into()));
        assert!(matches!("udp:1.2.3.4:5".parse::<Address>(), Err(Error::UnknownScheme(_))));
        assert!(matches!("/tmp/a.sock".parse::<Address>(), Err(Error::UnknownScheme(_))));
        assert!(matches!("unix:".parse::<Address>(), Err(Error::EmptyAddress(_))));
        Ok(())
    }

    #[test]
    fn address_display() -> Result<(), Error> {
        for s in ["unix:/var/run/x.sock", "tcp:[::1]:9000"] {
            assert_eq!(s.parse::<Address>()?.to_string(), s);
        }
        Ok(())
    }

    #[test]
    fn defaults() -> Result<(), Error> {
        let config = Config::default();
        assert_eq!(config.address, Config::DEFAULT_ADDRESS.parse()?);
        assert_eq!(config.max_conns.get(), 4);
        assert_eq!(config.max_reqs.get(), 4);
        assert_eq!(config.socket_mode, 0o660);
        assert_eq!(config.limits(), Limits { max_conns: 4, max_reqs: 4, mpxs_conns: true });
        Ok(())
    }

    #[test]
    fn modes() {
        assert_eq!(parse_mode("660"), Ok(0o660));
        assert_eq!(parse_mode("0o600"), Ok(0o600));
        assert!(parse_mode("0o1777").is_err());
        assert!(parse_mode("689").is_err());
        assert!(parse_mode("0o").is_err());
    }
}
