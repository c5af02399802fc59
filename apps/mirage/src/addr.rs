use std::fmt;

use thiserror::Error;
use url::Url;

use crate::protocol::{DEFAULT_PORT, URL_SCHEME};

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("invalid address: {0}")]
    Invalid(#[from] url::ParseError),
    #[error("address must use the {URL_SCHEME}:// scheme, got {0}://")]
    Scheme(String),
    #[error("address is missing a host")]
    MissingHost,
    #[error("address is missing the viewer password")]
    MissingPassword,
}

/// User-facing server address: `vmnetx://host[:port]/<viewer-password>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmAddr {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl VmAddr {
    pub fn parse(input: &str) -> Result<Self, AddrError> {
        let url = Url::parse(input.trim())?;
        if url.scheme() != URL_SCHEME {
            return Err(AddrError::Scheme(url.scheme().to_string()));
        }
        let host = url.host_str().ok_or(AddrError::MissingHost)?.to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let password = url.path().trim_start_matches('/').to_string();
        if password.is_empty() {
            return Err(AddrError::MissingPassword);
        }
        Ok(Self {
            host,
            port,
            password,
        })
    }

    /// `host:port` form for connecting.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for VmAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_PORT {
            write!(f, "{URL_SCHEME}://{}/{}", self.host, self.password)
        } else {
            write!(
                f,
                "{URL_SCHEME}://{}:{}/{}",
                self.host, self.port, self.password
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_default_and_explicit_port() {
        let addr = VmAddr::parse("vmnetx://vm.example.org/s3cret").unwrap();
        assert_eq!(addr.host, "vm.example.org");
        assert_eq!(addr.port, DEFAULT_PORT);
        assert_eq!(addr.password, "s3cret");
        assert_eq!(addr.authority(), format!("vm.example.org:{DEFAULT_PORT}"));

        let addr = VmAddr::parse("vmnetx://10.0.0.7:7000/pw").unwrap();
        assert_eq!(addr.port, 7000);
        assert_eq!(addr.to_string(), "vmnetx://10.0.0.7:7000/pw");
    }

    #[test]
    fn rejects_wrong_scheme_and_missing_parts() {
        assert!(matches!(
            VmAddr::parse("http://host/pw"),
            Err(AddrError::Scheme(_))
        ));
        assert!(matches!(
            VmAddr::parse("vmnetx://host/"),
            Err(AddrError::MissingPassword)
        ));
        assert!(matches!(
            VmAddr::parse("vmnetx://host"),
            Err(AddrError::MissingPassword)
        ));
    }

    #[test]
    fn display_round_trips() {
        for text in ["vmnetx://h/p", "vmnetx://h:9999/p"] {
            let addr = VmAddr::parse(text).unwrap();
            assert_eq!(addr.to_string(), text);
            assert_eq!(VmAddr::parse(&addr.to_string()).unwrap(), addr);
        }
    }
}
