use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("bus address is empty")]
    Empty,

    #[error("no supported transport in bus address '{0}'")]
    Unsupported(String),

    #[error("malformed bus address entry '{0}'")]
    Malformed(String),
}

/// Location of a bus endpoint. Only `unix:path=` sockets are supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    path: PathBuf,
}

impl BusAddress {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse a D-Bus server address such as `unix:path=/run/user/1000/bus`.
    ///
    /// A bare absolute path is accepted too. When several `;`-separated
    /// entries are given, the first supported one wins.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        if address.starts_with('/') {
            return Ok(Self::from_path(address));
        }

        for entry in address.split(';').filter(|e| !e.is_empty()) {
            let (transport, params) = entry
                .split_once(':')
                .ok_or_else(|| AddressError::Malformed(entry.to_string()))?;
            if transport != "unix" {
                continue;
            }
            for pair in params.split(',').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| AddressError::Malformed(entry.to_string()))?;
                if key == "path" {
                    let value = unescape(value).ok_or_else(|| AddressError::Malformed(entry.to_string()))?;
                    return Ok(Self::from_path(value));
                }
            }
        }

        Err(AddressError::Unsupported(address.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn connect(&self) -> std::io::Result<UnixStream> {
        UnixStream::connect(&self.path).await
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unix:path={}", self.path.display())
    }
}

fn unescape(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_path_entry() {
        let addr = BusAddress::parse("unix:path=/run/user/1000/bus").unwrap();
        assert_eq!(addr.path(), Path::new("/run/user/1000/bus"));
        assert_eq!(addr.to_string(), "unix:path=/run/user/1000/bus");
    }

    #[test]
    fn bare_path_and_extra_keys() {
        assert_eq!(
            BusAddress::parse("/tmp/outside").unwrap().path(),
            Path::new("/tmp/outside")
        );
        let addr = BusAddress::parse("unix:guid=abc,path=/tmp/b").unwrap();
        assert_eq!(addr.path(), Path::new("/tmp/b"));
    }

    #[test]
    fn first_supported_entry_wins() {
        let addr = BusAddress::parse("tcp:host=localhost,port=1;unix:path=/tmp/x;unix:path=/tmp/y").unwrap();
        assert_eq!(addr.path(), Path::new("/tmp/x"));
    }

    #[test]
    fn percent_escapes_are_decoded() {
        let addr = BusAddress::parse("unix:path=/tmp/with%20space").unwrap();
        assert_eq!(addr.path(), Path::new("/tmp/with space"));
        assert!(matches!(
            BusAddress::parse("unix:path=/tmp/bad%2"),
            Err(AddressError::Malformed(_))
        ));
    }

    #[test]
    fn unsupported_and_empty() {
        assert_eq!(BusAddress::parse("  "), Err(AddressError::Empty));
        assert!(matches!(
            BusAddress::parse("unix:abstract=/tmp/dbus-x"),
            Err(AddressError::Unsupported(_))
        ));
        assert!(matches!(
            BusAddress::parse("tcp:host=127.0.0.1,port=4000"),
            Err(AddressError::Unsupported(_))
        ));
        assert!(matches!(BusAddress::parse("nonsense"), Err(AddressError::Malformed(_))));
    }
}
