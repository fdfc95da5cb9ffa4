//! Network endpoint of a provider.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::archive::{InputArchive, Load, LoadError, OutputArchive, Save};

/// Where a provider can be reached. Travels inside storage descriptors and
/// IOV locations so any consumer can open its own connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint(pub SocketAddr);

impl Endpoint {
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Endpoint(s.parse()?))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint(addr)
    }
}

// On the wire an endpoint is its textual form; both sides re-parse. Keeps
// the archive free of address-family specific layouts.
impl Save for Endpoint {
    fn save(&self, oa: &mut OutputArchive) {
        self.0.to_string().save(oa);
    }
}

impl Load for Endpoint {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        let text = String::load(ia)?;
        text.parse()
            .map_err(|e| LoadError::Invalid(format!("endpoint {text:?}: {e}")))
    }
}
