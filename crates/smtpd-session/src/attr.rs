//! Client identity attributes, and the rules for telling a known
//! value from an unknown one.
//!
//! Inside the server, unknown name, address, name[address] and protocol
//! values are represented by the [UNKNOWN] string while an unknown HELO
//! or message identifier is represented by `None`. Forwarded values use
//! exactly the same representation as locally determined values, so
//! code that consumes an attribute never needs to know where it came
//! from.
pub use peer_resolver::UNKNOWN;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AttrCategory {
    Name,
    Addr,
    NameAddr,
    Protocol,
    Helo,
    Ident,
}

impl AttrCategory {
    /// Returns true for the categories that are forwarded as a single
    /// unit. The message identifier is forwarded independently.
    pub const fn is_client(&self) -> bool {
        !matches!(self, Self::Ident)
    }

    /// Returns true if `value` holds real information for
    /// this category, as opposed to one of the unknown markers.
    pub fn is_available(&self, value: Option<&str>) -> bool {
        match self {
            Self::Helo | Self::Ident => value.is_some(),
            Self::Name | Self::Addr | Self::NameAddr | Self::Protocol => {
                matches!(value, Some(v) if v != UNKNOWN)
            }
        }
    }
}

/// One coherent set of client attributes.
/// A session holds one for the real client and, via the
/// xforward overlay, one for the forwarded client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAttrs {
    name: String,
    addr: String,
    namaddr: String,
    protocol: String,
    helo: Option<String>,
}

impl Default for ClientAttrs {
    fn default() -> Self {
        Self {
            name: UNKNOWN.to_string(),
            addr: UNKNOWN.to_string(),
            namaddr: UNKNOWN.to_string(),
            protocol: UNKNOWN.to_string(),
            helo: None,
        }
    }
}

impl ClientAttrs {
    pub(crate) fn get(&self, category: AttrCategory) -> Option<&str> {
        match category {
            AttrCategory::Name => Some(&self.name),
            AttrCategory::Addr => Some(&self.addr),
            AttrCategory::NameAddr => Some(&self.namaddr),
            AttrCategory::Protocol => Some(&self.protocol),
            AttrCategory::Helo => self.helo.as_deref(),
            AttrCategory::Ident => None,
        }
    }

    /// Sets name and address together, deriving name[address]
    pub(crate) fn set_endpoint(&mut self, name: &str, addr: &str) {
        self.name = name.to_string();
        self.addr = addr.to_string();
        self.update_namaddr();
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
        self.update_namaddr();
    }

    pub(crate) fn set_addr(&mut self, addr: String) {
        self.addr = addr;
        self.update_namaddr();
    }

    pub(crate) fn set_protocol(&mut self, protocol: String) {
        self.protocol = protocol;
    }

    pub(crate) fn set_helo(&mut self, helo: Option<String>) {
        self.helo = helo;
    }

    fn update_namaddr(&mut self) {
        self.namaddr = if self.addr == UNKNOWN {
            self.name.clone()
        } else {
            format!("{}[{}]", self.name, self.addr)
        };
    }
}

/// The value an identity category resolves to, tagged with
/// the source it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effective<'a> {
    Real(Option<&'a str>),
    Forwarded(Option<&'a str>),
}

impl<'a> Effective<'a> {
    pub fn value(&self) -> Option<&'a str> {
        match self {
            Self::Real(v) | Self::Forwarded(v) => *v,
        }
    }

    /// Returns the value, or [UNKNOWN] when the category
    /// has no value; suitable for logging.
    pub fn or_unknown(&self) -> &'a str {
        self.value().unwrap_or(UNKNOWN)
    }

    pub fn is_forwarded(&self) -> bool {
        matches!(self, Self::Forwarded(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn availability_uses_the_right_marker() {
        assert!(!AttrCategory::Name.is_available(Some(UNKNOWN)));
        assert!(AttrCategory::Name.is_available(Some("mx.example.com")));
        // "unknown" is a perfectly valid HELO parameter
        assert!(AttrCategory::Helo.is_available(Some(UNKNOWN)));
        assert!(!AttrCategory::Helo.is_available(None));
        assert!(!AttrCategory::Ident.is_available(None));
    }

    #[test]
    fn namaddr_tracks_name_and_addr() {
        let mut attrs = ClientAttrs::default();
        assert_equal!(attrs.get(AttrCategory::NameAddr), Some(UNKNOWN));
        attrs.set_endpoint("mx.example.com", "192.0.2.1");
        assert_equal!(
            attrs.get(AttrCategory::NameAddr),
            Some("mx.example.com[192.0.2.1]")
        );
        attrs.set_addr("192.0.2.2".to_string());
        assert_equal!(
            attrs.get(AttrCategory::NameAddr),
            Some("mx.example.com[192.0.2.2]")
        );
        assert_equal!(attrs.get(AttrCategory::Ident), None);
    }

    #[test]
    fn namaddr_without_address_is_the_bare_name() {
        let mut attrs = ClientAttrs::default();
        attrs.set_name("relay.upstream.example".to_string());
        assert_equal!(
            attrs.get(AttrCategory::NameAddr),
            Some("relay.upstream.example")
        );
        attrs.set_addr("198.51.100.7".to_string());
        assert_equal!(
            attrs.get(AttrCategory::NameAddr),
            Some("relay.upstream.example[198.51.100.7]")
        );
        attrs.set_endpoint(UNKNOWN, UNKNOWN);
        assert_equal!(attrs.get(AttrCategory::NameAddr), Some(UNKNOWN));
    }
}
