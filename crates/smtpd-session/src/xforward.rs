//! Client identity forwarded by a trusted upstream (a content filter or
//! proxy front-end), and the rules for choosing between it and the
//! identity of the connected peer.
//!
//! The client name, address, protocol and HELO attributes are forwarded
//! as one unit: once any of them has been received, all of them are
//! taken from the forwarded set so that attributes of two different
//! upstream sessions are never stitched together. The message
//! identifier is forwarded independently.
//!
//! Whether the peer may forward anything at all is decided by the
//! caller before any update is applied.
use crate::attr::{AttrCategory, ClientAttrs, Effective, UNKNOWN};
use std::net::IpAddr;
use thiserror::Error;

bitflags::bitflags! {
    /// Which forwarded attributes have been received
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct XforwardFlags: u8 {
        /// Forwarded values have been given their defaults
        const INIT = 1 << 0;
        const NAME = 1 << 1;
        const ADDR = 1 << 2;
        const PROTO = 1 << 3;
        const HELO = 1 << 4;
        const IDENT = 1 << 5;

        const CLIENT_MASK = Self::NAME.bits()
            | Self::ADDR.bits()
            | Self::PROTO.bits()
            | Self::HELO.bits();
    }
}

bitflags::bitflags! {
    /// The XFORWARD attributes that a downstream proxy advertised
    /// in its EHLO response
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct XforwardFeatures: u8 {
        const NAME = 1 << 0;
        const ADDR = 1 << 1;
        const PROTO = 1 << 2;
        const HELO = 1 << 3;
        const IDENT = 1 << 4;
    }
}

impl XforwardFeatures {
    /// Parse the parameter portion of an `XFORWARD` EHLO keyword,
    /// eg: `NAME ADDR PROTO HELO`. Unrecognized names are ignored.
    pub fn from_ehlo_param(param: &str) -> Self {
        let mut features = Self::empty();
        for word in param.split_ascii_whitespace() {
            match word.to_ascii_uppercase().as_str() {
                "NAME" => features |= Self::NAME,
                "ADDR" => features |= Self::ADDR,
                "PROTO" => features |= Self::PROTO,
                "HELO" => features |= Self::HELO,
                "IDENT" => features |= Self::IDENT,
                _ => {}
            }
        }
        features
    }
}

/// Placeholder used on the wire for an attribute that the
/// upstream does not know.
pub const XFORWARD_UNAVAILABLE: &str = "[UNAVAILABLE]";
/// Placeholder used on the wire for an attribute that the
/// upstream could not determine due to a transient error.
pub const XFORWARD_TEMPUNAVAIL: &str = "[TEMPUNAVAIL]";

const MAX_PROTOCOL_LEN: usize = 64;
const MAX_HELO_LEN: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XforwardError {
    #[error("XFORWARD requires at least one attribute")]
    NoAttributes,
    #[error("Bad XFORWARD attribute: {0}")]
    Malformed(String),
    #[error("Bad XFORWARD attribute name: {0}")]
    UnknownAttribute(String),
    #[error("Bad XFORWARD {name} value: {value}")]
    BadValue { name: &'static str, value: String },
}

/// A single forwarded attribute value, as supplied by a trusted peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XforwardUpdate {
    Name(String),
    Addr(String),
    Protocol(String),
    Helo(Option<String>),
    Ident(Option<String>),
}

impl XforwardUpdate {
    pub fn category(&self) -> AttrCategory {
        match self {
            Self::Name(_) => AttrCategory::Name,
            Self::Addr(_) => AttrCategory::Addr,
            Self::Protocol(_) => AttrCategory::Protocol,
            Self::Helo(_) => AttrCategory::Helo,
            Self::Ident(_) => AttrCategory::Ident,
        }
    }

    fn flag(&self) -> XforwardFlags {
        match self {
            Self::Name(_) => XforwardFlags::NAME,
            Self::Addr(_) => XforwardFlags::ADDR,
            Self::Protocol(_) => XforwardFlags::PROTO,
            Self::Helo(_) => XforwardFlags::HELO,
            Self::Ident(_) => XforwardFlags::IDENT,
        }
    }

    /// Decode one `NAME=value` pair from an XFORWARD command.
    /// `value` is still xtext encoded.
    pub fn parse_attribute(name: &str, value: &str) -> Result<Self, XforwardError> {
        let value = xtext_decode(value)?;
        let unavailable = value == XFORWARD_UNAVAILABLE || value == XFORWARD_TEMPUNAVAIL;

        match name.to_ascii_uppercase().as_str() {
            "NAME" => {
                if unavailable || !is_valid_hostname(&value) {
                    Ok(Self::Name(UNKNOWN.to_string()))
                } else {
                    Ok(Self::Name(value))
                }
            }
            "ADDR" => {
                if unavailable {
                    return Ok(Self::Addr(UNKNOWN.to_string()));
                }
                let bare = match value.get(..5) {
                    Some(prefix) if prefix.eq_ignore_ascii_case("IPV6:") => &value[5..],
                    _ => value.as_str(),
                };
                match bare.parse::<IpAddr>() {
                    Ok(addr) => Ok(Self::Addr(addr.to_string())),
                    Err(_) => Err(XforwardError::BadValue {
                        name: "ADDR",
                        value,
                    }),
                }
            }
            "PROTO" => {
                if unavailable {
                    return Ok(Self::Protocol(UNKNOWN.to_string()));
                }
                if value.is_empty()
                    || value.len() > MAX_PROTOCOL_LEN
                    || !value.bytes().all(|b| b.is_ascii_graphic())
                {
                    return Err(XforwardError::BadValue {
                        name: "PROTO",
                        value,
                    });
                }
                Ok(Self::Protocol(value))
            }
            "HELO" => {
                if unavailable {
                    return Ok(Self::Helo(None));
                }
                if value.len() > MAX_HELO_LEN {
                    return Err(XforwardError::BadValue {
                        name: "HELO",
                        value,
                    });
                }
                Ok(Self::Helo(Some(printable(&value))))
            }
            "IDENT" => {
                if unavailable {
                    Ok(Self::Ident(None))
                } else {
                    Ok(Self::Ident(Some(printable(&value))))
                }
            }
            _ => Err(XforwardError::UnknownAttribute(name.to_string())),
        }
    }

    /// Decode the arguments of an XFORWARD command, eg:
    /// `NAME=spike.porcupine.org ADDR=168.100.189.2`
    pub fn parse_command(args: &str) -> Result<Vec<Self>, XforwardError> {
        let mut updates = vec![];
        for pair in args.split_ascii_whitespace() {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| XforwardError::Malformed(pair.to_string()))?;
            if name.is_empty() {
                return Err(XforwardError::Malformed(pair.to_string()));
            }
            updates.push(Self::parse_attribute(name, value)?);
        }
        if updates.is_empty() {
            return Err(XforwardError::NoAttributes);
        }
        Ok(updates)
    }
}

fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 || name.parse::<IpAddr>().is_ok() {
        return false;
    }
    name.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

fn printable(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_control() { '?' } else { c })
        .collect()
}

/// Decode RFC 3461 xtext
pub fn xtext_decode(s: &str) -> Result<String, XforwardError> {
    let bytes = s.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'+' {
            let hex = s
                .get(idx + 1..idx + 3)
                .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| XforwardError::Malformed(s.to_string()))?;
            result.push(hex);
            idx += 3;
        } else {
            result.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(result).map_err(|_| XforwardError::Malformed(s.to_string()))
}

/// Encode as RFC 3461 xtext
pub fn xtext_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for b in s.bytes() {
        if (b'!'..=b'~').contains(&b) && b != b'+' && b != b'=' {
            result.push(b as char);
        } else {
            result.push_str(&format!("+{b:02X}"));
        }
    }
    result
}

/// Forwarded client attributes, and which of them are in effect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XforwardOverlay {
    flags: XforwardFlags,
    client: ClientAttrs,
    ident: Option<String>,
}

impl XforwardOverlay {
    /// An overlay with nothing forwarded
    pub fn init() -> Self {
        Self::default()
    }

    /// Give every forwarded attribute a well defined default value.
    /// Called when a trusted peer is recognized; does nothing once
    /// the overlay has been preset, so it never clobbers an update
    /// that was applied before it.
    pub fn preset(&mut self) {
        if self.flags.contains(XforwardFlags::INIT) {
            return;
        }
        self.client = ClientAttrs::default();
        self.ident = None;
        self.flags = XforwardFlags::INIT;
    }

    /// Record a forwarded value. The last value received for
    /// a category replaces any earlier one.
    pub fn apply(&mut self, update: XforwardUpdate) {
        self.preset();
        let flag = update.flag();
        tracing::trace!("xforward {:?}: {update:?}", update.category());
        match update {
            XforwardUpdate::Name(name) => self.client.set_name(name),
            XforwardUpdate::Addr(addr) => self.client.set_addr(addr),
            XforwardUpdate::Protocol(proto) => self.client.set_protocol(proto),
            XforwardUpdate::Helo(helo) => self.client.set_helo(helo),
            XforwardUpdate::Ident(ident) => self.ident = ident,
        }
        self.flags |= flag;
    }

    /// Forget everything that was forwarded
    pub fn reset(&mut self) {
        if !self.flags.is_empty() {
            tracing::debug!("xforward reset; flags were {:?}", self.flags);
        }
        *self = Self::init();
    }

    pub fn flags(&self) -> XforwardFlags {
        self.flags
    }

    pub fn is_client_forwarded(&self) -> bool {
        self.flags.intersects(XforwardFlags::CLIENT_MASK)
    }

    pub fn is_ident_forwarded(&self) -> bool {
        self.flags.contains(XforwardFlags::IDENT)
    }

    /// Choose between the `real` and forwarded value of `category`.
    /// `real_ident` is the identifier assigned by this server.
    pub fn effective<'a>(
        &'a self,
        category: AttrCategory,
        real: &'a ClientAttrs,
        real_ident: Option<&'a str>,
    ) -> Effective<'a> {
        match category {
            AttrCategory::Ident => {
                if self.is_ident_forwarded() {
                    Effective::Forwarded(self.ident.as_deref())
                } else {
                    Effective::Real(real_ident)
                }
            }
            client => {
                if self.is_client_forwarded() {
                    Effective::Forwarded(self.client.get(client))
                } else {
                    Effective::Real(real.get(client))
                }
            }
        }
    }
}
