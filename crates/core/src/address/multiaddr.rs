/// Multi-segment network addresses and the registry that validates them
///
/// Addresses look like `/dns4/<host>/tcp/<port>` or `/onion/<id>:<port>`.
/// Which protocol names are legal, and whether they carry a value, is decided
/// by a [`ProtocolRegistry`] owned by whoever parses. There is no global table.

use std::collections::HashMap;
use std::fmt;
use tordht_common::MalformedAddress;

/// A protocol that may appear as one segment of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protocol {
    pub code: u32,
    pub name: &'static str,
    /// Whether the segment is followed by a value (`/tcp/80`) or stands alone
    pub takes_value: bool,
}

impl Protocol {
    pub const IP4: Protocol = Protocol::valued(4, "ip4");
    pub const TCP: Protocol = Protocol::valued(6, "tcp");
    pub const IP6: Protocol = Protocol::valued(41, "ip6");
    pub const DNS4: Protocol = Protocol::valued(54, "dns4");
    pub const DNS6: Protocol = Protocol::valued(55, "dns6");
    pub const ONION: Protocol = Protocol::valued(444, "onion");
    /// Pseudo-protocol asking the transport for a fresh onion service
    pub const ONION_LISTEN: Protocol = Protocol::bare(0x55, "onionListen");

    pub const fn valued(code: u32, name: &'static str) -> Self {
        Self {
            code,
            name,
            takes_value: true,
        }
    }

    pub const fn bare(code: u32, name: &'static str) -> Self {
        Self {
            code,
            name,
            takes_value: false,
        }
    }
}

/// Known protocols, keyed by name and by code
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    by_name: HashMap<&'static str, Protocol>,
    by_code: HashMap<u32, Protocol>,
}

impl ProtocolRegistry {
    /// Registry with no protocols at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the IP, DNS, TCP and onion protocols this transport speaks
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for protocol in [
            Protocol::IP4,
            Protocol::TCP,
            Protocol::IP6,
            Protocol::DNS4,
            Protocol::DNS6,
            Protocol::ONION,
            Protocol::ONION_LISTEN,
        ] {
            // The standard set has no clashes
            let _ = registry.register(protocol);
        }
        registry
    }

    /// Add a protocol. Fails if its name or code is already taken by a different one.
    pub fn register(&mut self, protocol: Protocol) -> Result<(), RegistryError> {
        if let Some(existing) = self.by_name.get(protocol.name) {
            if *existing != protocol {
                return Err(RegistryError::NameTaken(protocol.name));
            }
        }
        if let Some(existing) = self.by_code.get(&protocol.code) {
            if *existing != protocol {
                return Err(RegistryError::CodeTaken(protocol.code));
            }
        }
        self.by_name.insert(protocol.name, protocol);
        self.by_code.insert(protocol.code, protocol);
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<Protocol> {
        self.by_name.get(name).copied()
    }

    pub fn by_code(&self, code: u32) -> Option<Protocol> {
        self.by_code.get(&code).copied()
    }

    /// Parse a textual address, checking every segment against this registry
    pub fn parse(&self, text: &str) -> Result<Multiaddr, MalformedAddress> {
        let rest = text
            .strip_prefix('/')
            .ok_or_else(|| MalformedAddress::new(text, "must start with '/'"))?;

        let mut parts = rest.split('/');
        let mut segments = Vec::new();
        while let Some(name) = parts.next() {
            if name.is_empty() {
                return Err(MalformedAddress::new(text, "empty protocol name"));
            }
            let protocol = self
                .by_name(name)
                .ok_or_else(|| MalformedAddress::new(text, format!("unknown protocol {:?}", name)))?;

            let value = if protocol.takes_value {
                match parts.next() {
                    Some(value) if !value.is_empty() => Some(value.to_string()),
                    _ => {
                        return Err(MalformedAddress::new(
                            text,
                            format!("missing value for /{}", name),
                        ))
                    }
                }
            } else {
                None
            };
            segments.push(Segment { protocol, value });
        }

        Ok(Multiaddr { segments })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("protocol name {0:?} already registered")]
    NameTaken(&'static str),

    #[error("protocol code {0} already registered")]
    CodeTaken(u32),
}

/// One `/protocol[/value]` piece of an address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    pub protocol: Protocol,
    pub value: Option<String>,
}

/// A parsed multi-segment address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Multiaddr {
    segments: Vec<Segment>,
}

impl Multiaddr {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a segment. Values given to bare protocols are dropped.
    pub fn with(mut self, protocol: Protocol, value: impl Into<String>) -> Self {
        let value = protocol.takes_value.then(|| value.into());
        self.segments.push(Segment { protocol, value });
        self
    }

    /// Append a protocol that takes no value
    pub fn with_bare(mut self, protocol: Protocol) -> Self {
        self.segments.push(Segment {
            protocol,
            value: None,
        });
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn protocol_codes(&self) -> impl Iterator<Item = u32> + '_ {
        self.segments.iter().map(|s| s.protocol.code)
    }

    /// Value of the first segment with the given protocol code
    pub fn value_for(&self, code: u32) -> Option<&str> {
        self.segments
            .iter()
            .find(|s| s.protocol.code == code)
            .and_then(|s| s.value.as_deref())
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{}", segment.protocol.name)?;
            if let Some(value) = &segment.value {
                write!(f, "/{}", value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dns_address() {
        let registry = ProtocolRegistry::standard();
        let addr = registry.parse("/dns4/abc.onion/tcp/4001").unwrap();

        assert_eq!(addr.segments().len(), 2);
        assert_eq!(addr.value_for(Protocol::DNS4.code), Some("abc.onion"));
        assert_eq!(addr.value_for(Protocol::TCP.code), Some("4001"));
        assert_eq!(addr.to_string(), "/dns4/abc.onion/tcp/4001");
    }

    #[test]
    fn test_parse_bare_protocol() {
        let registry = ProtocolRegistry::standard();
        let addr = registry.parse("/onionListen").unwrap();
        assert_eq!(addr, Multiaddr::empty().with_bare(Protocol::ONION_LISTEN));
        assert_eq!(addr.to_string(), "/onionListen");
    }

    #[test]
    fn test_parse_errors() {
        let registry = ProtocolRegistry::standard();
        assert!(registry.parse("dns4/abc/tcp/1").is_err());
        assert!(registry.parse("/dns4/abc/tcp").is_err());
        assert!(registry.parse("/dns4/abc/tcp/").is_err());
        assert!(registry.parse("/quic/1").is_err());
        assert!(registry.parse("/").is_err());
    }

    #[test]
    fn test_registries_are_independent() {
        let mut custom = ProtocolRegistry::empty();
        custom.register(Protocol::valued(999, "garlic")).unwrap();

        assert!(custom.parse("/garlic/abc").is_ok());
        assert!(custom.parse("/onion/abc:1").is_err());
        assert!(ProtocolRegistry::standard().parse("/garlic/abc").is_err());
    }

    #[test]
    fn test_register_conflicts() {
        let mut registry = ProtocolRegistry::standard();
        assert_eq!(
            registry.register(Protocol::valued(4, "ipv4")),
            Err(RegistryError::CodeTaken(4))
        );
        assert_eq!(
            registry.register(Protocol::bare(7, "tcp")),
            Err(RegistryError::NameTaken("tcp"))
        );
        // Re-registering the same protocol is a no-op
        assert!(registry.register(Protocol::TCP).is_ok());
    }
}
