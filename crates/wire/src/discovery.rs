//! Discovery datagram text format.
//!
//! Controllers broadcast `"<application name>|<ip>"` while unconnected. A
//! bare `"<ip>"` is also accepted. The literal `"Reset"` asks the host to
//! re-zero the sender's pose.

use crate::DecodeError;

/// Payload of a reset request broadcast.
pub const RESET_COMMAND: &str = "Reset";

/// Separator between application name and address.
pub const FIELD_SEPARATOR: char = '|';

/// A controller announcing itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub application_name: String,
    pub ip_address: String,
}

impl Advertisement {
    pub fn new(application_name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ip_address: ip_address.into(),
        }
    }

    /// Wire form, `name|ip`.
    pub fn to_datagram(&self) -> Vec<u8> {
        format!(
            "{}{}{}",
            self.application_name, FIELD_SEPARATOR, self.ip_address
        )
        .into_bytes()
    }
}

/// A parsed discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryDatagram {
    Reset,
    Advertisement(Advertisement),
}

impl DiscoveryDatagram {
    /// Parse a received datagram.
    ///
    /// A bare address gets the display name `"Connect to <ip>"`.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        let text = text.trim();
        if text == RESET_COMMAND {
            return Ok(Self::Reset);
        }

        let fields: Vec<&str> = text.split(FIELD_SEPARATOR).map(str::trim).collect();
        let (name, ip) = match fields.as_slice() {
            [ip] => (format!("Connect to {ip}"), *ip),
            [name, ip] => (name.to_string(), *ip),
            _ => return Err(DecodeError::MalformedAdvertisement(text.to_string())),
        };
        if ip.is_empty() {
            return Err(DecodeError::MalformedAdvertisement(text.to_string()));
        }
        Ok(Self::Advertisement(Advertisement::new(name, ip)))
    }

    pub fn to_datagram(&self) -> Vec<u8> {
        match self {
            Self::Reset => RESET_COMMAND.as_bytes().to_vec(),
            Self::Advertisement(ad) => ad.to_datagram(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_advertisement() {
        let parsed = DiscoveryDatagram::parse(b"Navi Demo|192.168.1.20").unwrap();
        assert_eq!(
            parsed,
            DiscoveryDatagram::Advertisement(Advertisement::new("Navi Demo", "192.168.1.20"))
        );
    }

    #[test]
    fn test_parse_bare_ip() {
        let parsed = DiscoveryDatagram::parse(b"10.0.0.7").unwrap();
        let DiscoveryDatagram::Advertisement(ad) = parsed else {
            panic!("expected advertisement");
        };
        assert_eq!(ad.ip_address, "10.0.0.7");
        assert_eq!(ad.application_name, "Connect to 10.0.0.7");
    }

    #[test]
    fn test_parse_reset() {
        assert_eq!(
            DiscoveryDatagram::parse(b"Reset").unwrap(),
            DiscoveryDatagram::Reset
        );
    }

    #[test]
    fn test_too_many_fields_rejected() {
        assert!(matches!(
            DiscoveryDatagram::parse(b"a|b|c"),
            Err(DecodeError::MalformedAdvertisement(_))
        ));
    }

    #[test]
    fn test_empty_ip_rejected() {
        assert!(DiscoveryDatagram::parse(b"name|").is_err());
        assert!(DiscoveryDatagram::parse(b"").is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        assert!(matches!(
            DiscoveryDatagram::parse(&[0xff, 0xfe]),
            Err(DecodeError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_format_matches_parse() {
        let ad = Advertisement::new("Game", "127.0.0.1");
        assert_eq!(ad.to_datagram(), b"Game|127.0.0.1".to_vec());
        assert_eq!(
            DiscoveryDatagram::parse(&ad.to_datagram()).unwrap(),
            DiscoveryDatagram::Advertisement(ad)
        );
    }
}
