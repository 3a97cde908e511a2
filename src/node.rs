//! Directory entries and their field types.

use core::fmt;
use std::{
    net::{IpAddr, Ipv6Addr},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::InvalidInput;

/// Maximum number of characters in the free-text contact and details fields.
pub const MAX_TEXT_LEN: usize = 255;

/// Local integer identifier of the map a node was retrieved from.
///
/// [`SourceId::LOCAL`] marks nodes owned by this instance.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
pub struct SourceId(u32);

impl SourceId {
    /// The id of nodes registered on this instance.
    pub const LOCAL: SourceId = SourceId(0);

    /// Whether this is the id of locally owned nodes.
    pub fn is_local(&self) -> bool {
        *self == Self::LOCAL
    }

    pub(crate) fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

/// A network address stored in fixed-length form.
///
/// IPv4 addresses are kept as IPv4-mapped IPv6 addresses, so every address takes 16 bytes.
#[derive(derive_more::From, derive_more::Into, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy)]
pub struct NodeAddr([u8; 16]);

impl NodeAddr {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_ip(&self) -> IpAddr {
        Ipv6Addr::from(self.0).to_canonical()
    }
}

impl From<IpAddr> for NodeAddr {
    fn from(value: IpAddr) -> Self {
        let v6 = match value {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self(v6.octets())
    }
}

impl From<NodeAddr> for IpAddr {
    fn from(value: NodeAddr) -> Self {
        value.to_ip()
    }
}

impl FromStr for NodeAddr {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: IpAddr = s.trim().parse().map_err(|_| InvalidInput::Address)?;
        Ok(ip.into())
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip())
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({})", self.to_ip())
    }
}

impl Serialize for NodeAddr {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        self.to_ip().serialize(ser)
    }
}

impl<'de> Deserialize<'de> for NodeAddr {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        IpAddr::deserialize(de).map(Self::from)
    }
}

/// A PGP key id or fingerprint.
///
/// Accepted are short (8 hex digits) and long (16 hex digits) key ids as well as full
/// v4 fingerprints (40 hex digits).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PgpFingerprint(Vec<u8>);

impl PgpFingerprint {
    const VALID_LENGTHS: [usize; 3] = [4, 8, 20];

    /// Parse an optional fingerprint. Empty input yields `None`.
    pub fn parse_optional(s: &str) -> Result<Option<Self>, InvalidInput> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        s.parse().map(Some)
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }
}

impl FromStr for PgpFingerprint {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches("0x").replace(' ', "");
        let bytes = hex::decode(&s).map_err(|_| InvalidInput::Pgp)?;
        if !Self::VALID_LENGTHS.contains(&bytes.len()) {
            return Err(InvalidInput::Pgp);
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for PgpFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PgpFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PgpFingerprint({})", self.to_hex())
    }
}

impl Serialize for PgpFingerprint {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        self.to_hex().serialize(ser)
    }
}

impl<'de> Deserialize<'de> for PgpFingerprint {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse()
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&s), &"a hex PGP key id"))
    }
}

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Network address, unique per source.
    pub addr: NodeAddr,
    pub latitude: f64,
    pub longitude: f64,
    pub owner_name: String,
    /// Only known for locally registered nodes. Never exported.
    pub owner_email: String,
    pub contact: Option<String>,
    pub details: Option<String>,
    pub pgp: Option<PgpFingerprint>,
    /// Status bitmask as chosen by the owner.
    pub status: u32,
    /// The map this node was retrieved from.
    pub source_id: SourceId,
    /// Unix timestamp of the last modification, as reported by the owning map.
    pub retrieved: i64,
    /// Unix timestamp this map last stored or fetched the node. Cache eviction runs on this.
    pub last_seen: i64,
}

impl Node {
    /// Check the fields every node must satisfy, local or cached.
    pub fn validate(&self) -> Result<(), InvalidInput> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(InvalidInput::Latitude);
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(InvalidInput::Longitude);
        }
        if self.owner_name.trim().is_empty() {
            return Err(InvalidInput::NameMissing);
        }
        if exceeds_text_len(self.contact.as_deref()) {
            return Err(InvalidInput::ContactTooLong);
        }
        if exceeds_text_len(self.details.as_deref()) {
            return Err(InvalidInput::DetailsTooLong);
        }
        Ok(())
    }

    /// Check a node submitted for local registration.
    ///
    /// In addition to [`Self::validate`] this requires a usable owner email.
    pub fn validate_registrant(&self) -> Result<(), InvalidInput> {
        self.validate()?;
        let email = self.owner_email.trim();
        match email.split_once('@') {
            Some((user, domain)) if !user.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(InvalidInput::Email),
        }
    }

    /// Current unix time in seconds.
    pub fn now_unix() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

fn exceeds_text_len(text: Option<&str>) -> bool {
    text.map(|t| t.chars().count() > MAX_TEXT_LEN)
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_node(addr: &str) -> Node {
        Node {
            addr: addr.parse().unwrap(),
            latitude: 52.52,
            longitude: 13.405,
            owner_name: "alice".to_string(),
            owner_email: "alice@example.org".to_string(),
            contact: Some("alice on irc".to_string()),
            details: None,
            pgp: None,
            status: 1,
            source_id: SourceId::LOCAL,
            retrieved: 1_400_000_000,
            last_seen: 1_400_000_000,
        }
    }

    #[test]
    fn node_addr_is_fixed_length() {
        let v4: NodeAddr = "10.0.0.1".parse().unwrap();
        let v6: NodeAddr = "fc00::1".parse().unwrap();
        assert_eq!(v4.as_bytes().len(), 16);
        assert_eq!(v4.to_string(), "10.0.0.1");
        assert_eq!(v6.to_string(), "fc00::1");
        assert_eq!("not an ip".parse::<NodeAddr>(), Err(InvalidInput::Address));
    }

    #[test]
    fn pgp_fingerprint_lengths() {
        assert!(PgpFingerprint::parse_optional("").unwrap().is_none());
        assert_eq!(
            PgpFingerprint::parse_optional("deadbeef").unwrap().unwrap().to_hex(),
            "DEADBEEF"
        );
        assert!("0123456789ABCDEF".parse::<PgpFingerprint>().is_ok());
        assert!("0123 4567 89AB CDEF 0123 4567 89AB CDEF 0123 4567"
            .parse::<PgpFingerprint>()
            .is_ok());
        assert_eq!("abc".parse::<PgpFingerprint>(), Err(InvalidInput::Pgp));
        assert_eq!("zzzzzzzz".parse::<PgpFingerprint>(), Err(InvalidInput::Pgp));
        assert_eq!("deadbeefde".parse::<PgpFingerprint>(), Err(InvalidInput::Pgp));
    }

    #[test]
    fn validation() {
        let node = test_node("10.0.0.1");
        assert_eq!(node.validate_registrant(), Ok(()));

        let mut bad = node.clone();
        bad.latitude = 90.5;
        assert_eq!(bad.validate(), Err(InvalidInput::Latitude));

        let mut bad = node.clone();
        bad.longitude = -181.0;
        assert_eq!(bad.validate(), Err(InvalidInput::Longitude));

        let mut bad = node.clone();
        bad.contact = Some("x".repeat(MAX_TEXT_LEN + 1));
        assert_eq!(bad.validate(), Err(InvalidInput::ContactTooLong));

        let mut ok = node.clone();
        ok.details = Some("ü".repeat(MAX_TEXT_LEN));
        assert_eq!(ok.validate(), Ok(()));

        let mut bad = node.clone();
        bad.owner_email = "nobody".to_string();
        assert_eq!(bad.validate(), Ok(()));
        assert_eq!(bad.validate_registrant(), Err(InvalidInput::Email));
    }
}
