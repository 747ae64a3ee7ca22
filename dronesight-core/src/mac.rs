//! MAC address value type: 48-bit, colon-hex text form, OUI masking.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const ADDR_MASK: u64 = 0xffff_ffff_ffff;
const OUI24_MASK: u64 = 0xffff_ff00_0000;
const OUI28_MASK: u64 = 0xffff_fff0_0000;

/// 48-bit hardware address. Ordered numerically so maps iterate deterministically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(u64);

impl MacAddr {
    /// ff:ff:ff:ff:ff:ff. Never a host, client or classified device.
    pub const BROADCAST: MacAddr = MacAddr(ADDR_MASK);

    /// Build from the low 48 bits of `raw`.
    pub const fn new(raw: u64) -> Self {
        Self(raw & ADDR_MASK)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// Address masked to its 24-bit vendor prefix (MA-L block).
    pub fn oui24(self) -> u64 {
        self.0 & OUI24_MASK
    }

    /// Address masked to its 28-bit vendor prefix (MA-M block).
    pub fn oui28(self) -> u64 {
        self.0 & OUI28_MASK
    }
}

impl From<u64> for MacAddr {
    fn from(raw: u64) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

/// Error parsing a MAC address from text.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MacParseError {
    #[error("expected 6 colon-separated groups, got {0}")]
    GroupCount(usize),
    #[error("invalid hex group {0:?}")]
    BadGroup(String),
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    /// Accepts `aa:bb:cc:dd:ee:ff`; groups may be one or two hex digits, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let groups: Vec<&str> = s.trim().split(':').collect();
        if groups.len() != 6 {
            return Err(MacParseError::GroupCount(groups.len()));
        }
        let mut raw = 0u64;
        for g in groups {
            if g.is_empty() || g.len() > 2 {
                return Err(MacParseError::BadGroup(g.to_string()));
            }
            let byte =
                u8::from_str_radix(g, 16).map_err(|_| MacParseError::BadGroup(g.to_string()))?;
            raw = (raw << 8) | u64::from(byte);
        }
        Ok(Self(raw))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
