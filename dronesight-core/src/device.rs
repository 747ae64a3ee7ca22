//! Device roles, classification provenance and confidence.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mac::MacAddr;

/// Role of a transmitter. Numeric labels double as estimator classes and sequence-model states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Drone,
    Controller,
    AccessPoint,
    Unknown,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::Drone,
        DeviceType::Controller,
        DeviceType::AccessPoint,
        DeviceType::Unknown,
    ];

    pub fn label(self) -> usize {
        match self {
            DeviceType::Drone => 1,
            DeviceType::Controller => 2,
            DeviceType::AccessPoint => 3,
            DeviceType::Unknown => 4,
        }
    }

    pub fn from_label(label: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.label() == label)
    }

    /// Role on the other end of a link: drone and controller swap, the rest stay.
    pub fn opposite(self) -> Self {
        match self {
            DeviceType::Drone => DeviceType::Controller,
            DeviceType::Controller => DeviceType::Drone,
            other => other,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceType::Drone => "Drone",
            DeviceType::Controller => "Remote controller",
            DeviceType::AccessPoint => "Access point",
            DeviceType::Unknown => "Unknown device",
        })
    }
}

/// Pipeline stage that produced a classification, by trust. Serialised as 0..=3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "u8")]
pub enum Confidence {
    InsufficientData = 0,
    Rule = 1,
    SequenceModel = 2,
    Forest = 3,
}

impl Confidence {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl From<Confidence> for u8 {
    fn from(c: Confidence) -> u8 {
        c.value()
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// How a device got its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Source {
    Vendor,
    Ssid,
    Forest,
    SequenceModel,
    PeerInferred { from: MacAddr },
    InsufficientData,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Vendor => f.write_str("vendor"),
            Source::Ssid => f.write_str("ssid"),
            Source::Forest => f.write_str("forest"),
            Source::SequenceModel => f.write_str("sequence model"),
            Source::PeerInferred { from } => write!(f, "peer of {from}"),
            Source::InsufficientData => f.write_str("insufficient data"),
        }
    }
}

/// One classified transmitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedDevice {
    pub mac: MacAddr,
    pub device_type: DeviceType,
    pub source: Source,
    pub confidence: Confidence,
    /// Matched vendor or SSID.
    pub annotation: Option<String>,
}

/// Role and confidence reported per address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub device_type: DeviceType,
    pub confidence: Confidence,
}

impl From<&ClassifiedDevice> for Verdict {
    fn from(d: &ClassifiedDevice) -> Self {
        Self {
            device_type: d.device_type,
            confidence: d.confidence,
        }
    }
}
