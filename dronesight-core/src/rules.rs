//! Rule classification: vendor OUI table, drone-vendor set, SSID keywords, topology role.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::device::{DeviceType, Source};
use crate::graph::TopologyGraph;
use crate::mac::{MacAddr, MacParseError};

const BUILTIN_VENDORS: &[(u64, &str)] = &[
    (0x1831BF000000, "ASUSTek COMPUTER INC."),
    (0x708BCD000000, "ASUSTek COMPUTER INC."),
    (0x74C63B000000, "AzureWave Technology Inc."),
    (0x6CDFFBE00000, "Beijing Fimi Technology Co., Ltd."),
    (0xE03E44000000, "Broadcom"),
    (0x10BD18000000, "Cisco Systems, Inc"),
    (0x5C5015000000, "Cisco Systems, Inc"),
    (0x6400F1000000, "Cisco Systems, Inc"),
    (0xF07D68000000, "D-Link Corporation"),
    (0x58D56E000000, "D-Link International"),
    (0xD8FEE3000000, "D-Link International"),
    (0x88DC96000000, "EnGenius Technologies, Inc."),
    (0xDAA119000000, "Google, Inc."),
    (0x001882000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x001E10000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x002568000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x00259E000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x002EC7000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x0034FE000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x00464B000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x004F1A000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x005A13000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x006151000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0xEC5623000000, "HUAWEI TECHNOLOGIES CO.,LTD"),
    (0x48A472000000, "Intel Corporate"),
    (0x48F17F000000, "Intel Corporate"),
    (0x5CE0C5000000, "Intel Corporate"),
    (0x606720000000, "Intel Corporate"),
    (0x6C8814000000, "Intel Corporate"),
    (0x7C7A91000000, "Intel Corporate"),
    (0x7CB27D000000, "Intel Corporate"),
    (0x94659C000000, "Intel Corporate"),
    (0x98AF65000000, "Intel Corporate"),
    (0xBCA8A6000000, "Intel Corporate"),
    (0x28D244000000, "LCFC(HeFei) Electronics Technology co., ltd"),
    (0x9822EF000000, "Liteon Technology Corporation"),
    (0x00121C000000, "PARROT SA"),
    (0x00267E000000, "PARROT SA"),
    (0x9003B7000000, "PARROT SA"),
    (0x903AE6000000, "PARROT SA"),
    (0xA0143D000000, "PARROT SA"),
    (0x88A73C000000, "Ragentek Technology Group"),
    (0x4C5E0C000000, "Routerboard.com"),
    (0x98AAFC700000, "Shenzhen Hubsan Technology Co., LTD."),
    (0x381D14000000, "Skydio Inc."),
    (0x706582000000, "Suzhou Hanming Technologies Co., Ltd."),
    (0xC46E1F000000, "TP-LINK TECHNOLOGIES CO.,LTD."),
    (0x3C970E000000, "Wistron InfoComm(Kunshan)Co.,Ltd."),
    (0x80AD16000000, "Xiaomi Communications Co Ltd"),
];

const BUILTIN_DRONE_VENDORS: &[&str] = &[
    "Beijing Fimi Technology Co., Ltd.",
    "PARROT SA",
    "Skydio Inc.",
];

const BUILTIN_SSID_KEYWORDS: &[&str] = &["skydio", "bebop", "drone", "sololink"];

/// What a vendor-table hit that is neither a drone vendor nor a topology host/client becomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VendorFallback {
    /// Classify as an access point.
    #[default]
    AccessPoint,
    /// Leave it to SSID matching and packet analysis.
    Defer,
}

/// Parse a vendor prefix: `aa:bb:cc` (24-bit) or `aa:bb:cc:d` (28-bit).
pub fn parse_prefix(text: &str) -> Result<u64, MacParseError> {
    let groups: Vec<&str> = text.trim().split(':').collect();
    let bad = |g: &str| MacParseError::BadGroup(g.to_string());
    let byte = |g: &str| {
        if g.is_empty() || g.len() > 2 {
            return Err(bad(g));
        }
        u64::from_str_radix(g, 16).map_err(|_| bad(g))
    };
    match groups.as_slice() {
        [a, b, c] => Ok((byte(a)? << 40) | (byte(b)? << 32) | (byte(c)? << 24)),
        [a, b, c, d] if d.len() == 1 => {
            let nibble = u64::from_str_radix(d, 16).map_err(|_| bad(d))?;
            Ok((byte(a)? << 40) | (byte(b)? << 32) | (byte(c)? << 24) | (nibble << 20))
        }
        other => Err(MacParseError::GroupCount(other.len())),
    }
}

/// Static classification tables.
#[derive(Debug, Clone)]
pub struct RuleSet {
    vendors: BTreeMap<u64, String>,
    drone_vendors: BTreeSet<String>,
    ssid_keywords: Vec<String>,
    pub fallback: VendorFallback,
}

impl RuleSet {
    /// Empty tables.
    pub fn empty() -> Self {
        Self {
            vendors: BTreeMap::new(),
            drone_vendors: BTreeSet::new(),
            ssid_keywords: Vec::new(),
            fallback: VendorFallback::default(),
        }
    }

    /// `prefix` is a masked address value (see [`parse_prefix`]).
    pub fn add_vendor(&mut self, prefix: u64, name: impl Into<String>) {
        self.vendors.insert(prefix, name.into());
    }

    pub fn add_drone_vendor(&mut self, name: impl Into<String>) {
        self.drone_vendors.insert(name.into());
    }

    /// Keywords match case-insensitively.
    pub fn add_ssid_keyword(&mut self, keyword: &str) {
        let kw = keyword.to_lowercase();
        if !kw.is_empty() && !self.ssid_keywords.contains(&kw) {
            self.ssid_keywords.push(kw);
        }
    }

    /// Vendor for `mac`: 24-bit prefix first, then 28-bit.
    pub fn vendor_of(&self, mac: MacAddr) -> Option<&str> {
        self.vendors
            .get(&mac.oui24())
            .or_else(|| self.vendors.get(&mac.oui28()))
            .map(String::as_str)
    }

    pub fn is_drone_vendor(&self, vendor: &str) -> bool {
        self.drone_vendors.contains(vendor)
    }

    /// First keyword contained in `ssid`.
    pub fn ssid_keyword(&self, ssid: &str) -> Option<&str> {
        let lower = ssid.to_lowercase();
        self.ssid_keywords
            .iter()
            .find(|kw| lower.contains(kw.as_str()))
            .map(String::as_str)
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        let mut rules = Self::empty();
        for (prefix, name) in BUILTIN_VENDORS {
            rules.add_vendor(*prefix, *name);
        }
        for name in BUILTIN_DRONE_VENDORS {
            rules.add_drone_vendor(*name);
        }
        for kw in BUILTIN_SSID_KEYWORDS {
            rules.add_ssid_keyword(kw);
        }
        rules
    }
}

/// Successful rule classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub device_type: DeviceType,
    pub source: Source,
    /// Matched vendor name or SSID.
    pub annotation: String,
}

/// Classifies addresses from vendor prefix, SSID and topology role.
#[derive(Debug, Clone, Default)]
pub struct RuleClassifier {
    rules: RuleSet,
}

impl RuleClassifier {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Vendor prefix first, then SSID keywords. Broadcast never classifies.
    pub fn classify(
        &self,
        mac: MacAddr,
        ssid: Option<&str>,
        graph: &TopologyGraph,
    ) -> Option<RuleMatch> {
        if mac.is_broadcast() {
            return None;
        }
        self.classify_by_mac(mac, graph)
            .or_else(|| ssid.and_then(|s| self.classify_by_ssid(s)))
    }

    fn classify_by_mac(&self, mac: MacAddr, graph: &TopologyGraph) -> Option<RuleMatch> {
        let vendor = self.rules.vendor_of(mac)?;
        let device_type = if self.rules.is_drone_vendor(vendor) || graph.is_host(mac) {
            DeviceType::Drone
        } else if graph.is_client(mac) {
            DeviceType::Controller
        } else {
            match self.rules.fallback {
                VendorFallback::AccessPoint => DeviceType::AccessPoint,
                VendorFallback::Defer => return None,
            }
        };
        Some(RuleMatch {
            device_type,
            source: Source::Vendor,
            annotation: vendor.to_string(),
        })
    }

    fn classify_by_ssid(&self, ssid: &str) -> Option<RuleMatch> {
        self.rules.ssid_keyword(ssid)?;
        Some(RuleMatch {
            device_type: DeviceType::Drone,
            source: Source::Ssid,
            annotation: ssid.to_string(),
        })
    }

    /// Vendor-only verdict, without topology: drone vendor, other known vendor, or unknown.
    pub fn classify_by_vendor(&self, mac: MacAddr) -> DeviceType {
        match self.rules.vendor_of(mac) {
            Some(v) if self.rules.is_drone_vendor(v) => DeviceType::Drone,
            Some(_) => DeviceType::AccessPoint,
            None => DeviceType::Unknown,
        }
    }
}
