//! Decoded frame record, per-capture statistics and the separated-file merge.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mac::MacAddr;

/// Frame type string of an access-point beacon.
pub const BEACON_TYPE: &str = "Management/Beacon";

/// One decoded wireless frame. Address and type fields are only present when the FCS passed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub index: u64,
    /// Seconds since capture start.
    pub offset: f64,
    pub size: u32,
    pub bandwidth: Option<String>,
    pub mcs: Option<String>,
    /// FCS passed.
    pub correct: bool,
    pub frame_type: Option<String>,
    pub ssid: Option<String>,
    pub transmitter: Option<MacAddr>,
    pub receiver: Option<MacAddr>,
    pub more_fragments: Option<bool>,
    pub seq_num: Option<u64>,
    pub frag_num: Option<u64>,
}

impl FrameRecord {
    pub fn is_data(&self) -> bool {
        self.frame_type
            .as_deref()
            .map_or(false, |t| t.contains("Data"))
    }

    pub fn is_beacon(&self) -> bool {
        self.frame_type.as_deref() == Some(BEACON_TYPE)
    }

    /// Sequence number, 0 when absent.
    pub fn seq(&self) -> u64 {
        self.seq_num.unwrap_or(0)
    }

    /// Fragment number, 0 when absent.
    pub fn frag(&self) -> u64 {
        self.frag_num.unwrap_or(0)
    }

    pub fn has_more_fragments(&self) -> bool {
        self.more_fragments.unwrap_or(false)
    }

    /// Copy physical-layer header fields from `header` (same index, header-only record).
    pub fn fill_header(&mut self, header: &FrameRecord) {
        self.offset = header.offset;
        self.size = header.size;
        self.bandwidth = header.bandwidth.clone();
        self.mcs = header.mcs.clone();
    }
}

/// Merge body-only records with header-only records sharing the same index.
/// Body records without a matching header are dropped.
pub fn merge_separated(headers: &[FrameRecord], bodies: Vec<FrameRecord>) -> Vec<FrameRecord> {
    let by_index: HashMap<u64, &FrameRecord> = headers.iter().map(|h| (h.index, h)).collect();
    let total = bodies.len();
    let merged: Vec<FrameRecord> = bodies
        .into_iter()
        .filter_map(|mut body| {
            let header = by_index.get(&body.index)?;
            body.fill_header(header);
            Some(body)
        })
        .collect();
    if merged.len() < total {
        tracing::debug!(
            dropped = total - merged.len(),
            "body records without a matching header"
        );
    }
    merged
}

/// Counts over a parsed capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub whole: u64,
    pub correct: u64,
    pub incorrect: u64,
    /// Correct frames missing the transmitter or receiver address.
    pub no_address: u64,
    pub by_type: BTreeMap<String, u64>,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, frame: &FrameRecord) {
        self.whole += 1;
        if !frame.correct {
            self.incorrect += 1;
            return;
        }
        self.correct += 1;
        if frame.transmitter.is_none() || frame.receiver.is_none() {
            self.no_address += 1;
        }
        if let Some(t) = &frame.frame_type {
            *self.by_type.entry(t.clone()).or_insert(0) += 1;
        }
    }

    pub fn from_frames<'a>(frames: impl IntoIterator<Item = &'a FrameRecord>) -> Self {
        let mut stats = Self::new();
        for f in frames {
            stats.record(f);
        }
        stats
    }

    /// Share of correct frames in percent; 0 for an empty capture.
    pub fn correct_percent(&self) -> f64 {
        if self.whole == 0 {
            return 0.0;
        }
        self.correct as f64 / self.whole as f64 * 100.0
    }
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "frames:            {}", self.whole)?;
        writeln!(f, "correct:           {}", self.correct)?;
        writeln!(f, "incorrect:         {}", self.incorrect)?;
        writeln!(f, "missing address:   {}", self.no_address)?;
        writeln!(f, "correct share:     {:.2}%", self.correct_percent())?;
        for (t, n) in &self.by_type {
            writeln!(f, "  {t}: {n}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(index: u64, offset: f64, size: u32) -> FrameRecord {
        FrameRecord {
            index,
            offset,
            size,
            ..Default::default()
        }
    }

    fn body(index: u64, ty: &str) -> FrameRecord {
        FrameRecord {
            index,
            correct: true,
            frame_type: Some(ty.to_string()),
            transmitter: Some(MacAddr::new(1)),
            ..Default::default()
        }
    }

    #[test]
    fn merge_backfills_and_drops_orphans() {
        let headers = vec![header(1, 0.5, 100), header(3, 1.5, 300)];
        let bodies = vec![body(1, "Data/QoS"), body(2, "Data/QoS"), body(3, BEACON_TYPE)];
        let merged = merge_separated(&headers, bodies);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].index, 1);
        assert_eq!(merged[0].size, 100);
        assert_eq!(merged[0].offset, 0.5);
        assert_eq!(merged[1].index, 3);
        assert!(merged[1].is_beacon());
    }

    #[test]
    fn absent_fields_read_as_defaults() {
        let f = FrameRecord::default();
        assert_eq!(f.seq(), 0);
        assert_eq!(f.frag(), 0);
        assert!(!f.has_more_fragments());
        assert!(!f.is_data());
    }

    #[test]
    fn stats_counts() {
        let mut no_ra = body(1, "Data/QoS");
        no_ra.receiver = None;
        let mut full = body(2, "Data/QoS");
        full.receiver = Some(MacAddr::new(2));
        let bad = FrameRecord::default();
        let stats = FrameStats::from_frames([&no_ra, &full, &bad]);
        assert_eq!(stats.whole, 3);
        assert_eq!(stats.correct, 2);
        assert_eq!(stats.incorrect, 1);
        assert_eq!(stats.no_address, 1);
        assert_eq!(stats.by_type.get("Data/QoS"), Some(&2));
        assert!((stats.correct_percent() - 66.666).abs() < 0.01);
    }
}
