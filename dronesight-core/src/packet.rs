//! Logical packet assembled from one or more 802.11 fragments.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::frame::FrameRecord;

/// One transport-layer packet: all fragments sharing a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalPacket {
    seq: u64,
    size: u64,
    offset: f64,
    arrival: Option<f64>,
    fragments: Vec<(u32, f64)>,
    frag_nums: BTreeSet<u64>,
}

impl LogicalPacket {
    /// Start a packet from its first observed fragment.
    pub fn new(seq: u64, frag: u64, size: u32, offset: f64) -> Self {
        Self {
            seq,
            size: u64::from(size),
            offset,
            arrival: None,
            fragments: vec![(size, offset)],
            frag_nums: BTreeSet::from([frag]),
        }
    }

    pub fn from_frame(frame: &FrameRecord) -> Self {
        Self::new(frame.seq(), frame.frag(), frame.size, frame.offset)
    }

    /// Fold in a fragment. Rejected when the sequence number differs or the
    /// fragment number was already seen.
    pub fn add_fragment(&mut self, seq: u64, frag: u64, size: u32, offset: f64) -> bool {
        if seq != self.seq || !self.frag_nums.insert(frag) {
            return false;
        }
        self.fragments.push((size, offset));
        self.size += u64::from(size);
        self.offset = self.offset.max(offset);
        true
    }

    pub fn add_frame(&mut self, frame: &FrameRecord) -> bool {
        self.add_fragment(frame.seq(), frame.frag(), frame.size, frame.offset)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Sum of fragment sizes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Latest fragment offset.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Inter-arrival delta recorded by the front-cut; the packet offset until then.
    pub fn arrival(&self) -> f64 {
        self.arrival.unwrap_or(self.offset)
    }

    pub fn set_arrival(&mut self, delta: f64) {
        self.arrival = Some(delta);
    }

    pub fn fragments(&self) -> &[(u32, f64)] {
        &self.fragments
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

/// Whether the middle of three consecutive sequence numbers is a spurious retransmission:
/// a strict local extremum with `a <= c`, or a strictly falling triple.
pub fn is_retransmission(a: u64, b: u64, c: u64) -> bool {
    (a <= c && ((a < b && b > c) || (a > b && b < c))) || (a > b && b > c)
}
