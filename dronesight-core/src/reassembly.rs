//! Per-transmitter packet reassembly: fragment folding, retransmission pruning, front-cut window.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::frame::FrameRecord;
use crate::mac::MacAddr;
use crate::packet::{is_retransmission, LogicalPacket};

/// Packets retained per transmitter before it is handed to the estimator.
pub const DEFAULT_PACKET_THRESHOLD: usize = 200;

/// Common surface of the sequential and concurrent reassemblers.
pub trait Reassembler {
    /// Feed one frame. Returns true when the frame was taken into a window.
    fn handle(&mut self, frame: &FrameRecord) -> bool;
    /// Next transmitter that became ready, each reported once.
    fn pop_ready(&mut self) -> Option<MacAddr>;
    /// Current packet sequence of a transmitter.
    fn packets(&self, mac: MacAddr) -> Option<Vec<LogicalPacket>>;
    /// Live transmitters in address order.
    fn transmitters(&self) -> Vec<MacAddr>;
    /// Forget a transmitter's window.
    fn discard(&mut self, mac: MacAddr);
}

/// True for frames a reassembler should look at: data, with a non-broadcast transmitter.
pub fn is_reassemblable(frame: &FrameRecord) -> bool {
    frame.is_data() && frame.transmitter.map_or(false, |ta| !ta.is_broadcast())
}

/// Arrival-ordered window of one transmitter.
#[derive(Debug, Clone)]
pub struct Window {
    packets: Vec<LogicalPacket>,
    threshold: usize,
    needs_cut: bool,
    ready: bool,
    cut_count: usize,
}

impl Window {
    pub fn new(threshold: usize) -> Self {
        Self {
            packets: Vec::new(),
            threshold: threshold.max(1),
            needs_cut: true,
            ready: false,
            cut_count: 0,
        }
    }

    pub fn packets(&self) -> &[LogicalPacket] {
        &self.packets
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn needs_cut(&self) -> bool {
        self.needs_cut
    }

    /// Packets discarded by the front-cut.
    pub fn cut_count(&self) -> usize {
        self.cut_count
    }

    /// Returns true when this frame made the window ready.
    fn push(&mut self, frame: &FrameRecord) -> bool {
        if self.ready {
            return false;
        }
        match self.packets.last_mut() {
            Some(last) if last.seq() == frame.seq() => {
                last.add_frame(frame);
                return false;
            }
            _ => {}
        }
        // every packet already in the window is complete now
        if self.needs_cut {
            self.try_cut();
        }
        self.packets.push(LogicalPacket::from_frame(frame));
        self.prune_retransmission();
        if self.needs_cut {
            self.slide();
        }
        self.check_ready()
    }

    fn prune_retransmission(&mut self) {
        let n = self.packets.len();
        if n < 3 {
            return;
        }
        let (a, b, c) = (
            self.packets[n - 3].seq(),
            self.packets[n - 2].seq(),
            self.packets[n - 1].seq(),
        );
        if is_retransmission(a, b, c) {
            self.packets.remove(n - 2);
        }
    }

    /// Size-drop trigger: the peak before the first drop becomes the first packet.
    fn try_cut(&mut self) {
        let drop_at = (1..self.packets.len())
            .find(|&i| self.packets[i].size() < self.packets[i - 1].size());
        if let Some(i) = drop_at {
            self.cut_front(i - 1);
        }
    }

    /// Threshold trigger: while the ramp is still rising, keep only the newest
    /// `threshold` packets of the non-decreasing leading run.
    fn slide(&mut self) {
        let len = self.packets.len();
        if len <= self.threshold {
            return;
        }
        let mut left = 0;
        while left + 1 < len
            && self.packets[left].size() <= self.packets[left + 1].size()
            && len - left > self.threshold
        {
            left += 1;
        }
        if left == 0 {
            return;
        }
        let delta = self.packets[left].offset() - self.packets[left - 1].offset();
        self.packets[left].set_arrival(delta);
        self.packets.drain(..left);
        self.cut_count += left;
        tracing::debug!(discarded = left, arrival = delta, "ramp slid");
    }

    fn cut_front(&mut self, n: usize) {
        let delta = if n > 0 {
            self.packets[n].offset() - self.packets[n - 1].offset()
        } else if self.cut_count > 0 {
            // predecessor already slid out; its delta was recorded then
            self.packets[0].arrival()
        } else {
            self.packets[0].offset()
        };
        self.packets[n].set_arrival(delta);
        self.packets.drain(..n);
        self.cut_count += n;
        self.needs_cut = false;
        tracing::debug!(discarded = n, arrival = delta, "front-cut");
    }

    fn check_ready(&mut self) -> bool {
        if self.needs_cut || self.packets.len() < self.threshold {
            return false;
        }
        self.packets.truncate(self.threshold);
        self.ready = true;
        true
    }
}

/// Single-threaded reassembler over all transmitters of a capture.
pub struct PacketReassembler {
    windows: HashMap<MacAddr, Window>,
    queue: VecDeque<MacAddr>,
    threshold: usize,
}

impl PacketReassembler {
    pub fn new(threshold: usize) -> Self {
        Self {
            windows: HashMap::new(),
            queue: VecDeque::new(),
            threshold,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn window(&self, mac: MacAddr) -> Option<&Window> {
        self.windows.get(&mac)
    }

    pub fn is_ready(&self, mac: MacAddr) -> bool {
        self.windows.get(&mac).map_or(false, Window::is_ready)
    }

    /// Force a transmitter ready regardless of its window length.
    pub fn mark_ready(&mut self, mac: MacAddr) {
        if let Some(w) = self.windows.get_mut(&mac) {
            if !w.ready {
                w.ready = true;
                self.queue.push_back(mac);
            }
        }
    }

    /// Take the packet sequence and drop the transmitter's live state.
    pub fn drain(&mut self, mac: MacAddr) -> Option<Vec<LogicalPacket>> {
        self.queue.retain(|m| *m != mac);
        self.windows.remove(&mac).map(|w| w.packets)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn clear(&mut self) {
        self.windows.clear();
        self.queue.clear();
    }
}

impl Default for PacketReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_THRESHOLD)
    }
}

impl Reassembler for PacketReassembler {
    fn handle(&mut self, frame: &FrameRecord) -> bool {
        if !is_reassemblable(frame) {
            return false;
        }
        let Some(ta) = frame.transmitter else {
            return false;
        };
        let threshold = self.threshold;
        let window = self
            .windows
            .entry(ta)
            .or_insert_with(|| Window::new(threshold));
        if window.ready {
            return false;
        }
        if window.push(frame) {
            tracing::debug!(mac = %ta, packets = window.packets.len(), "transmitter ready");
            self.queue.push_back(ta);
        }
        true
    }

    fn pop_ready(&mut self) -> Option<MacAddr> {
        self.queue.pop_front()
    }

    fn packets(&self, mac: MacAddr) -> Option<Vec<LogicalPacket>> {
        self.windows.get(&mac).map(|w| w.packets.clone())
    }

    fn transmitters(&self) -> Vec<MacAddr> {
        let mut macs: Vec<MacAddr> = self.windows.keys().copied().collect();
        macs.sort();
        macs
    }

    fn discard(&mut self, mac: MacAddr) {
        self.drain(mac);
    }
}

/// Offline grouping: data frames per transmitter, sorted by offset, folded into packets,
/// retransmissions pruned from the back. No windowing.
pub fn collect_by_transmitter(frames: &[FrameRecord]) -> BTreeMap<MacAddr, Vec<LogicalPacket>> {
    let mut grouped: BTreeMap<MacAddr, Vec<&FrameRecord>> = BTreeMap::new();
    for f in frames.iter().filter(|f| f.is_data()) {
        if let Some(ta) = f.transmitter {
            grouped.entry(ta).or_default().push(f);
        }
    }
    grouped
        .into_iter()
        .map(|(ta, mut fs)| {
            fs.sort_by(|a, b| a.offset.total_cmp(&b.offset));
            let mut packets: Vec<LogicalPacket> = Vec::new();
            for f in fs {
                match packets.last_mut() {
                    Some(last) if last.seq() == f.seq() => {
                        last.add_frame(f);
                    }
                    _ => packets.push(LogicalPacket::from_frame(f)),
                }
            }
            prune_retransmissions(&mut packets);
            (ta, packets)
        })
        .collect()
}

fn prune_retransmissions(packets: &mut Vec<LogicalPacket>) {
    if packets.len() <= 3 {
        return;
    }
    for i in (1..packets.len() - 1).rev() {
        let (a, b, c) = (packets[i - 1].seq(), packets[i].seq(), packets[i + 1].seq());
        if is_retransmission(a, b, c) {
            packets.remove(i);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const M1: MacAddr = MacAddr::new(0x0000_0000_0a01);
    pub(crate) const M2: MacAddr = MacAddr::new(0x0000_0000_0b02);

    pub(crate) fn data_frame(ta: MacAddr, seq: u64, frag: u64, size: u32, offset: f64) -> FrameRecord {
        FrameRecord {
            index: seq,
            offset,
            size,
            correct: true,
            frame_type: Some("Data/QoS Data".to_string()),
            transmitter: Some(ta),
            receiver: Some(MacAddr::new(0x0000_0000_ffee)),
            more_fragments: Some(false),
            seq_num: Some(seq),
            frag_num: Some(frag),
            ..Default::default()
        }
    }

    /// Size pattern whose first packet is the peak: the cut lands at position 0.
    pub(crate) fn size_at(i: u64) -> u32 {
        if i == 0 {
            1500
        } else {
            200 + ((i * 37) % 900) as u32
        }
    }

    #[test]
    fn fragments_fold_into_one_packet() {
        let mut r = PacketReassembler::new(10);
        assert!(r.handle(&data_frame(M1, 4, 0, 300, 0.1)));
        assert!(r.handle(&data_frame(M1, 4, 1, 200, 0.3)));
        assert!(r.handle(&data_frame(M1, 4, 2, 100, 0.2)));
        let packets = r.packets(M1).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].size(), 600);
        assert_eq!(packets[0].offset(), 0.3);
    }

    #[test]
    fn ignores_non_data_and_broadcast() {
        let mut r = PacketReassembler::new(10);
        let mut beacon = data_frame(M1, 1, 0, 100, 0.0);
        beacon.frame_type = Some(crate::frame::BEACON_TYPE.to_string());
        assert!(!r.handle(&beacon));
        assert!(!r.handle(&data_frame(MacAddr::BROADCAST, 1, 0, 100, 0.0)));
        let mut no_ta = data_frame(M1, 1, 0, 100, 0.0);
        no_ta.transmitter = None;
        assert!(!r.handle(&no_ta));
        assert!(r.is_empty());
    }

    #[test]
    fn prunes_retransmitted_middle() {
        let mut r = PacketReassembler::new(10);
        for (i, seq) in [5u64, 9, 5].into_iter().enumerate() {
            r.handle(&data_frame(M1, seq, 0, 100, i as f64));
        }
        let seqs: Vec<u64> = r.packets(M1).unwrap().iter().map(|p| p.seq()).collect();
        assert_eq!(seqs, vec![5, 5]);

        let mut r = PacketReassembler::new(10);
        for (i, seq) in [5u64, 9, 13].into_iter().enumerate() {
            r.handle(&data_frame(M1, seq, 0, 100, i as f64));
        }
        let seqs: Vec<u64> = r.packets(M1).unwrap().iter().map(|p| p.seq()).collect();
        assert_eq!(seqs, vec![5, 9, 13]);
    }

    #[test]
    fn cut_at_peak_records_delta() {
        let mut r = PacketReassembler::new(50);
        let sizes = [100u32, 200, 300, 250, 400];
        for (i, s) in sizes.iter().enumerate() {
            r.handle(&data_frame(M1, i as u64 + 1, 0, *s, 1.0 + i as f64 * 0.5));
        }
        let w = r.window(M1).unwrap();
        assert!(!w.needs_cut());
        assert_eq!(w.cut_count(), 2);
        let packets = w.packets();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].size(), 300);
        // offset 2.0 minus predecessor 1.5
        assert!((packets[0].arrival() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn cut_at_position_zero_keeps_offset() {
        let mut r = PacketReassembler::new(50);
        for (i, s) in [900u32, 100, 200].iter().enumerate() {
            r.handle(&data_frame(M1, i as u64, 0, *s, 2.0 + i as f64));
        }
        let w = r.window(M1).unwrap();
        assert!(!w.needs_cut());
        assert_eq!(w.cut_count(), 0);
        assert_eq!(w.packets()[0].arrival(), 2.0);
    }

    #[test]
    fn ready_at_threshold_and_bounded() {
        let threshold = 20;
        let mut r = PacketReassembler::new(threshold);
        for i in 0..(threshold as u64 + 15) {
            r.handle(&data_frame(M1, i, 0, size_at(i), i as f64 * 0.01));
            assert!(r.window(M1).unwrap().packets().len() <= threshold);
        }
        assert!(r.is_ready(M1));
        assert_eq!(r.packets(M1).unwrap().len(), threshold);
        assert_eq!(r.pop_ready(), Some(M1));
        assert_eq!(r.pop_ready(), None);
    }

    #[test]
    fn ascending_stream_keeps_newest_run() {
        let threshold = 10;
        let mut r = PacketReassembler::new(threshold);
        for i in 0..30u64 {
            r.handle(&data_frame(M1, i, 0, 100 + i as u32, i as f64));
        }
        let w = r.window(M1).unwrap();
        assert_eq!(w.cut_count(), 20);
        assert!(w.needs_cut());
        assert!(!r.is_ready(M1));
        let packets = r.packets(M1).unwrap();
        assert_eq!(packets.len(), threshold);
        assert_eq!(packets[0].seq(), 20);
        assert_eq!(packets[threshold - 1].seq(), 29);
        assert_eq!(packets[0].arrival(), 1.0);
    }

    #[test]
    fn drop_after_ramp_completes_cut() {
        let threshold = 10;
        let mut r = PacketReassembler::new(threshold);
        for i in 0..30u64 {
            r.handle(&data_frame(M1, i, 0, 100 + i as u32, i as f64));
        }
        // 129 is the peak; the drop to 50 ends the ramp
        for i in 30..40u64 {
            r.handle(&data_frame(M1, i, 0, 50 + i as u32, i as f64));
        }
        let w = r.window(M1).unwrap();
        assert!(!w.needs_cut());
        assert_eq!(w.cut_count(), 29);
        assert!(r.is_ready(M1));
        let packets = r.packets(M1).unwrap();
        assert_eq!(packets.len(), threshold);
        assert_eq!(packets[0].seq(), 29);
        assert_eq!(packets[0].arrival(), 1.0);
    }

    #[test]
    fn ordinary_sizes_cut_at_first_drop() {
        let mut r = PacketReassembler::new(DEFAULT_PACKET_THRESHOLD);
        for i in 0..200u64 {
            r.handle(&data_frame(M1, i, 0, 500 + (i % 7) as u32, i as f64 * 0.01));
        }
        let w = r.window(M1).unwrap();
        assert_eq!(w.cut_count(), 6);
        assert_eq!(w.packets().len(), 194);
        assert!(!r.is_ready(M1));
        for i in 200..206u64 {
            r.handle(&data_frame(M1, i, 0, 500 + (i % 7) as u32, i as f64 * 0.01));
        }
        assert!(r.is_ready(M1));
        assert_eq!(r.packets(M1).unwrap()[0].seq(), 6);
    }

    #[test]
    fn mark_ready_and_drain() {
        let mut r = PacketReassembler::new(100);
        r.handle(&data_frame(M1, 1, 0, 100, 0.0));
        r.handle(&data_frame(M2, 1, 0, 100, 0.0));
        assert!(!r.is_ready(M1));
        r.mark_ready(M1);
        r.mark_ready(M1);
        assert!(r.is_ready(M1));
        assert_eq!(r.transmitters(), vec![M1, M2]);
        assert_eq!(r.drain(M1).unwrap().len(), 1);
        assert_eq!(r.pop_ready(), None);
        assert_eq!(r.transmitters(), vec![M2]);
    }

    #[test]
    fn offline_collection_sorts_by_offset() {
        let frames = vec![
            data_frame(M1, 2, 0, 50, 0.2),
            data_frame(M1, 1, 0, 10, 0.1),
            data_frame(M1, 1, 1, 20, 0.15),
            data_frame(M2, 7, 0, 70, 0.0),
        ];
        let grouped = collect_by_transmitter(&frames);
        assert_eq!(grouped.len(), 2);
        let p = &grouped[&M1];
        assert_eq!(p.len(), 2);
        assert_eq!(p[0].size(), 30);
        assert_eq!(p[1].seq(), 2);
    }

    #[test]
    fn offline_collection_prunes_retransmissions() {
        let frames: Vec<FrameRecord> = [1u64, 2, 9, 3, 4, 5]
            .iter()
            .enumerate()
            .map(|(i, seq)| data_frame(M1, *seq, 0, 100, i as f64))
            .collect();
        let seqs: Vec<u64> = collect_by_transmitter(&frames)[&M1]
            .iter()
            .map(LogicalPacket::seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        // three packets or fewer are left alone
        let short: Vec<FrameRecord> = [5u64, 9, 5]
            .iter()
            .enumerate()
            .map(|(i, seq)| data_frame(M1, *seq, 0, 100, i as f64))
            .collect();
        assert_eq!(collect_by_transmitter(&short)[&M1].len(), 3);
    }
}
