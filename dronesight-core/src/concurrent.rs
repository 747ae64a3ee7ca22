//! Thread-safe reassembler: out-of-order arrival, one re-entrant lock per transmitter.
//!
//! Lock order: transmitter lock, then ready-queue lock. The transmitter map lock is
//! only held long enough to fetch or insert a window handle.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::BufRead;
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::frame::FrameRecord;
use crate::mac::MacAddr;
use crate::packet::LogicalPacket;
use crate::parser::{FrameParser, Layout, ReadError, RecordLines};
use crate::pool::{PoolError, ThreadPool};
use crate::reassembly::{is_reassemblable, Reassembler, DEFAULT_PACKET_THRESHOLD};

/// Sequence-ordered window with per-packet fragment bookkeeping.
#[derive(Debug, Clone)]
pub struct SyncWindow {
    packets: Vec<LogicalPacket>,
    expected: Vec<u64>,
    complete: Vec<bool>,
    threshold: usize,
    needs_cut: bool,
    ready: bool,
}

impl SyncWindow {
    pub fn new(threshold: usize) -> Self {
        Self {
            packets: Vec::new(),
            expected: Vec::new(),
            complete: Vec::new(),
            threshold: threshold.max(1),
            needs_cut: true,
            ready: false,
        }
    }

    /// Fold in one frame. Returns the window's readiness afterwards.
    pub fn add(&mut self, frame: &FrameRecord) -> bool {
        if self.ready {
            return true;
        }
        let seq = frame.seq();
        let frag = frame.frag();
        let more = frame.has_more_fragments();
        let ind = self.packets.partition_point(|p| p.seq() < seq);
        if ind == 0 && !self.needs_cut {
            // nothing may land in front of a completed cut
            return self.ready;
        }
        if ind == self.packets.len() || self.packets[ind].seq() > seq {
            let packet = LogicalPacket::from_frame(frame);
            let expected = if more {
                frag.saturating_add(2)
            } else {
                frag.saturating_add(1)
            };
            self.complete
                .insert(ind, expected == packet.fragment_count() as u64);
            self.expected.insert(ind, expected);
            self.packets.insert(ind, packet);
        } else {
            self.packets[ind].add_frame(frame);
            self.expected[ind] = if more {
                self.expected[ind].max(frag.saturating_add(2))
            } else {
                frag.saturating_add(1)
            };
            self.complete[ind] = self.expected[ind] == self.packets[ind].fragment_count() as u64;
        }
        self.try_cut();
        self.ready = !self.needs_cut && self.count() >= self.threshold;
        self.ready
    }

    /// Drop the ascending prefix once a ready, smaller packet follows it.
    fn try_cut(&mut self) {
        if !self.needs_cut || self.packets.len() < 2 || !self.complete[0] {
            return;
        }
        let mut ind = 1;
        while ind < self.packets.len()
            && self.complete[ind]
            && self.packets[ind].size() >= self.packets[ind - 1].size()
        {
            ind += 1;
        }
        if ind == self.packets.len() || self.packets[ind].size() >= self.packets[ind - 1].size() {
            return;
        }
        let keep = ind - 1;
        let delta = if keep == 0 {
            self.packets[0].offset()
        } else {
            self.packets[keep].offset() - self.packets[keep - 1].offset()
        };
        self.packets[keep].set_arrival(delta);
        self.packets.drain(..keep);
        self.expected.drain(..keep);
        self.complete.drain(..keep);
        self.needs_cut = false;
        tracing::debug!(discarded = keep, arrival = delta, "front-cut");
    }

    /// Leading packets with every expected fragment observed.
    pub fn count(&self) -> usize {
        self.complete.iter().take_while(|c| **c).count()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn needs_cut(&self) -> bool {
        self.needs_cut
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// At most `threshold` leading packets.
    pub fn packets(&self) -> Vec<LogicalPacket> {
        self.packets.iter().take(self.threshold).cloned().collect()
    }

    /// Forget every packet and re-arm the cut.
    pub fn reset(&mut self) {
        self.packets.clear();
        self.expected.clear();
        self.complete.clear();
        self.needs_cut = true;
        self.ready = false;
    }
}

type Slot = Arc<ReentrantMutex<RefCell<SyncWindow>>>;

#[derive(Default)]
struct ReadyQueue {
    order: VecDeque<MacAddr>,
    queued: HashSet<MacAddr>,
}

/// Reassembler shared across pool workers.
pub struct ConcurrentPacketReassembler {
    windows: RwLock<HashMap<MacAddr, Slot>>,
    queue: Mutex<ReadyQueue>,
    threshold: usize,
}

impl ConcurrentPacketReassembler {
    pub fn new(threshold: usize) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            queue: Mutex::new(ReadyQueue::default()),
            threshold,
        }
    }

    fn slot(&self, mac: MacAddr) -> Slot {
        if let Some(slot) = self.windows.read().get(&mac) {
            return slot.clone();
        }
        let threshold = self.threshold;
        self.windows
            .write()
            .entry(mac)
            .or_insert_with(|| Arc::new(ReentrantMutex::new(RefCell::new(SyncWindow::new(threshold)))))
            .clone()
    }

    fn existing(&self, mac: MacAddr) -> Option<Slot> {
        self.windows.read().get(&mac).cloned()
    }

    fn read<T>(slot: &Slot, f: impl FnOnce(&SyncWindow) -> T) -> T {
        let guard = slot.lock();
        let window = guard.borrow();
        f(&window)
    }

    /// Handle one frame from any thread. Returns true when the frame was taken.
    pub fn submit(&self, frame: &FrameRecord) -> bool {
        if !is_reassemblable(frame) {
            return false;
        }
        let Some(ta) = frame.transmitter else {
            return false;
        };
        let slot = self.slot(ta);
        let guard = slot.lock();
        let ready = guard.borrow_mut().add(frame);
        if ready {
            // transmitter lock still held: queue lock comes second
            let mut q = self.queue.lock();
            if q.queued.insert(ta) {
                tracing::debug!(mac = %ta, "transmitter ready");
                q.order.push_back(ta);
            }
        }
        true
    }

    /// Next transmitter that became ready.
    pub fn take_ready(&self) -> Option<MacAddr> {
        self.queue.lock().order.pop_front()
    }

    pub fn is_ready(&self, mac: MacAddr) -> bool {
        self.existing(mac)
            .map_or(false, |slot| Self::read(&slot, SyncWindow::is_ready))
    }

    /// Ready-prefix of a transmitter's window.
    pub fn snapshot(&self, mac: MacAddr) -> Option<Vec<LogicalPacket>> {
        self.existing(mac)
            .map(|slot| Self::read(&slot, SyncWindow::packets))
    }

    /// Clear one transmitter's window so it can become ready again.
    pub fn reset(&self, mac: MacAddr) {
        if let Some(slot) = self.existing(mac) {
            let guard = slot.lock();
            guard.borrow_mut().reset();
            let mut q = self.queue.lock();
            q.queued.remove(&mac);
            q.order.retain(|m| *m != mac);
        }
    }

    /// Drop a transmitter's window and any pending ready notification.
    pub fn remove(&self, mac: MacAddr) {
        self.windows.write().remove(&mac);
        let mut q = self.queue.lock();
        q.queued.remove(&mac);
        q.order.retain(|m| *m != mac);
    }

    /// Snapshot of known transmitters in address order.
    pub fn macs(&self) -> Vec<MacAddr> {
        let mut macs: Vec<MacAddr> = self.windows.read().keys().copied().collect();
        macs.sort();
        macs
    }

    pub fn clear(&self) {
        self.windows.write().clear();
        let mut q = self.queue.lock();
        q.order.clear();
        q.queued.clear();
    }

    /// Read records from `reader`, parsing and handling each one as a pool job.
    /// Returns once every submitted job has run. A truncated trailing record is
    /// reported after the complete records were handled.
    pub fn ingest<R: BufRead>(
        self: &Arc<Self>,
        reader: R,
        layout: Layout,
        parser: &Arc<FrameParser>,
        pool: &ThreadPool,
    ) -> Result<usize, ReadError> {
        let (done_tx, done_rx) = mpsc::channel::<bool>();
        let mut submitted = 0usize;
        let mut failure = None;
        for record in RecordLines::new(reader, layout) {
            let lines = match record {
                Ok(lines) => lines,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let this = Arc::clone(self);
            let parser = Arc::clone(parser);
            let done = done_tx.clone();
            let queued = pool.execute(move || {
                let frame = parser.parse_record(&lines, layout);
                let taken = this.submit(&frame);
                let _ = done.send(taken);
            });
            if !queued {
                failure = Some(ReadError::Pool(PoolError::ShutDown));
                break;
            }
            submitted += 1;
        }
        drop(done_tx);
        let taken = done_rx.iter().filter(|t| *t).count();
        tracing::info!(records = submitted, taken, "ingest finished");
        match failure {
            Some(e) => Err(e),
            None => Ok(submitted),
        }
    }
}

impl Default for ConcurrentPacketReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_THRESHOLD)
    }
}

impl Reassembler for ConcurrentPacketReassembler {
    fn handle(&mut self, frame: &FrameRecord) -> bool {
        self.submit(frame)
    }

    fn pop_ready(&mut self) -> Option<MacAddr> {
        self.take_ready()
    }

    fn packets(&self, mac: MacAddr) -> Option<Vec<LogicalPacket>> {
        self.snapshot(mac)
    }

    fn transmitters(&self) -> Vec<MacAddr> {
        self.macs()
    }

    fn discard(&mut self, mac: MacAddr) {
        self.remove(mac);
    }
}
