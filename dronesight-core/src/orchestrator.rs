//! Per-frame classification pipeline: topology, rules, reassembly, estimator,
//! sequence-model fallback and peer inference.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::device::{ClassifiedDevice, Confidence, DeviceType, Source, Verdict};
use crate::estimator::{Dataset, Estimator};
use crate::features::{extract, is_finite_row};
use crate::frame::FrameRecord;
use crate::graph::TopologyGraph;
use crate::mac::MacAddr;
use crate::packet::LogicalPacket;
use crate::pool::ThreadPool;
use crate::reassembly::{PacketReassembler, Reassembler};
use crate::rules::RuleClassifier;
use crate::sequence::{ObservationTransformer, SequenceModel};

struct SequenceFallback {
    model: Box<dyn SequenceModel>,
    transformer: Arc<ObservationTransformer>,
}

/// Owns the topology graph and the reassembler; classifies transmitters as frames arrive.
pub struct ClassificationOrchestrator<R: Reassembler = PacketReassembler> {
    graph: TopologyGraph,
    rules: RuleClassifier,
    reassembler: R,
    estimator: Option<Box<dyn Estimator>>,
    sequence: Option<SequenceFallback>,
    pool: ThreadPool,
    devices: BTreeMap<MacAddr, ClassifiedDevice>,
    /// Classified by rule or estimator; no longer fed to the reassembler.
    settled: HashSet<MacAddr>,
}

impl<R: Reassembler> ClassificationOrchestrator<R> {
    pub fn new(rules: RuleClassifier, reassembler: R, pool: ThreadPool) -> Self {
        Self {
            graph: TopologyGraph::new(),
            rules,
            reassembler,
            estimator: None,
            sequence: None,
            pool,
            devices: BTreeMap::new(),
            settled: HashSet::new(),
        }
    }

    pub fn with_estimator(mut self, estimator: Box<dyn Estimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_sequence_model(
        mut self,
        model: Box<dyn SequenceModel>,
        transformer: ObservationTransformer,
    ) -> Self {
        self.sequence = Some(SequenceFallback {
            model,
            transformer: Arc::new(transformer),
        });
        self
    }

    pub fn topology(&self) -> &TopologyGraph {
        &self.graph
    }

    pub fn reassembler(&self) -> &R {
        &self.reassembler
    }

    /// Every device record, including provisional ones.
    pub fn devices(&self) -> &BTreeMap<MacAddr, ClassifiedDevice> {
        &self.devices
    }

    pub fn handle_frame(&mut self, frame: &FrameRecord) {
        let Some(ta) = frame.transmitter else {
            return;
        };
        self.graph.add_frame(frame);
        if ta.is_broadcast() || self.settled.contains(&ta) {
            return;
        }
        if let Some(m) = self.rules.classify(ta, frame.ssid.as_deref(), &self.graph) {
            tracing::debug!(mac = %ta, role = %m.device_type, source = %m.source, "rule match");
            self.record(ClassifiedDevice {
                mac: ta,
                device_type: m.device_type,
                source: m.source,
                confidence: Confidence::Rule,
                annotation: Some(m.annotation),
            });
            self.settled.insert(ta);
            self.reassembler.discard(ta);
            return;
        }
        self.reassembler.handle(frame);
    }

    pub fn handle_frames<'a>(&mut self, frames: impl IntoIterator<Item = &'a FrameRecord>) {
        for frame in frames {
            self.handle_frame(frame);
        }
    }

    /// Flush the pipeline: estimate ready transmitters, score the rest with the
    /// sequence model, infer peers. Returns every classified address.
    pub fn classified(&mut self) -> BTreeMap<MacAddr, Verdict> {
        self.estimate_ready();
        self.score_sequences();
        self.infer_peers();
        self.devices
            .iter()
            .map(|(mac, d)| (*mac, Verdict::from(d)))
            .collect()
    }

    /// Transmitters with a partial packet stream and no classification at all.
    pub fn unclassified_devices(&self) -> Vec<ClassifiedDevice> {
        self.reassembler
            .transmitters()
            .into_iter()
            .filter(|mac| !self.settled.contains(mac) && !self.devices.contains_key(mac))
            .map(|mac| ClassifiedDevice {
                mac,
                device_type: DeviceType::Unknown,
                source: Source::InsufficientData,
                confidence: Confidence::InsufficientData,
                annotation: Some("insufficient data".to_string()),
            })
            .collect()
    }

    pub fn unclassified(&self) -> BTreeMap<MacAddr, Verdict> {
        self.unclassified_devices()
            .iter()
            .map(|d| (d.mac, Verdict::from(d)))
            .collect()
    }

    pub fn all(&mut self) -> BTreeMap<MacAddr, Verdict> {
        let mut out = self.classified();
        out.extend(self.unclassified());
        out
    }

    fn record(&mut self, device: ClassifiedDevice) {
        self.devices.insert(device.mac, device);
    }

    fn estimate_ready(&mut self) {
        let mut batch: Vec<(MacAddr, Vec<LogicalPacket>)> = Vec::new();
        while let Some(mac) = self.reassembler.pop_ready() {
            if self.settled.contains(&mac) {
                continue;
            }
            if let Some(packets) = self.reassembler.packets(mac) {
                batch.push((mac, packets));
            }
        }
        if batch.is_empty() {
            return;
        }
        let Some(estimator) = self.estimator.as_ref().filter(|e| e.valid()) else {
            tracing::warn!(ready = batch.len(), "no usable estimator; ready transmitters left to fallback");
            return;
        };
        let (macs, streams): (Vec<MacAddr>, Vec<Vec<LogicalPacket>>) = batch.into_iter().unzip();
        let rows = match self.pool.map(streams.clone(), |packets| extract(&packets)) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "pool unavailable, extracting inline");
                streams.iter().map(|p| extract(p)).collect()
            }
        };
        let (kept, rows): (Vec<MacAddr>, Vec<Vec<f64>>) = macs
            .into_iter()
            .zip(rows)
            .filter_map(|(mac, row)| match row {
                Some(row) if is_finite_row(&row) => Some((mac, row)),
                _ => {
                    tracing::debug!(mac = %mac, "non-finite features, left to fallback");
                    None
                }
            })
            .unzip();
        if kept.is_empty() {
            return;
        }
        let labels = estimator.predict(&Dataset::new(rows));
        tracing::info!(devices = kept.len(), "estimator batch");
        for (mac, label) in kept.into_iter().zip(labels) {
            self.record(ClassifiedDevice {
                mac,
                device_type: DeviceType::from_label(label).unwrap_or(DeviceType::Unknown),
                source: Source::Forest,
                confidence: Confidence::Forest,
                annotation: None,
            });
            self.settled.insert(mac);
            self.reassembler.discard(mac);
        }
    }

    fn score_sequences(&mut self) {
        let Some(fallback) = self.sequence.as_ref() else {
            return;
        };
        let pending: Vec<(MacAddr, Vec<LogicalPacket>)> = self
            .reassembler
            .transmitters()
            .into_iter()
            .filter(|mac| !mac.is_broadcast() && !self.settled.contains(mac))
            .filter_map(|mac| self.reassembler.packets(mac).map(|p| (mac, p)))
            .filter(|(_, p)| !p.is_empty())
            .collect();
        if pending.is_empty() {
            return;
        }
        let transformer = Arc::clone(&fallback.transformer);
        let observed = match self.pool.map(pending.clone(), move |(mac, packets)| {
            (mac, transformer.observe_packets(&packets))
        }) {
            Ok(observed) => observed,
            Err(e) => {
                tracing::warn!(error = %e, "pool unavailable, observing inline");
                pending
                    .iter()
                    .map(|(mac, p)| (*mac, fallback.transformer.observe_packets(p)))
                    .collect()
            }
        };
        let mut scored = Vec::with_capacity(observed.len());
        for (mac, observations) in observed {
            let Some(state) = fallback.model.predict_terminal_state(&observations) else {
                continue;
            };
            scored.push(ClassifiedDevice {
                mac,
                device_type: DeviceType::from_label(state).unwrap_or(DeviceType::Unknown),
                source: Source::SequenceModel,
                confidence: Confidence::SequenceModel,
                annotation: None,
            });
        }
        tracing::info!(devices = scored.len(), "sequence-model fallback");
        for device in scored {
            self.record(device);
        }
    }

    /// One hop: every directly classified, known-role device assigns the opposite role
    /// to its most frequent counterpart unless that counterpart is directly classified.
    fn infer_peers(&mut self) {
        let mut inferred: BTreeMap<MacAddr, ClassifiedDevice> = BTreeMap::new();
        for origin in self.devices.values() {
            if origin.device_type == DeviceType::Unknown
                || matches!(origin.source, Source::PeerInferred { .. })
            {
                continue;
            }
            let Some(peer) = self.graph.most_frequent_counterpart(origin.mac) else {
                continue;
            };
            if peer.is_broadcast() || peer == origin.mac || self.is_direct(peer) {
                continue;
            }
            let candidate = ClassifiedDevice {
                mac: peer,
                device_type: origin.device_type.opposite(),
                source: Source::PeerInferred { from: origin.mac },
                confidence: origin.confidence,
                annotation: None,
            };
            match inferred.get(&peer) {
                Some(best) if best.confidence >= candidate.confidence => {}
                _ => {
                    inferred.insert(peer, candidate);
                }
            }
        }
        for (mac, device) in inferred {
            tracing::debug!(mac = %mac, role = %device.device_type, source = %device.source, "peer inferred");
            self.record(device);
        }
    }

    fn is_direct(&self, mac: MacAddr) -> bool {
        self.devices
            .get(&mac)
            .map_or(false, |d| !matches!(d.source, Source::PeerInferred { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BEACON_TYPE;
    use crate::reassembly::tests::{data_frame, size_at, M1, M2};
    use crate::rules::{RuleSet, VendorFallback};
    use crate::sequence::{StandardScaler, DEFAULT_SKIPPED_FEATURES};
    use parking_lot::Mutex;
    use std::path::Path;

    const PARROT: MacAddr = MacAddr::new(0x9003_b712_3456);
    const NOBODY: MacAddr = MacAddr::new(0x0200_0000_0001);

    /// Predicts a fixed label and records the shape of every batch.
    #[derive(Clone)]
    struct RecordingEstimator {
        label: usize,
        calls: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    impl Estimator for RecordingEstimator {
        fn fit(&mut self, _: &Dataset) -> Result<(), crate::persist::ModelError> {
            Ok(())
        }
        fn predict(&self, data: &Dataset) -> Vec<usize> {
            self.calls.lock().push((data.len(), data.features()));
            vec![self.label; data.len()]
        }
        fn predict_probabilities(&self, data: &Dataset) -> Vec<BTreeMap<usize, f64>> {
            self.predict(data)
                .into_iter()
                .map(|l| BTreeMap::from([(l, 1.0)]))
                .collect()
        }
        fn save(&self, _: &Path) -> Result<(), crate::persist::ModelError> {
            Ok(())
        }
        fn load(&mut self, _: &Path) -> Result<(), crate::persist::ModelError> {
            Ok(())
        }
        fn clone_box(&self) -> Box<dyn Estimator> {
            Box::new(self.clone())
        }
        fn valid(&self) -> bool {
            true
        }
    }

    struct FixedState {
        state: usize,
        lengths: Arc<Mutex<Vec<usize>>>,
    }

    impl SequenceModel for FixedState {
        fn predict_terminal_state(&self, observations: &[usize]) -> Option<usize> {
            self.lengths.lock().push(observations.len());
            Some(self.state)
        }
    }

    fn transformer() -> ObservationTransformer {
        let width = crate::features::FEATURE_COUNT - DEFAULT_SKIPPED_FEATURES.len();
        let scaler = StandardScaler::new(vec![0.0; width], vec![1.0; width]).unwrap();
        ObservationTransformer::new(scaler, vec![vec![0.0; width]])
    }

    fn beacon(ta: MacAddr, ssid: &str) -> FrameRecord {
        FrameRecord {
            correct: true,
            frame_type: Some(BEACON_TYPE.to_string()),
            ssid: Some(ssid.to_string()),
            transmitter: Some(ta),
            receiver: Some(MacAddr::BROADCAST),
            ..Default::default()
        }
    }

    fn orchestrator(rules: RuleSet, threshold: usize) -> ClassificationOrchestrator {
        ClassificationOrchestrator::new(
            RuleClassifier::new(rules),
            PacketReassembler::new(threshold),
            ThreadPool::new(2),
        )
    }

    /// `size_at` puts the size peak first, so the cut lands at position 0 and
    /// exactly 200 frames fill the window.
    #[test]
    fn full_window_goes_to_estimator_once() {
        let mut rules = RuleSet::empty();
        rules.add_vendor(M1.oui24(), "Acme Networks");
        rules.fallback = VendorFallback::Defer;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut o = orchestrator(rules, 200).with_estimator(Box::new(RecordingEstimator {
            label: DeviceType::Drone.label(),
            calls: calls.clone(),
        }));
        for i in 0..200u64 {
            o.handle_frame(&data_frame(M1, i, 0, size_at(i), 0.001 + i as f64 * 0.01));
        }
        assert!(o.devices().is_empty());
        assert!(o.reassembler().is_ready(M1));
        assert_eq!(o.reassembler().packets(M1).unwrap().len(), 200);

        let out = o.classified();
        assert_eq!(*calls.lock(), vec![(1, 27)]);
        assert_eq!(
            out[&M1],
            Verdict {
                device_type: DeviceType::Drone,
                confidence: Confidence::Forest
            }
        );
        assert_eq!(out[&M1].confidence.value(), 3);

        // settled: later frames and flushes do not reach the estimator again
        o.handle_frame(&data_frame(M1, 500, 0, 700, 9.0));
        o.classified();
        assert_eq!(calls.lock().len(), 1);
        assert!(o.unclassified().is_empty());
    }

    /// A rising ramp ahead of the first size drop is cut away, so readiness needs
    /// that many extra frames beyond the threshold.
    #[test]
    fn window_waits_for_frames_lost_to_the_cut() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut o = orchestrator(RuleSet::empty(), 200).with_estimator(Box::new(RecordingEstimator {
            label: DeviceType::Controller.label(),
            calls: calls.clone(),
        }));
        let frame = |i: u64| data_frame(M1, i, 0, 500 + (i % 7) as u32 * 40, i as f64 * 0.01 + (i % 3) as f64 * 0.002);
        for i in 0..200u64 {
            o.handle_frame(&frame(i));
        }
        assert_eq!(o.reassembler().packets(M1).unwrap().len(), 194);
        assert!(o.classified().is_empty());
        assert!(calls.lock().is_empty());

        for i in 200..206u64 {
            o.handle_frame(&frame(i));
        }
        let out = o.classified();
        assert_eq!(*calls.lock(), vec![(1, 27)]);
        assert_eq!(out[&M1].device_type, DeviceType::Controller);
    }

    #[test]
    fn drone_host_makes_its_client_a_controller() {
        let mut o = orchestrator(RuleSet::default(), 200);
        o.handle_frame(&beacon(PARROT, "Bebop2-0042"));
        for i in 0..5u64 {
            let mut f = data_frame(NOBODY, i, 0, 300, i as f64);
            f.receiver = Some(PARROT);
            o.handle_frame(&f);
        }
        assert_eq!(o.devices()[&PARROT].source, Source::Vendor);
        assert!(o.unclassified().contains_key(&NOBODY));

        let out = o.classified();
        assert_eq!(out[&PARROT].device_type, DeviceType::Drone);
        assert_eq!(out[&NOBODY].device_type, DeviceType::Controller);
        assert_eq!(out[&NOBODY].confidence, Confidence::Rule);
        assert_eq!(
            o.devices()[&NOBODY].source,
            Source::PeerInferred { from: PARROT }
        );
        assert!(o.unclassified().is_empty());
    }

    #[test]
    fn short_streams_report_insufficient_data() {
        let mut o = orchestrator(RuleSet::empty(), 200);
        for i in 0..5u64 {
            o.handle_frame(&data_frame(M2, i, 0, 300 + i as u32, i as f64));
        }
        assert!(o.classified().is_empty());
        let u = o.unclassified_devices();
        assert_eq!(u.len(), 1);
        assert_eq!(u[0].mac, M2);
        assert_eq!(u[0].source, Source::InsufficientData);
        assert_eq!(o.all()[&M2].confidence, Confidence::InsufficientData);
    }

    #[test]
    fn sequence_model_scores_short_streams() {
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let mut o = orchestrator(RuleSet::empty(), 200).with_sequence_model(
            Box::new(FixedState {
                state: DeviceType::Controller.label(),
                lengths: lengths.clone(),
            }),
            transformer(),
        );
        for i in 0..5u64 {
            o.handle_frame(&data_frame(M2, i, 0, 300 + i as u32 * 10, i as f64));
        }
        let out = o.classified();
        assert_eq!(*lengths.lock(), vec![5]);
        assert_eq!(
            out[&M2],
            Verdict {
                device_type: DeviceType::Controller,
                confidence: Confidence::SequenceModel
            }
        );
        assert!(o.unclassified().is_empty());
    }

    #[test]
    fn frames_without_transmitter_are_skipped() {
        let mut o = orchestrator(RuleSet::default(), 200);
        let mut f = data_frame(M1, 1, 0, 100, 0.0);
        f.transmitter = None;
        o.handle_frame(&f);
        o.handle_frame(&data_frame(MacAddr::BROADCAST, 1, 0, 100, 0.0));
        assert!(o.all().is_empty());
        assert_eq!(o.topology().edges().count(), 1);
    }
}
