//! Sequence-model fallback: observation discretisation and hidden-state inference.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::estimator::euclidean;
use crate::features::{extract_with_skips, is_finite_row};
use crate::packet::LogicalPacket;
use crate::persist::{load_model, save_model, ModelError, ModelKind};

/// Feature positions left out of observation vectors.
pub const DEFAULT_SKIPPED_FEATURES: [usize; 2] = [2, 15];

/// Infers the most likely final hidden state of an observation sequence.
pub trait SequenceModel: Send + Sync {
    /// `None` for an empty sequence or one the model cannot score.
    fn predict_terminal_state(&self, observations: &[usize]) -> Option<usize>;
}

/// Discrete hidden Markov model: start, transition and emission probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkovModel {
    start: Vec<f64>,
    transitions: Vec<Vec<f64>>,
    emissions: Vec<Vec<f64>>,
}

impl MarkovModel {
    pub fn new(
        start: Vec<f64>,
        transitions: Vec<Vec<f64>>,
        emissions: Vec<Vec<f64>>,
    ) -> Result<Self, ModelError> {
        let states = start.len();
        if states == 0 {
            return Err(ModelError::Empty);
        }
        if transitions.len() != states || transitions.iter().any(|r| r.len() != states) {
            return Err(ModelError::Shape(format!("transitions must be {states}x{states}")));
        }
        let symbols = emissions.first().map_or(0, Vec::len);
        if emissions.len() != states || symbols == 0 || emissions.iter().any(|r| r.len() != symbols) {
            return Err(ModelError::Shape(format!(
                "emissions must be {states}xN with N > 0"
            )));
        }
        Ok(Self {
            start,
            transitions,
            emissions,
        })
    }

    /// Supervised estimate from aligned observation/state sequences by counting.
    pub fn fit(
        observations: &[Vec<usize>],
        states: &[Vec<usize>],
        n_states: usize,
        n_symbols: usize,
    ) -> Result<Self, ModelError> {
        if observations.len() != states.len() {
            return Err(ModelError::Shape("observation and state sequence counts differ".into()));
        }
        let mut start = vec![0.0; n_states];
        let mut transitions = vec![vec![0.0; n_states]; n_states];
        let mut emissions = vec![vec![0.0; n_symbols]; n_states];
        let mut sequences = 0usize;
        for (obs, st) in observations.iter().zip(states) {
            if obs.len() != st.len() {
                return Err(ModelError::Shape("sequence lengths differ".into()));
            }
            if st.iter().any(|s| *s >= n_states) || obs.iter().any(|o| *o >= n_symbols) {
                return Err(ModelError::Shape("state or symbol out of range".into()));
            }
            let Some(first) = st.first() else {
                continue;
            };
            start[*first] += 1.0;
            sequences += 1;
            for w in st.windows(2) {
                transitions[w[0]][w[1]] += 1.0;
            }
            for (o, s) in obs.iter().zip(st) {
                emissions[*s][*o] += 1.0;
            }
        }
        if sequences == 0 {
            return Err(ModelError::Empty);
        }
        normalise(&mut start);
        transitions.iter_mut().for_each(|r| normalise(r));
        emissions.iter_mut().for_each(|r| normalise(r));
        Self::new(start, transitions, emissions)
    }

    pub fn states(&self) -> usize {
        self.start.len()
    }

    pub fn symbols(&self) -> usize {
        self.emissions[0].len()
    }

    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        load_model(path, ModelKind::Markov)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        save_model(path, ModelKind::Markov, self)
    }
}

fn normalise(row: &mut [f64]) {
    let total: f64 = row.iter().sum();
    if total > 0.0 {
        row.iter_mut().for_each(|x| *x /= total);
    }
}

fn argmax(xs: &[f64]) -> Option<usize> {
    xs.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

impl SequenceModel for MarkovModel {
    /// Forward pass, renormalised at every step; the final distribution's argmax.
    fn predict_terminal_state(&self, observations: &[usize]) -> Option<usize> {
        let (&first, rest) = observations.split_first()?;
        if observations.iter().any(|o| *o >= self.symbols()) {
            return None;
        }
        let n = self.states();
        let mut alpha: Vec<f64> = (0..n)
            .map(|i| self.start[i] * self.emissions[i][first])
            .collect();
        normalise(&mut alpha);
        for &o in rest {
            let next: Vec<f64> = (0..n)
                .map(|j| {
                    let reach: f64 = (0..n).map(|i| alpha[i] * self.transitions[i][j]).sum();
                    self.emissions[j][o] * reach
                })
                .collect();
            alpha = next;
            normalise(&mut alpha);
        }
        if alpha.iter().all(|a| *a == 0.0) {
            return None;
        }
        argmax(&alpha)
    }
}

/// Per-feature standardisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl StandardScaler {
    pub fn new(means: Vec<f64>, stds: Vec<f64>) -> Result<Self, ModelError> {
        if means.len() != stds.len() {
            return Err(ModelError::Shape("means and stds differ in length".into()));
        }
        Ok(Self { means, stds })
    }

    /// Column means and population standard deviations of `rows`.
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self, ModelError> {
        let width = rows.first().map(Vec::len).ok_or(ModelError::Empty)?;
        let n = rows.len() as f64;
        let mut means = vec![0.0; width];
        for r in rows {
            if r.len() != width {
                return Err(ModelError::Shape("ragged rows".into()));
            }
            for (m, v) in means.iter_mut().zip(r) {
                *m += v / n;
            }
        }
        let mut stds = vec![0.0; width];
        for r in rows {
            for ((s, v), m) in stds.iter_mut().zip(r).zip(&means) {
                *s += (v - m) * (v - m) / n;
            }
        }
        stds.iter_mut().for_each(|s| *s = s.sqrt());
        Self::new(means, stds)
    }

    /// `None` on a width mismatch.
    pub fn transform(&self, v: &[f64]) -> Option<Vec<f64>> {
        if v.len() != self.means.len() {
            return None;
        }
        Some(
            v.iter()
                .zip(&self.means)
                .zip(&self.stds)
                .map(|((x, m), s)| (x - m) / s)
                .collect(),
        )
    }

    pub fn inverse_transform(&self, v: &[f64]) -> Option<Vec<f64>> {
        if v.len() != self.means.len() {
            return None;
        }
        Some(
            v.iter()
                .zip(&self.means)
                .zip(&self.stds)
                .map(|((x, m), s)| x * s + m)
                .collect(),
        )
    }
}

/// Maps feature vectors to the index of the nearest cluster center in scaled space.
/// Index `centers.len()` is reserved for vectors that cannot be scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationTransformer {
    scaler: StandardScaler,
    centers: Vec<Vec<f64>>,
    skips: Vec<usize>,
}

impl ObservationTransformer {
    pub fn new(scaler: StandardScaler, centers: Vec<Vec<f64>>) -> Self {
        Self {
            scaler,
            centers,
            skips: DEFAULT_SKIPPED_FEATURES.to_vec(),
        }
    }

    pub fn with_skips(mut self, skips: Vec<usize>) -> Self {
        self.skips = skips;
        self
    }

    /// The reserved "invalid vector" observation.
    pub fn special(&self) -> usize {
        self.centers.len()
    }

    pub fn is_special(&self, observation: usize) -> bool {
        observation == self.special()
    }

    /// Observation vocabulary size including the reserved symbol.
    pub fn symbols(&self) -> usize {
        self.centers.len() + 1
    }

    pub fn observe(&self, features: &[f64]) -> usize {
        if !is_finite_row(features) {
            return self.special();
        }
        let Some(scaled) = self.scaler.transform(features) else {
            return self.special();
        };
        self.centers
            .iter()
            .enumerate()
            .map(|(i, c)| (i, euclidean(&scaled, c)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map_or(self.special(), |(i, _)| i)
    }

    /// One observation per prefix length `1..=packets.len()`.
    pub fn observe_packets(&self, packets: &[LogicalPacket]) -> Vec<usize> {
        (1..=packets.len())
            .map(|n| match extract_with_skips(&packets[..n], &self.skips) {
                Some(f) => self.observe(&f),
                None => self.special(),
            })
            .collect()
    }

    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        load_model(path, ModelKind::Transformer)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        save_model(path, ModelKind::Transformer, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// State 0 mostly emits 0, state 1 mostly emits 1; both sticky.
    fn two_state() -> MarkovModel {
        MarkovModel::new(
            vec![0.5, 0.5],
            vec![vec![0.9, 0.1], vec![0.1, 0.9]],
            vec![vec![0.8, 0.2], vec![0.2, 0.8]],
        )
        .unwrap()
    }

    #[test]
    fn terminal_state_follows_recent_evidence() {
        let m = two_state();
        assert_eq!(m.predict_terminal_state(&[0, 0, 0]), Some(0));
        assert_eq!(m.predict_terminal_state(&[0, 0, 1, 1, 1, 1]), Some(1));
        assert_eq!(m.predict_terminal_state(&[]), None);
        assert_eq!(m.predict_terminal_state(&[2]), None);
    }

    #[test]
    fn long_sequences_do_not_underflow() {
        let m = two_state();
        let obs: Vec<usize> = std::iter::repeat(1).take(5000).collect();
        assert_eq!(m.predict_terminal_state(&obs), Some(1));
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(MarkovModel::new(vec![], vec![], vec![]).is_err());
        assert!(MarkovModel::new(vec![1.0], vec![vec![1.0, 0.0]], vec![vec![1.0]]).is_err());
        assert!(MarkovModel::new(vec![1.0], vec![vec![1.0]], vec![vec![]]).is_err());
    }

    #[test]
    fn fit_by_counting() {
        let obs = vec![vec![0, 0, 1], vec![1, 1]];
        let states = vec![vec![0, 0, 1], vec![1, 1]];
        let m = MarkovModel::fit(&obs, &states, 2, 2).unwrap();
        assert_eq!(m.start, vec![0.5, 0.5]);
        assert_eq!(m.transitions[0], vec![0.5, 0.5]);
        assert_eq!(m.transitions[1], vec![0.0, 1.0]);
        assert_eq!(m.emissions[1], vec![0.0, 1.0]);
        assert!(MarkovModel::fit(&obs, &states[..1], 2, 2).is_err());
    }

    #[test]
    fn scaler_fit_and_inverse() {
        let s = StandardScaler::fit(&[vec![1.0, 10.0], vec![3.0, 30.0]]).unwrap();
        let t = s.transform(&[3.0, 10.0]).unwrap();
        assert_eq!(t, vec![1.0, -1.0]);
        assert_eq!(s.inverse_transform(&t).unwrap(), vec![3.0, 10.0]);
        assert!(s.transform(&[1.0]).is_none());
    }

    #[test]
    fn transformer_nearest_center_and_special() {
        let scaler = StandardScaler::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap();
        let t = ObservationTransformer::new(scaler, vec![vec![0.0, 0.0], vec![5.0, 5.0]]);
        assert_eq!(t.observe(&[4.0, 4.5]), 1);
        assert_eq!(t.observe(&[0.3, -0.2]), 0);
        assert_eq!(t.observe(&[f64::NAN, 1.0]), 2);
        assert_eq!(t.observe(&[1.0]), 2);
        assert!(t.is_special(2));
        assert_eq!(t.symbols(), 3);
    }

    #[test]
    fn observes_every_prefix() {
        let width = crate::features::FEATURE_COUNT - DEFAULT_SKIPPED_FEATURES.len();
        let scaler = StandardScaler::new(vec![0.0; width], vec![1.0; width]).unwrap();
        let t = ObservationTransformer::new(scaler, vec![vec![0.0; width]]);
        let packets: Vec<LogicalPacket> = [1500u32, 300, 700, 200]
            .iter()
            .enumerate()
            .map(|(i, s)| LogicalPacket::new(i as u64, 0, *s, 1.0 + i as f64 * 0.3))
            .collect();
        let obs = t.observe_packets(&packets);
        assert_eq!(obs.len(), 4);
        // a single packet has zero variance
        assert!(t.is_special(obs[0]));
        assert_eq!(obs[3], 0);
    }
}
