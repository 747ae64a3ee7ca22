//! Statistical estimator contract and a nearest-centroid implementation.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::persist::{load_model, save_model, ModelError, ModelKind};

/// Feature rows with optional class labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    rows: Vec<Vec<f64>>,
    targets: Option<Vec<usize>>,
}

impl Dataset {
    /// Unlabelled rows for prediction.
    pub fn new(rows: Vec<Vec<f64>>) -> Self {
        Self {
            rows,
            targets: None,
        }
    }

    pub fn labelled(rows: Vec<Vec<f64>>, targets: Vec<usize>) -> Result<Self, ModelError> {
        if rows.len() != targets.len() {
            return Err(ModelError::Shape(format!(
                "{} rows but {} targets",
                rows.len(),
                targets.len()
            )));
        }
        Ok(Self {
            rows,
            targets: Some(targets),
        })
    }

    /// CSV with a header line; `label_column` holds the class, every other column a feature.
    pub fn read_csv<R: BufRead>(reader: R, label_column: usize) -> Result<Self, ModelError> {
        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for (n, line) in reader.lines().enumerate().skip(1) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut row = Vec::new();
            let mut label = None;
            for (i, cell) in line.split(',').enumerate() {
                let value: f64 = cell
                    .trim()
                    .parse()
                    .map_err(|_| ModelError::Shape(format!("line {}: bad value {cell:?}", n + 1)))?;
                if i == label_column {
                    label = Some(value as usize);
                } else {
                    row.push(value);
                }
            }
            let label =
                label.ok_or_else(|| ModelError::Shape(format!("line {}: no label column", n + 1)))?;
            rows.push(row);
            targets.push(label);
        }
        Self::labelled(rows, targets)
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn targets(&self) -> Option<&[usize]> {
        self.targets.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Width of the first row.
    pub fn features(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }
}

/// Pluggable classifier over feature rows. Labels are [`crate::device::DeviceType`] labels.
pub trait Estimator: Send + Sync {
    fn fit(&mut self, data: &Dataset) -> Result<(), ModelError>;
    fn predict(&self, data: &Dataset) -> Vec<usize>;
    fn predict_probabilities(&self, data: &Dataset) -> Vec<BTreeMap<usize, f64>>;
    fn save(&self, path: &Path) -> Result<(), ModelError>;
    fn load(&mut self, path: &Path) -> Result<(), ModelError>;
    fn clone_box(&self) -> Box<dyn Estimator>;
    /// Fitted and usable.
    fn valid(&self) -> bool;
}

impl Clone for Box<dyn Estimator> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

pub(crate) fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// One centroid per class; predicts the class of the closest centroid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NearestCentroid {
    centroids: BTreeMap<usize, Vec<f64>>,
}

impl NearestCentroid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn centroids(&self) -> &BTreeMap<usize, Vec<f64>> {
        &self.centroids
    }

    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        load_model(path, ModelKind::NearestCentroid)
    }

    fn distances<'a>(&'a self, row: &'a [f64]) -> impl Iterator<Item = (usize, f64)> + 'a {
        self.centroids
            .iter()
            .map(move |(label, c)| (*label, euclidean(row, c)))
    }

    fn predict_row(&self, row: &[f64]) -> usize {
        self.distances(row)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map_or(0, |(label, _)| label)
    }
}

impl Estimator for NearestCentroid {
    fn fit(&mut self, data: &Dataset) -> Result<(), ModelError> {
        let targets = data
            .targets()
            .ok_or_else(|| ModelError::Shape("fit needs labelled rows".into()))?;
        if data.is_empty() {
            return Err(ModelError::Empty);
        }
        let width = data.features();
        let mut sums: BTreeMap<usize, (Vec<f64>, usize)> = BTreeMap::new();
        for (row, label) in data.rows().iter().zip(targets) {
            if row.len() != width {
                return Err(ModelError::Shape(format!(
                    "row width {} != {width}",
                    row.len()
                )));
            }
            let entry = sums.entry(*label).or_insert_with(|| (vec![0.0; width], 0));
            for (acc, v) in entry.0.iter_mut().zip(row) {
                *acc += v;
            }
            entry.1 += 1;
        }
        self.centroids = sums
            .into_iter()
            .map(|(label, (sum, n))| (label, sum.into_iter().map(|s| s / n as f64).collect()))
            .collect();
        tracing::info!(classes = self.centroids.len(), rows = data.len(), "fitted centroids");
        Ok(())
    }

    fn predict(&self, data: &Dataset) -> Vec<usize> {
        data.rows().iter().map(|r| self.predict_row(r)).collect()
    }

    /// Inverse-distance weights normalised to one.
    fn predict_probabilities(&self, data: &Dataset) -> Vec<BTreeMap<usize, f64>> {
        data.rows()
            .iter()
            .map(|row| {
                let weights: BTreeMap<usize, f64> = self
                    .distances(row)
                    .map(|(label, d)| (label, 1.0 / (d + f64::EPSILON)))
                    .collect();
                let total: f64 = weights.values().sum();
                weights
                    .into_iter()
                    .map(|(label, w)| (label, w / total))
                    .collect()
            })
            .collect()
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        save_model(path, ModelKind::NearestCentroid, self)
    }

    fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        *self = Self::from_file(path)?;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn valid(&self) -> bool {
        !self.centroids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn two_blobs() -> Dataset {
        Dataset::labelled(
            vec![
                vec![0.0, 0.0],
                vec![0.2, 0.1],
                vec![10.0, 10.0],
                vec![9.8, 10.3],
            ],
            vec![1, 1, 2, 2],
        )
        .unwrap()
    }

    #[test]
    fn fit_and_predict() {
        let mut m = NearestCentroid::new();
        assert!(!m.valid());
        m.fit(&two_blobs()).unwrap();
        assert!(m.valid());
        let q = Dataset::new(vec![vec![1.0, 1.0], vec![8.0, 9.0]]);
        assert_eq!(m.predict(&q), vec![1, 2]);
        let probs = m.predict_probabilities(&q);
        assert!(probs[0][&1] > probs[0][&2]);
        assert!((probs[1].values().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fit_rejects_unlabelled_and_ragged() {
        let mut m = NearestCentroid::new();
        assert!(matches!(
            m.fit(&Dataset::new(vec![vec![1.0]])),
            Err(ModelError::Shape(_))
        ));
        let ragged = Dataset::labelled(vec![vec![1.0], vec![1.0, 2.0]], vec![1, 2]).unwrap();
        assert!(m.fit(&ragged).is_err());
        assert!(Dataset::labelled(vec![vec![1.0]], vec![]).is_err());
    }

    #[test]
    fn save_load_clone() {
        let mut m = NearestCentroid::new();
        m.fit(&two_blobs()).unwrap();
        let path = std::env::temp_dir().join(format!("dronesight-centroid-{}.bin", std::process::id()));
        m.save(&path).unwrap();
        let mut loaded = NearestCentroid::new();
        loaded.load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, m);
        let boxed: Box<dyn Estimator> = Box::new(m);
        assert!(boxed.clone().valid());
    }

    #[test]
    fn csv_with_label_column() {
        let csv = "label,a,b\n1,0.5,1.5\n\n3,2.0,4.0\n";
        let d = Dataset::read_csv(Cursor::new(csv), 0).unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(d.targets(), Some(&[1usize, 3][..]));
        assert_eq!(d.rows()[1], vec![2.0, 4.0]);
        assert!(Dataset::read_csv(Cursor::new("h\nx\n"), 0).is_err());
    }
}
