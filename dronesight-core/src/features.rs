//! Feature vector over a packet sequence: pivot size ratios plus size and timing statistics.

use std::collections::BTreeMap;

use crate::packet::LogicalPacket;

/// Length of a full feature vector: 3 pivot + 12 size + 12 inter-arrival.
pub const FEATURE_COUNT: usize = 27;

/// Moment and order statistics of one sample, in vector order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StandardFeatures {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub median_abs_dev: f64,
    pub skewness: f64,
    pub kurtosis: f64,
    pub pearson_skewness: f64,
    pub mean_square: f64,
    pub rms: f64,
    pub variance: f64,
    pub std_dev: f64,
}

fn median(mut xs: Vec<f64>) -> f64 {
    xs.sort_by(f64::total_cmp);
    let n = xs.len();
    if n % 2 == 0 {
        (xs[n / 2 - 1] + xs[n / 2]) / 2.0
    } else {
        xs[n / 2]
    }
}

impl StandardFeatures {
    /// `None` for an empty sample. Zero-variance samples yield non-finite moments.
    pub fn new(xs: &[f64]) -> Option<Self> {
        if xs.is_empty() {
            return None;
        }
        let n = xs.len() as f64;
        let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = xs.iter().sum::<f64>() / n;
        let median = median(xs.to_vec());
        let median_abs_dev = self::median(xs.iter().map(|x| (x - median).abs()).collect());
        let moment = |k: i32| xs.iter().map(|x| (x - mean).powi(k)).sum::<f64>() / n;
        let variance = moment(2);
        let std_dev = variance.sqrt();
        let mean_square = xs.iter().map(|x| x * x).sum::<f64>() / n;
        Some(Self {
            min,
            max,
            mean,
            median,
            median_abs_dev,
            skewness: moment(3) / std_dev.powi(3),
            kurtosis: moment(4) / variance.powi(2),
            pearson_skewness: 3.0 * (mean - median) / std_dev,
            mean_square,
            rms: mean_square.sqrt(),
            variance,
            std_dev,
        })
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.min,
            self.max,
            self.mean,
            self.median,
            self.median_abs_dev,
            self.skewness,
            self.kurtosis,
            self.pearson_skewness,
            self.mean_square,
            self.rms,
            self.variance,
            self.std_dev,
        ]
    }
}

/// Pivot size (the most common non-maximal packet size) and its ratios.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PivotFeatures {
    pub pivot: f64,
    /// Pivot over the largest packet size.
    pub pivot_to_mtu: f64,
    /// Pivot over the total byte count.
    pub pivot_to_total: f64,
}

impl PivotFeatures {
    pub fn new(packets: &[LogicalPacket]) -> Option<Self> {
        let mut amounts: BTreeMap<u64, usize> = BTreeMap::new();
        let mut total = 0u64;
        let mut mtu = 0u64;
        for p in packets {
            *amounts.entry(p.size()).or_insert(0) += 1;
            total += p.size();
            mtu = mtu.max(p.size());
        }
        if packets.is_empty() {
            return None;
        }
        let mut pivot = packets
            .iter()
            .map(LogicalPacket::size)
            .find(|s| *s != mtu)
            .unwrap_or(mtu);
        for (&size, &count) in &amounts {
            if size != mtu && count > amounts.get(&pivot).copied().unwrap_or(0) {
                pivot = size;
            }
        }
        let pivot = pivot as f64;
        Some(Self {
            pivot,
            pivot_to_mtu: pivot / mtu as f64,
            pivot_to_total: pivot / total as f64,
        })
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.pivot, self.pivot_to_mtu, self.pivot_to_total]
    }
}

/// Full feature vector of a packet sequence; `None` when empty.
pub fn extract(packets: &[LogicalPacket]) -> Option<Vec<f64>> {
    extract_with_skips(packets, &[])
}

/// Feature vector with the listed positions removed.
pub fn extract_with_skips(packets: &[LogicalPacket], skips: &[usize]) -> Option<Vec<f64>> {
    let first = packets.first()?;
    let mut out = PivotFeatures::new(packets)?.to_vec();
    let sizes: Vec<f64> = packets.iter().map(|p| p.size() as f64).collect();
    out.extend(StandardFeatures::new(&sizes)?.to_vec());
    let mut deltas: Vec<f64> = packets
        .windows(2)
        .map(|w| w[1].offset() - w[0].offset())
        .collect();
    deltas.insert(0, first.arrival());
    out.extend(StandardFeatures::new(&deltas)?.to_vec());
    if skips.is_empty() {
        return Some(out);
    }
    Some(
        out.into_iter()
            .enumerate()
            .filter(|(i, _)| !skips.contains(i))
            .map(|(_, v)| v)
            .collect(),
    )
}

/// Every value is finite.
pub fn is_finite_row(row: &[f64]) -> bool {
    row.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(sizes: &[u32]) -> Vec<LogicalPacket> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, s)| LogicalPacket::new(i as u64, 0, *s, i as f64 * 0.5 + 1.0))
            .collect()
    }

    #[test]
    fn standard_statistics() {
        let f = StandardFeatures::new(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(f.min, 1.0);
        assert_eq!(f.max, 4.0);
        assert_eq!(f.mean, 2.5);
        assert_eq!(f.median, 2.5);
        assert_eq!(f.median_abs_dev, 1.0);
        assert!((f.variance - 1.25).abs() < 1e-12);
        assert!(f.skewness.abs() < 1e-12);
        assert!((f.mean_square - 7.5).abs() < 1e-12);
        assert!(StandardFeatures::new(&[]).is_none());
    }

    #[test]
    fn pivot_prefers_most_common_non_max() {
        let f = PivotFeatures::new(&packets(&[1500, 300, 200, 200, 1500])).unwrap();
        assert_eq!(f.pivot, 200.0);
        assert!((f.pivot_to_mtu - 200.0 / 1500.0).abs() < 1e-12);
        assert!((f.pivot_to_total - 200.0 / 3700.0).abs() < 1e-12);
    }

    #[test]
    fn vector_has_27_dims() {
        let row = extract(&packets(&[1500, 230, 410, 90, 660])).unwrap();
        assert_eq!(row.len(), FEATURE_COUNT);
        assert!(is_finite_row(&row));
        // first inter-arrival is the first packet's arrival (its offset here)
        assert_eq!(row[15], 0.5);
        assert_eq!(row[16], 1.0);
    }

    #[test]
    fn skips_drop_positions() {
        let ps = packets(&[1500, 230, 410, 90, 660]);
        let full = extract(&ps).unwrap();
        let skipped = extract_with_skips(&ps, &[2, 15]).unwrap();
        assert_eq!(skipped.len(), FEATURE_COUNT - 2);
        assert_eq!(skipped[2], full[3]);
    }

    #[test]
    fn degenerate_samples_are_not_finite() {
        assert!(extract(&[]).is_none());
        let single = extract(&packets(&[500])).unwrap();
        assert!(!is_finite_row(&single));
        let flat = extract(&packets(&[500, 500, 500])).unwrap();
        assert!(!is_finite_row(&flat));
    }
}
