//! Anomaly Detection Algorithms
//!
//! Standardisation, isolation forest and k-means used by the per-user
//! behaviour model. All randomness comes from a caller-supplied seeded
//! generator so a fit is reproducible.

use nalgebra::DVector;
use rand::seq::index;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Linear-interpolated percentile (`q` in 0..=100), NaN for empty input
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = q.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;

    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Per-feature standardisation to zero mean and unit variance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Fit on rows of equal width. Constant features get a scale of 1.
    pub fn fit(data: &[Vec<f64>]) -> Self {
        let width = data.first().map(|r| r.len()).unwrap_or(0);
        let n = data.len().max(1) as f64;

        let mut mean = vec![0.0; width];
        for row in data {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let mut scale = vec![0.0; width];
        for row in data {
            for ((s, v), m) in scale.iter_mut().zip(row).zip(&mean) {
                *s += (v - m) * (v - m);
            }
        }
        for s in &mut scale {
            *s = (*s / n).sqrt();
            if *s == 0.0 {
                *s = 1.0;
            }
        }

        Self { mean, scale }
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }
}

/// Isolation tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IsolationNode {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
}

/// Isolation Forest for multivariate anomaly detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationNode>,
    num_trees: usize,
    max_samples: usize,
    /// Rows drawn per tree in the last fit
    sample_size: usize,
}

impl IsolationForest {
    pub fn new(num_trees: usize, max_samples: usize) -> Self {
        Self {
            trees: Vec::with_capacity(num_trees),
            num_trees,
            max_samples,
            sample_size: 0,
        }
    }

    /// Fit forest to data; each tree sees a subsample drawn without replacement
    pub fn fit(&mut self, data: &[Vec<f64>], rng: &mut ChaCha8Rng) {
        self.trees.clear();
        self.sample_size = self.max_samples.min(data.len());
        if self.sample_size == 0 {
            return;
        }

        let height_limit = (self.sample_size as f64).log2().ceil().max(0.0) as usize;

        for _ in 0..self.num_trees {
            let sample: Vec<&[f64]> = index::sample(rng, data.len(), self.sample_size)
                .into_iter()
                .map(|i| data[i].as_slice())
                .collect();

            self.trees.push(build_tree(&sample, 0, height_limit, rng));
        }
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Mean path length of a point across all trees
    pub fn mean_path_length(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        self.trees.iter().map(|tree| path_length(point, tree, 0)).sum::<f64>() / self.trees.len() as f64
    }

    /// Negated anomaly score in [-1, 0); lower is more anomalous.
    ///
    /// Returns -0.5 for an unfitted forest.
    pub fn score_samples(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return -0.5;
        }

        let c = expected_path_length(self.sample_size);
        if c <= 0.0 {
            return -0.5;
        }

        -(2.0_f64.powf(-self.mean_path_length(point) / c))
    }
}

fn build_tree(data: &[&[f64]], depth: usize, height_limit: usize, rng: &mut ChaCha8Rng) -> IsolationNode {
    if depth >= height_limit || data.len() <= 1 {
        return IsolationNode::Leaf { size: data.len() };
    }

    let width = data[0].len();

    // Only features that still vary can split this node
    let ranges: Vec<(usize, f64, f64)> = (0..width)
        .filter_map(|feature| {
            let (min, max) = data
                .iter()
                .map(|row| row[feature])
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
            (max > min).then_some((feature, min, max))
        })
        .collect();

    if ranges.is_empty() {
        return IsolationNode::Leaf { size: data.len() };
    }

    let (feature, min, max) = ranges[rng.gen_range(0..ranges.len())];
    let value = rng.gen_range(min..max);

    let (left, right): (Vec<&[f64]>, Vec<&[f64]>) = data.iter().partition(|row| row[feature] < value);

    IsolationNode::Split {
        feature,
        value,
        left: Box::new(build_tree(&left, depth + 1, height_limit, rng)),
        right: Box::new(build_tree(&right, depth + 1, height_limit, rng)),
    }
}

fn path_length(point: &[f64], node: &IsolationNode, depth: usize) -> f64 {
    match node {
        IsolationNode::Leaf { size } => depth as f64 + expected_path_length(*size),
        IsolationNode::Split { feature, value, left, right } => {
            let v = point.get(*feature).copied().unwrap_or(0.0);
            if v < *value {
                path_length(point, left, depth + 1)
            } else {
                path_length(point, right, depth + 1)
            }
        }
    }
}

/// Average unsuccessful-search path length in a BST of `n` nodes
pub fn expected_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => 2.0 * (harmonic_number(n - 1) - (n as f64 - 1.0) / n as f64),
    }
}

fn harmonic_number(n: usize) -> f64 {
    (1..=n).map(|i| 1.0 / i as f64).sum()
}

/// K-means clustering with k-means++ seeding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeans {
    pub centers: Vec<DVector<f64>>,
}

impl KMeans {
    /// Fit `k` clusters with Lloyd iterations until assignments settle
    pub fn fit(data: &[DVector<f64>], k: usize, max_iter: usize, rng: &mut ChaCha8Rng) -> Self {
        if data.is_empty() || k == 0 {
            return Self { centers: Vec::new() };
        }

        let mut centers = seed_plus_plus(data, k, rng);
        let mut assignments = vec![usize::MAX; data.len()];

        for iteration in 0..max_iter {
            let mut changed = false;
            for (slot, point) in assignments.iter_mut().zip(data) {
                let (nearest, _) = nearest_center(&centers, point);
                if *slot != nearest {
                    *slot = nearest;
                    changed = true;
                }
            }

            if !changed {
                tracing::trace!("k-means converged after {} iterations", iteration);
                break;
            }

            for (c, center) in centers.iter_mut().enumerate() {
                let members: Vec<&DVector<f64>> = data
                    .iter()
                    .zip(&assignments)
                    .filter(|&(_, &a)| a == c)
                    .map(|(p, _)| p)
                    .collect();

                // Empty clusters keep their previous centre
                if !members.is_empty() {
                    let mut sum = DVector::zeros(center.len());
                    for p in &members {
                        sum += *p;
                    }
                    *center = sum / members.len() as f64;
                }
            }
        }

        Self { centers }
    }

    /// Nearest cluster and the distance to its centre
    pub fn predict(&self, point: &DVector<f64>) -> (usize, f64) {
        nearest_center(&self.centers, point)
    }

    /// Members per cluster for the given data
    pub fn cluster_sizes(&self, data: &[DVector<f64>]) -> Vec<usize> {
        let mut sizes = vec![0; self.centers.len()];
        for point in data {
            let (c, _) = self.predict(point);
            if let Some(size) = sizes.get_mut(c) {
                *size += 1;
            }
        }
        sizes
    }
}

fn nearest_center(centers: &[DVector<f64>], point: &DVector<f64>) -> (usize, f64) {
    centers
        .iter()
        .enumerate()
        .map(|(i, c)| (i, (point - c).norm()))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

fn seed_plus_plus(data: &[DVector<f64>], k: usize, rng: &mut ChaCha8Rng) -> Vec<DVector<f64>> {
    let mut centers = vec![data[rng.gen_range(0..data.len())].clone()];

    while centers.len() < k {
        let weights: Vec<f64> = data
            .iter()
            .map(|p| {
                let (_, d) = nearest_center(&centers, p);
                d * d
            })
            .collect();
        let total: f64 = weights.iter().sum();

        // All points coincide with a centre; any pick is as good as another
        if total <= 0.0 {
            centers.push(data[rng.gen_range(0..data.len())].clone());
            continue;
        }

        let mut target = rng.gen_range(0.0..total);
        let mut chosen = data.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                chosen = i;
                break;
            }
            target -= w;
        }
        centers.push(data[chosen].clone());
    }

    centers
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(42)
    }

    fn blob(rng: &mut ChaCha8Rng, n: usize, center: (f64, f64)) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| vec![center.0 + rng.gen_range(-1.0..1.0), center.1 + rng.gen_range(-1.0..1.0)])
            .collect()
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0, 5.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 50.0), 3.0);
        assert_eq!(percentile(&values, 100.0), 5.0);
        assert!((percentile(&values, 10.0) - 1.4).abs() < 1e-12);
        assert!(percentile(&[], 10.0).is_nan());
    }

    #[test]
    fn test_scaler() {
        let data = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let scaler = StandardScaler::fit(&data);
        assert_eq!(scaler.mean, vec![2.0, 5.0]);
        assert_eq!(scaler.scale, vec![1.0, 1.0]);
        assert_eq!(scaler.transform(&[3.0, 5.0]), vec![1.0, 0.0]);

        let data = vec![vec![0.0], vec![4.0]];
        let scaler = StandardScaler::fit(&data);
        assert_eq!(scaler.scale, vec![2.0]);
    }

    #[test]
    fn test_expected_path_length() {
        assert_eq!(expected_path_length(1), 0.0);
        assert_eq!(expected_path_length(2), 1.0);
        // 2 * (H(255) - 255/256)
        let c256 = expected_path_length(256);
        assert!((c256 - 10.244).abs() < 0.01, "c(256) = {}", c256);
    }

    #[test]
    fn test_forest_isolates_outlier() {
        let mut r = rng();
        let data = blob(&mut r, 200, (0.0, 0.0));

        let mut forest = IsolationForest::new(100, 256);
        forest.fit(&data, &mut r);
        assert_eq!(forest.num_trees(), 100);

        let inlier = forest.score_samples(&[0.0, 0.0]);
        let outlier = forest.score_samples(&[8.0, -8.0]);
        assert!(outlier < inlier, "outlier {} vs inlier {}", outlier, inlier);
        assert!((-1.0..0.0).contains(&outlier));
    }

    #[test]
    fn test_forest_is_reproducible() {
        let data = blob(&mut rng(), 50, (1.0, 1.0));

        let mut a = IsolationForest::new(20, 256);
        a.fit(&data, &mut rng());
        let mut b = IsolationForest::new(20, 256);
        b.fit(&data, &mut rng());

        assert_eq!(a, b);
        assert_eq!(a.score_samples(&[3.0, 3.0]), b.score_samples(&[3.0, 3.0]));
    }

    #[test]
    fn test_forest_survives_serde() {
        let data = blob(&mut rng(), 40, (0.0, 0.0));
        let mut forest = IsolationForest::new(10, 256);
        forest.fit(&data, &mut rng());

        let json = serde_json::to_string(&forest).unwrap();
        let back: IsolationForest = serde_json::from_str(&json).unwrap();
        let delta = back.score_samples(&[0.5, 0.5]) - forest.score_samples(&[0.5, 0.5]);
        assert!(delta.abs() < 1e-12);
    }

    #[test]
    fn test_constant_data_gives_leaves() {
        let data = vec![vec![1.0, 1.0]; 16];
        let mut forest = IsolationForest::new(5, 256);
        forest.fit(&data, &mut rng());
        let s = forest.score_samples(&[1.0, 1.0]);
        assert!(s.is_finite());
    }

    #[test]
    fn test_kmeans_finds_blobs() {
        let mut r = rng();
        let mut rows = blob(&mut r, 30, (0.0, 0.0));
        rows.extend(blob(&mut r, 30, (20.0, 20.0)));
        rows.extend(blob(&mut r, 30, (-20.0, 20.0)));
        let data: Vec<DVector<f64>> = rows.into_iter().map(DVector::from_vec).collect();

        let km = KMeans::fit(&data, 3, 300, &mut r);
        let mut sizes = km.cluster_sizes(&data);
        sizes.sort();
        assert_eq!(sizes, vec![30, 30, 30]);

        let (cluster, dist) = km.predict(&DVector::from_vec(vec![20.0, 20.0]));
        let (same, _) = km.predict(&data[40]);
        assert_eq!(cluster, same);
        assert!(dist < 1.5);
    }

    #[test]
    fn test_kmeans_with_fewer_distinct_points_than_k() {
        let data = vec![DVector::from_vec(vec![1.0, 1.0]); 5];
        let km = KMeans::fit(&data, 3, 300, &mut rng());
        assert_eq!(km.centers.len(), 3);
        assert_eq!(km.cluster_sizes(&data).iter().sum::<usize>(), 5);
    }
}
