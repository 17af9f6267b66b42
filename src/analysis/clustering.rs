use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    ClusterAssignment, MatchSet, Point,
    analysis::hierarchy::{CondensedMatrix, flat_clusters_inconsistent, ward_linkage},
    error::{ForensicsError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ClusterMethod {
    /// Ward linkage cut by the inconsistency criterion.
    Hierarchical { depth: usize, threshold: f64 },
    /// Density clustering; noise points are discarded.
    Dbscan { eps: f64, min_samples: usize },
}

impl ClusterMethod {
    pub fn hierarchical() -> Self {
        ClusterMethod::Hierarchical {
            depth: 4,
            threshold: 2.2,
        }
    }

    pub fn dbscan() -> Self {
        ClusterMethod::Dbscan {
            eps: 60.0,
            min_samples: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub method: ClusterMethod,
    /// Clusters with fewer members are treated as noise.
    pub min_cluster_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            method: ClusterMethod::hierarchical(),
            min_cluster_size: 4,
        }
    }
}

impl ClusterConfig {
    pub fn with_method(mut self, method: ClusterMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_min_cluster_size(mut self, min_cluster_size: usize) -> Self {
        self.min_cluster_size = min_cluster_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.method {
            ClusterMethod::Hierarchical { depth, threshold } => {
                if depth == 0 {
                    return Err(ForensicsError::InvalidParameter(
                        "inconsistency depth must be at least 1".into(),
                    ));
                }
                if !threshold.is_finite() || threshold < 0.0 {
                    return Err(ForensicsError::InvalidParameter(
                        "inconsistency threshold must be a non-negative number".into(),
                    ));
                }
            }
            ClusterMethod::Dbscan { eps, min_samples } => {
                if !(0.0..=500.0).contains(&eps) {
                    return Err(ForensicsError::InvalidParameter(
                        "eps must be between 0 and 500".into(),
                    ));
                }
                if min_samples > 50 {
                    return Err(ForensicsError::InvalidParameter(
                        "min_samples must be between 0 and 50".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterOutcome {
    Empty,
    Clustered(ClusterAssignment),
}

impl ClusterOutcome {
    pub fn is_clustered(&self) -> bool {
        matches!(self, ClusterOutcome::Clustered(_))
    }

    pub fn into_assignment(self) -> Option<ClusterAssignment> {
        match self {
            ClusterOutcome::Empty => None,
            ClusterOutcome::Clustered(assignment) => Some(assignment),
        }
    }
}

/// Groups both ends of every match pair into duplicated regions.
pub struct RegionClusterer {
    config: ClusterConfig,
}

impl RegionClusterer {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn cluster(&self, matches: &MatchSet) -> ClusterOutcome {
        self.cluster_with_count(matches).0
    }

    /// Also reports how many flat clusters existed before filtering.
    pub fn cluster_with_count(&self, matches: &MatchSet) -> (ClusterOutcome, usize) {
        if matches.is_empty() {
            return (ClusterOutcome::Empty, 0);
        }

        let points = matches.combined_points();
        let labels = self.flat_clusters(&points);
        let found = distinct_clusters(&labels);

        let (clusters, points) =
            filter_small_clusters(&labels, &points, self.config.min_cluster_size);
        debug!(
            "{} of {} clusters kept over {} points",
            distinct_clusters(&clusters),
            found,
            points.len()
        );

        if clusters.is_empty() {
            return (ClusterOutcome::Empty, found);
        }

        (
            ClusterOutcome::Clustered(ClusterAssignment { clusters, points }),
            found,
        )
    }

    /// Label per point; 0 marks noise.
    fn flat_clusters(&self, points: &[Point]) -> Vec<u32> {
        match self.config.method {
            ClusterMethod::Hierarchical { depth, threshold } => {
                let distances = CondensedMatrix::euclidean(points);
                let merges = ward_linkage(&distances);
                flat_clusters_inconsistent(&merges, depth, threshold)
            }
            ClusterMethod::Dbscan { eps, min_samples } => dbscan(points, eps, min_samples),
        }
    }
}

fn distinct_clusters(labels: &[u32]) -> usize {
    let mut ids = labels.iter().filter(|&&l| l != 0).collect::<Vec<_>>();
    ids.sort_unstable();
    ids.dedup();
    ids.len()
}

/// Keeps the points of clusters with at least `min_size` members, preserving
/// their order. Noise (label 0) is always dropped.
pub fn filter_small_clusters(
    labels: &[u32],
    points: &[Point],
    min_size: usize,
) -> (Vec<u32>, Vec<Point>) {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &label in labels {
        *counts.entry(label).or_default() += 1;
    }

    labels
        .iter()
        .zip(points.iter())
        .filter(|&(label, _)| *label != 0 && counts[label] >= min_size)
        .map(|(&label, &point)| (label, point))
        .unzip()
}

/// DBSCAN where `min_samples` counts the point itself. Cluster ids start at
/// 1 in order of discovery; unreachable points are labelled 0.
fn dbscan(points: &[Point], eps: f64, min_samples: usize) -> Vec<u32> {
    let n = points.len();
    let region = |index: usize| -> Vec<usize> {
        (0..n)
            .filter(|&other| other != index && points[index].distance(&points[other]) <= eps)
            .collect()
    };

    let mut labels = vec![0u32; n];
    let mut visited = vec![false; n];
    let mut cluster_id = 0u32;

    for index in 0..n {
        if visited[index] {
            continue;
        }
        visited[index] = true;

        let neighbours = region(index);
        if neighbours.len() + 1 < min_samples {
            continue;
        }

        cluster_id += 1;
        labels[index] = cluster_id;
        let mut to_process = neighbours;

        while let Some(neighbour) = to_process.pop() {
            if labels[neighbour] == 0 {
                labels[neighbour] = cluster_id;
            }
            if visited[neighbour] {
                continue;
            }
            visited[neighbour] = true;

            let expansion = region(neighbour);
            if expansion.len() + 1 >= min_samples {
                to_process.extend(expansion.into_iter().filter(|&nn| !visited[nn]));
            }
        }
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MatchPair;

    fn pair(a: (f32, f32), b: (f32, f32)) -> MatchPair {
        MatchPair::new(Point::new(a.0, a.1), Point::new(b.0, b.1))
    }

    fn clusterer() -> RegionClusterer {
        RegionClusterer::new(ClusterConfig::default()).unwrap()
    }

    /// `count` pairs from a tight group around (20, 20) to one around (200, 150).
    fn region_pairs(count: usize) -> Vec<MatchPair> {
        (0..count)
            .map(|i| {
                let dx = (i % 3) as f32 * 2.0;
                let dy = (i / 3) as f32 * 2.0;
                pair((20.0 + dx, 20.0 + dy), (200.0 + dx, 150.0 + dy))
            })
            .collect()
    }

    #[test]
    fn test_empty_matches_short_circuit() {
        assert_eq!(clusterer().cluster(&MatchSet::default()), ClusterOutcome::Empty);
    }

    #[test]
    fn test_single_pair_is_noise() {
        let matches = MatchSet::from_pairs(vec![pair((0.0, 0.0), (50.0, 50.0))]);
        assert_eq!(clusterer().cluster(&matches), ClusterOutcome::Empty);
    }

    #[test]
    fn test_coherent_regions_survive() {
        let matches = MatchSet::from_pairs(region_pairs(6));
        let outcome = clusterer().cluster(&matches);
        let assignment = outcome.into_assignment().expect("regions should survive");
        assert_eq!(assignment.points.len(), 12);
        assert!(assignment.p1().iter().all(|p| p.x < 30.0 && p.y < 30.0));
        assert!(assignment.p2().iter().all(|p| p.x >= 200.0 && p.y >= 150.0));
    }

    #[test]
    fn test_duplicate_pairs_do_not_change_result() {
        let once = MatchSet::from_pairs(region_pairs(5));
        let mut doubled = region_pairs(5);
        doubled.extend(region_pairs(5).into_iter().rev());
        let twice = MatchSet::from_pairs(doubled);
        assert_eq!(clusterer().cluster(&once), clusterer().cluster(&twice));
    }

    #[test]
    fn test_cluster_of_three_is_dropped_and_four_kept() {
        let labels = [1, 1, 1, 2, 2, 2, 2];
        let points = (0..7).map(|i| Point::new(i as f32, 0.0)).collect::<Vec<_>>();
        let (clusters, kept) = filter_small_clusters(&labels, &points, 4);
        assert_eq!(clusters, vec![2, 2, 2, 2]);
        assert_eq!(kept, points[3..].to_vec());

        let (clusters, _) = filter_small_clusters(&labels[..3], &points[..3], 4);
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_clusterer_size_boundary() {
        // p1 near (0, 0), p2 all within a few pixels of (200, 0).
        let three = vec![
            pair((0.0, 0.0), (200.0, 0.0)),
            pair((5.0, 0.0), (205.0, 0.0)),
            pair((200.0, 5.0), (400.0, 0.0)),
        ];
        let mut four = three.clone();
        four.push(pair((210.0, 0.0), (600.0, 0.0)));

        let density = RegionClusterer::new(
            ClusterConfig::default().with_method(ClusterMethod::dbscan()),
        )
        .unwrap();
        assert_eq!(
            density.cluster(&MatchSet::from_pairs(three)),
            ClusterOutcome::Empty
        );

        let assignment = density
            .cluster(&MatchSet::from_pairs(four))
            .into_assignment()
            .expect("cluster of four should survive");
        assert_eq!(assignment.points.len(), 4);
        assert_eq!(assignment.cluster_count(), 1);
        assert!(assignment.points.iter().all(|p| p.x >= 200.0 && p.x <= 210.0));
    }

    #[test]
    fn test_hierarchical_size_boundary() {
        // Two tight pairs form one four-point flat cluster.
        let matches = MatchSet::from_pairs(region_pairs(2));
        let outcome = clusterer().cluster(&matches);
        assert_eq!(outcome.clone().into_assignment().map(|a| a.points.len()), Some(4));

        let stricter =
            RegionClusterer::new(ClusterConfig::default().with_min_cluster_size(5)).unwrap();
        let (outcome, found) = stricter.cluster_with_count(&matches);
        assert_eq!(outcome, ClusterOutcome::Empty);
        assert_eq!(found, 1);
    }

    #[test]
    fn test_filter_drops_noise_label() {
        let labels = [0, 0, 0, 0, 0];
        let points = vec![Point::new(0.0, 0.0); 5];
        assert!(filter_small_clusters(&labels, &points, 1).0.is_empty());
    }

    #[test]
    fn test_dbscan_separates_dense_groups() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(5.0, 0.0),
            Point::new(300.0, 300.0),
            Point::new(305.0, 300.0),
            Point::new(800.0, 0.0),
        ];
        let labels = dbscan(&points, 60.0, 2);
        assert_eq!(labels, vec![1, 1, 2, 2, 0]);
    }

    #[test]
    fn test_dbscan_method_clusters_regions() {
        let config = ClusterConfig::default().with_method(ClusterMethod::dbscan());
        let outcome = RegionClusterer::new(config)
            .unwrap()
            .cluster(&MatchSet::from_pairs(region_pairs(4)));
        assert!(outcome.is_clustered());
    }

    #[test]
    fn test_invalid_dbscan_parameters() {
        let config = ClusterConfig::default().with_method(ClusterMethod::Dbscan {
            eps: 600.0,
            min_samples: 2,
        });
        assert!(RegionClusterer::new(config).is_err());
    }
}
