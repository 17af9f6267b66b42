use log::debug;
use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    FeatureSet, MatchPair, MatchSet,
    error::{ForensicsError, Result},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Neighbours per query, the query itself included.
    pub k: usize,
    pub ratio: f32,
    /// Pixel distance a pair must exceed to count as a match.
    pub min_separation: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            k: 10,
            ratio: 0.5,
            min_separation: 10.0,
        }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k < 2 {
            return Err(ForensicsError::InvalidParameter(
                "k must include at least one neighbour besides the query".into(),
            ));
        }
        if !(self.ratio > 0.0 && self.ratio <= 1.0) {
            return Err(ForensicsError::InvalidParameter(
                "ratio must be in (0, 1]".into(),
            ));
        }
        if self.min_separation < 0.0 {
            return Err(ForensicsError::InvalidParameter(
                "min_separation must not be negative".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Neighbour {
    index: usize,
    distance: f32,
}

/// Matches an image's features against themselves.
pub struct SelfMatcher {
    config: MatcherConfig,
}

impl SelfMatcher {
    pub fn new(config: MatcherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn find_matches(&self, features: &FeatureSet) -> MatchSet {
        let n = features.len();
        if n < 2 {
            debug!("{} keypoint(s), nothing to match", n);
            return MatchSet::default();
        }

        let k = self.config.k.min(n);
        let exhaustive = k == n;

        let pairs = (0..n)
            .into_par_iter()
            .map(|query| {
                let neighbours = self.nearest_neighbours(features, query, k);
                let accepted = self.adaptive_ratio_rank(&neighbours, exhaustive);
                neighbours[1..accepted]
                    .iter()
                    .filter_map(|neighbour| {
                        let pair = MatchPair::new(
                            features.keypoints[query].point,
                            features.keypoints[neighbour.index].point,
                        );
                        (pair.separation() > self.config.min_separation).then_some(pair)
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let matches = MatchSet::from_pairs(pairs.into_iter().flatten());
        debug!("{} distinct match pairs among {} keypoints", matches.len(), n);
        matches
    }

    /// The query at rank 0 followed by its `k - 1` closest descriptors,
    /// ties broken by index.
    fn nearest_neighbours(&self, features: &FeatureSet, query: usize, k: usize) -> Vec<Neighbour> {
        let target = features.descriptors.row(query);

        let mut others = features
            .descriptors
            .rows()
            .into_iter()
            .enumerate()
            .filter(|(index, _)| *index != query)
            .map(|(index, row)| Neighbour {
                index,
                distance: l2_distance(target, row),
            })
            .collect::<Vec<_>>();

        others.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.index.cmp(&b.index))
        });
        others.truncate(k - 1);

        let mut neighbours = Vec::with_capacity(k);
        neighbours.push(Neighbour {
            index: query,
            distance: 0.0,
        });
        neighbours.extend(others);
        neighbours
    }

    /// First rank at which `d[r] < ratio * d[r + 1]` stops holding; ranks
    /// `1..r` are accepted. When the list holds every other keypoint, a rank
    /// past its end counts as infinitely far. Otherwise the scan stops at the
    /// last listed neighbour since its successor is unknown.
    fn adaptive_ratio_rank(&self, neighbours: &[Neighbour], exhaustive: bool) -> usize {
        let mut rank = 1;
        while rank < neighbours.len() {
            let next = match neighbours.get(rank + 1) {
                Some(n) => n.distance,
                None if exhaustive => f32::INFINITY,
                None => break,
            };
            if neighbours[rank].distance < self.config.ratio * next {
                rank += 1;
            } else {
                break;
            }
        }
        rank
    }
}

fn l2_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
