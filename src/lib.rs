use std::{cmp::Ordering, path::Path};

use image::{DynamicImage, RgbImage};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{
        clustering::ClusterConfig, copy_move::CopyMoveDetector, matching::MatcherConfig,
        sift::SiftConfig,
    },
    error::Result,
    report::visualization::Visualizer,
};

pub mod analysis;
pub mod error;
pub mod evaluation;
pub mod image_utils;
pub mod report;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub sift: SiftConfig,
    pub matcher: MatcherConfig,
    pub clustering: ClusterConfig,
}

impl AnalysisConfig {
    pub fn with_sift(mut self, sift: SiftConfig) -> Self {
        self.sift = sift;
        self
    }

    pub fn with_matcher(mut self, matcher: MatcherConfig) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_clustering(mut self, clustering: ClusterConfig) -> Self {
        self.clustering = clustering;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.sift.validate()?;
        self.matcher.validate()?;
        self.clustering.validate()
    }
}

pub struct ForensicsAnalyzer {
    original: DynamicImage,
    config: AnalysisConfig,
    path: Option<String>,
}

impl ForensicsAnalyzer {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let original = image::open(&path)?;

        Ok(Self {
            original,
            config: AnalysisConfig::default(),
            path: Some(path_str),
        })
    }

    pub fn from_image(image: DynamicImage) -> Self {
        Self {
            original: image,
            config: AnalysisConfig::default(),
            path: None,
        }
    }

    pub fn with_config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn image(&self) -> &DynamicImage {
        &self.original
    }

    pub fn detect_copy_move(&self) -> Result<bool> {
        Ok(self.localize_copy_move()?.verdict)
    }

    pub fn localize_copy_move(&self) -> Result<CopyMoveResult> {
        let detector = CopyMoveDetector::new(self.config.clone())?;
        detector.localize(&self.original)
    }

    /// Renders the localization over the analysed image. Returns `None` when
    /// nothing survived clustering.
    pub fn visualize(&self, result: &CopyMoveResult) -> Option<RgbImage> {
        let clusters = result.clusters.as_ref()?;
        Some(Visualizer::new().render_copy_move(&self.original.to_rgb8(), clusters))
    }
}

/// Runs the full pipeline with default parameters and returns the verdict.
pub fn detect_copy_move(image: &DynamicImage) -> Result<bool> {
    Ok(localize_copy_move(image)?.verdict)
}

pub fn localize_copy_move(image: &DynamicImage) -> Result<CopyMoveResult> {
    CopyMoveDetector::new(AnalysisConfig::default())?.localize(image)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = self.x as f64 - other.x as f64;
        let dy = self.y as f64 - other.y as f64;
        (dx * dx + dy * dy).sqrt()
    }

    fn total_cmp(&self, other: &Point) -> Ordering {
        self.x.total_cmp(&other.x).then(self.y.total_cmp(&other.y))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub point: Point,
    pub size: f32,
    /// Degrees in `[0, 360)`.
    pub angle: f32,
    pub response: f32,
    pub octave: usize,
}

/// Keypoints and their descriptors; row `i` of `descriptors` belongs to
/// `keypoints[i]`.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Array2<f32>,
}

impl FeatureSet {
    pub fn empty(dimension: usize) -> Self {
        Self {
            keypoints: Vec::new(),
            descriptors: Array2::zeros((0, dimension)),
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPair {
    pub p1: Point,
    pub p2: Point,
}

impl MatchPair {
    pub fn new(p1: Point, p2: Point) -> Self {
        Self { p1, p2 }
    }

    pub fn separation(&self) -> f64 {
        self.p1.distance(&self.p2)
    }

    fn total_cmp(&self, other: &MatchPair) -> Ordering {
        self.p1.total_cmp(&other.p1).then(self.p2.total_cmp(&other.p2))
    }
}

/// Deduplicated match pairs kept in lexicographic `(p1, p2)` order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSet {
    pairs: Vec<MatchPair>,
}

impl MatchSet {
    pub fn from_pairs<I: IntoIterator<Item = MatchPair>>(pairs: I) -> Self {
        let mut pairs = pairs.into_iter().collect::<Vec<_>>();
        pairs.sort_by(|a, b| a.total_cmp(b));
        pairs.dedup_by(|a, b| a.total_cmp(b) == Ordering::Equal);
        Self { pairs }
    }

    pub fn pairs(&self) -> &[MatchPair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// All `p1` followed by all `p2`, in pair order.
    pub fn combined_points(&self) -> Vec<Point> {
        self.pairs
            .iter()
            .map(|pair| pair.p1)
            .chain(self.pairs.iter().map(|pair| pair.p2))
            .collect()
    }
}

/// Surviving points of the combined sequence and their flat cluster ids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterAssignment {
    pub clusters: Vec<u32>,
    pub points: Vec<Point>,
}

impl ClusterAssignment {
    fn midpoint(&self) -> usize {
        self.points.len() / 2
    }

    pub fn p1(&self) -> &[Point] {
        &self.points[..self.midpoint()]
    }

    pub fn p2(&self) -> &[Point] {
        &self.points[self.midpoint()..]
    }

    /// Cluster ids of the `p1` half.
    pub fn p1_clusters(&self) -> &[u32] {
        &self.clusters[..self.midpoint()]
    }

    pub fn pairs(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        self.p1().iter().copied().zip(self.p2().iter().copied())
    }

    pub fn cluster_ids(&self) -> Vec<u32> {
        let mut ids = self.clusters.clone();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_ids().len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub keypoints: usize,
    pub matches: usize,
    pub clusters_found: usize,
    pub clusters_kept: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CopyMoveResult {
    pub verdict: bool,
    pub clusters: Option<ClusterAssignment>,
    pub stats: PipelineStats,
}
