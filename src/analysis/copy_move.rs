use image::DynamicImage;
use log::{debug, info};

use crate::{
    AnalysisConfig, CopyMoveResult, PipelineStats,
    analysis::{
        clustering::{ClusterOutcome, RegionClusterer},
        matching::SelfMatcher,
        sift::SiftExtractor,
    },
    error::Result,
};

/// Extract, self-match and cluster. Every call is independent.
pub struct CopyMoveDetector {
    extractor: SiftExtractor,
    matcher: SelfMatcher,
    clusterer: RegionClusterer,
}

impl CopyMoveDetector {
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        Ok(Self {
            extractor: SiftExtractor::new(config.sift)?,
            matcher: SelfMatcher::new(config.matcher)?,
            clusterer: RegionClusterer::new(config.clustering)?,
        })
    }

    pub fn detect(&self, image: &DynamicImage) -> Result<bool> {
        Ok(self.localize(image)?.verdict)
    }

    pub fn localize(&self, image: &DynamicImage) -> Result<CopyMoveResult> {
        let features = self.extractor.extract(image)?;
        let mut stats = PipelineStats {
            keypoints: features.len(),
            ..PipelineStats::default()
        };

        if features.len() < 2 {
            info!(
                "insufficient features for copy-move analysis ({} keypoints)",
                features.len()
            );
            return Ok(CopyMoveResult {
                verdict: false,
                clusters: None,
                stats,
            });
        }

        let matches = self.matcher.find_matches(&features);
        stats.matches = matches.len();
        if matches.is_empty() {
            info!("no duplicated features among {} keypoints", features.len());
            return Ok(CopyMoveResult {
                verdict: false,
                clusters: None,
                stats,
            });
        }

        let (outcome, found) = self.clusterer.cluster_with_count(&matches);
        stats.clusters_found = found;

        let clusters = match outcome {
            ClusterOutcome::Empty => {
                info!(
                    "{} match pairs but no cluster survived filtering",
                    matches.len()
                );
                None
            }
            ClusterOutcome::Clustered(assignment) => {
                stats.clusters_kept = assignment.cluster_count();
                debug!(
                    "{} duplicated region cluster(s) over {} points",
                    stats.clusters_kept,
                    assignment.points.len()
                );
                Some(assignment)
            }
        };

        Ok(CopyMoveResult {
            verdict: clusters.is_some(),
            clusters,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma};

    use super::*;
    use crate::{
        analysis::{clustering::ClusterConfig, matching::MatcherConfig},
        error::ForensicsError,
    };

    #[test]
    fn test_flat_image_is_not_forged() {
        let detector = CopyMoveDetector::new(AnalysisConfig::default()).unwrap();
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(48, 48, Luma([90])));
        let result = detector.localize(&image).unwrap();
        assert!(!result.verdict);
        assert!(result.clusters.is_none());
        assert_eq!(result.stats.keypoints, 0);
    }

    #[test]
    fn test_empty_image_is_an_error() {
        let detector = CopyMoveDetector::new(AnalysisConfig::default()).unwrap();
        let image = DynamicImage::new_rgb8(0, 0);
        assert!(matches!(
            detector.detect(&image),
            Err(ForensicsError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = AnalysisConfig::default()
            .with_matcher(MatcherConfig {
                ratio: 0.0,
                ..MatcherConfig::default()
            })
            .with_clustering(ClusterConfig::default());
        assert!(CopyMoveDetector::new(config).is_err());
    }
}
