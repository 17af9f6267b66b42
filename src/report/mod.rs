pub mod visualization;

use serde::Serialize;

use crate::{ClusterAssignment, CopyMoveResult, PipelineStats, Point};

#[derive(Serialize)]
pub struct JsonReport {
    pub forged: bool,
    pub keypoint_count: usize,
    pub match_count: usize,
    pub clusters_found: usize,
    pub clusters_kept: usize,
    pub regions: Vec<RegionReportSection>,
}

/// Bounding box of one surviving cluster over both halves of the pairs.
#[derive(Serialize)]
pub struct RegionReportSection {
    pub cluster: u32,
    pub point_count: usize,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RegionReportSection {
    fn from_points(cluster: u32, points: &[Point]) -> Self {
        let min_x = points.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
        let min_y = points.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
        let max_x = points.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max);
        let max_y = points.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max);

        Self {
            cluster,
            point_count: points.len(),
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        }
    }
}

fn region_sections(assignment: &ClusterAssignment) -> Vec<RegionReportSection> {
    assignment
        .cluster_ids()
        .into_iter()
        .map(|id| {
            let members = assignment
                .clusters
                .iter()
                .zip(assignment.points.iter())
                .filter(|&(cluster, _)| *cluster == id)
                .map(|(_, point)| *point)
                .collect::<Vec<_>>();
            RegionReportSection::from_points(id, &members)
        })
        .collect()
}

impl From<&CopyMoveResult> for JsonReport {
    fn from(result: &CopyMoveResult) -> Self {
        let PipelineStats {
            keypoints,
            matches,
            clusters_found,
            clusters_kept,
        } = result.stats;

        Self {
            forged: result.verdict,
            keypoint_count: keypoints,
            match_count: matches,
            clusters_found,
            clusters_kept,
            regions: result
                .clusters
                .as_ref()
                .map(region_sections)
                .unwrap_or_default(),
        }
    }
}

impl JsonReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
