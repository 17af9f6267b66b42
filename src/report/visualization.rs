use std::{
    io::{Seek, Write},
    path::Path,
};

use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};

use crate::{
    ClusterAssignment, Point,
    analysis::clustering::ClusterMethod,
    error::{ForensicsError, Result},
};

#[derive(Debug, Clone)]
pub struct VisualizationConfig {
    pub point_radius: i32,
    pub line_color: Rgb<u8>,
    /// Length of each dash of the pair connectors, in pixels.
    pub dash_length: f32,
    pub saturation: f32,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            point_radius: 3,
            line_color: Rgb([0, 255, 255]),
            dash_length: 2.0,
            saturation: 1.0,
        }
    }
}

pub struct Visualizer {
    config: VisualizationConfig,
}

impl Visualizer {
    pub fn new() -> Self {
        Self {
            config: VisualizationConfig::default(),
        }
    }

    pub fn with_config(config: VisualizationConfig) -> Self {
        Self { config }
    }

    /// Dots on every surviving `p1`, coloured by cluster, and a dashed
    /// connector for each `(p1, p2)` pair.
    pub fn render_copy_move(&self, original: &RgbImage, assignment: &ClusterAssignment) -> RgbImage {
        let mut vis = original.clone();

        for (p1, p2) in assignment.pairs() {
            self.draw_dashed_line(&mut vis, p1, p2, self.config.line_color);
        }

        for (point, &cluster) in assignment.p1().iter().zip(assignment.p1_clusters()) {
            draw_filled_circle_mut(
                &mut vis,
                (point.x.round() as i32, point.y.round() as i32),
                self.config.point_radius,
                self.cluster_color(cluster),
            );
        }

        vis
    }

    pub fn cluster_color(&self, cluster: u32) -> Rgb<u8> {
        let hue = (cluster as f32 * 137.5) % 360.0;
        self.hsv_to_rgb(hue, self.config.saturation, 1.0)
    }

    fn draw_dashed_line(&self, image: &mut RgbImage, from: Point, to: Point, color: Rgb<u8>) {
        let length = from.distance(&to) as f32;
        let dash = self.config.dash_length.max(1.0);
        if length <= dash {
            draw_line_segment_mut(image, (from.x, from.y), (to.x, to.y), color);
            return;
        }

        let (dx, dy) = ((to.x - from.x) / length, (to.y - from.y) / length);
        let mut start = 0.0;
        while start < length {
            let end = (start + dash).min(length);
            draw_line_segment_mut(
                image,
                (from.x + dx * start, from.y + dy * start),
                (from.x + dx * end, from.y + dy * end),
                color,
            );
            start += dash * 2.0;
        }
    }

    fn hsv_to_rgb(&self, h: f32, s: f32, v: f32) -> Rgb<u8> {
        let c = v * s;
        let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
        let m = v - c;

        let (r, g, b) = match h {
            h if h < 60.0 => (c, x, 0.0),
            h if h < 120.0 => (x, c, 0.0),
            h if h < 180.0 => (0.0, c, x),
            h if h < 240.0 => (0.0, x, c),
            h if h < 300.0 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };

        Rgb([
            ((r + m) * 255.0) as u8,
            ((g + m) * 255.0) as u8,
            ((b + m) * 255.0) as u8,
        ])
    }

    pub fn save<P: AsRef<Path>>(&self, image: &RgbImage, path: P) -> Result<()> {
        image
            .save(path.as_ref())
            .map_err(|e| ForensicsError::Visualization(format!("{}: {}", path.as_ref().display(), e)))
    }

    pub fn write_png<W: Write + Seek>(&self, image: &RgbImage, sink: &mut W) -> Result<()> {
        image
            .write_to(sink, ImageFormat::Png)
            .map_err(|e| ForensicsError::Visualization(e.to_string()))
    }
}

impl Default for Visualizer {
    fn default() -> Self {
        Self::new()
    }
}

/// `<stem>_<param>_<param>_<timestamp><extension>`, the parameters being the
/// ones of the clustering method used.
pub fn visualization_file_name(
    stem: &str,
    extension: &str,
    method: &ClusterMethod,
    timestamp: &str,
) -> String {
    let params = match method {
        ClusterMethod::Hierarchical { depth, threshold } => format!("{}_{}", depth, threshold),
        ClusterMethod::Dbscan { eps, min_samples } => format!("{}_{}", eps, min_samples),
    };
    format!("{}_{}_{}{}", stem, params, timestamp, extension)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn assignment() -> ClusterAssignment {
        ClusterAssignment {
            clusters: vec![1, 1, 1, 1],
            points: vec![
                Point::new(5.0, 5.0),
                Point::new(8.0, 5.0),
                Point::new(30.0, 20.0),
                Point::new(33.0, 20.0),
            ],
        }
    }

    #[test]
    fn test_render_marks_p1_points() {
        let original = RgbImage::from_pixel(40, 30, Rgb([0, 0, 0]));
        let visualizer = Visualizer::new();
        let vis = visualizer.render_copy_move(&original, &assignment());
        assert_eq!(vis.dimensions(), (40, 30));
        assert_eq!(*vis.get_pixel(5, 5), visualizer.cluster_color(1));
        assert!(vis.pixels().any(|p| *p == Rgb([0, 255, 255])));
    }

    #[test]
    fn test_cluster_colors_differ() {
        let visualizer = Visualizer::new();
        assert_ne!(visualizer.cluster_color(1), visualizer.cluster_color(2));
    }

    #[test]
    fn test_write_png_to_sink() {
        let image = RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]));
        let mut sink = Cursor::new(Vec::new());
        Visualizer::new().write_png(&image, &mut sink).unwrap();
        assert!(sink.get_ref().starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn test_save_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::new(2, 2);
        let missing = dir.path().join("missing").join("out.png");
        assert!(matches!(
            Visualizer::new().save(&image, &missing),
            Err(ForensicsError::Visualization(_))
        ));
        let ok = dir.path().join("out.png");
        Visualizer::new().save(&image, &ok).unwrap();
        assert!(ok.exists());
    }

    #[test]
    fn test_file_name() {
        let name = visualization_file_name("photo", ".png", &ClusterMethod::dbscan(), "2024_01_02");
        assert_eq!(name, "photo_60_2_2024_01_02.png");
    }
}
