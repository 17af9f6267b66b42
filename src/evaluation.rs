//! Accuracy of the detector over labelled image sets.

use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    analysis::copy_move::CopyMoveDetector,
    error::{ForensicsError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    Original,
    Forged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationError {
    pub path: String,
    pub message: String,
}

/// Confusion counts for one evaluation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationContext {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
    pub original_images: usize,
    pub forged_images: usize,
    pub errors: Vec<EvaluationError>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, label: Label, verdict: bool) {
        match (label, verdict) {
            (Label::Forged, true) => self.true_positives += 1,
            (Label::Original, true) => self.false_positives += 1,
            (Label::Original, false) => self.true_negatives += 1,
            (Label::Forged, false) => self.false_negatives += 1,
        }
    }

    fn count_image(&mut self, label: Label) {
        match label {
            Label::Original => self.original_images += 1,
            Label::Forged => self.forged_images += 1,
        }
    }

    /// Runs the detector on one file. Unreadable images are recorded as
    /// errors and yield `None`.
    pub fn evaluate_image(
        &mut self,
        detector: &CopyMoveDetector,
        path: &Path,
        label: Label,
    ) -> Option<bool> {
        self.count_image(label);

        let verdict = image::open(path)
            .map_err(ForensicsError::from)
            .and_then(|image| detector.detect(&image));

        match verdict {
            Ok(verdict) => {
                self.record(label, verdict);
                Some(verdict)
            }
            Err(e) => {
                self.record_error(path, &e);
                None
            }
        }
    }

    fn record_error(&mut self, path: &Path, error: &dyn std::error::Error) {
        warn!("skipping {}: {}", path.display(), error);
        self.errors.push(EvaluationError {
            path: path.display().to_string(),
            message: error.to_string(),
        });
    }

    pub fn evaluate_paths<I, P>(&mut self, detector: &CopyMoveDetector, paths: I, label: Label)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for path in paths {
            self.evaluate_image(detector, path.as_ref(), label);
        }
    }

    /// Evaluates every regular file of `dir` in file-name order.
    pub fn evaluate_directory<P: AsRef<Path>>(
        &mut self,
        detector: &CopyMoveDetector,
        dir: P,
        label: Label,
    ) -> Result<()> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir.as_ref())? {
            match entry {
                Ok(entry) if entry.path().is_file() => paths.push(entry.path()),
                Ok(_) => {}
                Err(e) => self.record_error(dir.as_ref(), &e),
            }
        }
        paths.sort();

        info!(
            "evaluating {} {:?} image(s) from {}",
            paths.len(),
            label,
            dir.as_ref().display()
        );
        self.evaluate_paths(detector, paths, label);
        Ok(())
    }

    pub fn summary(&self) -> EvaluationSummary {
        let ratio = |num: usize, den: usize| (den > 0).then(|| num as f64 / den as f64);
        let evaluated =
            self.true_positives + self.true_negatives + self.false_positives + self.false_negatives;

        EvaluationSummary {
            total_images: self.original_images + self.forged_images,
            original_images: self.original_images,
            forged_images: self.forged_images,
            failed_images: self.errors.len(),
            accuracy: ratio(self.true_positives + self.true_negatives, evaluated),
            true_positive_rate: ratio(
                self.true_positives,
                self.true_positives + self.false_negatives,
            ),
            false_positive_rate: ratio(
                self.false_positives,
                self.false_positives + self.true_negatives,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub total_images: usize,
    pub original_images: usize,
    pub forged_images: usize,
    pub failed_images: usize,
    pub accuracy: Option<f64>,
    pub true_positive_rate: Option<f64>,
    pub false_positive_rate: Option<f64>,
}

impl EvaluationSummary {
    pub fn to_text(&self) -> String {
        let rate = |value: Option<f64>| value.map_or_else(|| "n/a".to_string(), |v| v.to_string());
        let mut text = String::new();
        let _ = writeln!(text, "Tested with {} images", self.total_images);
        let _ = writeln!(text, "Original images: {}", self.original_images);
        let _ = writeln!(text, "Forged images: {}", self.forged_images);
        if self.failed_images > 0 {
            let _ = writeln!(text, "Unreadable images: {}", self.failed_images);
        }
        let _ = writeln!(text, "Accuracy: {}", rate(self.accuracy));
        let _ = writeln!(text, "True Positive Rate: {}", rate(self.true_positive_rate));
        let _ = writeln!(text, "False Positive Rate: {}", rate(self.false_positive_rate));
        text
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_text<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_text())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma};

    use super::*;
    use crate::AnalysisConfig;

    #[test]
    fn test_confusion_counts() {
        let mut context = EvaluationContext::new();
        context.record(Label::Forged, true);
        context.record(Label::Forged, false);
        context.record(Label::Original, false);
        context.record(Label::Original, false);
        context.record(Label::Original, true);
        context.original_images = 3;
        context.forged_images = 2;

        let summary = context.summary();
        assert_eq!(summary.total_images, 5);
        assert_eq!(summary.accuracy, Some(0.6));
        assert_eq!(summary.true_positive_rate, Some(0.5));
        assert!((summary.false_positive_rate.unwrap() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_contexts_are_independent() {
        let mut first = EvaluationContext::new();
        first.record(Label::Forged, true);
        let second = EvaluationContext::new();
        assert_eq!(second.true_positives, 0);
        assert_eq!(second.summary().accuracy, None);
    }

    #[test]
    fn test_text_layout() {
        let mut context = EvaluationContext::new();
        context.record(Label::Original, false);
        context.original_images = 1;
        let text = context.summary().to_text();
        assert!(text.starts_with("Tested with 1 images\n"));
        assert!(text.contains("Accuracy: 1\n"));
        assert!(text.contains("True Positive Rate: n/a\n"));
    }

    #[test]
    fn test_directory_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(32, 32, Luma([120]))
            .save(dir.path().join("flat.png"))
            .unwrap();
        fs::write(dir.path().join("broken.png"), b"not an image").unwrap();

        let detector = CopyMoveDetector::new(AnalysisConfig::default()).unwrap();
        let mut context = EvaluationContext::new();
        context
            .evaluate_directory(&detector, dir.path(), Label::Original)
            .unwrap();

        assert_eq!(context.original_images, 2);
        assert_eq!(context.true_negatives, 1);
        assert_eq!(context.errors.len(), 1);
        assert!(context.errors[0].path.ends_with("broken.png"));

        let report = dir.path().join("results.txt");
        context.summary().write_text(&report).unwrap();
        assert!(fs::read_to_string(report).unwrap().contains("Original images: 2"));
    }

    #[test]
    fn test_listing_errors_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let detector = CopyMoveDetector::new(AnalysisConfig::default()).unwrap();
        let mut context = EvaluationContext::new();
        context
            .evaluate_directory(&detector, dir.path(), Label::Forged)
            .unwrap();
        assert_eq!(context.forged_images, 0);
        assert!(context.errors.is_empty());

        let unreadable = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        context.record_error(dir.path(), &unreadable);
        assert_eq!(context.errors.len(), 1);
        assert!(context.errors[0].message.contains("denied"));
        assert_eq!(context.summary().failed_images, 1);
        assert_eq!(context.summary().accuracy, None);
    }
}
