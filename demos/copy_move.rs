//! Copy-move detection on a single image.
//!
//! Run with: cargo run --example copy_move -- <image_path> [output_dir]

use std::{env, fs, path::Path};

use copymove_forensics::{
    ForensicsAnalyzer,
    analysis::clustering::ClusterMethod,
    error::Result,
    report::{
        JsonReport,
        visualization::{Visualizer, visualization_file_name},
    },
};

fn main() -> Result<()> {
    let args = env::args().collect::<Vec<_>>();
    if args.len() < 2 {
        println!("Usage: {} <image_path> [output_dir]", args[0]);
        return Ok(());
    }

    let image_path = Path::new(&args[1]);
    let output_dir = Path::new(args.get(2).map(String::as_str).unwrap_or("./output"));
    fs::create_dir_all(output_dir)?;

    let analyzer = ForensicsAnalyzer::new(image_path)?;
    let result = analyzer.localize_copy_move()?;

    println!("Keypoints: {}", result.stats.keypoints);
    println!("Match pairs: {}", result.stats.matches);
    println!(
        "Clusters: {} found, {} kept",
        result.stats.clusters_found, result.stats.clusters_kept
    );
    println!(
        "Verdict: {}",
        if result.verdict {
            "copy-move forgery detected"
        } else {
            "no copy-move forgery detected"
        }
    );

    let report = JsonReport::from(&result);
    for region in &report.regions {
        println!(
            "  cluster {}: {} points in ({:.0}, {:.0}) {:.0}x{:.0}",
            region.cluster, region.point_count, region.x, region.y, region.width, region.height
        );
    }
    fs::write(output_dir.join("copy_move_report.json"), report.to_json()?)?;

    if let Some(vis) = analyzer.visualize(&result) {
        let stem = image_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        let name = visualization_file_name(&stem, ".png", &ClusterMethod::hierarchical(), "result");
        let out = output_dir.join(name);
        Visualizer::new().save(&vis, &out)?;
        println!("Visualization saved to {}", out.display());
    }

    Ok(())
}
