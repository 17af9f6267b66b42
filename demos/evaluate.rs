//! Accuracy over a labelled dataset laid out as `<root>/original/*` and
//! `<root>/forged/*`.
//!
//! Run with: cargo run --release --example evaluate -- <dataset_root> [results_file]

use std::{env, path::Path};

use copymove_forensics::{
    AnalysisConfig,
    analysis::copy_move::CopyMoveDetector,
    error::Result,
    evaluation::{EvaluationContext, Label},
};

fn main() -> Result<()> {
    let args = env::args().collect::<Vec<_>>();
    if args.len() < 2 {
        println!("Usage: {} <dataset_root> [results_file]", args[0]);
        return Ok(());
    }

    let root = Path::new(&args[1]);
    let results_file = args
        .get(2)
        .map(String::as_str)
        .unwrap_or("test_results.txt");

    let detector = CopyMoveDetector::new(AnalysisConfig::default())?;
    let mut context = EvaluationContext::new();
    context.evaluate_directory(&detector, root.join("original"), Label::Original)?;
    context.evaluate_directory(&detector, root.join("forged"), Label::Forged)?;

    let summary = context.summary();
    print!("{}", summary.to_text());
    for error in &context.errors {
        eprintln!("failed: {} ({})", error.path, error.message);
    }

    summary.write_text(results_file)?;
    println!("{}", summary.to_json()?);
    Ok(())
}
