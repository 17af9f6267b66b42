use std::hint::black_box;

use copymove_forensics::{
    AnalysisConfig,
    analysis::{
        copy_move::CopyMoveDetector,
        sift::{SiftConfig, SiftExtractor},
    },
};
use criterion::{Criterion, criterion_group, criterion_main};
use image::{DynamicImage, GrayImage, Luma};

fn synthetic_image(width: u32, height: u32) -> DynamicImage {
    let mut state = 42u64;
    let mut image = GrayImage::from_fn(width, height, |_, _| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        Luma([(state >> 56) as u8])
    });
    for y in 0..48 {
        for x in 0..48 {
            let pixel = *image.get_pixel(8 + x, 8 + y);
            image.put_pixel(width - 56 + x, height - 56 + y, pixel);
        }
    }
    DynamicImage::ImageLuma8(image)
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_move");
    group.sample_size(10);

    let image = synthetic_image(160, 128);
    let extractor = SiftExtractor::new(SiftConfig::default()).unwrap();
    let detector = CopyMoveDetector::new(AnalysisConfig::default()).unwrap();

    group.bench_function("sift_160x128", |b| {
        b.iter(|| extractor.extract(black_box(&image)).unwrap())
    });
    group.bench_function("localize_160x128", |b| {
        b.iter(|| detector.localize(black_box(&image)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
