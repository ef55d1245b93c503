//! Criterion benchmarks for image loading, cropping and conversion.
//!
//! Run with: cargo bench --bench image_io

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use medio::{convert, Affine, ConversionSpec, CropRange, DataType, ImageContainer};
use ndarray::{ArrayD, IxDyn};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SHAPES: [[usize; 3]; 3] = [[64, 64, 64], [128, 128, 64], [197, 233, 189]];

fn create_test_image(shape: &[usize]) -> ImageContainer {
    let array = ArrayD::from_shape_fn(IxDyn(shape), |ix| ((ix[0] + ix[1] + ix[2]) % 256) as f64);
    let affine = Affine::from_zooms([1.0, 1.0, 1.0], [0.0; 3]);
    ImageContainer::from_array(&array, affine, DataType::Float32).unwrap()
}

fn label(shape: &[usize; 3]) -> String {
    let mb = shape.iter().product::<usize>() * 4 / (1024 * 1024);
    format!("{}x{}x{} ({mb} MB)", shape[0], shape[1], shape[2])
}

fn bytes(shape: &[usize; 3]) -> Throughput {
    Throughput::Bytes((shape.iter().product::<usize>() * 4) as u64)
}

/// Write each test volume once under `name`.
fn fixtures(dir: &Path, name: &str) -> Vec<([usize; 3], PathBuf)> {
    SHAPES
        .iter()
        .map(|shape| {
            let path = dir.join(format!("{}x{}x{}_{name}", shape[0], shape[1], shape[2]));
            medio::save(&create_test_image(shape), &path, None).unwrap();
            (*shape, path)
        })
        .collect()
}

fn bench_load(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut group = c.benchmark_group("load");
    for name in ["vol.nii", "vol.nii.gz"] {
        for (shape, path) in fixtures(dir.path(), name) {
            group.throughput(bytes(&shape));
            group.bench_with_input(BenchmarkId::new(name, label(&shape)), &path, |b, path| {
                b.iter(|| black_box(medio::load(black_box(path)).unwrap()))
            });
            group.bench_with_input(
                BenchmarkId::new(format!("{name}+fdata"), label(&shape)),
                &path,
                |b, path| {
                    b.iter(|| {
                        let img = medio::load(black_box(path)).unwrap();
                        black_box(img.get_fdata().unwrap())
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_crop(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut group = c.benchmark_group("crop");
    for (shape, path) in fixtures(dir.path(), "vol.nii") {
        let ranges: Vec<_> = shape.iter().map(|&n| n / 4..n - n / 4).collect();
        group.bench_with_input(BenchmarkId::new("half", label(&shape)), &path, |b, path| {
            b.iter(|| {
                let img = medio::load(black_box(path)).unwrap();
                let cropped = img.crop(&ranges).unwrap();
                black_box(cropped.get_fdata().unwrap())
            })
        });
    }
    group.finish();
}

fn bench_save(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut group = c.benchmark_group("save");
    group.sample_size(10);
    for shape in SHAPES {
        let img = create_test_image(&shape);
        group.throughput(bytes(&shape));
        for name in ["out.nii", "out.nii.gz", "out.nii.zst"] {
            let path = dir.path().join(name);
            group.bench_with_input(BenchmarkId::new(name, label(&shape)), &img, |b, img| {
                b.iter(|| medio::save(black_box(img), &path, None).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_convert(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut group = c.benchmark_group("convert");
    group.sample_size(10);
    let sink = dir.path().join("converted.nii.gz");
    for (shape, path) in fixtures(dir.path(), "vol.nii") {
        let full = ConversionSpec::new().output_dtype(DataType::Int16);
        group.bench_with_input(BenchmarkId::new("int16_gz", label(&shape)), &path, |b, path| {
            b.iter(|| convert(black_box(path), &sink, &full).unwrap())
        });
        let cropped = ConversionSpec::new().crop(vec![CropRange::new(8, shape[0] - 8)]);
        group.bench_with_input(BenchmarkId::new("crop_gz", label(&shape)), &path, |b, path| {
            b.iter(|| convert(black_box(path), &sink, &cropped).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_load, bench_crop, bench_save, bench_convert);
criterion_main!(benches);
