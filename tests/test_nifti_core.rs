//! Core NIfTI I/O: error conditions, metadata preservation and stored types.

use medio::{Affine, DataType, Error, ImageContainer, SaveOptions};
use ndarray::{ArrayD, IxDyn};
use std::path::Path;

fn create_test_image(values: &[f64], shape: &[usize]) -> ImageContainer {
    let array = ArrayD::from_shape_vec(IxDyn(shape), values.to_vec()).unwrap();
    ImageContainer::from_array(&array, Affine::identity(), DataType::Float32).unwrap()
}

fn saved(dir: &Path, name: &str, image: &ImageContainer) -> std::path::PathBuf {
    let path = dir.join(name);
    medio::save(image, &path, None).unwrap();
    path
}

#[test]
fn test_load_unsupported_data_type() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved(dir.path(), "bad_type.nii", &create_test_image(&[1.0, 2.0, 3.0, 4.0], &[2, 2, 1]));

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[70..72].copy_from_slice(&9999i16.to_ne_bytes());
    std::fs::write(&path, bytes).unwrap();

    let err = medio::load(&path).unwrap_err();
    assert!(matches!(err, Error::UnsupportedDatatype(_)), "{err}");
    assert!(err.to_string().contains("9999"));
}

#[test]
fn test_roundtrip_preserves_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<f64> = (1..=8).map(f64::from).collect();
    let mut image = create_test_image(&values, &[2, 2, 2]);
    image
        .set_affine(Affine::from_zooms([0.8, 0.8, 1.5], [-10.0, 4.0, 2.0]))
        .unwrap();
    let path = saved(dir.path(), "meta.nii", &image);
    let reloaded = medio::load(&path).unwrap();

    assert_eq!(reloaded.shape(), image.shape());
    assert_eq!(reloaded.dtype(), DataType::Float32);
    for (got, want) in reloaded.zooms().iter().zip([0.8, 0.8, 1.5]) {
        assert!((got - want).abs() < 1e-6);
    }
    assert_eq!(reloaded.get_fdata().unwrap(), image.get_fdata().unwrap());
}

#[test]
fn test_minimal_volume() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved(dir.path(), "one.nii", &create_test_image(&[1.0], &[1, 1, 1]));
    let loaded = medio::load(&path).unwrap();
    assert_eq!(loaded.shape(), &[1, 1, 1]);
    assert_eq!(loaded.get_fdata().unwrap().len(), 1);
}

#[test]
fn test_truncated_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let values = vec![1.0; 1000];
    let path = saved(dir.path(), "cut.nii", &create_test_image(&values, &[10, 10, 10]));

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let result = medio::load(&path).and_then(|img| img.get_fdata());
    assert!(matches!(result, Err(Error::CorruptStream(_))));
}

#[test]
fn test_different_data_types_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let image = create_test_image(&[1.0, 2.0, 3.0, 4.0], &[2, 2, 1]);

    for dtype in [DataType::Float32, DataType::UInt16, DataType::Int16, DataType::Int8, DataType::Float64] {
        let path = dir.path().join(format!("{dtype}.nii"));
        let options = SaveOptions::new().output_dtype(dtype);
        medio::save_with(&image, &path, None, &options).unwrap();

        let loaded = medio::load(&path).unwrap();
        assert_eq!(loaded.dtype(), dtype);
        assert_eq!(loaded.shape(), &[2, 2, 1]);
        assert_eq!(loaded.get_fdata().unwrap(), image.get_fdata().unwrap());
    }
}

#[test]
fn test_big_endian_file_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<f64> = (0..24).map(f64::from).collect();
    let image = create_test_image(&values, &[4, 3, 2]);
    let path = dir.path().join("be.nii.gz");
    let options = SaveOptions::new()
        .output_dtype(DataType::Int32)
        .endianness(medio::Endianness::Big);
    medio::save_with(&image, &path, None, &options).unwrap();

    let loaded = medio::load(&path).unwrap();
    let medio::Header::Nifti(header) = loaded.header() else {
        panic!("expected a NIfTI header");
    };
    assert_eq!(header.endianness, medio::Endianness::Big);
    assert_eq!(loaded.get_fdata().unwrap(), image.get_fdata().unwrap());
}
