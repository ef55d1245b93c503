//! End-to-end conversions: crop, cast, cross-format round trips and
//! tractography re-expression.

use medio::streamlines::{TractogramHeader, TrkHeader};
use medio::{
    convert, convert_batch, Affine, ConversionSpec, CropRange, DataType, Error, Format,
    ImageContainer, Reference, Streamline, Tractogram,
};
use ndarray::{ArrayD, IxDyn};
use std::path::{Path, PathBuf};

fn volume(shape: &[usize]) -> ArrayD<f64> {
    ArrayD::from_shape_fn(IxDyn(shape), |ix| (ix[0] + 10 * ix[1] + 100 * ix[2]) as f64)
}

fn save_volume(path: &Path, affine: Affine) -> ArrayD<f64> {
    let array = volume(&[10, 10, 10]);
    let image = ImageContainer::from_array(&array, affine, DataType::Int16).unwrap();
    medio::save(&image, path, None).unwrap();
    array
}

fn assert_points_close(a: &[Streamline], b: &[Streamline], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.points.len(), y.points.len());
        for (p, q) in x.points.iter().zip(&y.points) {
            for k in 0..3 {
                assert!((p[k] - q[k]).abs() < tol, "{p:?} vs {q:?}");
            }
        }
    }
}

#[test]
fn crop_along_x_shifts_origin() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("vol.nii");
    let sink = dir.path().join("crop.nii.gz");
    let affine = Affine::from_zooms([1.5, 2.0, 2.5], [-10.0, 20.0, 5.0]);
    let array = save_volume(&source, affine);

    let spec = ConversionSpec::new().crop(vec!["2:8".parse().unwrap()]);
    convert(&source, &sink, &spec).unwrap();

    let cropped = medio::load(&sink).unwrap();
    assert_eq!(cropped.shape(), &[6, 10, 10]);
    let expected = affine.translation()[0] + 2.0 * affine.column(0)[0];
    assert!((cropped.affine().translation()[0] - expected).abs() < 1e-6);
    assert_eq!(cropped.affine().translation()[1], 20.0);
    let data = cropped.get_fdata().unwrap();
    assert_eq!(data[[0, 0, 0]], array[[2, 0, 0]]);
    assert_eq!(data[[5, 9, 9]], array[[7, 9, 9]]);
}

#[test]
fn crop_outside_bounds_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("vol.nii");
    save_volume(&source, Affine::identity());
    let spec = ConversionSpec::new().crop(vec![CropRange::new(4, 12)]);
    let result = convert(&source, dir.path().join("out.nii"), &spec);
    assert!(matches!(result, Err(Error::InvalidCropRegion(_))));
    assert!(!dir.path().join("out.nii").exists());
}

#[test]
fn per_slice_parrec_scaling_survives_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let mut par = String::from(
        "# === DATA DESCRIPTION FILE ===\n\
         # CLINICAL TRYOUT             Research image export tool     V4.2\n\
         # === GENERAL INFORMATION ===\n\
         .    Repetition time [ms]               :   2000.000\n\
         .    Angulation midslice(ap,fh,rl)[degr]:   0.000  0.000  0.000\n\
         .    Off Centre midslice(ap,fh,rl) [mm] :   0.000  0.000  0.000\n\
         # === IMAGE INFORMATION ===\n",
    );
    for (slice, slope) in [(1, 1.0), (2, 2.0)] {
        let mut v = vec!["0".to_string(); 49];
        v[0] = slice.to_string();
        v[1] = "1".into();
        v[2] = "1".into();
        v[3] = "1".into();
        v[6] = (slice - 1).to_string();
        v[7] = "16".into();
        v[9] = "4".into();
        v[10] = "3".into();
        v[12] = slope.to_string();
        v[22] = "3.0".into();
        v[25] = "1".into();
        v[28] = "2.0".into();
        v[29] = "2.0".into();
        par.push_str(&v.join(" "));
        par.push('\n');
    }
    par.push_str("# === END OF DATA DESCRIPTION FILE ===\n");
    std::fs::write(dir.path().join("scan.PAR"), par).unwrap();
    let rec: Vec<u8> = (0..24i16).flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(dir.path().join("scan.REC"), rec).unwrap();

    let source = medio::load(dir.path().join("scan.PAR")).unwrap();
    let expected = source.get_fdata().unwrap();
    // second slice doubles its stored values
    assert_eq!(expected[[1, 0, 1]], 13.0 * 2.0);

    let sink = dir.path().join("scan.nii");
    convert(dir.path().join("scan.PAR"), &sink, &ConversionSpec::new()).unwrap();
    let converted = medio::load(&sink).unwrap();
    assert_eq!(converted.dtype(), DataType::Float64);
    assert_eq!(converted.get_fdata().unwrap(), expected);
    assert!(converted.affine().approx_eq(source.affine(), 1e-6));
}

#[test]
fn nifti_through_analyze_and_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("vol.nii");
    let affine = Affine::from_zooms([-2.0, 2.0, 2.0], [8.0, -6.0, -4.0]);
    let array = save_volume(&source, affine);

    let analyze = dir.path().join("vol.img");
    convert(&source, &analyze, &ConversionSpec::new().format(Format::Analyze)).unwrap();
    assert_eq!(medio::detect(dir.path().join("vol.hdr")).unwrap(), Format::Analyze);

    let back = dir.path().join("back.nii");
    convert(dir.path().join("vol.hdr"), &back, &ConversionSpec::new()).unwrap();
    let image = medio::load(&back).unwrap();
    assert!(image.affine().approx_eq(&affine, 1e-6));
    assert_eq!(image.get_fdata().unwrap(), array);
}

#[test]
fn nifti_through_gifti_and_nifti2() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("vol.nii");
    let affine = Affine::from_zooms([1.0, 1.2, 0.8], [-4.5, 3.0, 1.25]);
    let array = save_volume(&source, affine);

    let hops = ["hop.gii", "hop.nii", "hop2.nii"];
    let mut current: PathBuf = source;
    for (i, name) in hops.iter().enumerate() {
        let next = dir.path().join(name);
        let spec = if i == 2 {
            ConversionSpec::new().format(Format::Nifti2)
        } else {
            ConversionSpec::new()
        };
        convert(&current, &next, &spec).unwrap();
        current = next;
    }
    let image = medio::load(&current).unwrap();
    assert_eq!(image.format(), Format::Nifti2);
    assert!(image.affine().approx_eq(&affine, 1e-6));
    assert_eq!(image.get_fdata().unwrap(), array);
}

#[test]
fn cast_to_uint8_scales_into_range() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("vol.nii");
    let array = save_volume(&source, Affine::identity());
    let sink = dir.path().join("small.nii");
    convert(&source, &sink, &ConversionSpec::new().output_dtype(DataType::UInt8)).unwrap();

    let image = medio::load(&sink).unwrap();
    assert_eq!(image.dtype(), DataType::UInt8);
    let data = image.get_fdata().unwrap();
    // 999 does not fit u8, so a slope is written
    for (a, b) in data.iter().zip(array.iter()) {
        assert!((a - b).abs() <= 999.0 / 255.0);
    }
}

#[test]
fn batch_reports_each_job() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.nii");
    save_volume(&good, Affine::identity());
    let jobs = vec![
        (good.clone(), dir.path().join("good.nii.gz")),
        (dir.path().join("missing.nii"), dir.path().join("never.nii")),
        (good, dir.path().join("good2.nii")),
    ];
    let results = convert_batch(&jobs, &ConversionSpec::new());
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(Error::Io(_))));
    assert!(results[2].is_ok());
    assert!(dir.path().join("good2.nii").exists());
}

fn sample_streamlines() -> Vec<Streamline> {
    vec![
        Streamline::new(vec![[-20.0, 10.0, 4.0], [-18.5, 11.0, 4.5], [-17.0, 12.5, 5.0]]),
        Streamline::new(vec![[30.0, -40.0, 12.0], [31.0, -41.0, 12.0]]),
        Streamline::new(vec![[0.0, 0.0, 0.0], [2.0, 2.0, 2.0]]),
    ]
}

#[test]
fn trk_to_tck_and_back_keeps_rasmm_points() {
    let dir = tempfile::tempdir().unwrap();
    let reference = Reference::new(
        Affine::from_zooms([-1.25, 1.25, 1.25], [60.0, -80.0, -50.0]),
        [96, 128, 80],
    );
    let trk = dir.path().join("fibres.trk");
    medio::save_tractogram_with(
        &Tractogram::new(sample_streamlines()),
        &trk,
        None,
        Some(&reference),
        &medio::SaveOptions::default(),
    )
    .unwrap();

    let tck = dir.path().join("fibres.tck");
    convert(&trk, &tck, &ConversionSpec::new()).unwrap();
    let from_tck = medio::load_tractogram(&tck).unwrap();
    assert_eq!(from_tck.header.count(), Some(3));
    assert_points_close(&from_tck.streamlines, &sample_streamlines(), 1e-3);

    let again = dir.path().join("again.trk");
    convert(&tck, &again, &ConversionSpec::new().reference(reference)).unwrap();
    let back = medio::load_tractogram(&again).unwrap();
    let TractogramHeader::Trk(h) = &back.header else {
        panic!("expected a TrackVis header");
    };
    assert_eq!(h.dims, [96, 128, 80]);
    assert_eq!(h.n_count, 3);
    assert_points_close(&back.streamlines, &sample_streamlines(), 1e-3);
}

#[test]
fn trk_scalars_block_tck_target() {
    let dir = tempfile::tempdir().unwrap();
    let trk = dir.path().join("scalars.trk");
    let header = TrkHeader {
        n_scalars: 1,
        scalar_names: vec!["fa".into()],
        ..TrkHeader::default()
    };
    let streamline = Streamline {
        points: vec![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]],
        scalars: vec![vec![0.4], vec![0.5]],
        properties: Vec::new(),
    };
    let tractogram = Tractogram {
        header: TractogramHeader::Trk(header),
        streamlines: vec![streamline],
    };
    medio::save_tractogram(&tractogram, &trk, None).unwrap();
    let loaded = medio::load_tractogram(&trk).unwrap();
    assert_eq!(loaded.streamlines[0].scalars, vec![vec![0.4], vec![0.5]]);

    let result = convert(&trk, dir.path().join("out.tck"), &ConversionSpec::new());
    assert!(matches!(result, Err(Error::IncompatibleConversion(_))));
}

#[test]
fn images_and_tractograms_do_not_mix() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("vol.nii");
    save_volume(&source, Affine::identity());
    let result = convert(&source, dir.path().join("vol.tck"), &ConversionSpec::new());
    assert!(matches!(result, Err(Error::IncompatibleConversion(_))));

    let tck = dir.path().join("t.tck");
    medio::save_tractogram(&Tractogram::new(sample_streamlines()), &tck, None).unwrap();
    let result = convert(&tck, dir.path().join("t.nii"), &ConversionSpec::new());
    assert!(matches!(result, Err(Error::IncompatibleConversion(_))));
}
