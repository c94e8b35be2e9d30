//! Voxel resize node
//!
//! Multiplies voxel sizes and origin offsets in the NIfTI header by per-axis
//! factors, for data whose converter wrote physical sizes scaled down.
//! Voxel values keep their stored datatype unless the input carries an
//! intensity scaling, which is applied and written out as float32.

use crate::error::{PipelineError, Result};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, NiftiType, ReaderOptions};
use std::path::{Path, PathBuf};

/// Default per-axis factors
pub const DEFAULT_RESIZE_FACTORS: [f32; 3] = [10.0, 10.0, 10.0];

/// NIfTI `xform` code for scanner-based coordinates
const XFORM_SCANNER_ANAT: i16 = 1;

/// Scale the spatial part of a header
///
/// Voxel sizes, the sform diagonal and translation, and the qform offsets are
/// multiplied per axis; both transforms are marked scanner-based.
pub fn resize_header(header: &mut NiftiHeader, factors: [f32; 3]) {
    for (axis, factor) in factors.iter().enumerate() {
        header.pixdim[axis + 1] *= factor;
    }

    let rows = [&mut header.srow_x, &mut header.srow_y, &mut header.srow_z];
    for (axis, row) in rows.into_iter().enumerate() {
        row[axis] *= factors[axis];
        row[3] *= factors[axis];
    }

    header.quatern_x *= factors[0];
    header.quatern_y *= factors[1];
    header.quatern_z *= factors[2];

    header.sform_code = XFORM_SCANNER_ANAT;
    header.qform_code = XFORM_SCANNER_ANAT;
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
}

/// Read the volume as `$t` and write it under the resized header
macro_rules! write_as {
    ($t:ty, $volume:expr, $output:expr, $header:expr) => {{
        let data = $volume.into_ndarray::<$t>()?;
        WriterOptions::new($output)
            .reference_header($header)
            .write_nifti(&data)?;
    }};
}

/// Resize one file into `output_dir`, keeping its file name
pub fn resize_voxels(input: &Path, output_dir: &Path, factors: [f32; 3]) -> Result<PathBuf> {
    if factors.iter().any(|f| !f.is_finite() || *f <= 0.0) {
        return Err(PipelineError::Configuration(format!(
            "Resize factors must be positive, got {:?}",
            factors
        )));
    }
    let file_name = input.file_name().ok_or_else(|| {
        PipelineError::Configuration(format!("Not a file path: {}", input.display()))
    })?;

    let object = ReaderOptions::new().read_file(input)?;
    let mut header = object.header().clone();
    let unscaled = header.scl_inter == 0.0 && (header.scl_slope == 0.0 || header.scl_slope == 1.0);
    let data_type = if unscaled {
        header.data_type()?
    } else {
        NiftiType::Float32
    };
    let volume = object.into_volume();

    resize_header(&mut header, factors);

    std::fs::create_dir_all(output_dir)?;
    let output = output_dir.join(file_name);
    match data_type {
        NiftiType::Uint8 => write_as!(u8, volume, &output, &header),
        NiftiType::Int8 => write_as!(i8, volume, &output, &header),
        NiftiType::Uint16 => write_as!(u16, volume, &output, &header),
        NiftiType::Int16 => write_as!(i16, volume, &output, &header),
        NiftiType::Uint32 => write_as!(u32, volume, &output, &header),
        NiftiType::Int32 => write_as!(i32, volume, &output, &header),
        NiftiType::Float64 => write_as!(f64, volume, &output, &header),
        _ => write_as!(f32, volume, &output, &header),
    }

    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        factors = ?factors,
        data_type = ?data_type,
        "Voxels resized"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn header() -> NiftiHeader {
        NiftiHeader {
            pixdim: [1.0, 0.02, 0.02, 0.05, 1.0, 0.0, 0.0, 0.0],
            srow_x: [0.02, 0.0, 0.0, -1.0],
            srow_y: [0.0, 0.02, 0.0, -2.0],
            srow_z: [0.0, 0.0, 0.05, -0.5],
            quatern_x: -1.0,
            quatern_y: -2.0,
            quatern_z: -0.5,
            ..NiftiHeader::default()
        }
    }

    #[test]
    fn test_resize_header_scales_spacing_and_origin() {
        let mut header = header();
        resize_header(&mut header, DEFAULT_RESIZE_FACTORS);

        assert!((header.pixdim[1] - 0.2).abs() < 1e-6);
        assert!((header.pixdim[3] - 0.5).abs() < 1e-6);
        assert!((header.srow_x[0] - 0.2).abs() < 1e-6);
        assert!((header.srow_y[3] + 20.0).abs() < 1e-6);
        assert!((header.srow_z[2] - 0.5).abs() < 1e-6);
        assert!((header.quatern_z + 5.0).abs() < 1e-6);
        assert_eq!(header.sform_code, 1);
        assert_eq!(header.qform_code, 1);
        // off-diagonal terms and the time axis are untouched
        assert_eq!(header.srow_x[1], 0.0);
        assert_eq!(header.pixdim[4], 1.0);
    }

    #[test]
    fn test_resize_voxels_writes_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.nii");
        let data = Array3::<f32>::from_elem((2, 3, 4), 7.0);
        WriterOptions::new(&input)
            .reference_header(&header())
            .write_nifti(&data)
            .unwrap();

        let out_dir = dir.path().join("resized");
        let output = resize_voxels(&input, &out_dir, [10.0, 10.0, 2.0]).unwrap();
        assert_eq!(output, out_dir.join("scan.nii"));

        let written = ReaderOptions::new().read_file(&output).unwrap();
        let header = written.header().clone();
        assert!((header.pixdim[3] - 0.1).abs() < 1e-6);
        let volume = written.into_volume().into_ndarray::<f32>().unwrap();
        assert_eq!(volume.shape(), &[2, 3, 4]);
        assert!(volume.iter().all(|v| (*v - 7.0).abs() < 1e-6));
    }

    #[test]
    fn test_integer_data_keeps_its_type() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("structural.nii");
        let data = Array3::<i16>::from_shape_fn((2, 2, 3), |(x, y, z)| (x * 100 + y * 10 + z) as i16);
        WriterOptions::new(&input)
            .reference_header(&header())
            .write_nifti(&data)
            .unwrap();

        let output = resize_voxels(&input, &dir.path().join("resized"), DEFAULT_RESIZE_FACTORS).unwrap();
        let written = ReaderOptions::new().read_file(&output).unwrap();
        assert_eq!(written.header().data_type().unwrap(), NiftiType::Int16);
        let volume = written.into_volume().into_ndarray::<i16>().unwrap();
        assert_eq!(volume.into_dimensionality::<ndarray::Ix3>().unwrap(), data);
    }

    #[test]
    fn test_scaled_data_is_written_as_float() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scaled.nii");
        WriterOptions::new(&input)
            .reference_header(&header())
            .write_nifti(&Array3::<i16>::from_elem((2, 2, 2), 4))
            .unwrap();
        // the writer always stores slope 1; scl_slope sits at byte 112
        let mut bytes = std::fs::read(&input).unwrap();
        bytes[112..116].copy_from_slice(&0.5f32.to_ne_bytes());
        std::fs::write(&input, bytes).unwrap();

        let output = resize_voxels(&input, &dir.path().join("resized"), DEFAULT_RESIZE_FACTORS).unwrap();
        let written = ReaderOptions::new().read_file(&output).unwrap();
        assert_eq!(written.header().data_type().unwrap(), NiftiType::Float32);
        assert_eq!(written.header().scl_slope, 1.0);
        let volume = written.into_volume().into_ndarray::<f32>().unwrap();
        assert!(volume.iter().all(|v| (*v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_non_positive_factor_rejected() {
        let result = resize_voxels(Path::new("scan.nii"), Path::new("out"), [10.0, 0.0, 10.0]);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}
