//! Stereo calibration loading.
//!
//! Calibration is produced elsewhere (chessboard solving is not done here)
//! and read from JSON. Arrays may be flat or nested row lists, as written by
//! common calibration tools. Every key is required; any malformed entry is a
//! load error. Once loaded the calibration is immutable and shared via `Arc`.

use anyhow::{anyhow, Context, Result};
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::frame::Roi;

/// Distortion coefficients in (k1, k2, p1, p2, k3) order.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    fn from_slice(values: &[f64]) -> Self {
        Self {
            k1: values[0],
            k2: values[1],
            p1: values[2],
            p2: values[3],
            k3: values[4],
        }
    }

    fn to_vec(self) -> Vec<f64> {
        vec![self.k1, self.k2, self.p1, self.p2, self.k3]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    pub camera_matrix_left: Matrix3<f64>,
    pub camera_matrix_right: Matrix3<f64>,
    pub dist_coeffs_left: Distortion,
    pub dist_coeffs_right: Distortion,
    pub rotation_matrix: Matrix3<f64>,
    pub translation_vector: Vector3<f64>,
    pub essential_matrix: Matrix3<f64>,
    pub fundamental_matrix: Matrix3<f64>,
    pub rectification_left: Matrix3<f64>,
    pub rectification_right: Matrix3<f64>,
    pub projection_left: Matrix3x4<f64>,
    pub projection_right: Matrix3x4<f64>,
    /// Disparity-to-depth reprojection matrix.
    pub q: Matrix4<f64>,
    /// Valid rectified region, if the calibration reported one.
    pub roi_left: Option<Roi>,
    pub roi_right: Option<Roi>,
}

// ---- File format ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum NumArray {
    Flat(Vec<f64>),
    Nested(Vec<Vec<f64>>),
}

impl NumArray {
    fn flatten(&self) -> Vec<f64> {
        match self {
            NumArray::Flat(v) => v.clone(),
            NumArray::Nested(rows) => rows.iter().flatten().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CalibrationFile {
    camera_matrix_left: NumArray,
    camera_matrix_right: NumArray,
    dist_coeffs_left: NumArray,
    dist_coeffs_right: NumArray,
    rotation_matrix: NumArray,
    translation_vector: NumArray,
    essential_matrix: NumArray,
    fundamental_matrix: NumArray,
    rectification_left: NumArray,
    rectification_right: NumArray,
    projection_left: NumArray,
    projection_right: NumArray,
    disparity_to_depth_matrix: NumArray,
    roi_left: NumArray,
    roi_right: NumArray,
}

fn take(name: &str, value: &NumArray, len: usize) -> Result<Vec<f64>> {
    let flat = value.flatten();
    if flat.len() != len {
        return Err(anyhow!(
            "calibration key '{}' must hold {} numbers, found {}",
            name,
            len,
            flat.len()
        ));
    }
    if flat.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("calibration key '{}' contains non-finite values", name));
    }
    Ok(flat)
}

fn mat3(name: &str, value: &NumArray) -> Result<Matrix3<f64>> {
    Ok(Matrix3::from_row_slice(&take(name, value, 9)?))
}

fn roi(name: &str, value: &NumArray) -> Result<Option<Roi>> {
    let v = take(name, value, 4)?;
    if v.iter().any(|c| *c < 0.0 || c.fract() != 0.0) {
        return Err(anyhow!("calibration key '{}' must hold non-negative integers", name));
    }
    if v[2] == 0.0 || v[3] == 0.0 {
        return Ok(None);
    }
    Ok(Some(Roi::new(v[0] as u32, v[1] as u32, v[2] as u32, v[3] as u32)?))
}

fn row_major<const R: usize, const C: usize>(
    m: &nalgebra::SMatrix<f64, R, C>,
) -> Vec<Vec<f64>> {
    (0..R)
        .map(|r| (0..C).map(|c| m[(r, c)]).collect())
        .collect()
}

impl Calibration {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read calibration file {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("invalid calibration file {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: CalibrationFile =
            serde_json::from_str(raw).context("malformed calibration json")?;
        Self::from_raw(&file)
    }

    fn from_raw(f: &CalibrationFile) -> Result<Self> {
        let t = take("translation_vector", &f.translation_vector, 3)?;
        let cal = Self {
            camera_matrix_left: mat3("camera_matrix_left", &f.camera_matrix_left)?,
            camera_matrix_right: mat3("camera_matrix_right", &f.camera_matrix_right)?,
            dist_coeffs_left: Distortion::from_slice(&take(
                "dist_coeffs_left",
                &f.dist_coeffs_left,
                5,
            )?),
            dist_coeffs_right: Distortion::from_slice(&take(
                "dist_coeffs_right",
                &f.dist_coeffs_right,
                5,
            )?),
            rotation_matrix: mat3("rotation_matrix", &f.rotation_matrix)?,
            translation_vector: Vector3::new(t[0], t[1], t[2]),
            essential_matrix: mat3("essential_matrix", &f.essential_matrix)?,
            fundamental_matrix: mat3("fundamental_matrix", &f.fundamental_matrix)?,
            rectification_left: mat3("rectification_left", &f.rectification_left)?,
            rectification_right: mat3("rectification_right", &f.rectification_right)?,
            projection_left: Matrix3x4::from_row_slice(&take(
                "projection_left",
                &f.projection_left,
                12,
            )?),
            projection_right: Matrix3x4::from_row_slice(&take(
                "projection_right",
                &f.projection_right,
                12,
            )?),
            q: Matrix4::from_row_slice(&take(
                "disparity_to_depth_matrix",
                &f.disparity_to_depth_matrix,
                16,
            )?),
            roi_left: roi("roi_left", &f.roi_left)?,
            roi_right: roi("roi_right", &f.roi_right)?,
        };
        Ok(cal)
    }

    /// Serialize back to the JSON layout accepted by `from_json_str`.
    pub fn to_json_string(&self) -> Result<String> {
        let roi_vec = |r: Option<Roi>| {
            let r = r.unwrap_or(Roi {
                x: 0,
                y: 0,
                w: 0,
                h: 0,
            });
            NumArray::Flat(vec![r.x as f64, r.y as f64, r.w as f64, r.h as f64])
        };
        let file = CalibrationFile {
            camera_matrix_left: NumArray::Nested(row_major(&self.camera_matrix_left)),
            camera_matrix_right: NumArray::Nested(row_major(&self.camera_matrix_right)),
            dist_coeffs_left: NumArray::Flat(self.dist_coeffs_left.to_vec()),
            dist_coeffs_right: NumArray::Flat(self.dist_coeffs_right.to_vec()),
            rotation_matrix: NumArray::Nested(row_major(&self.rotation_matrix)),
            translation_vector: NumArray::Flat(self.translation_vector.iter().copied().collect()),
            essential_matrix: NumArray::Nested(row_major(&self.essential_matrix)),
            fundamental_matrix: NumArray::Nested(row_major(&self.fundamental_matrix)),
            rectification_left: NumArray::Nested(row_major(&self.rectification_left)),
            rectification_right: NumArray::Nested(row_major(&self.rectification_right)),
            projection_left: NumArray::Nested(row_major(&self.projection_left)),
            projection_right: NumArray::Nested(row_major(&self.projection_right)),
            disparity_to_depth_matrix: NumArray::Nested(row_major(&self.q)),
            roi_left: roi_vec(self.roi_left),
            roi_right: roi_vec(self.roi_right),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Already-rectified, distortion-free rig: both cameras share `focal` and the
    /// principal point at the image centre, the right camera sits `baseline`
    /// units along +x. Depth comes out in the baseline's unit.
    pub fn ideal(width: u32, height: u32, focal: f64, baseline: f64) -> Result<Self> {
        if !(focal > 0.0) || !(baseline > 0.0) {
            return Err(anyhow!("ideal calibration needs positive focal length and baseline"));
        }
        let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
        let k = Matrix3::new(focal, 0.0, cx, 0.0, focal, cy, 0.0, 0.0, 1.0);
        let tx = -baseline;
        let t = Vector3::new(tx, 0.0, 0.0);
        // E = [t]x R with R = I.
        let e = Matrix3::new(0.0, -t.z, t.y, t.z, 0.0, -t.x, -t.y, t.x, 0.0);
        let k_inv = k
            .try_inverse()
            .ok_or_else(|| anyhow!("camera matrix is singular"))?;
        let f = k_inv.transpose() * e * k_inv;
        let p_left = Matrix3x4::new(focal, 0.0, cx, 0.0, 0.0, focal, cy, 0.0, 0.0, 0.0, 1.0, 0.0);
        let p_right = Matrix3x4::new(
            focal,
            0.0,
            cx,
            tx * focal,
            0.0,
            focal,
            cy,
            0.0,
            0.0,
            0.0,
            1.0,
            0.0,
        );
        let q = Matrix4::new(
            1.0, 0.0, 0.0, -cx, //
            0.0, 1.0, 0.0, -cy, //
            0.0, 0.0, 0.0, focal, //
            0.0, 0.0, -1.0 / tx, 0.0,
        );
        Ok(Self {
            camera_matrix_left: k,
            camera_matrix_right: k,
            dist_coeffs_left: Distortion::default(),
            dist_coeffs_right: Distortion::default(),
            rotation_matrix: Matrix3::identity(),
            translation_vector: t,
            essential_matrix: e,
            fundamental_matrix: f,
            rectification_left: Matrix3::identity(),
            rectification_right: Matrix3::identity(),
            projection_left: p_left,
            projection_right: p_right,
            q,
            roi_left: Some(Roi::full(width, height)),
            roi_right: Some(Roi::full(width, height)),
        })
    }

    pub fn baseline(&self) -> f64 {
        self.translation_vector.norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "camera_matrix_left": [[700, 0, 320], [0, 700, 240], [0, 0, 1]],
        "camera_matrix_right": [700, 0, 320, 0, 700, 240, 0, 0, 1],
        "dist_coeffs_left": [[0.1, -0.05, 0.001, 0.002, 0.0]],
        "dist_coeffs_right": [0, 0, 0, 0, 0],
        "rotation_matrix": [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
        "translation_vector": [[-120.0], [0.0], [0.0]],
        "essential_matrix": [[0, 0, 0], [0, 0, 120], [0, -120, 0]],
        "fundamental_matrix": [[0, 0, 0], [0, 0, 0.17], [0, -0.17, 1]],
        "rectification_left": [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
        "rectification_right": [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
        "projection_left": [[700, 0, 320, 0], [0, 700, 240, 0], [0, 0, 1, 0]],
        "projection_right": [[700, 0, 320, -84000], [0, 700, 240, 0], [0, 0, 1, 0]],
        "disparity_to_depth_matrix": [[1, 0, 0, -320], [0, 1, 0, -240], [0, 0, 0, 700], [0, 0, 0.008333, 0]],
        "roi_left": [10, 12, 600, 450],
        "roi_right": [0, 0, 0, 0]
    }"#;

    #[test]
    fn loads_nested_and_flat_arrays() {
        let cal = Calibration::from_json_str(FIXTURE).unwrap();
        assert_eq!(cal.camera_matrix_left, cal.camera_matrix_right);
        assert_eq!(cal.camera_matrix_left[(0, 2)], 320.0);
        assert_eq!(cal.dist_coeffs_left.k1, 0.1);
        assert_eq!(cal.dist_coeffs_left.p2, 0.002);
        assert_eq!(cal.translation_vector.x, -120.0);
        assert_eq!(cal.projection_right[(0, 3)], -84000.0);
        assert_eq!(cal.q[(3, 2)], 0.008333);
        assert_eq!(cal.roi_left, Some(Roi::new(10, 12, 600, 450).unwrap()));
        assert_eq!(cal.roi_right, None);
        assert!((cal.baseline() - 120.0).abs() < 1e-12);
    }

    #[test]
    fn missing_key_is_fatal() {
        let broken = FIXTURE.replace("\"essential_matrix\"", "\"essential\"");
        let err = Calibration::from_json_str(&broken).unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.starts_with("malformed calibration json"), "{chain}");
        assert!(chain.contains("essential_matrix"), "{chain}");
    }

    #[test]
    fn wrong_shape_is_fatal() {
        let broken = FIXTURE.replace("\"dist_coeffs_right\": [0, 0, 0, 0, 0]", "\"dist_coeffs_right\": [0, 0, 0]");
        let err = Calibration::from_json_str(&broken).unwrap_err();
        assert!(err.to_string().contains("dist_coeffs_right"), "{err}");
    }

    #[test]
    fn ideal_calibration_round_trips_through_json() {
        let cal = Calibration::ideal(640, 480, 700.0, 120.0).unwrap();
        let json = cal.to_json_string().unwrap();
        let back = Calibration::from_json_str(&json).unwrap();
        assert_eq!(back, cal);
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.json");
        std::fs::write(&path, FIXTURE).unwrap();
        assert!(Calibration::from_file(&path).is_ok());
        assert!(Calibration::from_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn unreadable_file_keeps_io_cause() {
        let dir = tempfile::tempdir().unwrap();
        let err = Calibration::from_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.to_string().starts_with("failed to read calibration file"));
        let io = err
            .chain()
            .find_map(|c| c.downcast_ref::<std::io::Error>())
            .expect("io error in chain");
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
