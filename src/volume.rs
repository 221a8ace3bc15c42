//! Labelled 3-D volumes with an explicit voxel-to-world affine.
//!
//! A [`Volume`] is loaded from a NIfTI file, can be re-laid out so its axis
//! ordering matches an [`OrientationCode`], and is written back atomically.
//! Reorientation only permutes and flips voxel axes; the physical position
//! of every voxel is preserved by rewriting the affine alongside the data.

use camino::Utf8Path;
use ndarray::{Array3, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, NiftiType, ReaderOptions};
use tempfile::Builder;

use crate::domain::{AnatomicalSide, FILE_ENDING, OrientationCode};
use crate::error::ConvertError;

/// Row-major voxel-to-world (RAS+) transform.
pub type Affine = [[f64; 4]; 4];

/// On-disk voxel type used when a volume is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    U8,
    I16,
    U16,
    I32,
    F32,
}

impl StorageType {
    fn from_header(header: &NiftiHeader) -> Self {
        let scaled = header.scl_slope != 0.0
            && (header.scl_slope != 1.0 || header.scl_inter != 0.0);
        if scaled {
            return StorageType::F32;
        }
        match header.data_type() {
            Ok(NiftiType::Uint8) => StorageType::U8,
            Ok(NiftiType::Int16) => StorageType::I16,
            Ok(NiftiType::Uint16) => StorageType::U16,
            Ok(NiftiType::Int32) => StorageType::I32,
            _ => StorageType::F32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Volume {
    header: NiftiHeader,
    data: Array3<f32>,
    affine: Affine,
    storage: StorageType,
}

impl Volume {
    /// Reads a 3-D volume, or a 4-D volume holding a single frame.
    pub fn load(path: &Utf8Path) -> Result<Self, ConvertError> {
        let object = ReaderOptions::new()
            .read_file(path.as_std_path())
            .map_err(|err| volume_error(path, err))?;
        let header = object.header().clone();
        let array = object
            .into_volume()
            .into_ndarray::<f32>()
            .map_err(|err| volume_error(path, err))?;

        let array = match array.ndim() {
            3 => array,
            4 if array.shape()[3] == 1 => array.index_axis_move(Axis(3), 0),
            ndim => {
                return Err(ConvertError::VolumeIo {
                    path: path.as_std_path().to_path_buf(),
                    message: format!(
                        "expected a 3-D image, found {ndim} dimensions with shape {:?}",
                        array.shape()
                    ),
                });
            }
        };
        let data = array
            .into_dimensionality::<Ix3>()
            .map_err(|err| volume_error(path, err))?;

        Ok(Self {
            affine: header_affine(&header),
            storage: StorageType::from_header(&header),
            header,
            data,
        })
    }

    /// Builds an in-memory volume; voxel sizes are taken from the affine.
    pub fn new(data: Array3<f32>, affine: Affine, storage: StorageType) -> Self {
        let mut header = NiftiHeader::default();
        for axis in 0..3 {
            header.pixdim[axis + 1] = column_norm(&affine, axis) as f32;
        }
        header.pixdim[0] = 1.0;
        header.sform_code = 2;
        header.qform_code = 2;
        Self {
            header,
            data,
            affine,
            storage,
        }
    }

    /// Same geometry and header, different voxels.
    ///
    /// A shape mismatch carries no subject; callers that know it fill it in.
    pub fn with_data(&self, data: Array3<f32>, storage: StorageType) -> Result<Self, ConvertError> {
        let (x, y, z) = data.dim();
        if [x, y, z] != self.shape() {
            return Err(ConvertError::ShapeMismatch {
                subject: String::new(),
                expected: self.shape(),
                found: [x, y, z],
            });
        }
        Ok(Self {
            header: self.header.clone(),
            data,
            affine: self.affine,
            storage,
        })
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn shape(&self) -> [usize; 3] {
        let (x, y, z) = self.data.dim();
        [x, y, z]
    }

    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    pub fn storage(&self) -> StorageType {
        self.storage
    }

    /// Voxel sizes along the three array axes.
    pub fn voxel_size(&self) -> [f32; 3] {
        [
            self.header.pixdim[1],
            self.header.pixdim[2],
            self.header.pixdim[3],
        ]
    }

    /// Current axis ordering as read from the affine.
    pub fn orientation(&self) -> OrientationCode {
        let mut assigned_world = [false; 3];
        let mut sides = [None; 3];
        for _ in 0..3 {
            let mut best: Option<(usize, usize, f64)> = None;
            for voxel_axis in 0..3 {
                if sides[voxel_axis].is_some() {
                    continue;
                }
                let norm = column_norm(&self.affine, voxel_axis).max(f64::EPSILON);
                for world_axis in 0..3 {
                    if assigned_world[world_axis] {
                        continue;
                    }
                    let weight = self.affine[world_axis][voxel_axis].abs() / norm;
                    if best.is_none_or(|(_, _, current)| weight > current) {
                        best = Some((voxel_axis, world_axis, weight));
                    }
                }
            }
            if let Some((voxel_axis, world_axis, _)) = best {
                assigned_world[world_axis] = true;
                let positive = self.affine[world_axis][voxel_axis] >= 0.0;
                sides[voxel_axis] = Some(AnatomicalSide::from_direction(world_axis, positive));
            }
        }
        let sides = sides.map(|side| side.unwrap_or(AnatomicalSide::Left));
        OrientationCode::new(sides).unwrap_or_default()
    }

    /// Permutes and flips the voxel axes so they follow `target`.
    pub fn set_orientation(&mut self, target: OrientationCode) {
        let current = self.orientation().sides();
        let target = target.sides();
        let mut permutation = [0usize; 3];
        let mut flipped = [false; 3];
        for (new_axis, side) in target.iter().enumerate() {
            let old_axis = current
                .iter()
                .position(|candidate| candidate.world_axis() == side.world_axis())
                .unwrap_or(new_axis);
            permutation[new_axis] = old_axis;
            flipped[new_axis] = current[old_axis] != *side;
        }
        if permutation == [0, 1, 2] && flipped == [false; 3] {
            return;
        }

        let old_shape = self.shape();
        let mut view = self.data.view().permuted_axes(permutation);
        for (axis, flip) in flipped.iter().enumerate() {
            if *flip {
                view.invert_axis(Axis(axis));
            }
        }
        let data = view.as_standard_layout().into_owned();

        let mut affine = self.affine;
        for row in 0..3 {
            let mut translation = self.affine[row][3];
            for new_axis in 0..3 {
                let old_axis = permutation[new_axis];
                let column = self.affine[row][old_axis];
                if flipped[new_axis] {
                    affine[row][new_axis] = -column;
                    translation += column * (old_shape[old_axis] as f64 - 1.0);
                } else {
                    affine[row][new_axis] = column;
                }
            }
            affine[row][3] = translation;
        }

        let old_pixdim = self.header.pixdim;
        for new_axis in 0..3 {
            self.header.pixdim[new_axis + 1] = old_pixdim[permutation[new_axis] + 1];
        }
        self.data = data;
        self.affine = affine;
    }

    /// Writes the volume, replacing `path` only once the file is complete.
    pub fn save(&self, path: &Utf8Path) -> Result<(), ConvertError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        let suffix = if path.as_str().ends_with(FILE_ENDING) {
            FILE_ENDING
        } else {
            ".nii"
        };
        let temp = Builder::new()
            .prefix(".bids2nnunet-volume")
            .suffix(suffix)
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?
            .into_temp_path();

        let header = self.output_header();
        let writer = WriterOptions::new(&temp).reference_header(&header);
        let written = match self.storage {
            StorageType::U8 => writer.write_nifti(&self.data.mapv(|v| v.round() as u8)),
            StorageType::I16 => writer.write_nifti(&self.data.mapv(|v| v.round() as i16)),
            StorageType::U16 => writer.write_nifti(&self.data.mapv(|v| v.round() as u16)),
            StorageType::I32 => writer.write_nifti(&self.data.mapv(|v| v.round() as i32)),
            StorageType::F32 => writer.write_nifti(&self.data),
        };
        written.map_err(|err| volume_error(path, err))?;

        temp.persist(path.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn output_header(&self) -> NiftiHeader {
        let mut header = self.header.clone();
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;

        let code = if header.sform_code > 0 {
            header.sform_code
        } else if header.qform_code > 0 {
            header.qform_code
        } else {
            2
        };
        header.sform_code = code;
        header.srow_x = affine_row(&self.affine, 0);
        header.srow_y = affine_row(&self.affine, 1);
        header.srow_z = affine_row(&self.affine, 2);

        let quaternion = affine_to_quaternion(&self.affine);
        header.qform_code = code;
        header.quatern_b = quaternion.b as f32;
        header.quatern_c = quaternion.c as f32;
        header.quatern_d = quaternion.d as f32;
        header.quatern_x = self.affine[0][3] as f32;
        header.quatern_y = self.affine[1][3] as f32;
        header.quatern_z = self.affine[2][3] as f32;
        header.pixdim[0] = quaternion.qfac as f32;
        header
    }
}

fn volume_error(path: &Utf8Path, err: impl std::fmt::Display) -> ConvertError {
    ConvertError::VolumeIo {
        path: path.as_std_path().to_path_buf(),
        message: err.to_string(),
    }
}

fn column_norm(affine: &Affine, axis: usize) -> f64 {
    (0..3)
        .map(|row| affine[row][axis] * affine[row][axis])
        .sum::<f64>()
        .sqrt()
}

fn affine_row(affine: &Affine, row: usize) -> [f32; 4] {
    [
        affine[row][0] as f32,
        affine[row][1] as f32,
        affine[row][2] as f32,
        affine[row][3] as f32,
    ]
}

fn header_affine(header: &NiftiHeader) -> Affine {
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut affine = identity();
        for (row, values) in rows.iter().enumerate() {
            for (col, value) in values.iter().enumerate() {
                affine[row][col] = f64::from(*value);
            }
        }
        return affine;
    }
    if header.qform_code > 0 {
        return quaternion_to_affine(header);
    }
    let mut affine = identity();
    for axis in 0..3 {
        let size = f64::from(header.pixdim[axis + 1]);
        affine[axis][axis] = if size > 0.0 { size } else { 1.0 };
    }
    affine
}

fn identity() -> Affine {
    let mut affine = [[0.0; 4]; 4];
    for (index, row) in affine.iter_mut().enumerate() {
        row[index] = 1.0;
    }
    affine
}

struct Quaternion {
    b: f64,
    c: f64,
    d: f64,
    qfac: f64,
}

fn quaternion_to_affine(header: &NiftiHeader) -> Affine {
    let b = f64::from(header.quatern_b);
    let c = f64::from(header.quatern_c);
    let d = f64::from(header.quatern_d);
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };

    let rotation = [
        [
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c),
        ],
        [
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b),
        ],
        [
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            a * a + d * d - c * c - b * b,
        ],
    ];
    let mut sizes = [0.0; 3];
    for axis in 0..3 {
        let size = f64::from(header.pixdim[axis + 1]);
        sizes[axis] = if size > 0.0 { size } else { 1.0 };
    }
    sizes[2] *= qfac;

    let mut affine = identity();
    for row in 0..3 {
        for col in 0..3 {
            affine[row][col] = rotation[row][col] * sizes[col];
        }
    }
    affine[0][3] = f64::from(header.quatern_x);
    affine[1][3] = f64::from(header.quatern_y);
    affine[2][3] = f64::from(header.quatern_z);
    affine
}

fn affine_to_quaternion(affine: &Affine) -> Quaternion {
    let mut r = [[0.0; 3]; 3];
    for col in 0..3 {
        let norm = column_norm(affine, col);
        let norm = if norm > 0.0 { norm } else { 1.0 };
        for row in 0..3 {
            r[row][col] = affine[row][col] / norm;
        }
    }

    let determinant = r[0][0] * (r[1][1] * r[2][2] - r[1][2] * r[2][1])
        - r[0][1] * (r[1][0] * r[2][2] - r[1][2] * r[2][0])
        + r[0][2] * (r[1][0] * r[2][1] - r[1][1] * r[2][0]);
    let qfac = if determinant < 0.0 {
        for row in r.iter_mut() {
            row[2] = -row[2];
        }
        -1.0
    } else {
        1.0
    };

    let trace = 1.0 + r[0][0] + r[1][1] + r[2][2];
    let (a, mut b, mut c, mut d);
    if trace > 0.5 {
        a = 0.5 * trace.sqrt();
        b = 0.25 * (r[2][1] - r[1][2]) / a;
        c = 0.25 * (r[0][2] - r[2][0]) / a;
        d = 0.25 * (r[1][0] - r[0][1]) / a;
    } else {
        let xd = 1.0 + r[0][0] - (r[1][1] + r[2][2]);
        let yd = 1.0 + r[1][1] - (r[0][0] + r[2][2]);
        let zd = 1.0 + r[2][2] - (r[0][0] + r[1][1]);
        if xd > 1.0 {
            b = 0.5 * xd.sqrt();
            c = 0.25 * (r[0][1] + r[1][0]) / b;
            d = 0.25 * (r[0][2] + r[2][0]) / b;
            a = 0.25 * (r[2][1] - r[1][2]) / b;
        } else if yd > 1.0 {
            c = 0.5 * yd.sqrt();
            b = 0.25 * (r[0][1] + r[1][0]) / c;
            d = 0.25 * (r[1][2] + r[2][1]) / c;
            a = 0.25 * (r[0][2] - r[2][0]) / c;
        } else {
            d = 0.5 * zd.sqrt();
            b = 0.25 * (r[0][2] + r[2][0]) / d;
            c = 0.25 * (r[1][2] + r[2][1]) / d;
            a = 0.25 * (r[1][0] - r[0][1]) / d;
        }
        if a < 0.0 {
            b = -b;
            c = -c;
            d = -d;
        }
    }
    Quaternion { b, c, d, qfac }
}
