//! Minimal NPY / NPZ (de)serializer.
//!
//! Supports the subset of the NumPy array format a feature dump actually
//! contains:
//!   - NPY format version 1.0 and 2.0
//!   - `int32` / `int64` dtypes for charactor-id and duration vectors
//!   - `float32` / `float64` dtypes for mel matrices
//!   - C-contiguous (row-major) layout, 1-D or 2-D
//!
//! NPZ files are simply ZIP archives whose members are `.npy` files; the
//! member name without its `.npy` extension is the array name. Dumps that
//! bundle all per-utterance arrays into one archive can be read with
//! [`load_npz_member`] from a custom load function.
//!
//! Writers cover the same subset and always emit v1.0 little-endian files.

use std::{
    collections::HashMap,
    io::{Read, Write},
    path::Path,
};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;
use zip::ZipArchive;

use crate::error::{DatasetError, Result};

#[derive(Error, Debug)]
pub enum NpyError {
    #[error("not a valid NPY file (bad magic)")]
    BadMagic,
    #[error("unsupported NPY version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("file truncated in header")]
    TruncatedHeader,
    #[error("header is not valid UTF-8")]
    HeaderNotUtf8,
    #[error("header missing {0:?}")]
    MissingField(&'static str),
    #[error("unsupported dtype {0:?}")]
    UnsupportedDtype(String),
    #[error("Fortran-order arrays are not supported")]
    FortranOrder,
    #[error("bad shape dimension {0:?}")]
    BadShapeDim(String),
    #[error("data section too short: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("expected a {expected}-d array, got shape {shape:?}")]
    Rank { expected: usize, shape: Vec<usize> },
    #[error("expected {expected} data, got {got}")]
    WrongClass {
        expected: &'static str,
        got: &'static str,
    },
    #[error("integer value {0} does not fit in i32")]
    IntegerOverflow(i64),
    #[error("archive member {0:?} not found")]
    MissingMember(String),
    #[error("zip archive error")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsed array representation
// ─────────────────────────────────────────────────────────────────────────────

/// Flat row-major data of a parsed array, one variant per supported dtype.
#[derive(Debug, Clone)]
pub enum NpyData {
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl NpyData {
    fn kind(&self) -> &'static str {
        match self {
            NpyData::I32(_) => "int32",
            NpyData::I64(_) => "int64",
            NpyData::F32(_) => "float32",
            NpyData::F64(_) => "float64",
        }
    }
}

/// A loaded array: shape + flat data in row-major (C) order.
#[derive(Debug, Clone)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: NpyData,
}

impl NpyArray {
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of rows (first dimension).
    pub fn nrows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Interpret as a 1-D integer vector. `int64` input is narrowed with an
    /// overflow check; float input is rejected.
    pub fn into_i32_1d(self) -> std::result::Result<Array1<i32>, NpyError> {
        if self.shape.len() != 1 {
            return Err(NpyError::Rank { expected: 1, shape: self.shape });
        }
        let values = match self.data {
            NpyData::I32(v) => v,
            NpyData::I64(v) => v
                .into_iter()
                .map(|x| i32::try_from(x).map_err(|_| NpyError::IntegerOverflow(x)))
                .collect::<std::result::Result<Vec<i32>, NpyError>>()?,
            other => {
                return Err(NpyError::WrongClass { expected: "integer", got: other.kind() })
            }
        };
        Ok(Array1::from_vec(values))
    }

    /// Interpret as a 2-D float matrix. `float64` input is narrowed to f32;
    /// integer input is rejected.
    pub fn into_f32_2d(self) -> std::result::Result<Array2<f32>, NpyError> {
        if self.shape.len() != 2 {
            return Err(NpyError::Rank { expected: 2, shape: self.shape });
        }
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let values = match self.data {
            NpyData::F32(v) => v,
            NpyData::F64(v) => v.into_iter().map(|x| x as f32).collect(),
            other => {
                return Err(NpyError::WrongClass { expected: "float", got: other.kind() })
            }
        };
        // Element count was validated against the header shape during parsing.
        Array2::from_shape_vec((rows, cols), values)
            .map_err(|_| NpyError::Rank { expected: 2, shape: vec![rows, cols] })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NPY header parser
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    I32,
    I64,
    F32,
    F64,
}

impl Dtype {
    fn width(self) -> usize {
        match self {
            Dtype::I32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::F64 => 8,
        }
    }
}

fn parse_dtype(descr: &str) -> std::result::Result<(Dtype, bool), NpyError> {
    // Little-endian, native-endian and big-endian scalar codes.
    let dtype = match descr {
        "<i4" | "=i4" | "|i4" | ">i4" => Dtype::I32,
        "<i8" | "=i8" | "|i8" | ">i8" => Dtype::I64,
        "<f4" | "=f4" | "|f4" | ">f4" => Dtype::F32,
        "<f8" | "=f8" | "|f8" | ">f8" => Dtype::F64,
        other => return Err(NpyError::UnsupportedDtype(other.to_string())),
    };
    Ok((dtype, descr.starts_with('>')))
}

/// Parse a raw `.npy` byte buffer into shape + typed flat data.
pub fn parse_npy(data: &[u8]) -> std::result::Result<NpyArray, NpyError> {
    // Magic: 6 bytes "\x93NUMPY"
    if data.len() < 10 || &data[..6] != b"\x93NUMPY" {
        return Err(NpyError::BadMagic);
    }

    let major = data[6];
    let minor = data[7];

    // Header length: 2 bytes (v1) or 4 bytes (v2), little-endian.
    let (header_len, header_start) = match (major, minor) {
        (1, _) => {
            let len = u16::from_le_bytes([data[8], data[9]]) as usize;
            (len, 10)
        }
        (2, _) => {
            if data.len() < 12 {
                return Err(NpyError::TruncatedHeader);
            }
            let len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
            (len, 12)
        }
        _ => return Err(NpyError::UnsupportedVersion(major, minor)),
    };

    let header_end = header_start + header_len;
    if data.len() < header_end {
        return Err(NpyError::TruncatedHeader);
    }
    let header = std::str::from_utf8(&data[header_start..header_end])
        .map_err(|_| NpyError::HeaderNotUtf8)?;

    // Parse dtype
    let descr = extract_header_field(header, "descr")
        .ok_or(NpyError::MissingField("descr"))?;
    let descr = descr.trim().trim_matches('\'').trim_matches('"');
    let (dtype, big_endian) = parse_dtype(descr)?;

    // Parse fortran_order
    let fortran = extract_header_field(header, "fortran_order")
        .unwrap_or("False")
        .trim()
        .to_ascii_lowercase();
    if fortran == "true" {
        return Err(NpyError::FortranOrder);
    }

    // Parse shape — e.g. "(256, 512)" or "(100,)"
    let shape_str = extract_header_field(header, "shape")
        .ok_or(NpyError::MissingField("shape"))?;
    let shape = parse_shape(shape_str.trim())?;

    let n_elements: usize = shape.iter().product();
    let width = dtype.width();

    // Raw bytes start right after the header
    let data_bytes = &data[header_end..];
    if data_bytes.len() < n_elements * width {
        return Err(NpyError::Truncated {
            expected: n_elements * width,
            got: data_bytes.len(),
        });
    }
    let data_bytes = &data_bytes[..n_elements * width];

    let data = match dtype {
        Dtype::I32 => NpyData::I32(decode(data_bytes, big_endian, i32::from_le_bytes, i32::from_be_bytes)),
        Dtype::I64 => NpyData::I64(decode(data_bytes, big_endian, i64::from_le_bytes, i64::from_be_bytes)),
        Dtype::F32 => NpyData::F32(decode(data_bytes, big_endian, f32::from_le_bytes, f32::from_be_bytes)),
        Dtype::F64 => NpyData::F64(decode(data_bytes, big_endian, f64::from_le_bytes, f64::from_be_bytes)),
    };

    Ok(NpyArray { shape, data })
}

fn decode<T, const W: usize>(
    bytes: &[u8],
    big_endian: bool,
    from_le: fn([u8; W]) -> T,
    from_be: fn([u8; W]) -> T,
) -> Vec<T> {
    bytes
        .chunks_exact(W)
        .map(|b| {
            let mut arr = [0u8; W];
            arr.copy_from_slice(b);
            if big_endian {
                from_be(arr)
            } else {
                from_le(arr)
            }
        })
        .collect()
}

/// Extract the value of a field from a Python-literal dict header string.
///
/// e.g. `extract_header_field("{'descr': '<f4', 'shape': (3,)}", "descr")`
/// returns `Some("<f4")`.
fn extract_header_field<'a>(header: &'a str, field: &str) -> Option<&'a str> {
    // Look for `'field':` or `"field":`.
    let key_sq = format!("'{}':", field);
    let key_dq = format!("\"{}\":", field);

    let start = header
        .find(key_sq.as_str())
        .map(|p| p + key_sq.len())
        .or_else(|| header.find(key_dq.as_str()).map(|p| p + key_dq.len()))?;

    let rest = header[start..].trim_start();

    // Value is either a Python string (quoted), tuple (parentheses), or a bare word.
    if rest.starts_with('(') {
        // Tuple — find the matching closing paren
        let end = rest.find(')')?;
        Some(&rest[..end + 1])
    } else if rest.starts_with('\'') || rest.starts_with('"') {
        let quote = rest.chars().next()?;
        let inner = &rest[1..];
        let end = inner.find(quote)?;
        Some(&inner[..end])
    } else {
        // Bare value (True, False, or a number) — read until comma or }
        let end = rest.find([',', '}']).unwrap_or(rest.len());
        Some(rest[..end].trim())
    }
}

/// Parse a Python-style shape tuple like `(256, 512)` or `(100,)` or `()`.
fn parse_shape(s: &str) -> std::result::Result<Vec<usize>, NpyError> {
    let inner = s.trim_start_matches('(').trim_end_matches(')');
    if inner.trim().is_empty() {
        return Ok(vec![]);
    }
    inner
        .split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<usize>().map_err(|_| NpyError::BadShapeDim(t.to_string())))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// File loaders
// ─────────────────────────────────────────────────────────────────────────────

fn npy_context(path: &Path, source: NpyError) -> DatasetError {
    DatasetError::Npy { path: path.to_path_buf(), source }
}

/// Load a `.npy` file without committing to a dtype or rank.
pub fn load_npy(path: &Path) -> Result<NpyArray> {
    let bytes = std::fs::read(path).map_err(|e| npy_context(path, e.into()))?;
    parse_npy(&bytes).map_err(|e| npy_context(path, e))
}

/// Default charactor / duration loader: 1-D integer `.npy`.
pub fn load_i32_1d(path: &Path) -> Result<Array1<i32>> {
    load_npy(path)?.into_i32_1d().map_err(|e| npy_context(path, e))
}

/// Default mel loader: 2-D float `.npy`, `[frames, bins]`.
pub fn load_f32_2d(path: &Path) -> Result<Array2<f32>> {
    load_npy(path)?.into_f32_2d().map_err(|e| npy_context(path, e))
}

// ─────────────────────────────────────────────────────────────────────────────
// NPZ loader
// ─────────────────────────────────────────────────────────────────────────────

/// Load an NPZ archive and return all arrays indexed by name
/// (`.npy` extension stripped).
pub fn load_npz(path: &Path) -> Result<HashMap<String, NpyArray>> {
    let run = || -> std::result::Result<HashMap<String, NpyArray>, NpyError> {
        let file = std::fs::File::open(path)?;
        let mut archive = ZipArchive::new(file)?;

        let mut arrays = HashMap::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().trim_end_matches(".npy").to_string();

            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;

            arrays.insert(name, parse_npy(&buf)?);
        }
        Ok(arrays)
    };
    run().map_err(|e| npy_context(path, e))
}

/// Load a single named member of an NPZ archive.
///
/// Handy inside a custom load function when the dump bundles all arrays of
/// one utterance into a single archive.
pub fn load_npz_member(path: &Path, name: &str) -> Result<NpyArray> {
    load_npz(path)?
        .remove(name)
        .ok_or_else(|| npy_context(path, NpyError::MissingMember(name.to_string())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Writers — v1.0, little-endian
// ─────────────────────────────────────────────────────────────────────────────

/// Assemble a v1.0 NPY byte buffer. The header block (magic + length + dict)
/// is space-padded so the data section starts on a 64-byte boundary.
fn encode_npy(descr: &str, shape: &[usize], data_bytes: &[u8]) -> Vec<u8> {
    let shape_str = if shape.len() == 1 {
        format!("({},)", shape[0])
    } else {
        format!(
            "({})",
            shape.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        )
    };
    let header_str = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape_str
    );

    // 10 preamble bytes + dict + padding + '\n', total a multiple of 64.
    let raw_total = 10 + header_str.len() + 1;
    let padded_total = raw_total.div_ceil(64) * 64;
    let pad = padded_total - raw_total;

    let mut header = header_str;
    header.extend(std::iter::repeat(' ').take(pad));
    header.push('\n');

    let mut buf = Vec::with_capacity(padded_total + data_bytes.len());
    buf.extend_from_slice(b"\x93NUMPY");
    buf.push(1);
    buf.push(0);
    buf.extend_from_slice(&(header.len() as u16).to_le_bytes());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(data_bytes);
    buf
}

pub(crate) fn npy_bytes_i32(array: ArrayView1<i32>) -> Vec<u8> {
    let mut data = Vec::with_capacity(array.len() * 4);
    for &v in array.iter() {
        data.extend_from_slice(&v.to_le_bytes());
    }
    encode_npy("<i4", &[array.len()], &data)
}

pub(crate) fn npy_bytes_f32(array: ArrayView2<f32>) -> Vec<u8> {
    let mut data = Vec::with_capacity(array.len() * 4);
    for &v in array.iter() {
        data.extend_from_slice(&v.to_le_bytes());
    }
    encode_npy("<f4", &[array.nrows(), array.ncols()], &data)
}

/// Write a 1-D `int32` array as `.npy` (the charactor / duration dump format).
pub fn write_npy_i32(path: &Path, array: ArrayView1<i32>) -> Result<()> {
    let run = || -> std::result::Result<(), NpyError> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&npy_bytes_i32(array))?;
        Ok(())
    };
    run().map_err(|e| npy_context(path, e))
}

/// Write a 2-D `float32` array as `.npy` (the mel dump format).
pub fn write_npy_f32(path: &Path, array: ArrayView2<f32>) -> Result<()> {
    let run = || -> std::result::Result<(), NpyError> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&npy_bytes_f32(array))?;
        Ok(())
    };
    run().map_err(|e| npy_context(path, e))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
