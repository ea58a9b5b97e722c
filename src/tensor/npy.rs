//! NumPy `.npy` raw-array codec.
//!
//! Layout: `\x93NUMPY` | major(1) | minor(1) | header_len (u16 LE for 1.x,
//! u32 LE for 2.x/3.x) | python-literal header dict | little-endian data.

use candle_core::{DType, Device, Tensor};
use half::f16;
use std::io::{Read, Write};

use crate::error::{Error, Result};

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Header alignment required by the format (magic through trailing newline).
const HEADER_ALIGN: usize = 64;

/// Parsed `.npy` header dict.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyHeader {
    pub descr: String,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

impl NpyHeader {
    fn dtype(&self) -> Result<DType> {
        let mut chars = self.descr.chars();
        let order = chars.next();
        let code = chars.as_str();
        match order {
            Some('<' | '|' | '=') => {}
            Some('>') => {
                return Err(Error::format(format!(
                    "big-endian arrays are not supported: '{}'",
                    self.descr
                )));
            }
            _ => {
                return Err(Error::format(format!(
                    "unsupported npy descr '{}'",
                    self.descr
                )));
            }
        }
        match code {
            "f2" => Ok(DType::F16),
            "f4" => Ok(DType::F32),
            "f8" => Ok(DType::F64),
            "u1" | "b1" => Ok(DType::U8),
            "u4" => Ok(DType::U32),
            "i8" => Ok(DType::I64),
            _ => Err(Error::format(format!(
                "unsupported npy descr '{}'",
                self.descr
            ))),
        }
    }

    /// Parse the python-literal dict, e.g.
    /// `{'descr': '<f4', 'fortran_order': False, 'shape': (1, 4, 64, 64), }`.
    pub fn parse(header: &str) -> Result<Self> {
        let descr = quoted_value(header, "descr")?;
        let fortran_order = raw_value(header, "fortran_order")?.starts_with("True");
        let shape = parse_shape(raw_value(header, "shape")?)?;
        Ok(Self {
            descr,
            fortran_order,
            shape,
        })
    }

    fn render(&self) -> String {
        let shape = match self.shape.as_slice() {
            [] => "()".to_string(),
            [n] => format!("({n},)"),
            dims => {
                let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                format!("({})", dims.join(", "))
            }
        };
        let fortran = if self.fortran_order { "True" } else { "False" };
        format!(
            "{{'descr': '{}', 'fortran_order': {fortran}, 'shape': {shape}, }}",
            self.descr
        )
    }
}

/// Find the text following `'key':` in the header dict.
fn raw_value<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    let needle = format!("'{key}'");
    let start = header
        .find(&needle)
        .ok_or_else(|| Error::format(format!("npy header is missing '{key}'")))?;
    let after = &header[start + needle.len()..];
    let colon = after
        .find(':')
        .ok_or_else(|| Error::format(format!("npy header has no value for '{key}'")))?;
    Ok(after[colon + 1..].trim_start())
}

fn quoted_value(header: &str, key: &str) -> Result<String> {
    let value = raw_value(header, key)?;
    let quote = value
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| Error::format(format!("npy header value for '{key}' is not a string")))?;
    let rest = &value[1..];
    let end = rest
        .find(quote)
        .ok_or_else(|| Error::format(format!("unterminated npy header value for '{key}'")))?;
    Ok(rest[..end].to_string())
}

fn parse_shape(value: &str) -> Result<Vec<usize>> {
    let open = value
        .find('(')
        .ok_or_else(|| Error::format("npy shape is not a tuple"))?;
    let close = value[open..]
        .find(')')
        .map(|i| open + i)
        .ok_or_else(|| Error::format("unterminated npy shape tuple"))?;
    value[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            // Shapes written by some platforms carry an `L` suffix.
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|e| Error::format_with(format!("invalid npy dimension '{s}'"), e))
        })
        .collect()
}

fn truncated(e: std::io::Error) -> Error {
    Error::format_with("truncated npy payload", e)
}

/// Read `len` bytes, growing the buffer only as data actually arrives.
fn read_exactly<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader
        .by_ref()
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(truncated)?;
    if buf.len() != len {
        return Err(Error::format(format!(
            "truncated npy payload: expected {len} bytes, found {}",
            buf.len()
        )));
    }
    Ok(buf)
}

/// Read the magic, version, and header dict.
pub fn read_header<R: Read>(reader: &mut R) -> Result<NpyHeader> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic).map_err(truncated)?;
    if &magic != NPY_MAGIC {
        return Err(Error::format("not an npy array (bad magic)"));
    }

    let mut version = [0u8; 2];
    reader.read_exact(&mut version).map_err(truncated)?;
    let header_len = match version[0] {
        1 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf).map_err(truncated)?;
            u16::from_le_bytes(buf) as usize
        }
        2 | 3 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf).map_err(truncated)?;
            u32::from_le_bytes(buf) as usize
        }
        major => {
            return Err(Error::format(format!(
                "unsupported npy version {major}.{}",
                version[1]
            )));
        }
    };

    let header = read_exactly(reader, header_len)?;
    let header = std::str::from_utf8(&header)
        .map_err(|e| Error::format_with("npy header is not valid UTF-8", e))?;
    NpyHeader::parse(header)
}

/// Read a single array, keeping its stored dtype.
pub fn read_npy<R: Read>(reader: &mut R) -> Result<Tensor> {
    let header = read_header(reader)?;
    let dtype = header.dtype()?;

    let mut shape = header.shape.clone();
    if header.fortran_order {
        shape.reverse();
    }
    let byte_len = shape
        .iter()
        .try_fold(dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::format(format!("npy shape {shape:?} is too large")))?;
    let data = read_exactly(reader, byte_len)?;

    let tensor = Tensor::from_raw_buffer(&data, dtype, &shape, &Device::Cpu)?;
    if header.fortran_order && shape.len() > 1 {
        let axes: Vec<usize> = (0..shape.len()).rev().collect();
        Ok(tensor.permute(axes)?.contiguous()?)
    } else {
        Ok(tensor)
    }
}

/// Read a single array from an in-memory buffer.
pub fn from_bytes(bytes: &[u8]) -> Result<Tensor> {
    let mut cursor = bytes;
    read_npy(&mut cursor)
}

/// Flattened little-endian bytes plus the matching descr.
pub(crate) fn raw_bytes(tensor: &Tensor) -> Result<(&'static str, Vec<u8>)> {
    let flat = tensor.flatten_all()?;
    let encoded = match tensor.dtype() {
        DType::F32 => ("<f4", le_bytes(flat.to_vec1::<f32>()?, f32::to_le_bytes)),
        DType::F64 => ("<f8", le_bytes(flat.to_vec1::<f64>()?, f64::to_le_bytes)),
        DType::U8 => ("|u1", flat.to_vec1::<u8>()?),
        DType::U32 => ("<u4", le_bytes(flat.to_vec1::<u32>()?, u32::to_le_bytes)),
        DType::I64 => ("<i8", le_bytes(flat.to_vec1::<i64>()?, i64::to_le_bytes)),
        DType::F16 => ("<f2", le_bytes(flat.to_vec1::<f16>()?, f16::to_le_bytes)),
        DType::BF16 => {
            let widened = flat.to_dtype(DType::F32)?;
            ("<f4", le_bytes(widened.to_vec1::<f32>()?, f32::to_le_bytes))
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(Error::format(format!(
                "cannot write {other:?} tensors as npy"
            )));
        }
    };
    Ok(encoded)
}

fn le_bytes<T, const N: usize>(values: Vec<T>, f: fn(T) -> [u8; N]) -> Vec<u8> {
    values.into_iter().flat_map(f).collect()
}

/// Write a tensor as an NPY 1.0 array. bf16 has no npy descr and is widened to f32.
pub fn write_npy<W: Write>(tensor: &Tensor, writer: &mut W) -> Result<()> {
    let (descr, data) = raw_bytes(tensor)?;
    let header = NpyHeader {
        descr: descr.to_string(),
        fortran_order: false,
        shape: tensor.dims().to_vec(),
    }
    .render();

    let prefix_len = NPY_MAGIC.len() + 2 + 2;
    let unpadded = prefix_len + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    let header = format!("{header}{}\n", " ".repeat(padding));
    let header_len = u16::try_from(header.len())
        .map_err(|_| Error::format("npy header exceeds 65535 bytes"))?;

    writer.write_all(NPY_MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(header.as_bytes())?;
    writer.write_all(&data)?;
    Ok(())
}

/// Serialize a tensor into an in-memory `.npy` buffer.
pub fn to_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_npy(tensor, &mut buf)?;
    Ok(buf)
}
