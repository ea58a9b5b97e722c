//! Latent tensor loading from the on-disk formats the pipeline produces.
//!
//! | Extension | Format | Behavior |
//! |-----------|--------|----------|
//! | `.latent`, `.safetensors` | binary tensor container, entry `latent_tensor` | rescaled by `1/0.18215` unless the version marker is present |
//! | `.npy` | raw single array | values as-is |
//! | `.npz` | archive of named arrays | `latents` entry, else first rank > 3 entry |
//! | anything else | raw single array attempted | format error naming the extension |
//!
//! Every loader returns f32 samples normalised to rank ≥ 4.

pub mod npy;
pub mod npz;
pub mod safetensors;

use candle_core::{DType, Tensor};
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

/// A latent payload as passed between pipeline steps (`{"samples": tensor}`).
#[derive(Debug, Clone)]
pub struct Latent {
    pub samples: Tensor,
}

impl Latent {
    /// Wrap a tensor, coercing it to f32 and adding a batch dimension to 3-D input.
    pub fn new(samples: Tensor) -> Result<Self> {
        let samples = normalize(samples.to_dtype(DType::F32)?)?;
        Ok(Self { samples })
    }
}

/// Prepend a batch dimension of size 1 to rank-3 tensors. Other ranks pass through.
pub fn normalize(tensor: Tensor) -> Result<Tensor> {
    if tensor.rank() == 3 {
        Ok(tensor.unsqueeze(0)?)
    } else {
        Ok(tensor)
    }
}

/// Value equality: same dtype, same shape, bit-identical elements.
pub fn tensors_equal(a: &Tensor, b: &Tensor) -> Result<bool> {
    if a.dtype() != b.dtype() || a.dims() != b.dims() {
        return Ok(false);
    }
    Ok(npy::raw_bytes(a)?.1 == npy::raw_bytes(b)?.1)
}

/// The three on-disk latent layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatentFormat {
    /// Safetensors container with a `latent_tensor` entry.
    Container,
    /// Single `.npy` array.
    RawArray,
    /// `.npz` archive.
    Archive,
}

impl LatentFormat {
    /// Determine the format from a file path extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "latent" | "safetensors" => Some(Self::Container),
            "npy" => Some(Self::RawArray),
            "npz" => Some(Self::Archive),
            _ => None,
        }
    }

    /// Determine the format by substring match against a URL, so query
    /// strings and redirect paths after the extension still match.
    pub fn sniff_url(url: &str) -> Option<Self> {
        if url.contains(".latent") || url.contains(".safetensors") {
            Some(Self::Container)
        } else if url.contains(".npy") {
            Some(Self::RawArray)
        } else if url.contains(".npz") {
            Some(Self::Archive)
        } else {
            None
        }
    }

    /// Decode a whole payload in this format.
    pub fn decode(self, bytes: &[u8]) -> Result<Tensor> {
        match self {
            Self::Container => safetensors::load_latent(bytes),
            Self::RawArray => npy::from_bytes(bytes),
            Self::Archive => npz::select_latent(npz::NpzReader::from_bytes(bytes)?.arrays()?),
        }
    }
}

fn read_all<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Load from a binary tensor container stream.
pub fn load_container<R: Read>(reader: R) -> Result<Latent> {
    Latent::new(LatentFormat::Container.decode(&read_all(reader)?)?)
}

/// Load from a raw `.npy` stream; values are used as stored.
pub fn load_raw_array<R: Read>(reader: R) -> Result<Latent> {
    Latent::new(LatentFormat::RawArray.decode(&read_all(reader)?)?)
}

/// Load from an `.npz` archive stream.
pub fn load_archive<R: Read>(reader: R) -> Result<Latent> {
    Latent::new(LatentFormat::Archive.decode(&read_all(reader)?)?)
}

/// Load a latent file, choosing the loader by extension.
///
/// Unknown extensions are attempted as a raw array; if that fails the error
/// names the extension and carries the parse failure as its source.
pub fn load_latent_file(path: &Path) -> Result<Latent> {
    let bytes = std::fs::read(path)?;
    let tensor = match LatentFormat::from_path(path) {
        Some(format) => format.decode(&bytes)?,
        None => npy::from_bytes(&bytes).map_err(|e| {
            let ext = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            Error::format_with(format!("Unknown latent extension '{ext}'"), e)
        })?,
    };
    let latent = Latent::new(tensor)?;
    log::debug!("Loaded latent {:?} from {}", latent.samples.dims(), path.display());
    Ok(latent)
}
