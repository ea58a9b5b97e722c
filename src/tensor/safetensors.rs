//! Binary tensor containers (`.latent` / `.safetensors`) as written by the
//! host's stock latent saver.

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Entry holding the latent tensor.
pub const LATENT_ENTRY: &str = "latent_tensor";

/// Marker entry present in containers written with the current (scaled)
/// convention.
pub const VERSION_MARKER: &str = "latent_format_version_0";

/// Scale factor of the legacy unscaled encoding.
pub const LEGACY_SCALE: f64 = 0.18215;

/// Load the latent entry from an in-memory container.
///
/// Containers without [`VERSION_MARKER`] store values in the legacy
/// convention, so they are multiplied by `1 / 0.18215`.
pub fn load_latent(bytes: &[u8]) -> Result<Tensor> {
    let entries = candle_core::safetensors::load_buffer(bytes, &Device::Cpu)
        .map_err(|e| Error::format_with("not a readable safetensors container", e))?;
    latent_from_entries(entries)
}

fn latent_from_entries(mut entries: HashMap<String, Tensor>) -> Result<Tensor> {
    let latent = entries
        .remove(LATENT_ENTRY)
        .ok_or_else(|| Error::format(format!("container has no '{LATENT_ENTRY}' entry")))?
        .to_dtype(DType::F32)?;

    if entries.contains_key(VERSION_MARKER) {
        Ok(latent)
    } else {
        log::debug!("No '{VERSION_MARKER}' entry, rescaling legacy latent");
        Ok(latent.affine(1.0 / LEGACY_SCALE, 0.0)?)
    }
}
