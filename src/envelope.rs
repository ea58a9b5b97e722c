//! Base64 text envelopes for binary tensor payloads.
//!
//! Blobs use the standard RFC 4648 alphabet with padding, on a single line.
//! Tensor blobs wrap a raw `.npy` array.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use candle_core::Tensor;

use crate::error::{Error, Result, Validation};
use crate::tensor::{Latent, npy};

/// Encode bytes as single-line padded base64.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 blob. Surrounding whitespace (a trailing newline from a
/// multiline text field) is ignored; anything else outside the alphabet fails.
pub fn decode(blob: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(blob.trim())?)
}

/// Serialize a tensor as `.npy` and encode it.
pub fn encode_tensor(tensor: &Tensor) -> Result<String> {
    Ok(encode(&npy::to_bytes(tensor)?))
}

/// Decode a tensor blob into a latent (f32, rank ≥ 4).
pub fn decode_tensor(blob: &str) -> Result<Latent> {
    let bytes = decode(blob)?;
    let latent = Latent::new(npy::from_bytes(&bytes)?)?;
    log::debug!("Decoded latent shape: {:?}", latent.samples.dims());
    Ok(latent)
}

/// `true` when the blob decodes to a readable array. Never fails.
pub fn is_well_formed_tensor_blob(blob: &str) -> bool {
    decode(blob)
        .and_then(|bytes| npy::from_bytes(&bytes))
        .is_ok()
}

/// Pre-flight check for a base64 latent input.
pub fn validate_base64_latent(blob: &str) -> Validation {
    if blob.is_empty() {
        Validation::Rejected("Base64 latent string is empty".to_string())
    } else if !is_well_formed_tensor_blob(blob) {
        Validation::Rejected("Invalid base64 latent string".to_string())
    } else {
        Validation::Valid
    }
}

/// Encode a latent's samples.
pub fn encode_latent(latent: &Latent) -> Result<String> {
    encode_tensor(&latent.samples)
}

/// Same as [`decode_tensor`] but with the error message callers of the
/// base64 latent loader see.
pub fn load_latent_from_base64(blob: &str) -> Result<Latent> {
    decode_tensor(blob)
        .map_err(|e| Error::format_with(format!("Failed to load latent from base64: {e}"), e))
}
