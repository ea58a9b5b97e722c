//! Text metadata carried in PNG side-channel chunks.
//!
//! - [`TextMetadata`]: the key/value map attached at save time
//! - [`write_png`] / [`embed_text_chunks`]: encode and attach it
//! - [`read_text_metadata`] / [`read_text_chunks`]: read it back verbatim
//!
//! Keys are unique within a map: writing a key twice keeps only the last
//! value. Saving an image with both a positive and a negative conditioning
//! therefore leaves only the negative one under [`CONDITIONING_KEY`].

mod reader;
mod writer;

pub use reader::{read_text_chunks, read_text_metadata};
pub use writer::{PngCompression, embed_text_chunks, encode_png, write_png};

/// Key holding a base64 latent blob.
pub const LATENT_KEY: &str = "latent_base64";

/// Key holding a base64 conditioning blob.
pub const CONDITIONING_KEY: &str = "conditioning_base64";

/// Key holding the workflow prompt JSON.
pub const PROMPT_KEY: &str = "prompt";

/// Ordered string→string map with last-write-wins keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMetadata {
    entries: Vec<(String, String)>,
}

impl TextMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, or replace the value of an existing key in place.
    pub fn embed(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// The stored value, or `None` if the key was never written.
    pub fn extract(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The latent and conditioning blobs, each `None` when absent.
    pub fn base64_payloads(&self) -> Base64Payloads {
        Base64Payloads {
            latent: self.extract(LATENT_KEY).map(str::to_string),
            conditioning: self.extract(CONDITIONING_KEY).map(str::to_string),
        }
    }
}

/// Base64 blobs recovered from an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Base64Payloads {
    pub latent: Option<String>,
    pub conditioning: Option<String>,
}

/// Decoded pixels that still carry the text metadata they were loaded with.
#[derive(Debug, Clone)]
pub struct ImageWithMetadata {
    pub pixels: image::DynamicImage,
    pub metadata: Option<TextMetadata>,
}

impl ImageWithMetadata {
    /// Decode a PNG file and keep its text chunks.
    pub fn open(path: &std::path::Path) -> crate::Result<Self> {
        let bytes = std::fs::read(path)?;
        let pixels = image::load_from_memory(&bytes)?;
        let metadata = read_text_chunks(&bytes).ok();
        Ok(Self { pixels, metadata })
    }

    pub fn base64_payloads(&self) -> Base64Payloads {
        self.metadata
            .as_ref()
            .map(TextMetadata::base64_payloads)
            .unwrap_or_default()
    }
}
