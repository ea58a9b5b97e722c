use image::DynamicImage;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use img_parts::Bytes;
use img_parts::png::{Png, PngChunk};
use std::path::Path;

use super::TextMetadata;
use crate::error::{Error, Result};

const MAX_KEYWORD_LEN: usize = 79;

/// PNG deflate effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PngCompression {
    Fast,
    Default,
    Best,
}

impl PngCompression {
    /// Map a zlib-style level (0–9) onto the encoder's presets.
    pub fn from_level(level: u8) -> Self {
        match level {
            0..=2 => Self::Fast,
            3..=6 => Self::Default,
            _ => Self::Best,
        }
    }
}

impl From<PngCompression> for CompressionType {
    fn from(c: PngCompression) -> Self {
        match c {
            PngCompression::Fast => CompressionType::Fast,
            PngCompression::Default => CompressionType::Default,
            PngCompression::Best => CompressionType::Best,
        }
    }
}

/// Encode pixels as PNG without any text chunks.
pub fn encode_png(image: &DynamicImage, compression: PngCompression) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut buf, compression.into(), FilterType::Adaptive);
    image.write_with_encoder(encoder)?;
    Ok(buf)
}

/// Encode a string as Latin-1, or `None` if it has characters outside it.
fn to_latin1(s: &str) -> Option<Vec<u8>> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

/// Build a `tEXt` chunk for Latin-1 values, `iTXt` (uncompressed UTF-8) otherwise.
fn text_chunk(key: &str, value: &str) -> Result<PngChunk> {
    let keyword = to_latin1(key)
        .filter(|k| !k.is_empty() && k.len() <= MAX_KEYWORD_LEN && !k.contains(&0))
        .ok_or_else(|| Error::format(format!("'{key}' is not a valid PNG text keyword")))?;

    let (kind, contents) = match to_latin1(value) {
        Some(text) => {
            let mut contents = keyword;
            contents.push(0);
            contents.extend_from_slice(&text);
            (*b"tEXt", contents)
        }
        None => {
            let mut contents = keyword;
            // NUL, compression flag, compression method, empty language tag,
            // empty translated keyword.
            contents.extend_from_slice(&[0, 0, 0, 0, 0]);
            contents.extend_from_slice(value.as_bytes());
            (*b"iTXt", contents)
        }
    };
    Ok(PngChunk::new(kind, Bytes::from(contents)))
}

/// Attach text chunks to an encoded PNG, just before `IEND`, in map order.
pub fn embed_text_chunks(png_bytes: Vec<u8>, metadata: &TextMetadata) -> Result<Vec<u8>> {
    let mut png = Png::from_bytes(Bytes::from(png_bytes))
        .map_err(|e| Error::format(format!("Failed to parse PNG: {e}")))?;

    let new_chunks = metadata
        .iter()
        .map(|(k, v)| text_chunk(k, v))
        .collect::<Result<Vec<_>>>()?;

    let chunks = png.chunks_mut();
    let iend = chunks
        .iter()
        .position(|c| c.kind() == *b"IEND")
        .unwrap_or(chunks.len());
    for (offset, chunk) in new_chunks.into_iter().enumerate() {
        chunks.insert(iend + offset, chunk);
    }

    Ok(png.encoder().bytes().to_vec())
}

/// Encode pixels, attach the metadata, and write the file.
pub fn write_png(
    path: &Path,
    image: &DynamicImage,
    metadata: &TextMetadata,
    compression: PngCompression,
) -> Result<()> {
    let encoded = encode_png(image, compression)?;
    let output = embed_text_chunks(encoded, metadata)?;
    std::fs::write(path, &output)?;
    log::debug!("Wrote {} ({} text entries)", path.display(), metadata.len());
    Ok(())
}
