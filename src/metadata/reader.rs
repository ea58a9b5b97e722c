use flate2::read::ZlibDecoder;
use img_parts::Bytes;
use img_parts::png::{Png, PngChunk};
use std::io::Read;
use std::path::Path;

use super::TextMetadata;
use crate::error::{Error, Result};

/// Read the text metadata of a PNG file.
pub fn read_text_metadata(path: &Path) -> Result<TextMetadata> {
    let bytes = std::fs::read(path)?;
    read_text_chunks(&bytes)
}

/// Collect `tEXt`, `zTXt`, and `iTXt` chunks. Repeated keywords resolve to
/// the last chunk in file order.
pub fn read_text_chunks(bytes: &[u8]) -> Result<TextMetadata> {
    let png = Png::from_bytes(Bytes::copy_from_slice(bytes))
        .map_err(|e| Error::format(format!("Failed to parse PNG: {e}")))?;

    let mut metadata = TextMetadata::new();
    for chunk in png.chunks() {
        let parsed = match &chunk.kind() {
            b"tEXt" => parse_text(chunk),
            b"zTXt" => parse_compressed_text(chunk),
            b"iTXt" => parse_international_text(chunk),
            _ => continue,
        };
        match parsed {
            Some((key, value)) => metadata.embed(key, value),
            None => log::debug!(
                "Skipping malformed {} chunk",
                String::from_utf8_lossy(&chunk.kind())
            ),
        }
    }
    Ok(metadata)
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn split_keyword(contents: &[u8]) -> Option<(String, &[u8])> {
    let nul = contents.iter().position(|&b| b == 0)?;
    Some((latin1(&contents[..nul]), &contents[nul + 1..]))
}

/// Largest accepted inflated text chunk.
const MAX_INFLATED_LEN: u64 = 64 * 1024 * 1024;

fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    inflate_limited(data, MAX_INFLATED_LEN)
}

fn inflate_limited(data: &[u8], limit: u64) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(limit + 1)
        .read_to_end(&mut out)
        .ok()?;
    if out.len() as u64 > limit {
        log::debug!("Compressed text chunk exceeds {limit} bytes inflated");
        return None;
    }
    Some(out)
}

fn parse_text(chunk: &PngChunk) -> Option<(String, String)> {
    let (key, text) = split_keyword(chunk.contents())?;
    Some((key, latin1(text)))
}

fn parse_compressed_text(chunk: &PngChunk) -> Option<(String, String)> {
    let (key, rest) = split_keyword(chunk.contents())?;
    let (&method, data) = rest.split_first()?;
    if method != 0 {
        return None;
    }
    Some((key, latin1(&inflate(data)?)))
}

fn parse_international_text(chunk: &PngChunk) -> Option<(String, String)> {
    let (key, rest) = split_keyword(chunk.contents())?;
    let [flag, method, rest @ ..] = rest else {
        return None;
    };
    // Language tag, then translated keyword, each NUL-terminated.
    let lang_end = rest.iter().position(|&b| b == 0)?;
    let rest = &rest[lang_end + 1..];
    let translated_end = rest.iter().position(|&b| b == 0)?;
    let text = &rest[translated_end + 1..];

    let text = match (*flag, *method) {
        (0, _) => text.to_vec(),
        (1, 0) => inflate(text)?,
        _ => return None,
    };
    Some((key, String::from_utf8(text).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{PngCompression, embed_text_chunks, encode_png, write_png};
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use image::DynamicImage;
    use std::io::Write;
    use tempfile::TempDir;

    fn blank_png() -> Vec<u8> {
        encode_png(&DynamicImage::new_rgb8(3, 2), PngCompression::Fast).unwrap()
    }

    fn with_raw_chunks(chunks: Vec<PngChunk>) -> Vec<u8> {
        let mut png = Png::from_bytes(Bytes::from(blank_png())).unwrap();
        let list = png.chunks_mut();
        let iend = list.len() - 1;
        for (i, c) in chunks.into_iter().enumerate() {
            list.insert(iend + i, c);
        }
        png.encoder().bytes().to_vec()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn written_metadata_reads_back_verbatim() {
        let mut meta = TextMetadata::new();
        meta.embed("prompt", r#"{"3": {"class_type": "KSampler"}}"#);
        meta.embed("workflow", "\u{1f3a8} unicode title");
        meta.embed("latent_base64", "AAAA");

        let bytes = embed_text_chunks(blank_png(), &meta).unwrap();
        assert_eq!(read_text_chunks(&bytes).unwrap(), meta);
    }

    #[test]
    fn file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.png");
        let mut meta = TextMetadata::new();
        meta.embed("k", "v");
        write_png(&path, &DynamicImage::new_rgb8(4, 4), &meta, PngCompression::Default).unwrap();
        assert_eq!(read_text_metadata(&path).unwrap().extract("k"), Some("v"));
    }

    #[test]
    fn duplicate_keywords_keep_last() {
        let bytes = with_raw_chunks(vec![
            PngChunk::new(*b"tEXt", Bytes::from_static(b"conditioning_base64\0first")),
            PngChunk::new(*b"tEXt", Bytes::from_static(b"conditioning_base64\0second")),
        ]);
        let meta = read_text_chunks(&bytes).unwrap();
        assert_eq!(meta.extract("conditioning_base64"), Some("second"));
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn compressed_chunks_are_inflated() {
        let mut ztxt = b"comment\0\0".to_vec();
        ztxt.extend(zlib(b"squeezed"));
        let mut itxt = b"title\0\x01\0en\0\0".to_vec();
        itxt.extend(zlib("\u{732b}".as_bytes()));

        let bytes = with_raw_chunks(vec![
            PngChunk::new(*b"zTXt", Bytes::from(ztxt)),
            PngChunk::new(*b"iTXt", Bytes::from(itxt)),
        ]);
        let meta = read_text_chunks(&bytes).unwrap();
        assert_eq!(meta.extract("comment"), Some("squeezed"));
        assert_eq!(meta.extract("title"), Some("\u{732b}"));
    }

    #[test]
    fn inflate_stops_at_limit() {
        let bomb = zlib(&vec![b'a'; 4096]);
        assert_eq!(inflate_limited(&bomb, 4096).map(|v| v.len()), Some(4096));
        assert_eq!(inflate_limited(&bomb, 1024), None);
    }

    #[test]
    fn oversized_compressed_chunk_is_skipped() {
        let mut ztxt = b"bomb\0\0".to_vec();
        ztxt.extend(zlib(&vec![0u8; MAX_INFLATED_LEN as usize + 1]));
        let bytes = with_raw_chunks(vec![
            PngChunk::new(*b"zTXt", Bytes::from(ztxt)),
            PngChunk::new(*b"tEXt", Bytes::from_static(b"ok\0yes")),
        ]);
        let meta = read_text_chunks(&bytes).unwrap();
        assert_eq!(meta.extract("bomb"), None);
        assert_eq!(meta.extract("ok"), Some("yes"));
    }

    #[test]
    fn malformed_chunk_is_skipped() {
        let bytes = with_raw_chunks(vec![
            PngChunk::new(*b"tEXt", Bytes::from_static(b"no separator")),
            PngChunk::new(*b"tEXt", Bytes::from_static(b"ok\0yes")),
        ]);
        let meta = read_text_chunks(&bytes).unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta.extract("ok"), Some("yes"));
    }

    #[test]
    fn not_a_png() {
        assert!(read_text_chunks(b"GIF89a").unwrap_err().is_format());
    }
}
