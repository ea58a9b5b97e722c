//! `.npz` archives: a zip file whose members are `.npy` arrays.

use candle_core::Tensor;
use std::io::{Cursor, Read, Seek, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::npy;
use crate::error::{Error, Result};

const NPY_SUFFIX: &str = ".npy";

/// Read-side view over an archive of named members.
pub struct NpzReader<R: Read + Seek> {
    archive: ZipArchive<R>,
}

impl<'a> NpzReader<Cursor<&'a [u8]>> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        Self::new(Cursor::new(bytes))
    }
}

impl<R: Read + Seek> NpzReader<R> {
    pub fn new(reader: R) -> Result<Self> {
        let archive = ZipArchive::new(reader)
            .map_err(|e| Error::format_with("not a readable npz archive", e))?;
        Ok(Self { archive })
    }

    /// Member names in central-directory order, as stored.
    pub fn member_names(&mut self) -> Result<Vec<String>> {
        (0..self.archive.len())
            .map(|i| {
                self.archive
                    .by_index(i)
                    .map(|f| f.name().to_string())
                    .map_err(|e| Error::format_with(format!("unreadable archive member #{i}"), e))
            })
            .collect()
    }

    /// Raw bytes of a member, or a format error naming it.
    pub fn member_bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut file = self
            .archive
            .by_name(name)
            .map_err(|e| Error::format_with(format!("archive has no member '{name}'"), e))?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)
            .map_err(|e| Error::format_with(format!("corrupt archive member '{name}'"), e))?;
        Ok(buf)
    }

    /// Decode the array stored under `name` (without the `.npy` suffix).
    pub fn array(&mut self, name: &str) -> Result<Tensor> {
        let bytes = self.member_bytes(&format!("{name}{NPY_SUFFIX}"))?;
        npy::from_bytes(&bytes)
            .map_err(|e| Error::format_with(format!("archive member '{name}' is not an array"), e))
    }

    /// Every `.npy` member, decoded, in archive order.
    pub fn arrays(&mut self) -> Result<Vec<(String, Tensor)>> {
        let names: Vec<String> = self
            .member_names()?
            .into_iter()
            .filter_map(|n| n.strip_suffix(NPY_SUFFIX).map(str::to_string))
            .collect();
        names
            .into_iter()
            .map(|name| {
                let tensor = self.array(&name)?;
                Ok((name, tensor))
            })
            .collect()
    }
}

/// Write-side builder producing an in-memory archive.
pub struct NpzWriter {
    zip: ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
}

impl NpzWriter {
    /// `compressed` selects deflate (`savez_compressed`) over stored members (`savez`).
    pub fn new(compressed: bool) -> Self {
        let method = if compressed {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        Self {
            zip: ZipWriter::new(Cursor::new(Vec::new())),
            options: SimpleFileOptions::default().compression_method(method),
        }
    }

    pub fn add_array(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        let bytes = npy::to_bytes(tensor)?;
        self.add_bytes(&format!("{name}{NPY_SUFFIX}"), &bytes)
    }

    pub fn add_bytes(&mut self, member: &str, bytes: &[u8]) -> Result<()> {
        self.zip
            .start_file(member, self.options)
            .map_err(|e| Error::format_with(format!("cannot add archive member '{member}'"), e))?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let cursor = self
            .zip
            .finish()
            .map_err(|e| Error::format_with("cannot finalize archive", e))?;
        Ok(cursor.into_inner())
    }
}

/// Pick the latent from a multi-array archive: the `latents` entry when
/// present, otherwise the first entry with rank greater than 3.
pub fn select_latent(entries: Vec<(String, Tensor)>) -> Result<Tensor> {
    let mut fallback = None;
    for (name, tensor) in entries {
        if name == "latents" {
            return Ok(tensor);
        }
        if fallback.is_none() && tensor.rank() > 3 {
            fallback = Some(tensor);
        }
    }
    fallback.ok_or_else(|| {
        Error::format("archive has no 'latents' entry and no entry with rank > 3")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, candle_core::DType::F32, &Device::Cpu).unwrap()
    }

    fn archive(entries: &[(&str, &Tensor)], compressed: bool) -> Vec<u8> {
        let mut w = NpzWriter::new(compressed);
        for (name, t) in entries {
            w.add_array(name, t).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn arrays_keep_archive_order() {
        let a = zeros(&[2]);
        let b = zeros(&[1, 4, 2, 2]);
        let bytes = archive(&[("zeta", &a), ("alpha", &b)], false);
        let names: Vec<String> = NpzReader::from_bytes(&bytes)
            .unwrap()
            .arrays()
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn compressed_members_decode() {
        let t = Tensor::from_vec(vec![1.5f32; 64], (1, 4, 4, 4), &Device::Cpu).unwrap();
        let bytes = archive(&[("latents", &t)], true);
        let back = NpzReader::from_bytes(&bytes).unwrap().array("latents").unwrap();
        assert_eq!(back.dims(), &[1, 4, 4, 4]);
        assert_eq!(back.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![1.5; 64]);
    }

    #[test]
    fn missing_member_names_it() {
        let bytes = archive(&[("a", &zeros(&[1]))], false);
        let err = NpzReader::from_bytes(&bytes).unwrap().array("b").unwrap_err();
        assert!(err.is_format());
        assert!(err.to_string().contains("b.npy"));
    }

    #[test]
    fn corrupt_archive_is_format_error() {
        let err = NpzReader::from_bytes(b"not a zip").err().unwrap();
        assert!(err.is_format());
    }

    // ── select_latent ────────────────────────────────────────────────

    #[test]
    fn select_prefers_latents_entry() {
        let other = zeros(&[1, 4, 8, 8]);
        let latents = zeros(&[2, 4, 8, 8]);
        let picked = select_latent(vec![("other".into(), other), ("latents".into(), latents)]).unwrap();
        assert_eq!(picked.dims(), &[2, 4, 8, 8]);
    }

    #[test]
    fn select_falls_back_to_first_rank4() {
        let picked = select_latent(vec![
            ("small".into(), zeros(&[4, 8, 8])),
            ("first".into(), zeros(&[1, 4, 2, 2])),
            ("second".into(), zeros(&[1, 4, 3, 3])),
        ])
        .unwrap();
        assert_eq!(picked.dims(), &[1, 4, 2, 2]);
    }

    #[test]
    fn select_without_candidates_fails() {
        let err = select_latent(vec![("flat".into(), zeros(&[16]))]).unwrap_err();
        assert!(err.is_format());
        assert!(err.to_string().contains("latents"));
    }
}
