//! # latent-bridge
//!
//! Latent and conditioning interchange for node-based image generation. This
//! crate loads latents from several tensor file formats or over HTTP, moves
//! latents and conditioning through base64 text, and embeds both in the
//! text metadata of saved PNG images.
//!
//! ## Quick Start
//!
//! The pipeline module covers the save side, and the envelope module
//! recovers what was embedded:
//!
//! ```rust,no_run
//! use latent_bridge::config::Config;
//! use latent_bridge::pipeline::{ImageSaveRequest, ImageSaver, extract_base64_payloads};
//! use latent_bridge::tensor::load_latent_file;
//! use latent_bridge::envelope;
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load(Some("config.json".as_ref()))?;
//!
//!     // Load a latent by extension (.latent, .safetensors, .npy, .npz)
//!     let latent = load_latent_file(Path::new("input/sample.latent"))?;
//!
//!     // Save a [B, H, W, C] image batch with the latent embedded
//!     let images = candle_core::Tensor::zeros(
//!         (1, 64, 64, 3), candle_core::DType::F32, &candle_core::Device::Cpu,
//!     )?;
//!     let saver = ImageSaver::from_config(&config);
//!     let request = ImageSaveRequest { latent: Some(&latent), ..Default::default() };
//!     let saved = saver.save_images(&images, &request)?;
//!
//!     // Later: read the blob back out of the PNG
//!     let path = config.paths.output_dir.join(&saved[0].filename);
//!     let payloads = extract_base64_payloads(&path)?;
//!     if let Some(blob) = payloads.latent {
//!         let back = envelope::load_latent_from_base64(&blob)?;
//!         println!("{:?}", back.samples.dims());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Latent Sources
//!
//! | Source | Decoding |
//! |--------|----------|
//! | `.latent` / `.safetensors` | Container entry `latent_tensor`; legacy files without the version marker are divided by 0.18215 |
//! | `.npy` | Raw array, versions 1–3, C or Fortran order |
//! | `.npz` | Entry `latents`, else the first entry with rank > 3 |
//! | URL | Format sniffed from the URL, container format as the fallback |
//! | base64 | Raw `.npy` bytes |
//!
//! Rank-3 arrays gain a leading batch axis.
//!
//! ## Modules
//!
//! - [`config`]: Configuration types and loading/saving
//! - [`conditioning`]: Conditioning entries and their base64 bundle form
//! - [`envelope`]: Base64 envelopes for tensors and latents
//! - [`error`]: Library error type and validation results
//! - [`fetch`]: Latent retrieval over HTTP(S)
//! - [`metadata`]: PNG text chunk reading and writing
//! - [`overlay`]: Text overlay drawing
//! - [`pipeline`]: Image and latent saving, input listing, payload extraction
//! - [`tensor`]: Tensor file formats and the `Latent` type

pub mod conditioning;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fetch;
pub mod metadata;
pub mod overlay;
pub mod pipeline;
pub mod tensor;

pub use error::{Error, Result, Validation};
