use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, GrayImage, Rgb, RgbImage, RgbaImage};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::conditioning::{self, ConditioningEntry};
use crate::envelope;
use crate::error::{Error, Result, Validation};
use crate::metadata::{
    self, Base64Payloads, CONDITIONING_KEY, LATENT_KEY, PngCompression, TextMetadata,
};
use crate::overlay::{self, AssetDir, AssetLocator, FontProvider, GlyphRasterizer, TextLayout};
use crate::tensor::{Latent, npy};

/// Extensions offered when listing latent inputs.
const LATENT_EXTENSIONS: &[&str] = &["latent", "safetensors", "npy", "npz"];

const BATCH_TOKEN: &str = "%batch_num%";

/// Where a save lands: folder, base name, and the next free counter.
///
/// A prefix such as `latents/ComfyUI` yields subfolder `latents` and base
/// name `ComfyUI`. The counter is one past the largest `{name}_{NNNNN}_`
/// counter already present in the folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    pub folder: PathBuf,
    pub filename: String,
    pub counter: u32,
    pub subfolder: String,
}

impl SaveTarget {
    /// Resolve a prefix under `output_dir`, creating the folder.
    ///
    /// `size` is `(width, height)` for image saves and substitutes the
    /// `%width%` / `%height%` tokens.
    pub fn resolve(output_dir: &Path, prefix: &str, size: Option<(u32, u32)>) -> Result<Self> {
        let prefix = match size {
            Some((w, h)) => prefix
                .replace("%width%", &w.to_string())
                .replace("%height%", &h.to_string()),
            None => prefix.to_string(),
        };

        let (subfolder, filename) = match prefix.rfind(['/', '\\']) {
            Some(pos) => (prefix[..pos].to_string(), prefix[pos + 1..].to_string()),
            None => (String::new(), prefix),
        };

        let escapes = Path::new(&subfolder)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::InvalidPath(format!(
                "'{subfolder}' is outside {}",
                output_dir.display()
            )));
        }

        let folder = output_dir.join(&subfolder);
        std::fs::create_dir_all(&folder)?;
        let counter = next_counter(&folder, &filename)?;

        Ok(Self {
            folder,
            filename,
            counter,
            subfolder,
        })
    }
}

fn next_counter(folder: &Path, filename: &str) -> Result<u32> {
    let stem = format!("{filename}_");
    let mut highest = 0;
    for entry in std::fs::read_dir(folder)? {
        let name = entry?.file_name();
        let Some(rest) = name.to_str().and_then(|n| n.strip_prefix(&stem)) else {
            continue;
        };
        let digits = rest.split('_').next().unwrap_or_default();
        if let Ok(n) = digits.parse::<u32>() {
            highest = highest.max(n);
        }
    }
    Ok(highest + 1)
}

/// List latent files directly inside `input_dir`, sorted by name.
pub fn collect_latent_files(input_dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(input_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_latent_file(e.path()))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    files.sort();
    files
}

fn is_latent_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| LATENT_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Pre-flight check that a named input exists.
pub fn validate_latent_file(input_dir: &Path, name: &str) -> Validation {
    if input_dir.join(name).is_file() {
        Validation::Valid
    } else {
        Validation::Rejected(format!("Invalid latent file '{name}'"))
    }
}

/// Save a latent as `{name}_{counter:05}_.npy` and return the file name.
pub fn save_latent_npy(latent: &Latent, output_dir: &Path, prefix: &str) -> Result<String> {
    let target = SaveTarget::resolve(output_dir, prefix, None)?;
    let fname = format!("{}_{:05}_.npy", target.filename, target.counter);
    let path = target.folder.join(&fname);
    std::fs::write(&path, npy::to_bytes(&latent.samples)?)?;
    log::info!("Saved latent {:?} to {}", latent.samples.dims(), path.display());
    Ok(fname)
}

/// Convert one `[H, W, C]` image tensor in `[0, 1]` to 8-bit pixels.
///
/// Values are scaled by 255, clamped, and truncated.
pub fn tensor_to_image(image: &Tensor) -> Result<DynamicImage> {
    let (h, w, c) = image.dims3()?;
    let raw = image
        .to_dtype(DType::F32)?
        .affine(255.0, 0.0)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let (w, h) = (w as u32, h as u32);
    let img = match c {
        1 => GrayImage::from_raw(w, h, raw).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, raw).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(w, h, raw).map(DynamicImage::ImageRgba8),
        _ => None,
    };
    img.ok_or_else(|| Error::format(format!("cannot save an image with {c} channels")))
}

/// Convert decoded pixels to a `[1, H, W, 3]` tensor in `[0, 1]`.
pub fn image_to_tensor(image: &DynamicImage) -> Result<Tensor> {
    let rgb = image.to_rgb8();
    let (w, h) = rgb.dimensions();
    let t = Tensor::from_vec(rgb.into_raw(), (1, h as usize, w as usize, 3), &Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)?;
    Ok(t)
}

/// One saved image, as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedImage {
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Optional payloads attached to an image save. Absent inputs omit their key.
#[derive(Default)]
pub struct ImageSaveRequest<'a> {
    /// Overrides the saver's default prefix.
    pub filename_prefix: Option<&'a str>,
    /// Drawn onto each image when non-empty and a font is configured.
    pub workflow_name: &'a str,
    pub latent: Option<&'a Latent>,
    pub positive: Option<&'a [ConditioningEntry]>,
    pub negative: Option<&'a [ConditioningEntry]>,
    pub prompt: Option<&'a serde_json::Value>,
    pub extra_pnginfo: Option<&'a serde_json::Map<String, serde_json::Value>>,
}

impl ImageSaveRequest<'_> {
    /// Build the text chunks in write order.
    ///
    /// Positive and negative conditioning share [`CONDITIONING_KEY`], so when
    /// both are present only the negative blob is kept.
    pub fn text_metadata(&self) -> Result<TextMetadata> {
        let mut meta = TextMetadata::new();
        if let Some(prompt) = self.prompt {
            meta.embed(metadata::PROMPT_KEY, serde_json::to_string(prompt)?);
        }
        if let Some(extra) = self.extra_pnginfo {
            for (key, value) in extra {
                meta.embed(key.as_str(), serde_json::to_string(value)?);
            }
        }
        if let Some(latent) = self.latent {
            meta.embed(LATENT_KEY, envelope::encode_latent(latent)?);
        }
        if let Some(positive) = self.positive {
            meta.embed(CONDITIONING_KEY, conditioning::encode_conditioning(positive)?);
        }
        if let Some(negative) = self.negative {
            meta.embed(CONDITIONING_KEY, conditioning::encode_conditioning(negative)?);
        }
        Ok(meta)
    }
}

struct OverlayFont {
    font: Box<dyn GlyphRasterizer>,
    color: Rgb<u8>,
}

/// Writes image batches as PNG files carrying text metadata.
pub struct ImageSaver {
    output_dir: PathBuf,
    filename_prefix: String,
    output_type: String,
    compression: PngCompression,
    overlay: Option<OverlayFont>,
}

impl ImageSaver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            filename_prefix: "ComfyUI".to_string(),
            output_type: "output".to_string(),
            compression: PngCompression::from_level(4),
            overlay: None,
        }
    }

    /// A saver configured from [`Config`](crate::config::Config), without a font.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            output_dir: config.paths.output_dir.clone(),
            filename_prefix: config.image.filename_prefix.clone(),
            output_type: config.image.output_type.clone(),
            compression: PngCompression::from_level(config.image.compress_level),
            overlay: None,
        }
    }

    /// A saver configured from `config`, drawing the workflow name with the
    /// configured font, size, and color.
    ///
    /// The font is looked up in `paths.fonts_dir` and loaded through `provider`.
    pub fn from_config_with_fonts(
        config: &crate::config::Config,
        provider: &dyn FontProvider,
    ) -> Result<Self> {
        let fonts = AssetDir::new(&config.paths.fonts_dir);
        Self::from_config(config).with_overlay_font(
            &fonts,
            provider,
            &config.overlay.font_name,
            config.overlay.font_size,
            Rgb(config.overlay.color),
        )
    }

    pub fn with_compression(mut self, compression: PngCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Enable the workflow-name overlay, loading the font now.
    pub fn with_overlay_font(
        mut self,
        locator: &dyn AssetLocator,
        provider: &dyn FontProvider,
        font_name: &str,
        font_size: f32,
        color: Rgb<u8>,
    ) -> Result<Self> {
        let font = overlay::load_font(locator, provider, font_name, font_size)?;
        self.overlay = Some(OverlayFont { font, color });
        Ok(self)
    }

    /// Save every image of a `[B, H, W, C]` batch.
    ///
    /// Files are named `{name}_{counter:05}_.png` with the counter advancing
    /// per image and `%batch_num%` replaced by the batch index.
    pub fn save_images(&self, images: &Tensor, request: &ImageSaveRequest) -> Result<Vec<SavedImage>> {
        let (batch, height, width, _) = images.dims4()?;
        let prefix = request.filename_prefix.unwrap_or(&self.filename_prefix);
        let target = SaveTarget::resolve(&self.output_dir, prefix, Some((width as u32, height as u32)))?;
        let meta = request.text_metadata()?;

        let mut counter = target.counter;
        let mut results = Vec::with_capacity(batch);
        for batch_number in 0..batch {
            let mut img = tensor_to_image(&images.get(batch_number)?)?;

            if !request.workflow_name.is_empty() {
                match &self.overlay {
                    Some(o) => {
                        img = overlay::overlay_text(
                            &img,
                            request.workflow_name,
                            o.font.as_ref(),
                            &TextLayout::default(),
                            o.color,
                        );
                    }
                    None => log::warn!("No overlay font configured, saving without workflow name"),
                }
            }

            let name = target.filename.replace(BATCH_TOKEN, &batch_number.to_string());
            let file = format!("{name}_{counter:05}_.png");
            metadata::write_png(&target.folder.join(&file), &img, &meta, self.compression)?;
            log::info!("Saved {}", target.folder.join(&file).display());

            results.push(SavedImage {
                filename: file,
                subfolder: target.subfolder.clone(),
                kind: self.output_type.clone(),
            });
            counter += 1;
        }
        Ok(results)
    }
}

/// Read the latent and conditioning blobs from a saved PNG.
pub fn extract_base64_payloads(path: &Path) -> Result<Base64Payloads> {
    let meta = metadata::read_text_metadata(path)?;
    let payloads = meta.base64_payloads();
    log::debug!(
        "{}: latent {}, conditioning {}",
        path.display(),
        if payloads.latent.is_some() { "present" } else { "absent" },
        if payloads.conditioning.is_some() { "present" } else { "absent" },
    );
    Ok(payloads)
}
