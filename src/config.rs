use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for latent-bridge.
///
/// Controls where inputs are read from and outputs written to, the network
/// timeout for URL loads, PNG encoding, and the workflow-name overlay.
///
/// # Loading
///
/// ```rust,no_run
/// use latent_bridge::config::Config;
///
/// // From a JSON file
/// let config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.image.compress_level = 9;
/// config.fetch.timeout_secs = 30;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Input, output, and font directories.
    pub paths: PathsConfig,
    /// URL retrieval settings.
    pub fetch: FetchConfig,
    /// Image save settings.
    pub image: ImageConfig,
    /// Latent `.npy` save settings.
    pub latent: LatentConfig,
    /// Workflow-name overlay settings.
    pub overlay: OverlayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub fonts_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-request timeout, in seconds.
    pub timeout_secs: u64,
}

/// Controls how images are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// zlib-style level, 0–9.
    pub compress_level: u8,
    /// Filename prefix, may contain a subfolder and `%width%`, `%height%`,
    /// `%batch_num%` tokens.
    pub filename_prefix: String,
    /// Tag reported with each saved image (`output`, `temp`, ...).
    pub output_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatentConfig {
    pub filename_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Font file name, resolved inside `paths.fonts_dir`.
    pub font_name: String,
    pub font_size: f32,
    /// RGB color of the drawn text.
    pub color: [u8; 3],
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            fonts_dir: PathBuf::from("fonts"),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { timeout_secs: 16 }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            compress_level: 4,
            filename_prefix: "ComfyUI".to_string(),
            output_type: "output".to_string(),
        }
    }
}

impl Default for LatentConfig {
    fn default() -> Self {
        Self {
            filename_prefix: "latents/ComfyUI".to_string(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            font_name: "Roboto-Regular.ttf".to_string(),
            font_size: 30.0,
            color: [255, 255, 255],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            fetch: FetchConfig::default(),
            image: ImageConfig::default(),
            latent: LatentConfig::default(),
            overlay: OverlayConfig::default(),
        }
    }
}

impl Config {
    /// Resolve the config file path: `config.json` next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }

    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch.timeout_secs)
    }
}
