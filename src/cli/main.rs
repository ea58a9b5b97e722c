use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use latent_bridge::config::Config;
use latent_bridge::fetch::LatentFetcher;
use latent_bridge::metadata::{Base64Payloads, ImageWithMetadata};
use latent_bridge::pipeline::{self, ImageSaveRequest, ImageSaver};
use latent_bridge::tensor::{self, Latent};
use latent_bridge::{conditioning, envelope};

#[derive(Parser, Debug)]
#[command(
    name = "latent-bridge",
    version,
    about = "Load, share, and embed latents and conditioning in base64 and PNG metadata"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config.json and exit
    Init,
    /// List latent files in the input directory
    List,
    /// Load a latent file and print its shape
    Inspect {
        /// Path, or a file name inside the input directory
        file: PathBuf,
    },
    /// Load a latent from a URL and print its shape
    Fetch { url: String },
    /// Print a latent file as a base64 blob
    ToBase64 { file: PathBuf },
    /// Decode a base64 blob from a text file and save it as .npy
    FromBase64 { text_file: PathBuf },
    /// Re-save an image as PNG with a latent embedded
    Embed {
        image: PathBuf,
        /// Latent file to embed
        #[arg(long, value_name = "FILE")]
        latent: Option<PathBuf>,
        /// Workflow name to draw onto the image
        #[arg(long, value_name = "NAME", default_value = "")]
        workflow: String,
    },
    /// Print the latent and conditioning payloads of a PNG
    Extract { png: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let config = match cli.command {
        Command::Init => Config::default(),
        _ => Config::load(cli.config.as_deref())?,
    };

    match cli.command {
        Command::Init => {
            let path = cli.config.as_deref();
            config.save(path)?;
            let save_path = match path {
                Some(p) => p.to_path_buf(),
                None => Config::config_path()?,
            };
            println!("Default config written to {}", save_path.display());
        }
        Command::List => {
            let files = pipeline::collect_latent_files(&config.paths.input_dir);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&files)?);
            } else if files.is_empty() {
                log::info!("No latent files in {}", config.paths.input_dir.display());
            } else {
                for name in files {
                    println!("{name}");
                }
            }
        }
        Command::Inspect { file } => {
            let path = resolve_input(&config, &file)?;
            let latent = tensor::load_latent_file(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            print_latent(&path.display().to_string(), &latent, cli.json)?;
        }
        Command::Fetch { url } => {
            let fetcher = LatentFetcher::new(config.fetch_timeout());
            let latent = fetcher.fetch_latent(&url).await?;
            print_latent(&url, &latent, cli.json)?;
        }
        Command::ToBase64 { file } => {
            let path = resolve_input(&config, &file)?;
            let latent = tensor::load_latent_file(&path)?;
            println!("{}", envelope::encode_latent(&latent)?);
        }
        Command::FromBase64 { text_file } => {
            let blob = std::fs::read_to_string(&text_file)
                .with_context(|| format!("Failed to read {}", text_file.display()))?;
            if let Some(msg) = envelope::validate_base64_latent(&blob).message() {
                anyhow::bail!("{msg}");
            }
            let latent = envelope::load_latent_from_base64(&blob)?;
            let name = pipeline::save_latent_npy(
                &latent,
                &config.paths.output_dir,
                &config.latent.filename_prefix,
            )?;
            if cli.json {
                println!("{}", serde_json::json!({ "filename": name, "shape": latent.samples.dims() }));
            } else {
                println!("Saved {name}");
            }
        }
        Command::Embed {
            image: input,
            latent,
            workflow,
        } => {
            let pixels = image::open(&input)
                .with_context(|| format!("Failed to open image {}", input.display()))?;
            let images = pipeline::image_to_tensor(&pixels)?;
            let latent = match latent {
                Some(p) => Some(tensor::load_latent_file(&resolve_input(&config, &p)?)?),
                None => None,
            };

            let request = ImageSaveRequest {
                workflow_name: &workflow,
                latent: latent.as_ref(),
                ..Default::default()
            };
            let saved = ImageSaver::from_config(&config).save_images(&images, &request)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&saved)?);
            } else {
                for s in &saved {
                    println!("Saved {}", Path::new(&s.subfolder).join(&s.filename).display());
                }
            }
        }
        Command::Extract { png } => {
            let img = ImageWithMetadata::open(&png)
                .with_context(|| format!("Failed to read {}", png.display()))?;
            print_payloads(&img.base64_payloads(), cli.json)?;
        }
    }

    Ok(())
}

/// Accept either a path or a bare name inside the input directory.
fn resolve_input(config: &Config, file: &Path) -> Result<PathBuf> {
    if file.is_file() {
        return Ok(file.to_path_buf());
    }
    let name = file.to_string_lossy();
    if let Some(msg) = pipeline::validate_latent_file(&config.paths.input_dir, &name).message() {
        anyhow::bail!("{msg}");
    }
    Ok(config.paths.input_dir.join(file))
}

fn print_latent(source: &str, latent: &Latent, json: bool) -> Result<()> {
    let dims = latent.samples.dims();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "source": source,
                "shape": dims,
                "dtype": format!("{:?}", latent.samples.dtype()),
            }))?
        );
    } else {
        println!("{source}: {dims:?}");
    }
    Ok(())
}

fn print_payloads(payloads: &Base64Payloads, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "latent_base64": payloads.latent,
                "conditioning_base64": payloads.conditioning,
            }))?
        );
        return Ok(());
    }

    match &payloads.latent {
        Some(blob) => match envelope::decode_tensor(blob) {
            Ok(latent) => println!("latent: {:?} ({} chars)", latent.samples.dims(), blob.len()),
            Err(e) => println!("latent: undecodable ({e})"),
        },
        None => println!("latent: none"),
    }
    match &payloads.conditioning {
        Some(blob) => match conditioning::decode_conditioning(blob) {
            Ok(entries) => {
                for entry in &entries {
                    let keys: Vec<&str> = entry.meta.keys().map(String::as_str).collect();
                    println!("conditioning: {:?} meta {keys:?}", entry.data.dims());
                }
            }
            Err(e) => println!("conditioning: undecodable ({e})"),
        },
        None => println!("conditioning: none"),
    }
    Ok(())
}
