use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use lutgrade::lut::{self, LutId};
use lutgrade::processing::{Backend, Compositor};
use lutgrade::{EngineConfig, FilterEngine, SourceImage};

#[derive(Parser, Debug)]
#[command(name = "lutgrade", about = "Apply packed-cube LUT filters to images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Filter one image.
    Apply {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "lut1")]
        lut: String,
        #[arg(long, default_value_t = 1.0)]
        intensity: f32,
        /// Directory holding 001.jpeg .. 005.jpeg.
        #[arg(long)]
        lut_dir: Option<PathBuf>,
        /// cpu, gpu or auto.
        #[arg(long)]
        backend: Option<String>,
    },
    /// List the filter catalogue.
    Presets {
        #[arg(long)]
        json: bool,
    },
    /// Write the identity LUT as a PNG.
    Identity {
        #[arg(long)]
        output: PathBuf,
    },
}

fn build_compositor(backend: Backend) -> Result<Arc<dyn Compositor>> {
    let compositor = backend
        .build()
        .with_context(|| format!("could not start {:?} compositor", backend))?;
    eprintln!("lutgrade: compositor = {}", compositor.name());
    Ok(Arc::from(compositor))
}

async fn run_apply(
    config: EngineConfig,
    input: PathBuf,
    output: PathBuf,
    lut_name: &str,
    intensity: f32,
) -> Result<()> {
    let id: LutId = lut_name.parse()?;
    let compositor = build_compositor(config.backend())?;
    let engine = FilterEngine::from_config(&config, compositor)?;

    let pixels = image::open(&input)
        .with_context(|| format!("failed to open {}", input.display()))?
        .into_rgba8();
    let source = SourceImage::new(input.to_string_lossy().into_owned(), pixels);

    if !id.is_normal() && engine.load_lut(id).await.is_none() {
        eprintln!(
            "lutgrade: {} could not be loaded from {}; writing the unfiltered image",
            id,
            config.lut_dir().display()
        );
    }
    let filtered = engine.get_or_process_image(&source, id, intensity).await;
    filtered
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    tracing::info!(lut = %id, intensity, output = %output.display(), "wrote filtered image");
    Ok(())
}

fn run_presets(json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(LutId::presets())?);
        return Ok(());
    }
    for preset in LutId::presets() {
        let asset = preset
            .id
            .asset()
            .map(|a| a.file_name)
            .unwrap_or("-");
        println!("{:<8} {:<14} {}", preset.id, preset.name, asset);
    }
    Ok(())
}

fn run_identity(output: PathBuf) -> Result<()> {
    lut::identity_lut()
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Apply {
            input,
            output,
            lut,
            intensity,
            lut_dir,
            backend,
        } => {
            let mut config = EngineConfig::load();
            if lut_dir.is_some() {
                config.lut_dir = lut_dir;
            }
            if backend.is_some() {
                config.backend = backend;
            }
            run_apply(config, input, output, &lut, intensity).await
        }
        Command::Presets { json } => run_presets(json),
        Command::Identity { output } => run_identity(output),
    }
}
