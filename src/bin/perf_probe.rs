use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use image::RgbaImage;
use lutgrade::lut::{self, LutId};
use lutgrade::processing::{self, Backend, Compositor, CpuCompositor};
use lutgrade::{FilterEngine, ImageCrateDecoder, MemoryAssetSource, SourceImage};
use rayon::prelude::*;

const PREVIEW_MAX: u32 = 1920;
const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png"];
const INTENSITY: f32 = 0.75;

fn has_extension(path: &Path, exts: &[&str]) -> bool {
    let Some(ext) = path.extension().map(|e| e.to_string_lossy()) else {
        return false;
    };
    exts.iter().any(|known| ext.eq_ignore_ascii_case(known))
}

fn list_images(dir: &Path, limit: usize) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read_dir failed for {}", dir.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_extension(p, IMAGE_EXTS))
        .collect();
    files.sort();
    files.truncate(limit);
    Ok(files)
}

fn median_ms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) * 0.5
    } else {
        sorted[mid]
    }
}

/// Warm-toned stand-in so the probe needs no bundled assets.
fn probe_lut() -> RgbaImage {
    lut::packed_lut_from_fn(|r, g, b| {
        [
            r.saturating_add(24),
            g,
            b.saturating_sub(24),
        ]
    })
}

fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = std::io::Cursor::new(Vec::new());
    img.write_to(&mut bytes, image::ImageFormat::Png)
        .context("encode probe lut")?;
    Ok(bytes.into_inner())
}

fn time_compositor(
    compositor: &dyn Compositor,
    previews: &[RgbaImage],
    lut: &RgbaImage,
) -> Result<Vec<f64>> {
    previews
        .iter()
        .map(|preview| {
            let t0 = Instant::now();
            processing::apply_filter(compositor, preview, lut, INTENSITY)
                .with_context(|| format!("{} compositor failed", compositor.name()))?;
            Ok(t0.elapsed().as_secs_f64() * 1000.0)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args();
    let _bin = args.next();
    let dir = args
        .next()
        .map(PathBuf::from)
        .context("usage: perf_probe <image-dir> [count]")?;
    let count = args
        .next()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(20);

    let files = list_images(&dir, count)?;
    if files.is_empty() {
        anyhow::bail!("No images found in {}", dir.display());
    }
    eprintln!("Using {} images from {}", files.len(), dir.display());

    let decode_start = Instant::now();
    let previews: Vec<RgbaImage> = files
        .par_iter()
        .map(|path| -> Result<RgbaImage> {
            let img = image::open(path)
                .with_context(|| format!("open failed for {}", path.display()))?
                .into_rgba8();
            Ok(processing::fit_within(&img, PREVIEW_MAX, PREVIEW_MAX))
        })
        .collect::<Result<_>>()?;
    let decode_wall_s = decode_start.elapsed().as_secs_f64();

    let lut_image = probe_lut();
    let cpu_samples = time_compositor(&CpuCompositor, &previews, &lut_image)?;
    let gpu_samples = match Backend::Gpu.build() {
        Ok(gpu) => Some(time_compositor(gpu.as_ref(), &previews, &lut_image)?),
        Err(err) => {
            eprintln!("gpu compositor unavailable: {err}");
            None
        }
    };

    let assets = MemoryAssetSource::new().with(LutId::Lut1, encode_png(&lut_image)?);
    let compositor: Arc<dyn Compositor> = Arc::from(Backend::Auto.build()?);
    let engine = FilterEngine::new(
        Arc::new(assets),
        Arc::new(ImageCrateDecoder),
        compositor,
        files.len().max(1),
    )?;
    let sources: Vec<SourceImage> = files
        .iter()
        .zip(previews)
        .map(|(path, pixels)| SourceImage::new(path.to_string_lossy().into_owned(), pixels))
        .collect();

    let lut_start = Instant::now();
    engine
        .load_lut(LutId::Lut1)
        .await
        .context("probe lut did not load")?;
    let lut_load_ms = lut_start.elapsed().as_secs_f64() * 1000.0;

    let mut cold_samples = Vec::with_capacity(sources.len());
    for source in &sources {
        let t0 = Instant::now();
        let _ = engine
            .get_or_process_image(source, LutId::Lut1, INTENSITY)
            .await;
        cold_samples.push(t0.elapsed().as_secs_f64() * 1000.0);
    }
    let mut warm_samples = Vec::with_capacity(sources.len());
    for source in &sources {
        let t0 = Instant::now();
        let _ = engine
            .get_or_process_image(source, LutId::Lut1, INTENSITY)
            .await;
        warm_samples.push(t0.elapsed().as_secs_f64() * 1000.0);
    }

    println!("METRIC file_count={}", files.len());
    println!("METRIC decode_wall_s={:.2}", decode_wall_s);
    println!("METRIC lut_load_ms={:.2}", lut_load_ms);
    println!("METRIC cpu_lut_ms_median={:.2}", median_ms(&cpu_samples));
    match gpu_samples {
        Some(samples) => println!("METRIC gpu_lut_ms_median={:.2}", median_ms(&samples)),
        None => println!("METRIC gpu_lut_ms_median=n/a"),
    }
    println!("METRIC engine_cold_ms_median={:.2}", median_ms(&cold_samples));
    println!("METRIC engine_warm_ms_median={:.2}", median_ms(&warm_samples));
    println!("METRIC engine_compositor={}", engine.compositor_name());
    println!(
        "METRIC result_cache_entries={}",
        engine.cache_size().result_count
    );

    Ok(())
}
