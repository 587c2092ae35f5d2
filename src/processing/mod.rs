pub mod cpu;
pub mod gpu;

use std::sync::{
    OnceLock,
    atomic::{AtomicBool, Ordering},
};

use image::{DynamicImage, RgbaImage};
use tracing::{debug, warn};

use crate::error::FilterError;
use crate::lut;

pub use cpu::CpuCompositor;
pub use gpu::GpuCompositor;

/// A backend that remaps source colors through a packed LUT.
///
/// Implementations may assume the LUT has already passed
/// [`lut::validate_dimensions`]; go through [`apply_filter`] to get that.
pub trait Compositor: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        source: &RgbaImage,
        lut: &RgbaImage,
        intensity: f32,
    ) -> Result<RgbaImage, FilterError>;
}

/// Validates the LUT, then runs `compositor`.
///
/// A LUT of the wrong size never reaches the backend.
pub fn apply_filter(
    compositor: &dyn Compositor,
    source: &RgbaImage,
    lut: &RgbaImage,
    intensity: f32,
) -> Result<RgbaImage, FilterError> {
    lut::validate_dimensions(lut)?;
    compositor.apply(source, lut, clamp_intensity(intensity))
}

/// Clamps to `[0, 1]`; NaN becomes 0.
pub fn clamp_intensity(intensity: f32) -> f32 {
    if intensity.is_nan() {
        0.0
    } else {
        intensity.clamp(0.0, 1.0)
    }
}

/// Shrinks `source` to fit within `max_w` x `max_h`, keeping aspect ratio.
/// Images that already fit are returned as-is.
pub fn fit_within(source: &RgbaImage, max_w: u32, max_h: u32) -> RgbaImage {
    let max_w = max_w.max(1);
    let max_h = max_h.max(1);
    if source.width() <= max_w && source.height() <= max_h {
        return source.clone();
    }
    DynamicImage::ImageRgba8(source.clone())
        .thumbnail(max_w, max_h)
        .into_rgba8()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Cpu,
    Gpu,
    Auto,
}

pub fn parse_backend(value: &str) -> Backend {
    match value.trim().to_ascii_lowercase().as_str() {
        "cpu" => Backend::Cpu,
        "gpu" | "wgpu" | "shader" => Backend::Gpu,
        _ => Backend::Auto,
    }
}

impl Backend {
    pub fn build(self) -> Result<Box<dyn Compositor>, FilterError> {
        match self {
            Backend::Cpu => Ok(Box::new(CpuCompositor)),
            Backend::Gpu => Ok(Box::new(GpuCompositor::new()?)),
            Backend::Auto => Ok(Box::new(AutoCompositor::new())),
        }
    }
}

/// Prefers the GPU and drops to the CPU when the device is missing or a
/// dispatch fails. The device is created on first use.
pub struct AutoCompositor {
    gpu: OnceLock<Option<GpuCompositor>>,
    cpu: CpuCompositor,
    fallback_reported: AtomicBool,
}

impl AutoCompositor {
    pub fn new() -> Self {
        Self {
            gpu: OnceLock::new(),
            cpu: CpuCompositor,
            fallback_reported: AtomicBool::new(false),
        }
    }

    fn gpu(&self) -> Option<&GpuCompositor> {
        self.gpu
            .get_or_init(|| match GpuCompositor::new() {
                Ok(gpu) => {
                    debug!(adapter = %gpu.status().describe(), "gpu compositor ready");
                    Some(gpu)
                }
                Err(err) => {
                    debug!(%err, "gpu compositor unavailable");
                    None
                }
            })
            .as_ref()
    }

    fn report_fallback_once(&self, err: &FilterError) {
        if !self.fallback_reported.swap(true, Ordering::Relaxed) {
            warn!(%err, "gpu lut pass failed; falling back to cpu");
        }
    }
}

impl Default for AutoCompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compositor for AutoCompositor {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn apply(
        &self,
        source: &RgbaImage,
        lut: &RgbaImage,
        intensity: f32,
    ) -> Result<RgbaImage, FilterError> {
        match self.gpu() {
            Some(gpu) => match gpu.apply(source, lut, intensity) {
                Ok(out) => Ok(out),
                Err(err @ FilterError::InvalidLutDimensions { .. }) => Err(err),
                Err(err) => {
                    self.report_fallback_once(&err);
                    self.cpu.apply(source, lut, intensity)
                }
            },
            None => {
                self.report_fallback_once(&FilterError::GpuUnavailable);
                self.cpu.apply(source, lut, intensity)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{ImageBuffer, Rgba, RgbaImage};

    use super::*;
    use crate::lut::identity_lut;

    struct Counting(AtomicUsize);

    impl Compositor for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn apply(
            &self,
            source: &RgbaImage,
            _lut: &RgbaImage,
            _intensity: f32,
        ) -> Result<RgbaImage, FilterError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(source.clone())
        }
    }

    #[test]
    fn wrong_lut_size_is_rejected_before_backend_runs() {
        let backend = Counting(AtomicUsize::new(0));
        let src = ImageBuffer::from_pixel(2, 2, Rgba([1, 2, 3, 255]));
        let err = apply_filter(&backend, &src, &RgbaImage::new(64, 512), 1.0).unwrap_err();
        assert!(matches!(err, FilterError::InvalidLutDimensions { width: 64, .. }));
        assert_eq!(backend.0.load(Ordering::SeqCst), 0);

        apply_filter(&backend, &src, &identity_lut(), 1.0).expect("valid lut should pass");
        assert_eq!(backend.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn intensity_is_clamped_and_nan_is_zero() {
        assert_eq!(clamp_intensity(-0.5), 0.0);
        assert_eq!(clamp_intensity(1.7), 1.0);
        assert_eq!(clamp_intensity(f32::NAN), 0.0);
        assert_eq!(clamp_intensity(0.42), 0.42);
    }

    #[test]
    fn fit_within_keeps_aspect_and_never_upscales() {
        let wide: RgbaImage = ImageBuffer::from_pixel(400, 200, Rgba([0, 0, 0, 255]));
        assert_eq!(fit_within(&wide, 100, 100).dimensions(), (100, 50));
        let small: RgbaImage = ImageBuffer::from_pixel(10, 20, Rgba([0, 0, 0, 255]));
        assert_eq!(fit_within(&small, 100, 100).dimensions(), (10, 20));
    }

    #[test]
    fn parse_backend_handles_supported_values() {
        assert_eq!(parse_backend("cpu"), Backend::Cpu);
        assert_eq!(parse_backend(" GPU "), Backend::Gpu);
        assert_eq!(parse_backend("wgpu"), Backend::Gpu);
        assert_eq!(parse_backend("auto"), Backend::Auto);
        assert_eq!(parse_backend("quantum"), Backend::Auto);
    }

    #[test]
    fn auto_compositor_produces_cpu_equivalent_output() {
        let src: RgbaImage = ImageBuffer::from_fn(16, 8, |x, y| {
            Rgba([(x * 15) as u8, (y * 30) as u8, ((x + y) * 9) as u8, 255])
        });
        let lut = crate::lut::packed_lut_from_fn(|r, g, b| [255 - r, 255 - g, 255 - b]);
        let auto = AutoCompositor::new().apply(&src, &lut, 0.6).expect("auto apply");
        let cpu = CpuCompositor.apply(&src, &lut, 0.6).expect("cpu apply");
        assert_eq!(auto.dimensions(), cpu.dimensions());
        for (a, c) in auto.pixels().zip(cpu.pixels()) {
            for i in 0..4 {
                assert!(a[i].abs_diff(c[i]) <= 1);
            }
        }
    }
}
