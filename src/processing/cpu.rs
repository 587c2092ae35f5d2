use image::RgbaImage;
use rayon::prelude::*;

use super::Compositor;
use crate::error::FilterError;
use crate::lut;

/// Reference LUT pass. The table lookup matches the WGSL shader exactly; the
/// blend agrees with the shader's `mix` and unorm store to within 1 LSB.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuCompositor;

impl Compositor for CpuCompositor {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn apply(
        &self,
        source: &RgbaImage,
        lut: &RgbaImage,
        intensity: f32,
    ) -> Result<RgbaImage, FilterError> {
        lut::validate_dimensions(lut)?;
        let t = super::clamp_intensity(intensity);
        let mut out = source.clone();
        out.par_chunks_mut(4).for_each(|px| {
            let (x, y) = lut::lookup_coord(px[0], px[1], px[2]);
            let mapped = lut.get_pixel(x, y);
            for c in 0..3 {
                px[c] = blend(px[c], mapped[c], t);
            }
        });
        Ok(out)
    }
}

/// `round(src + (mapped - src) * t)`
#[inline]
pub fn blend(src: u8, mapped: u8, t: f32) -> u8 {
    let s = f32::from(src);
    (s + (f32::from(mapped) - s) * t).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgba, RgbaImage};

    use super::*;
    use crate::lut::{identity_lut, packed_lut_from_fn};

    fn gradient(w: u32, h: u32) -> RgbaImage {
        ImageBuffer::from_fn(w, h, |x, y| {
            Rgba([
                ((x * 7 + y * 3) % 256) as u8,
                ((x * 11 + y * 5) % 256) as u8,
                ((x * 13 + y * 17) % 256) as u8,
                ((x * 3 + 200) % 256) as u8,
            ])
        })
    }

    fn inverting_lut() -> RgbaImage {
        packed_lut_from_fn(|r, g, b| [255 - r, 255 - g, 255 - b])
    }

    fn distance(a: &Rgba<u8>, b: &Rgba<u8>) -> u32 {
        (0..3).map(|c| u32::from(a[c].abs_diff(b[c]))).sum()
    }

    #[test]
    fn zero_intensity_returns_source() {
        let src = gradient(32, 24);
        let out = CpuCompositor.apply(&src, &inverting_lut(), 0.0).unwrap();
        assert_eq!(out.as_raw(), src.as_raw());
    }

    #[test]
    fn full_intensity_is_pure_lut_color() {
        let src = gradient(32, 24);
        let lut = inverting_lut();
        let out = CpuCompositor.apply(&src, &lut, 1.0).unwrap();
        for (s, o) in src.pixels().zip(out.pixels()) {
            let (x, y) = lut::lookup_coord(s[0], s[1], s[2]);
            let mapped = lut.get_pixel(x, y);
            assert_eq!(&o.0[..3], &mapped.0[..3]);
            assert_eq!(o[3], s[3], "alpha comes from the source");
        }
    }

    #[test]
    fn distance_from_source_grows_with_intensity() {
        let src = gradient(24, 16);
        let lut = inverting_lut();
        let steps = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0];
        let outputs: Vec<RgbaImage> = steps
            .iter()
            .map(|&t| CpuCompositor.apply(&src, &lut, t).unwrap())
            .collect();
        for pair in outputs.windows(2) {
            for ((s, lo), hi) in src.pixels().zip(pair[0].pixels()).zip(pair[1].pixels()) {
                assert!(distance(s, hi) >= distance(s, lo));
            }
        }
    }

    #[test]
    fn identity_lut_only_moves_colors_within_a_cell() {
        let src = gradient(32, 32);
        let out = CpuCompositor.apply(&src, &identity_lut(), 1.0).unwrap();
        for (s, o) in src.pixels().zip(out.pixels()) {
            for c in 0..3 {
                assert!(s[c].abs_diff(o[c]) <= 3);
            }
        }
    }

    #[test]
    fn output_keeps_source_dimensions() {
        let src = gradient(7, 3);
        let out = CpuCompositor.apply(&src, &identity_lut(), 0.5).unwrap();
        assert_eq!(out.dimensions(), (7, 3));
    }

    #[test]
    fn blend_rounds_to_nearest() {
        assert_eq!(blend(0, 255, 0.5), 128);
        assert_eq!(blend(10, 20, 0.25), 13);
        assert_eq!(blend(200, 100, 1.0), 100);
    }
}
