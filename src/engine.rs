use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{FilterRequest, ResultCache};
use crate::config::EngineConfig;
use crate::error::{ContractError, FilterError};
use crate::layer::{FilterParams, FilterPhase, LayerFilter};
use crate::loader::{AssetSource, DirAssetSource, ImageCrateDecoder, LutDecoder, LutLoader};
use crate::lut::{LutId, LutTexture};
use crate::processing::{self, Compositor};

/// How many catalogue successors `preload_neighbours` warms up.
const PRELOAD_AHEAD: usize = 2;

/// A caller-identified source raster.
///
/// The id is what the result cache keys on, so two different images must not
/// share one.
#[derive(Debug, Clone)]
pub struct SourceImage {
    id: Arc<str>,
    pixels: Arc<RgbaImage>,
}

impl SourceImage {
    pub fn new(id: impl Into<Arc<str>>, pixels: impl Into<Arc<RgbaImage>>) -> Self {
        Self {
            id: id.into(),
            pixels: pixels.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pixels(&self) -> &Arc<RgbaImage> {
        &self.pixels
    }

    fn request(&self, lut: LutId, intensity: f32) -> FilterRequest<'_> {
        FilterRequest {
            source_id: &self.id,
            width: self.pixels.width(),
            height: self.pixels.height(),
            lut,
            intensity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheSize {
    pub lut_count: usize,
    pub result_count: usize,
}

/// LUT filtering service: owns the texture loader, the compositor and the
/// result cache. Construct one per canvas (or per test).
pub struct FilterEngine {
    loader: LutLoader,
    compositor: Arc<dyn Compositor>,
    results: Mutex<ResultCache>,
}

impl FilterEngine {
    pub fn new(
        source: Arc<dyn AssetSource>,
        decoder: Arc<dyn LutDecoder>,
        compositor: Arc<dyn Compositor>,
        max_cache_size: usize,
    ) -> Result<Self, ContractError> {
        Ok(Self {
            loader: LutLoader::new(source, decoder),
            compositor,
            results: Mutex::new(ResultCache::new(max_cache_size)?),
        })
    }

    /// Engine reading LUTs from `config.lut_dir` with the image crate.
    pub fn from_config(
        config: &EngineConfig,
        compositor: Arc<dyn Compositor>,
    ) -> Result<Self, ContractError> {
        Self::new(
            Arc::new(DirAssetSource::new(config.lut_dir())),
            Arc::new(ImageCrateDecoder),
            compositor,
            config.max_cache_size(),
        )
    }

    pub fn compositor_name(&self) -> &'static str {
        self.compositor.name()
    }

    pub async fn load_lut(&self, id: LutId) -> Option<Arc<LutTexture>> {
        self.loader.load(id).await
    }

    /// Warms the LUTs after `id` in the catalogue, the ones a user browsing
    /// the filter strip is likely to pick next.
    pub fn preload_neighbours(&self, id: LutId) {
        self.loader.preload(&id.next_in_catalogue(PRELOAD_AHEAD));
    }

    /// Runs the compositor synchronously. `None` on any failure.
    pub fn apply_filter(
        &self,
        source: &RgbaImage,
        lut: &RgbaImage,
        intensity: f32,
        id: LutId,
    ) -> Option<RgbaImage> {
        match processing::apply_filter(&*self.compositor, source, lut, intensity) {
            Ok(out) => Some(out),
            Err(err) => {
                warn!(lut = %id, %err, "lut filter failed");
                None
            }
        }
    }

    /// The filtered image for `(source, id, intensity)`, from cache when
    /// possible.
    ///
    /// Pass-through cases return `source.pixels()` itself and are not cached:
    /// `Normal`, an intensity that rounds to 0, a LUT that fails to load, and
    /// a compositor failure. A render that finishes after `clear_cache` or
    /// `clear_filter_cache` is returned but not stored.
    pub async fn get_or_process_image(
        &self,
        source: &SourceImage,
        id: LutId,
        intensity: f32,
    ) -> Arc<RgbaImage> {
        let key = source.request(id, intensity).key();
        let generation = {
            let results = self.results.lock();
            if let Some(hit) = results.get(&key) {
                debug!(lut = %id, source = source.id(), "result cache hit");
                return hit;
            }
            results.generation()
        };
        if id.is_normal() || key.intensity() == 0.0 {
            return source.pixels.clone();
        }
        let Some(texture) = self.loader.load(id).await else {
            return source.pixels.clone();
        };

        let compositor = self.compositor.clone();
        let pixels = source.pixels.clone();
        let quantized = key.intensity();
        let rendered = tokio::task::spawn_blocking(move || {
            processing::apply_filter(&*compositor, &pixels, texture.image(), quantized)
        })
        .await
        .unwrap_or_else(|err| {
            Err(FilterError::SurfaceAllocationFailure(format!(
                "compositor task failed: {err}"
            )))
        });

        match rendered {
            Ok(out) => {
                let image = Arc::new(out);
                let stored = self
                    .results
                    .lock()
                    .insert_if_current(key, image.clone(), generation);
                match stored {
                    Some(stored) => {
                        debug!(lut = %id, source = source.id(), intensity = quantized, "filtered image cached");
                        stored
                    }
                    None => {
                        debug!(lut = %id, source = source.id(), "cache cleared during render; result not stored");
                        image
                    }
                }
            }
            Err(err) => {
                warn!(lut = %id, %err, "lut filter failed; showing unfiltered source");
                source.pixels.clone()
            }
        }
    }

    /// Downscales `source` to fit the box, then filters it. Not cached.
    pub async fn create_preview(
        &self,
        source: &RgbaImage,
        id: LutId,
        intensity: f32,
        max_width: u32,
        max_height: u32,
    ) -> RgbaImage {
        let thumbnail = processing::fit_within(source, max_width, max_height);
        if id.is_normal() {
            return thumbnail;
        }
        let Some(texture) = self.loader.load(id).await else {
            return thumbnail;
        };
        self.apply_filter(&thumbnail, texture.image(), intensity, id)
            .unwrap_or(thumbnail)
    }

    /// Requests a new image for `layer` and applies it unless a newer request
    /// for the same layer was made in the meantime.
    pub async fn refresh_layer(
        &self,
        layer: &LayerFilter,
        source: &SourceImage,
        params: FilterParams,
    ) -> FilterPhase {
        let ticket = layer.request(params);
        let image = self
            .get_or_process_image(source, params.lut, params.intensity)
            .await;
        layer.resolve(ticket, image)
    }

    /// Drops all rendered results and all LUT textures.
    pub fn clear_cache(&self) {
        self.results.lock().clear();
        self.loader.clear();
    }

    /// Drops rendered results for one filter. Its texture stays loaded.
    pub fn clear_filter_cache(&self, id: LutId) -> usize {
        let removed = self.results.lock().remove_lut(id);
        debug!(lut = %id, removed, "cleared filter results");
        removed
    }

    pub fn set_max_cache_size(&self, max_entries: usize) -> Result<(), ContractError> {
        self.results.lock().set_max_entries(max_entries)
    }

    pub fn cache_size(&self) -> CacheSize {
        CacheSize {
            lut_count: self.loader.texture_count(),
            result_count: self.results.lock().len(),
        }
    }
}
