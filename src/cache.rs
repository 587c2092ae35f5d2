use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use image::RgbaImage;

use crate::error::ContractError;
use crate::lut::LutId;
use crate::processing::clamp_intensity;

pub const DEFAULT_MAX_ENTRIES: usize = 20;

/// Intensity steps per unit; keys keep two decimal digits.
const INTENSITY_STEPS: f32 = 100.0;

/// Parameters of one filtered-image request. Only used to derive a key.
#[derive(Debug, Clone)]
pub struct FilterRequest<'a> {
    pub source_id: &'a Arc<str>,
    pub width: u32,
    pub height: u32,
    pub lut: LutId,
    pub intensity: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    source_id: Arc<str>,
    width: u32,
    height: u32,
    lut: LutId,
    intensity_step: u8,
}

impl FilterRequest<'_> {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            source_id: Arc::clone(self.source_id),
            width: self.width,
            height: self.height,
            lut: self.lut,
            intensity_step: quantize_intensity(self.intensity),
        }
    }
}

impl CacheKey {
    pub fn lut(&self) -> LutId {
        self.lut
    }

    /// The intensity the cached image was rendered with.
    pub fn intensity(&self) -> f32 {
        f32::from(self.intensity_step) / INTENSITY_STEPS
    }
}

/// Clamps then rounds to hundredths: `0.004 -> 0`, `0.126 -> 13`.
pub fn quantize_intensity(intensity: f32) -> u8 {
    (clamp_intensity(intensity) * INTENSITY_STEPS).round() as u8
}

/// Bounded map of rendered images with first-in-first-out eviction.
///
/// `order` holds every key exactly once, oldest insertion at the front.
/// Lookups do not reorder entries.
#[derive(Debug)]
pub struct ResultCache {
    entries: HashMap<CacheKey, Arc<RgbaImage>>,
    order: VecDeque<CacheKey>,
    max_entries: usize,
    /// Bumped by `clear` and `remove_lut`.
    generation: u64,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Result<Self, ContractError> {
        check_size(max_entries)?;
        Ok(Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
            generation: 0,
        })
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<RgbaImage>> {
        self.entries.get(key).cloned()
    }

    /// Stores `image` unless `key` is already present, and returns whichever
    /// image the cache holds for `key` afterwards.
    pub fn insert(&mut self, key: CacheKey, image: Arc<RgbaImage>) -> Arc<RgbaImage> {
        if let Some(existing) = self.entries.get(&key) {
            return existing.clone();
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, image.clone());
        self.evict_overflow();
        image
    }

    /// Like [`insert`](Self::insert), but only if nothing was cleared since
    /// `generation` was read. `None` means the image was not stored.
    pub fn insert_if_current(
        &mut self,
        key: CacheKey,
        image: Arc<RgbaImage>,
        generation: u64,
    ) -> Option<Arc<RgbaImage>> {
        if generation != self.generation {
            return None;
        }
        Some(self.insert(key, image))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn set_max_entries(&mut self, max_entries: usize) -> Result<(), ContractError> {
        check_size(max_entries)?;
        self.max_entries = max_entries;
        self.evict_overflow();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.generation += 1;
    }

    /// Drops every entry rendered with `lut`; returns how many were removed.
    pub fn remove_lut(&mut self, lut: LutId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.lut != lut);
        self.order.retain(|key| key.lut != lut);
        self.generation += 1;
        before - self.entries.len()
    }

    fn evict_overflow(&mut self) {
        while self.order.len() > self.max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

fn check_size(max_entries: usize) -> Result<(), ContractError> {
    if max_entries == 0 {
        return Err(ContractError::InvalidCacheSize(max_entries));
    }
    Ok(())
}
