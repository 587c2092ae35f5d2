use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lut::LutId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub lut: LutId,
    pub intensity: f32,
}

impl FilterParams {
    pub fn new(lut: LutId, intensity: f32) -> Self {
        Self { lut, intensity }
    }
}

impl Default for FilterParams {
    fn default() -> Self {
        Self::new(LutId::Normal, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPhase {
    Idle,
    Loading,
    Applied,
    Superseded,
}

/// Handed out per request; identifies the generation it was made in.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use]
pub struct FilterTicket {
    generation: u64,
    params: FilterParams,
}

impl FilterTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn params(&self) -> FilterParams {
        self.params
    }
}

#[derive(Debug)]
struct LayerState {
    generation: u64,
    phase: FilterPhase,
    applied: Option<(FilterParams, Arc<RgbaImage>)>,
}

/// Filter state of one image layer as the view sees it.
///
/// Every parameter change takes a new ticket; only the newest ticket may
/// apply its image. Results can arrive in any order.
#[derive(Debug)]
pub struct LayerFilter {
    state: Mutex<LayerState>,
}

impl LayerFilter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LayerState {
                generation: 0,
                phase: FilterPhase::Idle,
                applied: None,
            }),
        }
    }

    pub fn request(&self, params: FilterParams) -> FilterTicket {
        let mut state = self.state.lock();
        state.generation += 1;
        state.phase = FilterPhase::Loading;
        FilterTicket {
            generation: state.generation,
            params,
        }
    }

    /// Applies `image` if `ticket` is still the newest request. A stale
    /// ticket returns `Superseded` and changes nothing.
    pub fn resolve(&self, ticket: FilterTicket, image: Arc<RgbaImage>) -> FilterPhase {
        let mut state = self.state.lock();
        if ticket.generation != state.generation {
            debug!(
                stale = ticket.generation,
                current = state.generation,
                "dropping superseded filter result"
            );
            return FilterPhase::Superseded;
        }
        state.applied = Some((ticket.params, image));
        state.phase = FilterPhase::Applied;
        FilterPhase::Applied
    }

    pub fn phase(&self) -> FilterPhase {
        self.state.lock().phase
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Parameters of the image currently shown.
    pub fn params(&self) -> Option<FilterParams> {
        self.state.lock().applied.as_ref().map(|(params, _)| *params)
    }

    pub fn image(&self) -> Option<Arc<RgbaImage>> {
        self.state.lock().applied.as_ref().map(|(_, img)| img.clone())
    }
}

impl Default for LayerFilter {
    fn default() -> Self {
        Self::new()
    }
}
