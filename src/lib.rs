//! LUT color grading for layered photo canvases.
//!
//! [`FilterEngine`] resolves a named filter to a packed-cube LUT, runs the
//! lookup pass on the GPU or CPU, and memoizes results per source image,
//! filter and intensity.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod layer;
pub mod loader;
pub mod lut;
pub mod processing;

pub use cache::{CacheKey, FilterRequest, ResultCache};
pub use config::EngineConfig;
pub use engine::{CacheSize, FilterEngine, SourceImage};
pub use error::{ContractError, FilterError};
pub use layer::{FilterParams, FilterPhase, FilterTicket, LayerFilter};
pub use loader::{AssetSource, DirAssetSource, ImageCrateDecoder, LutDecoder, LutLoader, MemoryAssetSource};
pub use lut::{FilterPreset, LutId, LutTexture};
pub use processing::{Backend, Compositor};
