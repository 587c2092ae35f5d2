use std::{fmt, str::FromStr};

use image::{ImageBuffer, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{ContractError, FilterError};

/// Levels per channel in the packed cube.
pub const CUBE_LEVELS: u32 = 64;
/// Tiles per row (and per column) of the packed grid.
pub const TILES_PER_ROW: u32 = 8;
/// Edge length in pixels of a packed LUT image.
pub const LUT_SIZE: u32 = CUBE_LEVELS * TILES_PER_ROW;

/// Closed set of filters the canvas offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LutId {
    Normal,
    Lut1,
    Lut2,
    Lut3,
    Lut4,
    Lut5,
}

/// Opaque handle to a bundled LUT resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LutAsset {
    pub file_name: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
/// Catalogue entry shown in the filter strip.
pub struct FilterPreset {
    pub id: LutId,
    pub name: &'static str,
    pub intensity: f32,
}

const PRESETS: [FilterPreset; 6] = [
    FilterPreset {
        id: LutId::Normal,
        name: "Original",
        intensity: 1.0,
    },
    FilterPreset {
        id: LutId::Lut1,
        name: "Fresh",
        intensity: 1.0,
    },
    FilterPreset {
        id: LutId::Lut2,
        name: "Vintage Film",
        intensity: 1.0,
    },
    FilterPreset {
        id: LutId::Lut3,
        name: "Warm Sun",
        intensity: 1.0,
    },
    FilterPreset {
        id: LutId::Lut4,
        name: "Cool Tone",
        intensity: 1.0,
    },
    FilterPreset {
        id: LutId::Lut5,
        name: "Mono",
        intensity: 1.0,
    },
];

impl LutId {
    /// Every identifier in catalogue order.
    pub const ALL: [LutId; 6] = [
        LutId::Normal,
        LutId::Lut1,
        LutId::Lut2,
        LutId::Lut3,
        LutId::Lut4,
        LutId::Lut5,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LutId::Normal => "normal",
            LutId::Lut1 => "lut1",
            LutId::Lut2 => "lut2",
            LutId::Lut3 => "lut3",
            LutId::Lut4 => "lut4",
            LutId::Lut5 => "lut5",
        }
    }

    pub fn is_normal(self) -> bool {
        self == LutId::Normal
    }

    /// Bundled resource backing this filter. `Normal` has none.
    pub fn asset(self) -> Option<LutAsset> {
        let file_name = match self {
            LutId::Normal => return None,
            LutId::Lut1 => "001.jpeg",
            LutId::Lut2 => "002.jpeg",
            LutId::Lut3 => "003.jpeg",
            LutId::Lut4 => "004.jpeg",
            LutId::Lut5 => "005.jpeg",
        };
        Some(LutAsset { file_name })
    }

    pub fn presets() -> &'static [FilterPreset] {
        &PRESETS
    }

    pub fn preset(self) -> &'static FilterPreset {
        &PRESETS[self.catalogue_index()]
    }

    /// The `count` entries following `self` in the catalogue, wrapping around.
    pub fn next_in_catalogue(self, count: usize) -> Vec<LutId> {
        let len = Self::ALL.len();
        let start = self.catalogue_index();
        (1..=count.min(len - 1))
            .map(|step| Self::ALL[(start + step) % len])
            .collect()
    }

    fn catalogue_index(self) -> usize {
        match self {
            LutId::Normal => 0,
            LutId::Lut1 => 1,
            LutId::Lut2 => 2,
            LutId::Lut3 => 3,
            LutId::Lut4 => 4,
            LutId::Lut5 => 5,
        }
    }
}

impl fmt::Display for LutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for LutId {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase();
        LutId::ALL
            .into_iter()
            .find(|id| id.as_str() == norm)
            .ok_or_else(|| ContractError::UnknownLut(s.to_string()))
    }
}

/// Decoded packed-cube LUT. Only constructible with the expected dimensions.
#[derive(Debug)]
pub struct LutTexture {
    id: LutId,
    image: RgbaImage,
}

impl LutTexture {
    pub fn new(id: LutId, image: RgbaImage) -> Result<Self, FilterError> {
        validate_dimensions(&image)?;
        Ok(Self { id, image })
    }

    pub fn id(&self) -> LutId {
        self.id
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

pub fn validate_dimensions(lut: &RgbaImage) -> Result<(), FilterError> {
    let (width, height) = lut.dimensions();
    if width != LUT_SIZE || height != LUT_SIZE {
        return Err(FilterError::InvalidLutDimensions {
            width,
            height,
            expected: LUT_SIZE,
        });
    }
    Ok(())
}

/// Cube level for an 8-bit channel value.
#[inline]
pub fn level(channel: u8) -> u32 {
    u32::from(channel) >> 2
}

/// Packed LUT pixel holding the mapping for `(r, g, b)`.
///
/// Blue picks the tile (column = level % 8, row = level / 8); red and green
/// address the pixel inside the tile. Coordinates are clamped to the image.
#[inline]
pub fn lookup_coord(r: u8, g: u8, b: u8) -> (u32, u32) {
    let blue = level(b);
    let x = (blue % TILES_PER_ROW) * CUBE_LEVELS + level(r);
    let y = (blue / TILES_PER_ROW) * CUBE_LEVELS + level(g);
    (x.min(LUT_SIZE - 1), y.min(LUT_SIZE - 1))
}

/// Builds a packed LUT by evaluating `map` at the center of every cube cell.
pub fn packed_lut_from_fn<F>(map: F) -> RgbaImage
where
    F: Fn(u8, u8, u8) -> [u8; 3],
{
    let cell = |lvl: u32| (lvl * 4 + 2).min(255) as u8;
    ImageBuffer::from_fn(LUT_SIZE, LUT_SIZE, |x, y| {
        let r = cell(x % CUBE_LEVELS);
        let g = cell(y % CUBE_LEVELS);
        let b = cell((y / CUBE_LEVELS) * TILES_PER_ROW + x / CUBE_LEVELS);
        let [or, og, ob] = map(r, g, b);
        Rgba([or, og, ob, 255])
    })
}

/// LUT that maps every cell to its own center color.
pub fn identity_lut() -> RgbaImage {
    packed_lut_from_fn(|r, g, b| [r, g, b])
}
