//! Decoding hints and the per-format table of which hints apply.
//!
//! Hints are open-ended: unknown keys deserialize into [`DecodeHints::extra`]
//! and are carried along untouched. Whether a recognised hint has any effect
//! is a property of the format, recorded as a [`HintSupport`] in its registry
//! entry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::raster::PixelLayout;

/// Whether materialized tiles are kept after a tile request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileCachePolicy {
    /// Keep decoded tiles in the image's tile cache
    #[default]
    Retain,
    /// Decode on every request
    Discard,
}

/// Optional decoding hints supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeHints {
    /// Convert pixels to this layout instead of the stream's native one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<PixelLayout>,

    /// Integer downscale factor; 0 and 1 mean full resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsample: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_cache: Option<TileCachePolicy>,

    /// Keys no format interprets
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DecodeHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color(mut self, layout: PixelLayout) -> Self {
        self.color = Some(layout);
        self
    }

    pub fn with_subsample(mut self, factor: u32) -> Self {
        self.subsample = Some(factor);
        self
    }

    pub fn with_tile_cache(mut self, policy: TileCachePolicy) -> Self {
        self.tile_cache = Some(policy);
        self
    }

    /// Parse hints from a JSON object.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Which hints a format honors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HintSupport {
    pub color: bool,
    pub subsample: bool,
    pub tile_cache: bool,
}

impl HintSupport {
    /// Every hint is honored.
    pub const ALL: HintSupport = HintSupport {
        color: true,
        subsample: true,
        tile_cache: true,
    };

    /// Hints are ignored entirely.
    pub const NONE: HintSupport = HintSupport {
        color: false,
        subsample: false,
        tile_cache: false,
    };

    pub const fn honors_any(&self) -> bool {
        self.color || self.subsample || self.tile_cache
    }

    /// Reduce caller hints to the ones this format acts on.
    pub fn resolve(&self, hints: Option<&DecodeHints>) -> EffectiveHints {
        let Some(hints) = hints else {
            return EffectiveHints::default();
        };

        EffectiveHints {
            color: hints.color.filter(|_| self.color),
            subsample: hints
                .subsample
                .filter(|_| self.subsample)
                .unwrap_or(1)
                .max(1),
            tile_cache: hints
                .tile_cache
                .filter(|_| self.tile_cache)
                .unwrap_or_default(),
        }
    }
}

/// Hints after filtering through a format's [`HintSupport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveHints {
    pub color: Option<PixelLayout>,
    pub subsample: u32,
    pub tile_cache: TileCachePolicy,
}

impl Default for EffectiveHints {
    fn default() -> Self {
        Self {
            color: None,
            subsample: 1,
            tile_cache: TileCachePolicy::Retain,
        }
    }
}
