// SPDX-License-Identifier: MIT OR Apache-2.0

//! Heat colormaps.
//!
//! Closed-form approximations so rendering stays deterministic and free
//! of lookup-table assets. Jet is the classic piecewise ramp hosts use
//! for attention overlays; viridis is a quadratic fit of matplotlib's
//! anchor colors.

use crate::error::DaamError;

/// Colormap applied to normalized heat before blending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatColormap {
    /// Blue through green to red.
    #[default]
    Jet,
    /// Purple through teal to yellow.
    Viridis,
}

impl HeatColormap {
    /// Map normalized heat in `[0, 1]` to RGB. Out-of-range input clamps.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn color(self, t: f32) -> [u8; 3] {
        let t = t.clamp(0.0, 1.0);
        let rgb = match self {
            Self::Jet => [
                1.5 - (4.0 * t - 3.0).abs(),
                1.5 - (4.0 * t - 2.0).abs(),
                1.5 - (4.0 * t - 1.0).abs(),
            ],
            Self::Viridis => [
                0.267 + t * ((0.329 - 0.267) + t * (0.984 - 0.329)),
                0.005 + t * ((0.569 - 0.005) + t * (0.906 - 0.569)),
                0.329 + t * ((0.758 - 0.329) - t * (0.758 - 0.121)),
            ],
        };
        [
            (rgb[0].clamp(0.0, 1.0) * 255.0).round() as u8,
            (rgb[1].clamp(0.0, 1.0) * 255.0).round() as u8,
            (rgb[2].clamp(0.0, 1.0) * 255.0).round() as u8,
        ]
    }
}

impl std::fmt::Display for HeatColormap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jet => write!(f, "jet"),
            Self::Viridis => write!(f, "viridis"),
        }
    }
}

impl std::str::FromStr for HeatColormap {
    type Err = DaamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jet" => Ok(Self::Jet),
            "viridis" => Ok(Self::Viridis),
            other => Err(DaamError::Config(format!("unknown colormap: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
