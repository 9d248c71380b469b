use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Número de bandas del ecualizador del nodo (0..=14).
pub const EQ_BANDS: u8 = 15;

/// Rango de ganancia admitido por banda
const EQ_GAIN_RANGE: std::ops::RangeInclusive<f32> = -0.25..=1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerBand {
    pub band: u8,
    pub gain: f32,
}

impl EqualizerBand {
    /// Builds a band, clamping the gain into the range the node accepts.
    pub fn new(band: u8, gain: f32) -> Result<Self> {
        if band >= EQ_BANDS {
            return Err(Error::Invalid(format!(
                "equalizer band {band} does not exist (0..{EQ_BANDS})"
            )));
        }
        Ok(Self {
            band,
            gain: gain.clamp(*EQ_GAIN_RANGE.start(), *EQ_GAIN_RANGE.end()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timescale {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

/// Used by both tremolo and vibrato.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Oscillation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_hz: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mono_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_band: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_width: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowPass {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<f64>,
}

/// Estado de filtros de un player, tal como se envía al nodo.
///
/// Distortion and channel mix are passed through untyped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<EqualizerBand>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Oscillation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Oscillation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_filters: Option<Value>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self == &Filters::default()
    }

    /// Replaces the equalizer, dropping bands with zero gain.
    pub fn set_equalizer(&mut self, bands: Vec<EqualizerBand>) {
        let bands: Vec<EqualizerBand> = bands.into_iter().filter(|b| b.gain != 0.0).collect();
        self.equalizer = (!bands.is_empty()).then_some(bands);
    }

    /// Speed multiplier applied by the timescale filter; 1.0 when unset.
    pub fn playback_rate(&self) -> f64 {
        self.timescale
            .as_ref()
            .map(|t| t.speed.unwrap_or(1.0) * t.rate.unwrap_or(1.0))
            .unwrap_or(1.0)
    }
}
