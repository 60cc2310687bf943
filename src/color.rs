use crate::config::{ColorScaleConfig, ScaleKind};
use crate::types::ResolvedRecord;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ColorError {
    InvalidColor(String),
    InvalidDomain([f64; 2]),
    InvalidSteps(usize),
}

impl fmt::Display for ColorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidColor(s) => write!(f, "unrecognized color {s:?}"),
            Self::InvalidDomain([a, b]) => write!(f, "color domain [{a}, {b}] is not finite"),
            Self::InvalidSteps(n) => write!(f, "quantize scale needs at least one step, got {n}"),
        }
    }
}

impl std::error::Error for ColorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const WHITE: Rgb = Rgb(255, 255, 255);

    fn from_channels(r: f64, g: f64, b: f64) -> Self {
        let channel = |v: f64| v.round().clamp(0.0, 255.0) as u8;
        Rgb(channel(r), channel(g), channel(b))
    }

    /// Parses `#rgb`, `#rrggbb`, `rgb(r, g, b)` or a handful of CSS names.
    pub fn parse(s: &str) -> Result<Self, ColorError> {
        let trimmed = s.trim();
        let invalid = || ColorError::InvalidColor(s.to_string());

        if let Some(hex) = trimmed.strip_prefix('#') {
            return parse_hex(hex).ok_or_else(invalid);
        }

        if let Some(body) = trimmed
            .strip_prefix("rgb(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let parts = body
                .split(',')
                .map(|p| p.trim().parse::<u8>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| invalid())?;
            return match parts.as_slice() {
                [r, g, b] => Ok(Rgb(*r, *g, *b)),
                _ => Err(invalid()),
            };
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "white" => Ok(Rgb::WHITE),
            "black" => Ok(Rgb(0, 0, 0)),
            "gray" | "grey" => Ok(Rgb(128, 128, 128)),
            "lightgray" | "lightgrey" => Ok(Rgb(211, 211, 211)),
            "gainsboro" => Ok(Rgb(220, 220, 220)),
            "whitesmoke" => Ok(Rgb(245, 245, 245)),
            "silver" => Ok(Rgb(192, 192, 192)),
            _ => Err(invalid()),
        }
    }
}

fn parse_hex(hex: &str) -> Option<Rgb> {
    if !hex.is_ascii() {
        return None;
    }
    let channel = |s: &str| u8::from_str_radix(s, 16).ok();
    match hex.len() {
        6 => Some(Rgb(channel(&hex[0..2])?, channel(&hex[2..4])?, channel(&hex[4..6])?)),
        3 => {
            let mut out = [0u8; 3];
            for (slot, c) in out.iter_mut().zip(hex.chars()) {
                let v = c.to_digit(16)? as u8;
                *slot = v * 17;
            }
            Some(Rgb(out[0], out[1], out[2]))
        }
        _ => None,
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

impl Serialize for Rgb {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorScheme {
    Blues,
    Greens,
    Greys,
    #[default]
    Oranges,
    Purples,
    Reds,
    #[serde(alias = "yl_gn")]
    YlGn,
    #[serde(alias = "yl_or_rd")]
    YlOrRd,
}

impl ColorScheme {
    fn stops(self) -> &'static [u32; 9] {
        match self {
            ColorScheme::Blues => &[
                0xf7fbff, 0xdeebf7, 0xc6dbef, 0x9ecae1, 0x6baed6, 0x4292c6, 0x2171b5, 0x08519c,
                0x08306b,
            ],
            ColorScheme::Greens => &[
                0xf7fcf5, 0xe5f5e0, 0xc7e9c0, 0xa1d99b, 0x74c476, 0x41ab5d, 0x238b45, 0x006d2c,
                0x00441b,
            ],
            ColorScheme::Greys => &[
                0xffffff, 0xf0f0f0, 0xd9d9d9, 0xbdbdbd, 0x969696, 0x737373, 0x525252, 0x252525,
                0x000000,
            ],
            ColorScheme::Oranges => &[
                0xfff5eb, 0xfee6ce, 0xfdd0a2, 0xfdae6b, 0xfd8d3c, 0xf16913, 0xd94801, 0xa63603,
                0x7f2704,
            ],
            ColorScheme::Purples => &[
                0xfcfbfd, 0xefedf5, 0xdadaeb, 0xbcbddc, 0x9e9ac8, 0x807dba, 0x6a51a3, 0x54278f,
                0x3f007d,
            ],
            ColorScheme::Reds => &[
                0xfff5f0, 0xfee0d2, 0xfcbba1, 0xfc9272, 0xfb6a4a, 0xef3b2c, 0xcb181d, 0xa50f15,
                0x67000d,
            ],
            ColorScheme::YlGn => &[
                0xffffe5, 0xf7fcb9, 0xd9f0a3, 0xaddd8e, 0x78c679, 0x41ab5d, 0x238443, 0x006837,
                0x004529,
            ],
            ColorScheme::YlOrRd => &[
                0xffffcc, 0xffeda0, 0xfed976, 0xfeb24c, 0xfd8d3c, 0xfc4e2a, 0xe31a1c, 0xbd0026,
                0x800026,
            ],
        }
    }

    /// Color at `t`; values outside [0, 1] saturate at the end stops.
    pub fn interpolate(self, t: f64) -> Rgb {
        let stops = self.stops();
        let channel = |shift: u32| -> Vec<f64> {
            stops.iter().map(|c| ((c >> shift) & 0xff) as f64).collect()
        };
        Rgb::from_channels(
            basis_spline(&channel(16), t),
            basis_spline(&channel(8), t),
            basis_spline(&channel(0), t),
        )
    }
}

fn basis(t1: f64, v0: f64, v1: f64, v2: f64, v3: f64) -> f64 {
    let t2 = t1 * t1;
    let t3 = t2 * t1;
    ((1.0 - 3.0 * t1 + 3.0 * t2 - t3) * v0
        + (4.0 - 6.0 * t2 + 3.0 * t3) * v1
        + (1.0 + 3.0 * t1 + 3.0 * t2 - 3.0 * t3) * v2
        + t3 * v3)
        / 6.0
}

fn basis_spline(values: &[f64], t: f64) -> f64 {
    let n = values.len() - 1;
    let (t, i) = if t <= 0.0 {
        (0.0, 0)
    } else if t >= 1.0 {
        (1.0, n - 1)
    } else {
        (t, (t * n as f64).floor() as usize)
    };
    let v1 = values[i];
    let v2 = values[i + 1];
    let v0 = if i > 0 { values[i - 1] } else { 2.0 * v1 - v2 };
    let v3 = if i < n - 1 { values[i + 2] } else { 2.0 * v2 - v1 };
    basis((t - i as f64 / n as f64) * n as f64, v0, v1, v2, v3)
}

/// A continuous (or binned) scale from a fixed input domain onto a scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorScale {
    kind: ScaleKind,
    scheme: ColorScheme,
    domain: [f64; 2],
    clamp: bool,
    steps: usize,
}

impl ColorScale {
    pub fn new(config: &ColorScaleConfig) -> Result<Self, ColorError> {
        if !config.domain.iter().all(|d| d.is_finite()) {
            return Err(ColorError::InvalidDomain(config.domain));
        }
        if config.kind == ScaleKind::Quantize && config.steps == 0 {
            return Err(ColorError::InvalidSteps(config.steps));
        }
        Ok(ColorScale {
            kind: config.kind,
            scheme: config.scheme,
            domain: config.domain,
            clamp: config.clamp,
            steps: config.steps,
        })
    }

    /// `None` for NaN input.
    pub fn color(&self, value: f64) -> Option<Rgb> {
        if value.is_nan() {
            return None;
        }
        let [d0, d1] = self.domain;
        let t = if d0 == d1 {
            0.5
        } else {
            let t = (value - d0) / (d1 - d0);
            if self.clamp {
                t.clamp(0.0, 1.0)
            } else {
                t
            }
        };

        match self.kind {
            ScaleKind::Sequential => Some(self.scheme.interpolate(t)),
            ScaleKind::Quantize => {
                let bins = self.steps as f64;
                let bin = (t * bins).floor().clamp(0.0, bins - 1.0);
                Some(self.scheme.interpolate((bin + 0.5) / bins))
            }
        }
    }
}

/// Colors counties from the resolved dataset, falling back to the
/// missing-data fill when a county has no usable value.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorMapper {
    scale: ColorScale,
    fallback: Rgb,
}

impl ColorMapper {
    pub fn new(config: &ColorScaleConfig, missing_data_fill: &str) -> Result<Self, ColorError> {
        Ok(ColorMapper {
            scale: ColorScale::new(config)?,
            fallback: Rgb::parse(missing_data_fill)?,
        })
    }

    pub fn fallback(&self) -> Rgb {
        self.fallback
    }

    pub fn map(
        &self,
        resolved: &HashMap<String, ResolvedRecord>,
        fips: &str,
        value_field: &str,
    ) -> Rgb {
        resolved
            .get(fips)
            .and_then(|record| record.get(value_field))
            .and_then(|value| self.scale.color(coerce_value(value)))
            .unwrap_or(self.fallback)
    }
}

/// Numeric view of a dataset value: numbers as-is, numeric strings parsed,
/// booleans as 0/1, anything else NaN.
pub fn coerce_value(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => f64::NAN,
    }
}
