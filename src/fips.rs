use crate::types::StateStyle;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

pub const STATE_WIDTH: usize = 2;
pub const COUNTY_WIDTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FipsError {
    /// The code is empty, has non-digit characters, or is longer than the
    /// target width.
    InvalidCode { code: String, width: usize },
}

impl fmt::Display for FipsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCode { code, width } => {
                write!(f, "invalid FIPS code {code:?} for width {width}")
            }
        }
    }
}

impl std::error::Error for FipsError {}

/// Left-pads `code` with zeros to `width` digits.
pub fn normalize_fips(code: &str, width: usize) -> Result<String, FipsError> {
    let trimmed = code.trim();
    if trimmed.is_empty()
        || trimmed.len() > width
        || !trimmed.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(FipsError::InvalidCode {
            code: code.to_string(),
            width,
        });
    }
    Ok(format!("{trimmed:0>width$}"))
}

/// Same as [`normalize_fips`] for a JSON value. Strings and non-negative
/// whole numbers (`1001` or `1001.0`) are accepted; everything else is an
/// invalid code.
pub fn normalize_fips_value(value: &Value, width: usize) -> Result<String, FipsError> {
    match value {
        Value::String(s) => normalize_fips(s, width),
        Value::Number(n) => match n.as_u64().or_else(|| whole_number(n.as_f64()?)) {
            Some(v) => normalize_fips(&v.to_string(), width),
            None => Err(FipsError::InvalidCode {
                code: n.to_string(),
                width,
            }),
        },
        other => Err(FipsError::InvalidCode {
            code: other.to_string(),
            width,
        }),
    }
}

fn whole_number(v: f64) -> Option<u64> {
    // 2^64 itself is out of range, so compare strictly
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v < u64::MAX as f64 {
        Some(v as u64)
    } else {
        None
    }
}

/// Lookup tables over the state style rows: by normalized FIPS, by postal
/// code and by full name.
#[derive(Debug, Clone, Default)]
pub struct StateIndex {
    styles: Vec<StateStyle>,
    by_fips: HashMap<String, usize>,
    by_postal: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl StateIndex {
    pub fn new(styles: Vec<StateStyle>) -> Self {
        let mut index = StateIndex::default();

        for style in styles {
            let fips = match normalize_fips_value(&style.fips, STATE_WIDTH) {
                Ok(fips) => fips,
                Err(e) => {
                    warn!("skipping state style {:?}: {e}", style.name);
                    continue;
                }
            };
            if index.by_fips.contains_key(&fips) {
                warn!("duplicate state FIPS {fips} for {:?}, keeping the first", style.name);
                continue;
            }

            let slot = index.styles.len();
            index.by_fips.insert(fips, slot);
            index.by_postal.insert(style.postal.clone(), slot);
            index.by_name.insert(style.name.clone(), slot);
            index.styles.push(style);
        }

        index
    }

    /// Exact, case-sensitive lookup of a full state name.
    pub fn state_name_to_fips(&self, name: &str) -> Option<String> {
        let slot = *self.by_name.get(name)?;
        normalize_fips_value(&self.styles[slot].fips, STATE_WIDTH).ok()
    }

    pub fn by_fips(&self, fips: &str) -> Option<&StateStyle> {
        self.by_fips.get(fips).map(|&slot| &self.styles[slot])
    }

    pub fn by_postal(&self, postal: &str) -> Option<&StateStyle> {
        self.by_postal.get(postal).map(|&slot| &self.styles[slot])
    }

    /// Rows paired with their normalized FIPS, in load order.
    pub fn iter(&self) -> impl Iterator<Item = (String, &StateStyle)> {
        self.styles.iter().filter_map(|style| {
            normalize_fips_value(&style.fips, STATE_WIDTH)
                .ok()
                .map(|fips| (fips, style))
        })
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }
}
