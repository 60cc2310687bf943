use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One boundary polygon from the static topology. `id` is a normalized FIPS
/// code: 2 digits for states, 5 for counties.
#[derive(Debug, Clone)]
pub struct GeoFeature {
    pub id: String,
    pub geometry: MultiPolygon<f64>,
}

impl GeoFeature {
    /// Parent state FIPS of a county feature (first two characters of the id).
    pub fn state_fips(&self) -> &str {
        self.id.get(..2).unwrap_or(&self.id)
    }
}

/// Per-state display metadata. `fips` is kept as loaded (number or unpadded
/// string); use `fips::normalize_fips` before comparing it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateStyle {
    pub fips: Value,
    pub postal: String,
    pub name: String,
    pub ap: String,
}

/// Geographic placement point for a state label, before projection.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct LabelAnchor {
    pub longitude: f64,
    pub latitude: f64,
}

/// A dataset row after normalization, keyed elsewhere by its 5-digit FIPS.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedRecord {
    pub fips: String,
    /// Every field of the source row plus derived fields and, for nested
    /// sources, the originating state under `State`.
    pub fields: Map<String, Value>,
}

impl ResolvedRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Originating state name, present for nested-by-state sources.
    pub fn state(&self) -> Option<&str> {
        self.fields.get(crate::dataset::STATE_ATTRIBUTE).and_then(Value::as_str)
    }
}
