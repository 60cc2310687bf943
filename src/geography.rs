use crate::config::{AppConfig, LabelStyle};
use crate::fips::{normalize_fips, StateIndex, COUNTY_WIDTH, STATE_WIDTH};
use crate::topology::{TopoFeature, Topology, TopologyError};
use crate::types::{GeoFeature, LabelAnchor, StateStyle};
use anyhow::{Context, Result};
use geo::MultiLineString;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{info, warn};

const BUILTIN_STATE_STYLES: &str = include_str!("../data/statestyle.json");
const BUILTIN_LABEL_ANCHORS: &str = include_str!("../data/label_anchors.json");

/// Static boundary geometry and per-state metadata, loaded once and shared
/// read-only by every draw.
#[derive(Debug, Clone)]
pub struct Geography {
    pub states: Vec<GeoFeature>,
    pub counties: Vec<GeoFeature>,
    /// Borders between two different states, each drawn once.
    pub border_mesh: MultiLineString<f64>,
    pub index: StateIndex,
    pub anchors: HashMap<String, LabelAnchor>,
}

/// A state label ready for projection.
#[derive(Debug, Clone, PartialEq)]
pub struct StateLabel {
    pub fips: String,
    pub postal: String,
    pub text: String,
    pub anchor: LabelAnchor,
}

impl Geography {
    pub fn load(
        topology: &Topology,
        states_object: &str,
        counties_object: &str,
        styles: Vec<StateStyle>,
        anchors: HashMap<String, LabelAnchor>,
    ) -> Result<Self, TopologyError> {
        let states = normalize_features(topology.features(states_object)?, STATE_WIDTH);
        let counties = normalize_features(topology.features(counties_object)?, COUNTY_WIDTH);
        let border_mesh = topology.mesh(states_object, |a, b| a != b)?;

        Ok(Geography {
            states,
            counties,
            border_mesh,
            index: StateIndex::new(styles),
            anchors,
        })
    }

    /// Labels for every state that has an anchor, in state table order.
    pub fn labels(&self, style: LabelStyle) -> Vec<StateLabel> {
        self.index
            .iter()
            .filter_map(|(fips, state)| {
                let anchor = *self.anchors.get(&fips)?;
                let text = match style {
                    LabelStyle::Name => state.name.clone(),
                    LabelStyle::Ap => state.ap.clone(),
                    LabelStyle::Postal => state.postal.clone(),
                };
                Some(StateLabel {
                    fips,
                    postal: state.postal.clone(),
                    text,
                    anchor,
                })
            })
            .collect()
    }
}

fn normalize_features(features: Vec<TopoFeature>, width: usize) -> Vec<GeoFeature> {
    features
        .into_iter()
        .filter_map(|feature| {
            let raw = feature.id.unwrap_or_default();
            match normalize_fips(&raw, width) {
                Ok(id) => Some(GeoFeature {
                    id,
                    geometry: feature.geometry,
                }),
                Err(e) => {
                    warn!("skipping feature: {e}");
                    None
                }
            }
        })
        .collect()
}

/// The state table compiled into the binary.
pub fn builtin_state_styles() -> Result<Vec<StateStyle>> {
    serde_json::from_str(BUILTIN_STATE_STYLES).context("Built-in state table is corrupt")
}

pub fn builtin_label_anchors() -> Result<HashMap<String, LabelAnchor>> {
    parse_label_anchors(BUILTIN_LABEL_ANCHORS).context("Built-in label anchors are corrupt")
}

/// Parses `{"01": [lon, lat], ...}`; keys are normalized to two digits.
pub fn parse_label_anchors(json: &str) -> Result<HashMap<String, LabelAnchor>> {
    let raw: HashMap<String, [f64; 2]> =
        serde_json::from_str(json).context("Failed to parse label anchors")?;
    let mut anchors = HashMap::with_capacity(raw.len());
    for (key, [longitude, latitude]) in raw {
        let fips = normalize_fips(&key, STATE_WIDTH)?;
        anchors.insert(fips, LabelAnchor { longitude, latitude });
    }
    Ok(anchors)
}

pub fn load_geography(config: &AppConfig) -> Result<Geography> {
    let input = &config.input;

    info!("Loading topology from {:?}...", input.topology);
    let topology = load_topology(&input.topology)?;

    let styles = match &input.state_styles {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read state styles: {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state styles: {:?}", path))?
        }
        None => builtin_state_styles()?,
    };

    let anchors = match &input.label_anchors {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read label anchors: {:?}", path))?;
            parse_label_anchors(&content)?
        }
        None => builtin_label_anchors()?,
    };

    let geography = Geography::load(
        &topology,
        &input.states_object,
        &input.counties_object,
        styles,
        anchors,
    )
    .with_context(|| format!("Failed to build geography from {:?}", input.topology))?;

    info!(
        "Loaded {} states, {} counties, {} border segments",
        geography.states.len(),
        geography.counties.len(),
        geography.border_mesh.0.len()
    );

    Ok(geography)
}

fn load_topology(path: &Path) -> Result<Topology> {
    let file = File::open(path).with_context(|| format!("Failed to open topology: {:?}", path))?;
    Topology::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to decode topology: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::fixtures::TWO_STATES;

    fn fixture() -> Geography {
        let topology = Topology::parse(TWO_STATES).unwrap();
        Geography::load(
            &topology,
            "states",
            "counties",
            builtin_state_styles().unwrap(),
            builtin_label_anchors().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn builtin_tables_cover_every_state() {
        let styles = builtin_state_styles().unwrap();
        assert_eq!(styles.len(), 51);
        let index = StateIndex::new(styles);
        assert_eq!(index.len(), 51);

        let anchors = builtin_label_anchors().unwrap();
        for (fips, _) in index.iter() {
            assert!(anchors.contains_key(&fips), "missing anchor for {fips}");
        }
    }

    #[test]
    fn malformed_anchor_table_is_an_error() {
        assert!(parse_label_anchors(r#"{"01": [-86.8]}"#).is_err());
        assert!(parse_label_anchors(r#"{"AL": [-86.8, 32.8]}"#).is_err());
    }

    #[test]
    fn normalizes_feature_ids() {
        let geo = fixture();
        let states: Vec<&str> = geo.states.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(states, vec!["01", "22"]);
        let counties: Vec<&str> = geo.counties.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(counties, vec!["01001", "01003", "22001"]);
    }

    #[test]
    fn border_mesh_excludes_outer_edges() {
        let geo = fixture();
        assert_eq!(geo.border_mesh.0.len(), 1);
    }

    #[test]
    fn lookups_by_fips_and_postal() {
        let geo = fixture();
        assert_eq!(geo.index.by_fips("22").map(|s| s.postal.as_str()), Some("LA"));
        assert_eq!(geo.index.by_postal("AL").map(|s| s.name.as_str()), Some("Alabama"));
    }

    #[test]
    fn label_text_follows_style() {
        let geo = fixture();
        let labels = geo.labels(LabelStyle::Ap);
        let alabama = labels.iter().find(|l| l.fips == "01").unwrap();
        assert_eq!(alabama.text, "Ala.");
        assert_eq!(alabama.postal, "AL");

        let labels = geo.labels(LabelStyle::Name);
        assert!(labels.iter().any(|l| l.text == "Louisiana"));
    }

    #[test]
    fn label_anchor_keys_are_padded() {
        let anchors = parse_label_anchors(r#"{"1": [-86.8, 32.8]}"#).unwrap();
        assert_eq!(
            anchors.get("01"),
            Some(&LabelAnchor {
                longitude: -86.8,
                latitude: 32.8
            })
        );
    }
}
