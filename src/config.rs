use crate::color::ColorScheme;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    /// Absent when only the base map is drawn.
    pub dataset: Option<DatasetConfig>,
    #[serde(default)]
    pub color: ColorScaleConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub topology: PathBuf,
    #[serde(default = "default_states_object")]
    pub states_object: String,
    #[serde(default = "default_counties_object")]
    pub counties_object: String,
    /// Falls back to the built-in table when absent.
    pub state_styles: Option<PathBuf>,
    pub label_anchors: Option<PathBuf>,
}

/// How the caller's dataset is organized and where it comes from.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DatasetConfig {
    /// `"flat"` or `"nested-by-state"`.
    pub organization: String,
    pub value_field: String,
    #[serde(default = "default_fips_field")]
    pub fips_field: String,
    /// Top-level sibling of the per-state entries that is not a state name.
    pub ignore_key: Option<String>,
    /// Dotted path from a state entry to its county records.
    pub nested_field: Option<String>,
    #[serde(default)]
    pub source: DataSource,
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    #[serde(default = "default_missing_fill")]
    pub missing_data_fill: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub derived: Vec<DerivedField>,
}

/// Where the dataset lives. A map without data omits `[dataset]` entirely.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    #[default]
    Local,
    Remote,
}

/// A per-record ratio: `name = numerator / denominator * multiplier`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DerivedField {
    pub name: String,
    pub numerator: String,
    pub denominator: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ColorScaleConfig {
    #[serde(default)]
    pub kind: ScaleKind,
    #[serde(default)]
    pub scheme: ColorScheme,
    #[serde(default = "default_domain")]
    pub domain: [f64; 2],
    /// Clamp inputs to the domain before interpolating.
    #[serde(default)]
    pub clamp: bool,
    /// Number of bins for `quantize`.
    #[serde(default = "default_steps")]
    pub steps: usize,
}

impl Default for ColorScaleConfig {
    fn default() -> Self {
        ColorScaleConfig {
            kind: ScaleKind::default(),
            scheme: ColorScheme::default(),
            domain: default_domain(),
            clamp: false,
            steps: default_steps(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScaleKind {
    #[default]
    Sequential,
    Quantize,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct SelectionConfig {
    /// Full state names; `None` shows every state.
    pub states: Option<Vec<String>>,
    #[serde(default)]
    pub hide_other_states: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub svg: PathBuf,
    /// Optional GeoJSON export of the colored counties.
    pub geojson: Option<PathBuf>,
    #[serde(default = "default_width")]
    pub width: f64,
    #[serde(default = "default_aspect_height")]
    pub aspect_height: f64,
    #[serde(default)]
    pub margin: Margin,
    #[serde(default)]
    pub label_style: LabelStyle,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct Margin {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl Default for Margin {
    fn default() -> Self {
        Margin {
            top: 0.0,
            right: 20.0,
            bottom: 0.0,
            left: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LabelStyle {
    Name,
    #[default]
    Ap,
    Postal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { port: 3000 }
    }
}

fn default_states_object() -> String {
    "states".to_string()
}

fn default_counties_object() -> String {
    "counties".to_string()
}

fn default_fips_field() -> String {
    "fips".to_string()
}

fn default_missing_fill() -> String {
    "#f7f7f7".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_domain() -> [f64; 2] {
    [0.0, 100.0]
}

fn default_steps() -> usize {
    9
}

fn default_width() -> f64 {
    960.0
}

fn default_aspect_height() -> f64 {
    0.66
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r##"
        [input]
        topology = "data/us-county-topo.json"

        [dataset]
        organization = "nested-by-state"
        value_field = "pctOutage"
        ignore_key = "timeStamp"
        nested_field = "WebCountyRecord"
        source = "remote"
        url = "https://example.com/power.json"
        missing_data_fill = "#f7f7f7"

        [[dataset.derived]]
        name = "pctOutage"
        numerator = "OutageCount"
        denominator = "CustomerCount"
        multiplier = 100

        [color]
        kind = "sequential"
        scheme = "oranges"
        domain = [0, 100]

        [selection]
        states = ["Alabama", "Louisiana", "Mississippi"]
        hide_other_states = true

        [output]
        svg = "output/map.svg"
        label_style = "name"
    "##;

    #[test]
    fn parses_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = AppConfig::load_from_file(file.path()).unwrap();
        let dataset = config.dataset.unwrap();
        assert_eq!(dataset.organization, "nested-by-state");
        assert_eq!(dataset.fips_field, "fips");
        assert_eq!(dataset.source, DataSource::Remote);
        assert_eq!(dataset.derived[0].multiplier, 100.0);
        assert_eq!(config.color.scheme, ColorScheme::Oranges);
        assert_eq!(config.selection.states.as_ref().map(Vec::len), Some(3));
        assert!(config.selection.hide_other_states);
        assert_eq!(config.output.label_style, LabelStyle::Name);
        assert_eq!(config.output.width, 960.0);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.input.states_object, "states");
    }

    #[test]
    fn dataset_section_is_optional() {
        let config: AppConfig = toml::from_str(
            r#"
            [input]
            topology = "topo.json"
            [output]
            svg = "map.svg"
            "#,
        )
        .unwrap();
        assert!(config.dataset.is_none());
        assert_eq!(config.color.domain, [0.0, 100.0]);
        assert!(config.selection.states.is_none());
    }

    #[test]
    fn source_is_local_or_remote() {
        let parse = |source: &str| {
            toml::from_str::<AppConfig>(&format!(
                r#"
                [input]
                topology = "topo.json"
                [dataset]
                organization = "flat"
                value_field = "v"
                source = "{source}"
                [output]
                svg = "map.svg"
                "#
            ))
        };
        assert_eq!(parse("local").unwrap().dataset.unwrap().source, DataSource::Local);
        assert_eq!(parse("remote").unwrap().dataset.unwrap().source, DataSource::Remote);
        assert!(parse("none").is_err());
    }

    #[test]
    fn missing_file_has_context() {
        let err = AppConfig::load_from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
