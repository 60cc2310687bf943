use crate::color::{ColorError, ColorMapper, Rgb};
use crate::config::{AppConfig, ColorScaleConfig, DatasetConfig, LabelStyle, SelectionConfig};
use crate::dataset::{resolve, ResolveError, ResolvedDataset};
use crate::filter::StateFilter;
use crate::geography::{Geography, StateLabel};
use crate::source::{load_dataset, DataFetchError};
use crate::types::{GeoFeature, ResolvedRecord};
use geo::MultiLineString;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

const DEFAULT_MISSING_FILL: &str = "#f7f7f7";

/// Everything a draw needs besides the geography.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub dataset: Option<DatasetConfig>,
    pub color: ColorScaleConfig,
    pub selection: SelectionConfig,
    pub label_style: LabelStyle,
}

impl RenderRequest {
    pub fn from_config(config: &AppConfig) -> Self {
        RenderRequest {
            dataset: config.dataset.clone(),
            color: config.color.clone(),
            selection: config.selection.clone(),
            label_style: config.output.label_style,
        }
    }
}

#[derive(Debug)]
pub enum DrawError {
    Color(ColorError),
    Resolve(ResolveError),
}

impl fmt::Display for DrawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Color(e) => write!(f, "invalid color configuration: {e}"),
            Self::Resolve(e) => write!(f, "could not resolve dataset: {e}"),
        }
    }
}

impl std::error::Error for DrawError {}

impl From<ColorError> for DrawError {
    fn from(value: ColorError) -> Self {
        Self::Color(value)
    }
}

impl From<ResolveError> for DrawError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

/// What the frame knows about county data.
#[derive(Debug, Clone, PartialEq)]
pub enum DataState {
    /// No dataset configured; base map only.
    Disabled,
    /// The dataset could not be obtained or used; every county gets the
    /// missing-data fill.
    NoData(String),
    Loaded(ResolvedDataset),
}

/// The output of one draw, borrowing geometry from the shared geography.
#[derive(Debug, Clone)]
pub struct ChoroplethFrame<'g> {
    pub counties: Vec<&'g GeoFeature>,
    pub states: Vec<&'g GeoFeature>,
    /// Features the projection is fit to.
    pub extent: Vec<&'g GeoFeature>,
    pub borders: &'g MultiLineString<f64>,
    pub labels: Vec<StateLabel>,
    /// Selected state names that did not match any state.
    pub unresolved_states: Vec<String>,
    pub data: DataState,
    mapper: ColorMapper,
    value_field: Option<String>,
}

impl<'g> ChoroplethFrame<'g> {
    /// Fill for a county; the missing-data fill when it has no usable value.
    pub fn fill(&self, fips: &str) -> Rgb {
        match (&self.data, &self.value_field) {
            (DataState::Loaded(resolved), Some(field)) => {
                self.mapper.map(&resolved.records, fips, field)
            }
            _ => self.mapper.fallback(),
        }
    }

    pub fn record(&self, fips: &str) -> Option<&ResolvedRecord> {
        match &self.data {
            DataState::Loaded(resolved) => resolved.get(fips),
            _ => None,
        }
    }

    pub fn resolved(&self) -> Option<&ResolvedDataset> {
        match &self.data {
            DataState::Loaded(resolved) => Some(resolved),
            _ => None,
        }
    }

    pub fn missing_fill(&self) -> Rgb {
        self.mapper.fallback()
    }

    /// Caption text for the data timestamp, when the dataset carried one.
    pub fn timestamp_caption(&self) -> Option<String> {
        let resolved = self.resolved()?;
        resolved
            .formatted_timestamp()
            .or_else(|| resolved.timestamp.clone())
    }
}

/// Builds a frame from already-loaded data. `raw` is `None` when nothing was
/// fetched. Resolve errors are returned, fetch errors become
/// [`DataState::NoData`].
pub fn draw<'g>(
    geography: &'g Geography,
    request: &RenderRequest,
    raw: Option<Result<Value, DataFetchError>>,
) -> Result<ChoroplethFrame<'g>, DrawError> {
    let data = match (&request.dataset, raw) {
        (None, _) => DataState::Disabled,
        (Some(_), None) => DataState::NoData("dataset was not loaded".to_string()),
        (Some(_), Some(Err(e))) => {
            warn!("dataset unavailable, drawing without data: {e}");
            DataState::NoData(e.to_string())
        }
        (Some(config), Some(Ok(raw))) => {
            let resolved = resolve(&raw, config)?;
            if !resolved.report.is_clean() {
                warn!(
                    "dataset resolved with {} skipped records, {} duplicate counties, {} states without records",
                    resolved.report.skipped.len(),
                    resolved.report.duplicates.len(),
                    resolved.report.missing_collections.len()
                );
            }
            DataState::Loaded(resolved)
        }
    };
    build_frame(geography, request, data)
}

/// A frame with the base map only, for when the data failed.
pub fn draw_base<'g>(
    geography: &'g Geography,
    request: &RenderRequest,
    reason: impl Into<String>,
) -> Result<ChoroplethFrame<'g>, DrawError> {
    build_frame(geography, request, DataState::NoData(reason.into()))
}

fn build_frame<'g>(
    geography: &'g Geography,
    request: &RenderRequest,
    data: DataState,
) -> Result<ChoroplethFrame<'g>, DrawError> {
    let missing_fill = request
        .dataset
        .as_ref()
        .map_or(DEFAULT_MISSING_FILL, |d| d.missing_data_fill.as_str());
    let mapper = ColorMapper::new(&request.color, missing_fill)?;

    let filter = StateFilter::new(&request.selection, &geography.index);
    if !filter.unresolved().is_empty() {
        info!("ignoring unknown states in selection: {:?}", filter.unresolved());
    }

    let extent = if filter.is_active() {
        filter.extent_features(&geography.states)
    } else {
        geography.states.iter().collect()
    };

    Ok(ChoroplethFrame {
        counties: filter.filter_features(&geography.counties),
        states: filter.filter_state_outlines(&geography.states),
        extent,
        borders: &geography.border_mesh,
        labels: filter.filter_labels(geography.labels(request.label_style)),
        unresolved_states: filter.unresolved().to_vec(),
        data,
        mapper,
        value_field: request.dataset.as_ref().map(|d| d.value_field.clone()),
    })
}

/// Hands out increasing generations so a draw can tell whether a newer one
/// started while it was waiting on the network.
#[derive(Debug, Default)]
pub struct DrawGenerations {
    latest: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawTicket {
    generation: u64,
}

impl DrawGenerations {
    pub fn begin(&self) -> DrawTicket {
        let generation = self.latest.fetch_add(1, Ordering::AcqRel) + 1;
        DrawTicket { generation }
    }

    pub fn is_current(&self, ticket: DrawTicket) -> bool {
        self.latest.load(Ordering::Acquire) == ticket.generation
    }
}

#[derive(Debug)]
pub enum DrawOutcome<T> {
    Applied(T),
    /// A newer draw began before this one's data arrived.
    Superseded,
}

/// Data fetched under a ticket that was still current when it arrived.
#[derive(Debug)]
pub struct Fetched {
    pub ticket: DrawTicket,
    /// `None` when no dataset is configured.
    pub raw: Option<Result<Value, DataFetchError>>,
}

/// Takes a ticket and fetches the dataset (if any). `Superseded` when a
/// newer draw started while the fetch was in flight.
pub async fn fetch_latest(
    request: &RenderRequest,
    generations: &DrawGenerations,
) -> DrawOutcome<Fetched> {
    let ticket = generations.begin();

    let raw = match &request.dataset {
        Some(config) => Some(load_dataset(config).await),
        None => None,
    };

    if !generations.is_current(ticket) {
        info!("discarding data for superseded draw {}", ticket.generation);
        return DrawOutcome::Superseded;
    }
    DrawOutcome::Applied(Fetched { ticket, raw })
}

/// Fetches the dataset (if any) and draws, unless a newer draw started in
/// the meantime.
pub async fn draw_latest<'g>(
    geography: &'g Geography,
    request: &RenderRequest,
    generations: &DrawGenerations,
) -> Result<DrawOutcome<ChoroplethFrame<'g>>, DrawError> {
    match fetch_latest(request, generations).await {
        DrawOutcome::Applied(fetched) => draw(geography, request, fetched.raw).map(DrawOutcome::Applied),
        DrawOutcome::Superseded => Ok(DrawOutcome::Superseded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorScheme;
    use crate::config::DataSource;
    use crate::geography::{builtin_label_anchors, builtin_state_styles};
    use crate::topology::{fixtures::TWO_STATES, Topology};
    use serde_json::json;
    use std::time::Duration;

    fn geography() -> Geography {
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

    fn dataset(organization: &str) -> DatasetConfig {
        DatasetConfig {
            organization: organization.to_string(),
            value_field: "OutageCount".to_string(),
            fips_field: "fips".to_string(),
            ignore_key: None,
            nested_field: None,
            source: DataSource::Local,
            path: None,
            url: None,
            missing_data_fill: "white".to_string(),
            request_timeout_secs: 10,
            derived: Vec::new(),
        }
    }

    fn request(dataset: Option<DatasetConfig>) -> RenderRequest {
        RenderRequest {
            dataset,
            color: ColorScaleConfig::default(),
            selection: SelectionConfig::default(),
            label_style: LabelStyle::Ap,
        }
    }

    #[test]
    fn colors_counties_with_data_and_falls_back_elsewhere() {
        let geo = geography();
        let req = request(Some(dataset("flat")));
        let raw = json!([{"fips": "01001", "OutageCount": 10}]);

        let frame = draw(&geo, &req, Some(Ok(raw))).unwrap();

        assert_eq!(frame.fill("01001"), ColorScheme::Oranges.interpolate(0.1));
        assert_eq!(frame.fill("01003"), Rgb::WHITE);
        assert_eq!(frame.fill("22001"), Rgb::WHITE);
        assert_eq!(frame.counties.len(), 3);
    }

    #[test]
    fn fetch_failure_keeps_the_base_map() {
        let geo = geography();
        let req = request(Some(dataset("flat")));
        let err = DataFetchError::MissingLocation("url");

        let frame = draw(&geo, &req, Some(Err(err))).unwrap();

        assert!(matches!(frame.data, DataState::NoData(_)));
        assert_eq!(frame.states.len(), 2);
        assert_eq!(frame.fill("01001"), Rgb::WHITE);
    }

    #[test]
    fn unsupported_shape_fails_the_draw() {
        let geo = geography();
        let req = request(Some(dataset("xml")));
        let raw = json!([{"fips": "01001", "OutageCount": 10}]);

        let err = draw(&geo, &req, Some(Ok(raw))).unwrap_err();
        assert!(matches!(err, DrawError::Resolve(ResolveError::UnsupportedShape(_))));

        let base = draw_base(&geo, &req, err.to_string()).unwrap();
        assert!(base.resolved().is_none());
        assert_eq!(base.fill("01001"), Rgb::WHITE);
    }

    #[test]
    fn selection_narrows_counties_and_extent() {
        let geo = geography();
        let mut req = request(None);
        req.selection = SelectionConfig {
            states: Some(vec!["Louisiana".to_string(), "Narnia".to_string()]),
            hide_other_states: false,
        };

        let frame = draw(&geo, &req, None).unwrap();

        assert_eq!(frame.data, DataState::Disabled);
        let counties: Vec<&str> = frame.counties.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(counties, vec!["22001"]);
        assert_eq!(frame.states.len(), 2);
        assert_eq!(frame.extent.len(), 1);
        assert_eq!(frame.labels.len(), 1);
        assert_eq!(frame.unresolved_states, vec!["Narnia".to_string()]);
        assert_eq!(frame.missing_fill(), Rgb(0xf7, 0xf7, 0xf7));
    }

    #[test]
    fn timestamp_caption_is_formatted() {
        let geo = geography();
        let mut config = dataset("nested-by-state");
        config.ignore_key = Some("timeStamp".to_string());
        let req = request(Some(config));
        let raw = json!({
            "timeStamp": "Wed, 01 Sep 2021 14:05:00 +0000",
            "Alabama": [{"fips": "01001", "OutageCount": 50}]
        });

        let frame = draw(&geo, &req, Some(Ok(raw))).unwrap();
        assert_eq!(frame.timestamp_caption().as_deref(), Some("September 01, 2:05 PM"));
        assert_eq!(frame.record("01001").and_then(|r| r.state()), Some("Alabama"));
    }

    #[test]
    fn newer_draw_supersedes_older_ticket() {
        let generations = DrawGenerations::default();
        let first = generations.begin();
        assert!(generations.is_current(first));

        let second = generations.begin();
        assert!(!generations.is_current(first));
        assert!(generations.is_current(second));
    }

    #[tokio::test]
    async fn draw_latest_without_dataset_applies() {
        let geo = geography();
        let generations = DrawGenerations::default();
        let outcome = draw_latest(&geo, &request(None), &generations).await.unwrap();
        assert!(matches!(outcome, DrawOutcome::Applied(_)));
    }

    /// A `url` on localhost where nothing is listening.
    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}/outages.json")
    }

    #[tokio::test]
    async fn unreachable_server_draws_without_data() {
        let geo = geography();
        let generations = DrawGenerations::default();
        let mut config = dataset("flat");
        config.source = DataSource::Remote;
        config.url = Some(closed_port_url());

        let outcome = draw_latest(&geo, &request(Some(config)), &generations)
            .await
            .unwrap();
        match outcome {
            DrawOutcome::Applied(frame) => {
                assert!(matches!(frame.data, DataState::NoData(_)));
                assert_eq!(frame.fill("01001"), Rgb::WHITE);
            }
            DrawOutcome::Superseded => panic!("only one draw was started"),
        }
    }

    #[tokio::test]
    async fn draw_started_during_fetch_supersedes_it() {
        let geo = geography();
        let generations = DrawGenerations::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = dataset("flat");
        config.source = DataSource::Remote;
        config.url = Some(format!("http://{}/outages.json", listener.local_addr().unwrap()));
        let req = request(Some(config));

        // a second draw begins while the first one's request is still open
        let (outcome, newer) = tokio::join!(draw_latest(&geo, &req, &generations), async {
            let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
            let ticket = generations.begin();
            drop(accepted);
            ticket
        });

        assert!(matches!(outcome.unwrap(), DrawOutcome::Superseded));
        assert!(generations.is_current(newer));
    }

    #[tokio::test]
    async fn draw_latest_reports_missing_location_as_no_data() {
        let geo = geography();
        let generations = DrawGenerations::default();
        let mut config = dataset("flat");
        config.source = DataSource::Remote;

        let outcome = draw_latest(&geo, &request(Some(config)), &generations)
            .await
            .unwrap();
        match outcome {
            DrawOutcome::Applied(frame) => assert!(matches!(frame.data, DataState::NoData(_))),
            DrawOutcome::Superseded => panic!("only one draw was started"),
        }
    }
}
