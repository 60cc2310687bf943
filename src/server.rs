use crate::config::AppConfig;
use crate::geography::Geography;
use crate::pipeline::{
    draw, draw_base, fetch_latest, ChoroplethFrame, DataState, DrawGenerations, DrawOutcome,
    DrawTicket, Fetched, RenderRequest,
};
use crate::render::render_svg;
use crate::source::DataFetchError;
use crate::types::ResolvedRecord;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use geo::Point;
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

// Wrapper for RTree indexing
pub struct CountyIndex {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for CountyIndex {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Owned result of the latest applied draw.
#[derive(Debug, Clone, Default)]
pub struct ServedMap {
    pub svg: String,
    pub fills: HashMap<String, String>,
    pub records: HashMap<String, ResolvedRecord>,
    pub no_data: Option<String>,
}

impl ServedMap {
    fn from_frame(frame: &ChoroplethFrame<'_>, config: &AppConfig) -> Self {
        ServedMap {
            svg: render_svg(frame, &config.output),
            fills: frame
                .counties
                .iter()
                .map(|c| (c.id.clone(), frame.fill(&c.id).to_string()))
                .collect(),
            records: frame
                .resolved()
                .map(|r| r.records.clone())
                .unwrap_or_default(),
            no_data: match &frame.data {
                DataState::NoData(reason) => Some(reason.clone()),
                _ => None,
            },
        }
    }
}

pub struct AppState {
    pub geography: Arc<Geography>,
    pub tree: RTree<CountyIndex>,
    pub config: AppConfig,
    pub request: RenderRequest,
    pub generations: DrawGenerations,
    pub current: RwLock<ServedMap>,
}

impl AppState {
    pub fn new(config: AppConfig, geography: Geography) -> Self {
        info!("Building spatial index for API...");
        let tree = build_index(&geography);
        AppState {
            geography: Arc::new(geography),
            tree,
            request: RenderRequest::from_config(&config),
            config,
            generations: DrawGenerations::default(),
            current: RwLock::new(ServedMap::default()),
        }
    }

    /// Draws and renders; fatal data errors fall back to the base map.
    fn render(&self, raw: Option<Result<Value, DataFetchError>>) -> Option<ServedMap> {
        let frame = match draw(&self.geography, &self.request, raw) {
            Ok(frame) => frame,
            Err(e) => {
                error!("draw failed, serving base map: {e}");
                match draw_base(&self.geography, &self.request, e.to_string()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("base map failed: {e}");
                        return None;
                    }
                }
            }
        };
        Some(ServedMap::from_frame(&frame, &self.config))
    }

    /// Installs `map` unless a newer draw began after `ticket` was issued.
    async fn commit(&self, ticket: DrawTicket, map: ServedMap) -> bool {
        let mut current = self.current.write().await;
        if !self.generations.is_current(ticket) {
            return false;
        }
        *current = map;
        true
    }
}

enum Redraw {
    Ready(DrawTicket, ServedMap),
    Superseded,
    Failed,
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Serialize)]
pub struct QueryResponse {
    fips: String,
    fill: Option<String>,
    record: Option<ResolvedRecord>,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    applied: bool,
    counties: usize,
    no_data: Option<String>,
}

pub fn build_index(geography: &Geography) -> RTree<CountyIndex> {
    let items: Vec<CountyIndex> = geography
        .counties
        .iter()
        .enumerate()
        .filter_map(|(i, county)| {
            let rect = county.geometry.bounding_rect()?;
            Some(CountyIndex {
                index: i,
                aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
            })
        })
        .collect();
    RTree::bulk_load(items)
}

/// Fetches and renders a new map. Rendering runs on the blocking pool.
async fn redraw(state: &Arc<AppState>) -> Redraw {
    let fetched = match fetch_latest(&state.request, &state.generations).await {
        DrawOutcome::Applied(fetched) => fetched,
        DrawOutcome::Superseded => return Redraw::Superseded,
    };

    let Fetched { ticket, raw } = fetched;
    let worker = Arc::clone(state);
    match tokio::task::spawn_blocking(move || worker.render(raw)).await {
        Ok(Some(map)) => Redraw::Ready(ticket, map),
        Ok(None) => Redraw::Failed,
        Err(e) => {
            error!("render task failed: {e}");
            Redraw::Failed
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/map.svg", get(svg_handler))
        .route("/api/query", get(query_handler))
        .route("/api/refresh", post(refresh_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: AppConfig, geography: Geography) -> Result<()> {
    let port = config.server.port;
    let state = Arc::new(AppState::new(config, geography));

    if let Redraw::Ready(ticket, map) = redraw(&state).await {
        state.commit(ticket, map).await;
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn svg_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let svg = state.current.read().await.svg.clone();
    ([(header::CONTENT_TYPE, "image/svg+xml")], svg)
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rejected = |status| {
        (
            status,
            Json(RefreshResponse {
                applied: false,
                counties: 0,
                no_data: None,
            }),
        )
    };

    match redraw(&state).await {
        Redraw::Ready(ticket, map) => {
            let response = RefreshResponse {
                applied: true,
                counties: map.fills.len(),
                no_data: map.no_data.clone(),
            };
            if state.commit(ticket, map).await {
                (StatusCode::OK, Json(response))
            } else {
                rejected(StatusCode::CONFLICT)
            }
        }
        Redraw::Superseded => rejected(StatusCode::CONFLICT),
        Redraw::Failed => rejected(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<QueryResponse>> {
    let point = Point::new(params.lon, params.lat);
    let envelope = AABB::from_point([params.lon, params.lat]);

    let hit = state
        .tree
        .locate_in_envelope_intersecting(&envelope)
        .filter_map(|candidate| state.geography.counties.get(candidate.index))
        .find(|county| county.geometry.contains(&point))
        .map(|county| county.id.clone());

    if let Some(fips) = hit {
        let current = state.current.read().await;
        return Json(Some(QueryResponse {
            fill: current.fills.get(&fips).cloned(),
            record: current.records.get(&fips).cloned(),
            fips,
        }));
    }

    Json(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geography::{builtin_label_anchors, builtin_state_styles};
    use crate::topology::{fixtures::TWO_STATES, Topology};
    use serde_json::json;
    use std::io::Write;
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

    fn app_state(dataset: &str) -> Arc<AppState> {
        let config: AppConfig = toml::from_str(&format!(
            r#"
            [input]
            topology = "us.json"

            {dataset}

            [output]
            svg = "map.svg"
            "#
        ))
        .unwrap();
        Arc::new(AppState::new(config, geography()))
    }

    fn local_dataset(file: &tempfile::NamedTempFile) -> String {
        format!(
            r#"
            [dataset]
            organization = "flat"
            value_field = "v"
            path = {:?}
            "#,
            file.path()
        )
    }

    fn remote_dataset(url: &str) -> String {
        format!(
            r#"
            [dataset]
            organization = "flat"
            value_field = "v"
            source = "remote"
            url = "{url}"
            "#
        )
    }

    #[test]
    fn index_finds_county_candidates() {
        let geo = geography();
        let tree = build_index(&geo);

        let hits: Vec<&str> = tree
            .locate_in_envelope_intersecting(&AABB::from_point([1.5, 0.5]))
            .map(|c| geo.counties[c.index].id.as_str())
            .collect();
        assert_eq!(hits, vec!["22001"]);
    }

    #[tokio::test]
    async fn refresh_then_query_returns_fill_and_record() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(br#"[{"fips": "22001", "v": 100}]"#).unwrap();
        let state = app_state(&local_dataset(&file));

        let response = refresh_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let Json(hit) = query_handler(
            State(Arc::clone(&state)),
            Query(QueryParams { lat: 0.5, lon: 1.5 }),
        )
        .await;
        let hit = hit.unwrap();
        assert_eq!(hit.fips, "22001");
        assert_eq!(hit.fill.as_deref(), Some("#7f2704"));
        assert_eq!(hit.record.unwrap().get("v"), Some(&json!(100)));

        let Json(miss) = query_handler(State(state), Query(QueryParams { lat: 0.5, lon: 5.0 })).await;
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn stale_map_is_not_committed() {
        let state = app_state("");
        let Redraw::Ready(ticket, map) = redraw(&state).await else {
            panic!("a lone redraw should produce a map");
        };

        let newer = state.generations.begin();
        assert!(!state.commit(ticket, map.clone()).await);
        assert!(state.current.read().await.svg.is_empty());

        assert!(state.commit(newer, map).await);
        assert!(state.current.read().await.svg.starts_with("<svg"));
    }

    #[tokio::test]
    async fn refresh_superseded_during_fetch_conflicts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/outages.json", listener.local_addr().unwrap());
        let state = app_state(&remote_dataset(&url));

        let (response, _) = tokio::join!(refresh_handler(State(Arc::clone(&state))), async {
            let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
            state.generations.begin();
            drop(accepted);
        });

        assert_eq!(response.into_response().status(), StatusCode::CONFLICT);
        assert!(state.current.read().await.svg.is_empty());
    }
}
