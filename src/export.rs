use crate::pipeline::ChoroplethFrame;
use anyhow::{Context, Result};
use geojson::feature::Id;
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, JsonObject, JsonValue};
use std::fs;
use std::path::Path;
use tracing::info;

/// The visible counties as a FeatureCollection, each carrying its fill and
/// resolved record fields as properties.
pub fn counties_to_geojson(frame: &ChoroplethFrame<'_>) -> GeoJson {
    let features = frame
        .counties
        .iter()
        .map(|county| {
            let mut properties = JsonObject::new();
            if let Some(record) = frame.record(&county.id) {
                properties.extend(record.fields.clone());
            }
            properties.insert("fips".to_string(), JsonValue::from(county.id.clone()));
            properties.insert("fill".to_string(), JsonValue::from(frame.fill(&county.id).to_string()));

            Feature {
                bbox: None,
                geometry: Some(Geometry::new(geojson::Value::from(&county.geometry))),
                id: Some(Id::String(county.id.clone())),
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    GeoJson::FeatureCollection(FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
}

pub fn write_geojson(path: &Path, frame: &ChoroplethFrame<'_>) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).context("Failed to create output directory")?;
    }
    let geojson = counties_to_geojson(frame);
    fs::write(path, geojson.to_string())
        .with_context(|| format!("Failed to write GeoJSON: {:?}", path))?;
    info!("Wrote {:?}", path);
    Ok(())
}
