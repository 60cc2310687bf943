use crate::config::OutputConfig;
use crate::pipeline::ChoroplethFrame;
use crate::projection::Mercator;
use anyhow::{Context, Result};
use geo::{LineString, MultiLineString, MultiPolygon};
use rayon::prelude::*;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

// Labels sit slightly below their anchor, text lifted back above it
const LABEL_OFFSET_Y: f64 = 5.0;
const LABEL_TEXT_Y: f64 = -8.0;

/// Viewport of the plot area, inside the margins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn from_output(output: &OutputConfig) -> Self {
        let margin = output.margin;
        Viewport {
            width: (output.width - margin.left - margin.right).max(0.0),
            height: (output.width * output.aspect_height - margin.top - margin.bottom).max(0.0),
        }
    }
}

/// Projection fitted to the frame's extent.
pub fn fit_projection(frame: &ChoroplethFrame<'_>, viewport: Viewport) -> Mercator {
    Mercator::fit_size(viewport.width, viewport.height, &frame.extent)
}

pub fn render_svg(frame: &ChoroplethFrame<'_>, output: &OutputConfig) -> String {
    let viewport = Viewport::from_output(output);
    let projection = fit_projection(frame, viewport);
    let margin = output.margin;

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{:.0}" height="{:.0}">"#,
        viewport.width + margin.left + margin.right,
        viewport.height + margin.top + margin.bottom
    );
    let _ = writeln!(
        svg,
        r#"<g class="plot" transform="translate({},{})">"#,
        margin.left, margin.top
    );

    svg.push_str("<g class=\"states-g features-g\">\n");
    for state in &frame.states {
        let _ = writeln!(
            svg,
            r#"<path class="state st-{}" d="{}"/>"#,
            state.id,
            polygon_path(&state.geometry, &projection)
        );
    }
    svg.push_str("</g>\n");

    // county paths dominate the output, build them in parallel
    let county_paths: Vec<String> = frame
        .counties
        .par_iter()
        .map(|county| {
            format!(
                r#"<path class="county" id="c-{}" fill="{}" d="{}"/>"#,
                county.id,
                frame.fill(&county.id),
                polygon_path(&county.geometry, &projection)
            )
        })
        .collect();
    svg.push_str("<g class=\"counties-g features-g\">\n");
    for path in county_paths {
        svg.push_str(&path);
        svg.push('\n');
    }
    svg.push_str("</g>\n");

    let _ = writeln!(
        svg,
        r#"<path class="borders" fill="none" d="{}"/>"#,
        mesh_path(frame.borders, &projection)
    );

    svg.push_str("<g class=\"labels-g\">\n");
    for label in &frame.labels {
        let (x, y) = projection.project_anchor(label.anchor);
        let text = escape_xml(&label.text);
        let _ = writeln!(
            svg,
            r#"<g class="state-label {}" transform="translate({:.2},{:.2})"><text class="st bkgd" y="{}">{}</text><text class="st front" y="{}">{}</text></g>"#,
            label.postal,
            x,
            y + LABEL_OFFSET_Y,
            LABEL_TEXT_Y,
            text,
            LABEL_TEXT_Y,
            text
        );
    }
    svg.push_str("</g>\n");

    if let Some(caption) = frame.timestamp_caption() {
        let _ = writeln!(
            svg,
            r#"<text class="update-time" x="0" y="{:.0}">{}</text>"#,
            viewport.height,
            escape_xml(&caption)
        );
    }

    svg.push_str("</g>\n</svg>\n");
    svg
}

pub fn write_svg(path: &Path, svg: &str) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).context("Failed to create output directory")?;
    }
    fs::write(path, svg).with_context(|| format!("Failed to write SVG: {:?}", path))?;
    info!("Wrote {:?}", path);
    Ok(())
}

fn polygon_path(shape: &MultiPolygon<f64>, projection: &Mercator) -> String {
    let mut d = String::new();
    for polygon in shape {
        ring_path(&mut d, polygon.exterior(), projection, true);
        for hole in polygon.interiors() {
            ring_path(&mut d, hole, projection, true);
        }
    }
    d
}

fn mesh_path(mesh: &MultiLineString<f64>, projection: &Mercator) -> String {
    let mut d = String::new();
    for line in mesh {
        ring_path(&mut d, line, projection, false);
    }
    d
}

fn ring_path(d: &mut String, line: &LineString<f64>, projection: &Mercator, close: bool) {
    for (i, coord) in line.coords().enumerate() {
        let (x, y) = projection.project(coord.x, coord.y);
        let command = if i == 0 { 'M' } else { 'L' };
        let _ = write!(d, "{command}{x:.2},{y:.2}");
    }
    if close && line.0.len() > 1 {
        d.push('Z');
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
