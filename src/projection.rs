use crate::types::{GeoFeature, LabelAnchor};
use geo::{BoundingRect, Coord, Rect};
use std::f64::consts::PI;

// Web Mercator is undefined at the poles
const MAX_LATITUDE: f64 = 85.051_128_78;

/// Spherical Mercator scaled and translated to fit a viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mercator {
    scale: f64,
    translate: (f64, f64),
}

impl Mercator {
    /// Fits the projection so `features` fill a `width` x `height` box,
    /// centred along the slack axis.
    pub fn fit_size(width: f64, height: f64, features: &[&GeoFeature]) -> Self {
        let bounds = features
            .iter()
            .filter_map(|f| f.geometry.bounding_rect())
            .reduce(|a, b| {
                Rect::new(
                    Coord {
                        x: a.min().x.min(b.min().x),
                        y: a.min().y.min(b.min().y),
                    },
                    Coord {
                        x: a.max().x.max(b.max().x),
                        y: a.max().y.max(b.max().y),
                    },
                )
            });

        let Some(bounds) = bounds else {
            return Mercator {
                scale: 1.0,
                translate: (width / 2.0, height / 2.0),
            };
        };

        // project the geographic corners; y flips, so min/max swap
        let (x0, y1) = raw(bounds.min().x, bounds.min().y);
        let (x1, y0) = raw(bounds.max().x, bounds.max().y);
        let dx = x1 - x0;
        let dy = y1 - y0;

        let scale = match (dx > 0.0, dy > 0.0) {
            (true, true) => (width / dx).min(height / dy),
            (true, false) => width / dx,
            (false, true) => height / dy,
            (false, false) => 1.0,
        };
        Mercator {
            scale,
            translate: (
                (width - scale * (x0 + x1)) / 2.0,
                (height - scale * (y0 + y1)) / 2.0,
            ),
        }
    }

    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        let (x, y) = raw(lon, lat);
        (
            x * self.scale + self.translate.0,
            y * self.scale + self.translate.1,
        )
    }

    pub fn project_anchor(&self, anchor: LabelAnchor) -> (f64, f64) {
        self.project(anchor.longitude, anchor.latitude)
    }
}

fn raw(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = lon.to_radians();
    let y = -((PI / 4.0 + lat / 2.0).tan()).ln();
    (x, y)
}
