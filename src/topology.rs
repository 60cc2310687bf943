use geo::{Coord, LineString, MultiLineString, MultiPolygon, Polygon};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;

#[derive(Debug)]
pub enum TopologyError {
    Parse(serde_json::Error),
    UnknownObject(String),
    NotACollection(String),
    ArcOutOfRange(i64),
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "failed to parse topology: {e}"),
            Self::UnknownObject(name) => write!(f, "topology has no object named {name:?}"),
            Self::NotACollection(name) => {
                write!(f, "topology object {name:?} is not a GeometryCollection")
            }
            Self::ArcOutOfRange(i) => write!(f, "arc index {i} is out of range"),
        }
    }
}

impl std::error::Error for TopologyError {}

impl From<serde_json::Error> for TopologyError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Transform {
    scale: [f64; 2],
    translate: [f64; 2],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum TopoGeometry {
    GeometryCollection {
        geometries: Vec<TopoGeometry>,
    },
    Polygon {
        #[serde(default)]
        id: Option<Value>,
        arcs: Vec<Vec<i64>>,
    },
    MultiPolygon {
        #[serde(default)]
        id: Option<Value>,
        arcs: Vec<Vec<Vec<i64>>>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct RawTopology {
    #[serde(default)]
    transform: Option<Transform>,
    arcs: Vec<Vec<Vec<f64>>>,
    objects: HashMap<String, TopoGeometry>,
}

/// A decoded topology. Arc positions are absolute (quantization already
/// undone), so features and meshes can be assembled repeatedly.
#[derive(Debug, Clone)]
pub struct Topology {
    arcs: Vec<Vec<Coord<f64>>>,
    objects: HashMap<String, TopoGeometry>,
}

/// A polygon geometry from a topology object, with its raw id.
#[derive(Debug, Clone)]
pub struct TopoFeature {
    pub id: Option<String>,
    pub geometry: MultiPolygon<f64>,
}

impl Topology {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, TopologyError> {
        let raw: RawTopology = serde_json::from_reader(reader)?;
        Ok(Self::decode(raw))
    }

    pub fn parse(s: &str) -> Result<Self, TopologyError> {
        let raw: RawTopology = serde_json::from_str(s)?;
        Ok(Self::decode(raw))
    }

    fn decode(raw: RawTopology) -> Self {
        let arcs = raw
            .arcs
            .iter()
            .map(|arc| decode_arc(arc, raw.transform))
            .collect();
        Topology {
            arcs,
            objects: raw.objects,
        }
    }

    pub fn object_names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// Polygon features of a GeometryCollection object. Non-polygon members
    /// are skipped.
    pub fn features(&self, object: &str) -> Result<Vec<TopoFeature>, TopologyError> {
        let mut out = Vec::new();
        for geometry in self.collection(object)? {
            self.collect_features(geometry, &mut out)?;
        }
        Ok(out)
    }

    fn collect_features(
        &self,
        geometry: &TopoGeometry,
        out: &mut Vec<TopoFeature>,
    ) -> Result<(), TopologyError> {
        match geometry {
            TopoGeometry::GeometryCollection { geometries } => {
                for g in geometries {
                    self.collect_features(g, out)?;
                }
            }
            TopoGeometry::Polygon { id, arcs } => out.push(TopoFeature {
                id: id.as_ref().and_then(id_string),
                geometry: MultiPolygon::new(vec![self.polygon(arcs)?]),
            }),
            TopoGeometry::MultiPolygon { id, arcs } => {
                let polygons = arcs
                    .iter()
                    .map(|rings| self.polygon(rings))
                    .collect::<Result<Vec<_>, _>>()?;
                out.push(TopoFeature {
                    id: id.as_ref().and_then(id_string),
                    geometry: MultiPolygon::new(polygons),
                });
            }
            TopoGeometry::Unsupported => {}
        }
        Ok(())
    }

    /// Every arc of `object` exactly once, kept only when `filter` accepts
    /// the ids of the geometries on its two sides. Arcs on the outer edge
    /// have the same geometry on both sides.
    pub fn mesh<F>(&self, object: &str, filter: F) -> Result<MultiLineString<f64>, TopologyError>
    where
        F: Fn(Option<&str>, Option<&str>) -> bool,
    {
        let members = self.collection(object)?;

        // arc index -> ids of the geometries referencing it, in visit order
        let mut sides: HashMap<usize, Vec<Option<String>>> = HashMap::new();
        for geometry in members {
            visit_arcs(geometry, &mut |arc, id| {
                sides.entry(arc).or_default().push(id.map(str::to_string));
            });
        }

        let mut arcs: Vec<usize> = sides
            .iter()
            .filter(|(_, ids)| {
                let first = ids.first().and_then(|id| id.as_deref());
                let last = ids.last().and_then(|id| id.as_deref());
                filter(first, last)
            })
            .map(|(&arc, _)| arc)
            .collect();
        arcs.sort_unstable();

        let mut lines = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let coords = self
                .arcs
                .get(arc)
                .ok_or(TopologyError::ArcOutOfRange(arc as i64))?;
            lines.push(LineString::new(coords.clone()));
        }
        Ok(MultiLineString::new(lines))
    }

    fn collection(&self, object: &str) -> Result<&[TopoGeometry], TopologyError> {
        match self.objects.get(object) {
            Some(TopoGeometry::GeometryCollection { geometries }) => Ok(geometries),
            Some(_) => Err(TopologyError::NotACollection(object.to_string())),
            None => Err(TopologyError::UnknownObject(object.to_string())),
        }
    }

    fn polygon(&self, rings: &[Vec<i64>]) -> Result<Polygon<f64>, TopologyError> {
        let mut rings = rings.iter().map(|r| self.ring(r));
        let exterior = match rings.next() {
            Some(ring) => ring?,
            None => LineString::new(Vec::new()),
        };
        let interiors = rings.collect::<Result<Vec<_>, _>>()?;
        Ok(Polygon::new(exterior, interiors))
    }

    fn ring(&self, arc_indexes: &[i64]) -> Result<LineString<f64>, TopologyError> {
        let mut points: Vec<Coord<f64>> = Vec::new();
        for &index in arc_indexes {
            let arc = self
                .arcs
                .get(arc_slot(index))
                .ok_or(TopologyError::ArcOutOfRange(index))?;
            // consecutive arcs share their joining point
            points.pop();
            if index < 0 {
                points.extend(arc.iter().rev().copied());
            } else {
                points.extend(arc.iter().copied());
            }
        }
        Ok(LineString::new(points))
    }
}

fn arc_slot(index: i64) -> usize {
    if index < 0 {
        (!index) as usize
    } else {
        index as usize
    }
}

fn decode_arc(arc: &[Vec<f64>], transform: Option<Transform>) -> Vec<Coord<f64>> {
    let position = |p: &Vec<f64>| (p.first().copied().unwrap_or(0.0), p.get(1).copied().unwrap_or(0.0));

    match transform {
        None => arc
            .iter()
            .map(|p| {
                let (x, y) = position(p);
                Coord { x, y }
            })
            .collect(),
        Some(t) => {
            let (mut x, mut y) = (0.0, 0.0);
            arc.iter()
                .map(|p| {
                    let (dx, dy) = position(p);
                    x += dx;
                    y += dy;
                    Coord {
                        x: x * t.scale[0] + t.translate[0],
                        y: y * t.scale[1] + t.translate[1],
                    }
                })
                .collect()
        }
    }
}

fn visit_arcs<F>(geometry: &TopoGeometry, f: &mut F)
where
    F: FnMut(usize, Option<&str>),
{
    match geometry {
        TopoGeometry::GeometryCollection { geometries } => {
            for g in geometries {
                visit_arcs(g, f);
            }
        }
        TopoGeometry::Polygon { id, arcs } => {
            let id = id.as_ref().and_then(id_string);
            for &index in arcs.iter().flatten() {
                f(arc_slot(index), id.as_deref());
            }
        }
        TopoGeometry::MultiPolygon { id, arcs } => {
            let id = id.as_ref().and_then(id_string);
            for &index in arcs.iter().flatten().flatten() {
                f(arc_slot(index), id.as_deref());
            }
        }
        TopoGeometry::Unsupported => {}
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
