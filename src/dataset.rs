use crate::color::coerce_value;
use crate::config::{DatasetConfig, DerivedField};
use crate::fips::{normalize_fips_value, FipsError, COUNTY_WIDTH};
use crate::types::ResolvedRecord;
use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Attribute holding the originating state name on nested-by-state records.
pub const STATE_ATTRIBUTE: &str = "State";

const TIMESTAMP_FORMAT: &str = "%B %d, %-I:%M %p";

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// The configured organization is not one this resolver understands.
    UnsupportedShape(String),
    /// The dataset's top-level value does not match the configured
    /// organization.
    MalformedDataset {
        expected: &'static str,
        found: &'static str,
    },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedShape(org) => {
                write!(f, "unsupported dataset organization {org:?}")
            }
            Self::MalformedDataset { expected, found } => {
                write!(f, "expected the dataset to be {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for ResolveError {}

/// The two dataset layouts, with the fields each one needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetShape<'a> {
    Flat {
        fips_field: &'a str,
    },
    NestedByState {
        fips_field: &'a str,
        ignore_key: Option<&'a str>,
        nested_field: Option<&'a str>,
    },
}

impl DatasetConfig {
    pub fn shape(&self) -> Result<DatasetShape<'_>, ResolveError> {
        match self.organization.as_str() {
            "flat" => Ok(DatasetShape::Flat {
                fips_field: &self.fips_field,
            }),
            "nested-by-state" => Ok(DatasetShape::NestedByState {
                fips_field: &self.fips_field,
                ignore_key: self.ignore_key.as_deref(),
                nested_field: self.nested_field.as_deref(),
            }),
            other => Err(ResolveError::UnsupportedShape(other.to_string())),
        }
    }
}

/// Why a single record was left out of the resolved map.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NotAnObject,
    MissingFips,
    InvalidFips(FipsError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    /// Originating state, for nested sources.
    pub state: Option<String>,
    /// Position of the record in its collection.
    pub position: usize,
    pub reason: SkipReason,
}

/// What the resolver tolerated instead of failing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveReport {
    pub skipped: Vec<SkippedRecord>,
    /// FIPS codes seen more than once; the last record won.
    pub duplicates: Vec<String>,
    /// State entries whose county collection could not be found.
    pub missing_collections: Vec<String>,
}

impl ResolveReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.duplicates.is_empty() && self.missing_collections.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedDataset {
    pub records: HashMap<String, ResolvedRecord>,
    /// Value found under the ignored key of a nested dataset, when a string.
    pub timestamp: Option<String>,
    pub report: ResolveReport,
}

impl ResolvedDataset {
    pub fn get(&self, fips: &str) -> Option<&ResolvedRecord> {
        self.records.get(fips)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The timestamp as `September 01, 9:30 AM` when it parses as RFC 3339
    /// or RFC 2822.
    pub fn formatted_timestamp(&self) -> Option<String> {
        let raw = self.timestamp.as_deref()?;
        parse_timestamp(raw).map(|t| t.format(TIMESTAMP_FORMAT).to_string())
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .ok()
}

/// Resolves `raw` according to `config`. Fails only on shape problems;
/// bad individual records are skipped and listed in the report.
pub fn resolve(raw: &Value, config: &DatasetConfig) -> Result<ResolvedDataset, ResolveError> {
    let shape = config.shape()?;
    let mut resolver = Resolver {
        derived: &config.derived,
        out: ResolvedDataset::default(),
    };

    match shape {
        DatasetShape::Flat { fips_field } => {
            let records = raw.as_array().ok_or(ResolveError::MalformedDataset {
                expected: "an array of records",
                found: kind_of(raw),
            })?;
            resolver.insert_all(records, fips_field, None);
        }
        DatasetShape::NestedByState {
            fips_field,
            ignore_key,
            nested_field,
        } => {
            let states = raw.as_object().ok_or(ResolveError::MalformedDataset {
                expected: "an object keyed by state name",
                found: kind_of(raw),
            })?;

            for (state, entry) in states {
                if Some(state.as_str()) == ignore_key {
                    resolver.out.timestamp = entry.as_str().map(str::to_string);
                    continue;
                }

                let collection = match nested_field {
                    Some(path) => lookup_path(entry, path),
                    None => Some(entry),
                };
                match collection.and_then(Value::as_array) {
                    Some(records) => resolver.insert_all(records, fips_field, Some(state.as_str())),
                    None => {
                        warn!("no county records found for {state:?}");
                        resolver.out.report.missing_collections.push(state.clone());
                    }
                }
            }
        }
    }

    let out = resolver.out;
    debug!(
        "resolved {} counties ({} skipped, {} duplicates)",
        out.records.len(),
        out.report.skipped.len(),
        out.report.duplicates.len()
    );
    Ok(out)
}

struct Resolver<'a> {
    derived: &'a [DerivedField],
    out: ResolvedDataset,
}

impl Resolver<'_> {
    fn insert_all(&mut self, records: &[Value], fips_field: &str, state: Option<&str>) {
        for (position, record) in records.iter().enumerate() {
            if let Err(reason) = self.insert(record, fips_field, state) {
                self.out.report.skipped.push(SkippedRecord {
                    state: state.map(str::to_string),
                    position,
                    reason,
                });
            }
        }
    }

    fn insert(&mut self, record: &Value, fips_field: &str, state: Option<&str>) -> Result<(), SkipReason> {
        let fields = record.as_object().ok_or(SkipReason::NotAnObject)?;
        let code = fields.get(fips_field).ok_or(SkipReason::MissingFips)?;
        let fips = normalize_fips_value(code, COUNTY_WIDTH).map_err(SkipReason::InvalidFips)?;

        let mut fields = fields.clone();
        if let Some(state) = state {
            fields.insert(STATE_ATTRIBUTE.to_string(), Value::String(state.to_string()));
        }
        apply_derived(&mut fields, self.derived);

        let record = ResolvedRecord {
            fips: fips.clone(),
            fields,
        };
        if self.out.records.insert(fips.clone(), record).is_some() {
            self.out.report.duplicates.push(fips);
        }
        Ok(())
    }
}

fn apply_derived(fields: &mut Map<String, Value>, derived: &[DerivedField]) {
    for field in derived {
        let numerator = fields.get(&field.numerator).map(coerce_value);
        let denominator = fields.get(&field.denominator).map(coerce_value);
        let value = match (numerator, denominator) {
            (Some(n), Some(d)) if d != 0.0 => n / d * field.multiplier,
            _ => continue,
        };
        if let Some(number) = Number::from_f64(value) {
            fields.insert(field.name.clone(), Value::Number(number));
        }
    }
}

/// Follows a dotted path (`WebCountyRecord.values`) through nested objects.
fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
