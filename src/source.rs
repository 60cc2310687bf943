use crate::config::{DataSource, DatasetConfig};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug)]
pub enum DataFetchError {
    MissingLocation(&'static str),
    UnsupportedFormat(PathBuf),
    Io { path: PathBuf, source: std::io::Error },
    Json(serde_json::Error),
    Csv(csv::Error),
    Http(reqwest::Error),
}

impl fmt::Display for DataFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingLocation(what) => write!(f, "dataset source needs a {what}"),
            Self::UnsupportedFormat(path) => {
                write!(f, "unsupported dataset format: {:?}", path)
            }
            Self::Io { path, source } => write!(f, "failed to read {:?}: {source}", path),
            Self::Json(e) => write!(f, "failed to parse dataset JSON: {e}"),
            Self::Csv(e) => write!(f, "failed to parse dataset CSV: {e}"),
            Self::Http(e) => write!(f, "failed to fetch dataset: {e}"),
        }
    }
}

impl std::error::Error for DataFetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json(e) => Some(e),
            Self::Csv(e) => Some(e),
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DataFetchError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<csv::Error> for DataFetchError {
    fn from(value: csv::Error) -> Self {
        Self::Csv(value)
    }
}

impl From<reqwest::Error> for DataFetchError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

/// Loads the dataset described by `config`, from a file or a URL.
pub async fn load_dataset(config: &DatasetConfig) -> Result<Value, DataFetchError> {
    match config.source {
        DataSource::Local => {
            let path = config
                .path
                .as_deref()
                .ok_or(DataFetchError::MissingLocation("path"))?;
            let format = LocalFormat::from_path(path)?;
            info!("Reading dataset from {:?}...", path);
            let bytes = tokio::fs::read(path).await.map_err(|source| DataFetchError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            format.parse(&bytes)
        }
        DataSource::Remote => {
            let url = config
                .url
                .as_deref()
                .ok_or(DataFetchError::MissingLocation("url"))?;
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_secs))
                .build()?;
            fetch_remote(&client, url).await
        }
    }
}

/// Reads a `.json` dataset, or a `.csv` one as a flat array of records
/// with every cell kept as a string.
pub fn read_local(path: &Path) -> Result<Value, DataFetchError> {
    let format = LocalFormat::from_path(path)?;
    info!("Reading dataset from {:?}...", path);
    let bytes = fs::read(path).map_err(|source| DataFetchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    format.parse(&bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalFormat {
    Json,
    Csv,
}

impl LocalFormat {
    fn from_path(path: &Path) -> Result<Self, DataFetchError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_lowercase());
        match extension.as_deref() {
            Some("json") => Ok(LocalFormat::Json),
            Some("csv") => Ok(LocalFormat::Csv),
            _ => Err(DataFetchError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    fn parse(self, bytes: &[u8]) -> Result<Value, DataFetchError> {
        match self {
            LocalFormat::Json => Ok(serde_json::from_slice(bytes)?),
            LocalFormat::Csv => read_csv(bytes),
        }
    }
}

fn read_csv<R: std::io::Read>(reader: R) -> Result<Value, DataFetchError> {
    let mut rdr = csv::ReaderBuilder::new().from_reader(reader);
    let headers = rdr.headers()?.clone();

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let row: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
            .collect();
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

pub async fn fetch_remote(client: &reqwest::Client, url: &str) -> Result<Value, DataFetchError> {
    info!("Fetching dataset from {url}...");
    let resp = client.get(url).send().await?.error_for_status()?;
    let data: Value = resp.json().await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn temp_with(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reads_json_datasets() {
        let file = temp_with(".json", r#"[{"fips": "01001", "v": 5}]"#);
        let data = read_local(file.path()).unwrap();
        assert_eq!(data, json!([{"fips": "01001", "v": 5}]));
    }

    #[test]
    fn reads_csv_as_flat_records() {
        let file = temp_with(".csv", "fips,OutageCount\n01001,10\n22001,3\n");
        let data = read_local(file.path()).unwrap();
        assert_eq!(
            data,
            json!([
                {"fips": "01001", "OutageCount": "10"},
                {"fips": "22001", "OutageCount": "3"}
            ])
        );
    }

    #[test]
    fn rejects_unknown_extensions() {
        let file = temp_with(".xml", "<data/>");
        assert!(matches!(
            read_local(file.path()),
            Err(DataFetchError::UnsupportedFormat(_))
        ));
    }

    fn dataset(source: DataSource) -> DatasetConfig {
        DatasetConfig {
            organization: "flat".to_string(),
            value_field: "v".to_string(),
            fips_field: "fips".to_string(),
            ignore_key: None,
            nested_field: None,
            source,
            path: None,
            url: None,
            missing_data_fill: "white".to_string(),
            request_timeout_secs: 2,
            derived: Vec::new(),
        }
    }

    #[tokio::test]
    async fn load_dataset_reads_configured_path() {
        let file = temp_with(".csv", "fips,v\n1001,7\n");
        let mut config = dataset(DataSource::Local);
        config.path = Some(file.path().to_path_buf());

        let data = load_dataset(&config).await.unwrap();
        assert_eq!(data, json!([{"fips": "1001", "v": "7"}]));
    }

    #[tokio::test]
    async fn unreachable_url_is_an_http_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = dataset(DataSource::Remote);
        config.url = Some(format!("http://127.0.0.1:{port}/outages.json"));

        let err = load_dataset(&config).await.unwrap_err();
        assert!(matches!(err, DataFetchError::Http(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = read_local(Path::new("/no/such/dataset.json")).unwrap_err();
        assert!(matches!(err, DataFetchError::Io { .. }));
    }
}
