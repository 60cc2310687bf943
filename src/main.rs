use anyhow::Context;
use clap::{Parser, Subcommand};
use county_choropleth::config::AppConfig;
use county_choropleth::geography::load_geography;
use county_choropleth::pipeline::{draw, draw_base, RenderRequest};
use county_choropleth::render::{render_svg, write_svg};
use county_choropleth::{export, server, source};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the county choropleth to SVG (and optionally GeoJSON)
    Render {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Serve the map with a county query API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Render { config } => {
            info!("Rendering map with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;

            // 1. Load geography
            let geography = load_geography(&app_config)?;

            // 2. Load data, if any
            let request = RenderRequest::from_config(&app_config);
            let raw = match &request.dataset {
                Some(dataset) => Some(source::load_dataset(dataset).await),
                None => None,
            };

            // 3. Draw
            let frame = match draw(&geography, &request, raw) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("draw failed, rendering base map: {e}");
                    draw_base(&geography, &request, e.to_string())
                        .context("Failed to draw base map")?
                }
            };

            // 4. Write outputs
            let svg = render_svg(&frame, &app_config.output);
            write_svg(&app_config.output.svg, &svg)?;
            if let Some(path) = &app_config.output.geojson {
                export::write_geojson(path, &frame)?;
            }

            info!("Render complete!");
        }
        Commands::Serve { config } => {
            info!("Serving map with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            let geography = load_geography(&app_config)?;

            server::start_server(app_config, geography).await?;
        }
    }

    Ok(())
}
