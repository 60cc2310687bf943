pub mod color;
pub mod config;
pub mod dataset;
pub mod export;
pub mod filter;
pub mod fips;
pub mod geography;
pub mod pipeline;
pub mod projection;
pub mod render;
pub mod server;
pub mod source;
pub mod topology;
pub mod types;
