//! Weather MCP server - demo application for mcp-serve
//!
//! Serves a couple of weather tools, a per-city forecast resource template
//! and periodic change notifications, over stdio (for MCP desktop clients)
//! or streamable HTTP.

mod domain;
mod handler;

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use mcp_serve::{McpServer, ResourceOptions, StreamableHttpTransport, ToolOptions};

use domain::WeatherRepository;

/// Weather MCP server
#[derive(Parser, Debug)]
#[command(name = "weather-demo")]
#[command(version = "0.1.0")]
#[command(about = "Weather forecasts and conversions over MCP")]
struct Args {
    /// Run in stdio mode (for MCP clients like Claude Desktop)
    #[arg(long)]
    stdio: bool,

    /// Run in streamable HTTP mode
    #[arg(long)]
    http: bool,

    /// Address for the HTTP server
    #[arg(long, default_value = "127.0.0.1:3001")]
    address: String,
}

#[tokio::main]
async fn main() -> mcp_serve::Result<()> {
    let args = Args::parse();

    // Logging would corrupt the protocol stream in stdio mode.
    if !args.stdio {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    }

    let repo = Arc::new(WeatherRepository::new());

    let mut server = McpServer::new("weather").with_version(env!("CARGO_PKG_VERSION"));

    server.tool_with(
        "convert_temperature",
        handler::convert_temperature_schema(),
        handler::convert_temperature,
        ToolOptions::new().description("Convert temperature between Celsius and Fahrenheit"),
    )?;

    server.tool_with(
        "calculate_humidity_index",
        handler::humidity_index_schema(),
        handler::calculate_humidity_index,
        ToolOptions::new().description("Calculate humidity index based on temperature and humidity"),
    )?;

    server.resource_with(
        "City Weather Forecast",
        "weather://forecast/{city}",
        handler::forecast_handler(repo.clone()),
        ResourceOptions::new()
            .description("Weather forecast for a specific city")
            .mime_type("application/json"),
    )?;

    server.resource_list(handler::resource_list_handler(repo.clone()))?;

    {
        let repo = repo.clone();
        server.resource_change_observer("weather://forecast/{city}", move |handle| {
            handler::forecast_change_observer(repo, handle)
        })?;
    }
    server.resource_list_change_observer(handler::list_change_observer)?;

    if args.stdio || !args.http {
        server.serve_stdio().await
    } else {
        info!(address = %args.address, "starting weather MCP server");
        server
            .serve_streamable(StreamableHttpTransport::new().with_address(args.address.clone()))
            .await
    }
}
