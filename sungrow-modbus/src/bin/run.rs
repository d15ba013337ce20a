use clap::Parser;
use std::path::PathBuf;
use sungrow_modbus::{config::Config, server, Result};
use url::Url;

#[derive(Parser, Debug)]
#[clap(
    name = "sungrow-modbus",
    version,
    author,
    about = "Polls Sungrow inverters and battery stacks over Modbus and bridges them to MQTT"
)]
struct Cli {
    /// JSON file describing the devices and register groups to poll
    #[clap(value_hint = clap::ValueHint::FilePath)]
    config: PathBuf,

    #[clap(
        long,
        env = "MQTT_URL",
        default_value = "mqtt://localhost:1883/sungrow",
        value_hint = clap::ValueHint::Url
    )]
    mqtt_url: Url,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let mut args = Cli::parse();

    let config = Config::load(&args.config)?;

    let prefix = args
        .mqtt_url
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .filter(|prefix| !prefix.is_empty())
        .unwrap_or(env!("CARGO_PKG_NAME"))
        .to_owned();

    if !args.mqtt_url.query_pairs().any(|(key, _)| key == "client_id") {
        args.mqtt_url
            .query_pairs_mut()
            .append_pair("client_id", env!("CARGO_PKG_NAME"))
            .finish();
    }

    server::run(config, prefix, args.mqtt_url.try_into()?, tokio::signal::ctrl_c()).await?;

    Ok(())
}
