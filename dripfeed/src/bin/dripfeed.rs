use std::time::Duration;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{runtime::Builder, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

use dripfeed::{
    config::{self, Config},
    publisher::{Publisher, Source},
    registry,
    signals::Shutdown,
};
use dripfeed_payload::SenMl;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Registry(#[from] registry::Error),
    #[error(transparent)]
    Publisher(#[from] dripfeed::publisher::Error),
    #[error(transparent)]
    Payload(#[from] dripfeed_payload::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

fn default_config_path() -> String {
    "/etc/dripfeed/dripfeed.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// override the datastore URI from the configuration file
    #[clap(long)]
    target_uri: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file and exit
    ConfigCheck,
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let contents = config::load_contents(config_path)?;
    let config = config::parse(&contents).map_err(|err| {
        error!("Configuration validation failed: {err}");
        err
    })?;
    info!("Configuration file is valid");
    Ok(config)
}

fn get_config(cli: &Cli) -> Result<Config, Error> {
    let contents = config::load_contents(&cli.config_path)?;
    let mut config = config::parse(&contents)?;
    if let Some(ref target_uri) = cli.target_uri {
        config.target_uri = target_uri.parse().map_err(config::Error::Uri)?;
    }
    Ok(config)
}

async fn register_sources(
    client: &registry::Client,
    config: &Config,
) -> Result<Vec<Source>, Error> {
    let mut sources = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let template = registry::DataSource {
            id: String::new(),
            resource: source.resource(&config.defaults),
            retention: config.defaults.retention.clone(),
            kind: config.defaults.kind,
            aggregation: config.defaults.aggregation.clone(),
        };
        let registered = client.ensure(&source.name, &template).await?;
        let serializer = SenMl::new(
            registered.resource.clone(),
            source.unit.clone(),
            source.value.unwrap_or_default(),
        )?;
        sources.push(Source::new(
            &config.target_uri,
            &registered.id,
            registered.resource.clone(),
            serializer,
        )?);
    }
    Ok(sources)
}

async fn inner_main(config: Config) -> Result<(), Error> {
    if let Some(addr) = config.prometheus_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
    }

    let shutdown = Shutdown::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("received ctrl-c");
        ctrl_c_shutdown.signal();
    });

    info!("Datastore URI: {uri}", uri = config.target_uri);
    let client = registry::Client::new(
        config.target_uri.clone(),
        Duration::from_secs(config.retry_interval_seconds),
    );

    let mut registration_shutdown = shutdown.clone();
    let sources = tokio::select! {
        res = register_sources(&client, &config) => res?,
        () = registration_shutdown.recv() => {
            info!("shutdown requested during registration");
            return Ok(());
        }
    };

    let publisher = Publisher::new(
        Duration::from_secs(config.publish_interval_seconds),
        config.seed,
        sources,
        shutdown,
    );
    publisher.spin().await?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting dripfeed {version} run.");

    let cli = Cli::parse();
    if let Some(Commands::ConfigCheck) = cli.command {
        match validate_config(&cli.config_path) {
            Ok(_) => std::process::exit(0),
            Err(_) => std::process::exit(1),
        }
    }
    let config = get_config(&cli)?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    runtime.shutdown_timeout(Duration::from_secs(5));
    info!("dripfeed run complete.");
    res
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn target_uri_override_wins() {
        let cli = Cli::parse_from([
            "dripfeed",
            "--config-path",
            "/dev/null",
            "--target-uri",
            "http://localhost:9090",
        ]);
        assert_eq!(cli.target_uri.as_deref(), Some("http://localhost:9090"));
    }
}
