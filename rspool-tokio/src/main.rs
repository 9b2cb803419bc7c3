use clap::{Arg, ArgAction, Command};
use rspool_core::config::UpstreamConfig;
use rspool_tokio::config::{self, EndpointOptions, Network};
use rspool_tokio::proxy::Proxy;
use std::sync::Arc;
use tracing::{error, info};

fn validate_network(value: &str) -> Result<Network, String> {
    value.parse()
}

#[tokio::main]
async fn main() {
    let matches = Command::new("rspool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A caching connection proxy for RESP key-value servers")
        .arg(
            Arg::new("upstream")
                .help("Upstream URLs, e.g. redis://localhost:6379?cacheprefixes=user:")
                .value_name("url")
                .num_args(0..),
        )
        .arg(
            Arg::new("config")
                .help("TOML file with an `upstreams` list, merged with the positional URLs")
                .long("config")
                .short('c'),
        )
        .arg(
            Arg::new("network")
                .help("Address family for the local endpoints")
                .long("network")
                .value_parser(validate_network)
                .default_value("unix"),
        )
        .arg(
            Arg::new("prefix")
                .help("Path prefix for unix-socket endpoints")
                .long("unix-prefix")
                .default_value("/var/tmp/rspool-"),
        )
        .arg(
            Arg::new("suffix")
                .help("Path suffix for unix-socket endpoints")
                .long("unix-suffix")
                .default_value(".sock"),
        )
        .arg(
            Arg::new("unlink")
                .help("Remove stale socket files before binding")
                .long("unlink")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log_level")
                .help("Log filter when RUST_LOG is unset")
                .long("log-level")
                .default_value("info"),
        )
        .get_matches();

    let log_level = matches
        .get_one::<String>("log_level")
        .expect("log_level has a default");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.clone())),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "rspool starting");

    let mut urls: Vec<String> = matches
        .get_many::<String>("upstream")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if let Some(path) = matches.get_one::<String>("config") {
        match config::load_file(path) {
            Ok(mut more) => urls.append(&mut more),
            Err(err) => {
                error!(error = %err, "failed to load config file");
                std::process::exit(1);
            }
        }
    }
    if urls.is_empty() {
        error!("no upstreams configured; pass URLs or --config");
        std::process::exit(1);
    }

    let options = EndpointOptions {
        network: *matches
            .get_one::<Network>("network")
            .expect("network has a default"),
        prefix: matches
            .get_one::<String>("prefix")
            .expect("prefix has a default")
            .clone(),
        suffix: matches
            .get_one::<String>("suffix")
            .expect("suffix has a default")
            .clone(),
        unlink: matches.get_flag("unlink"),
    };

    let mut proxies: Vec<Arc<Proxy>> = Vec::new();
    for url in &urls {
        match UpstreamConfig::from_url(url) {
            Ok(seed) => proxies.push(Proxy::new(seed, options.clone())),
            Err(err) => {
                error!(url = %url, error = %err, "invalid upstream url");
                std::process::exit(1);
            }
        }
    }

    let tasks: Vec<_> = proxies
        .iter()
        .map(|proxy| {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.run().await })
        })
        .collect();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        (finished, _, _) = futures::future::select_all(tasks) => {
            match finished {
                Ok(Err(err)) => {
                    error!(error = %err, "proxy failed to start");
                    std::process::exit(1);
                }
                Ok(Ok(())) => info!("proxy stopped"),
                Err(err) => error!(error = %err, "proxy task failed"),
            }
        }
    }

    for proxy in &proxies {
        proxy.shutdown().await;
    }
    for proxy in &proxies {
        proxy.kill().await;
    }
}
