//! Exposes the command line application.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use jobhub_client::breaker::{DependencyId, FallbackPolicy};
use jobhub_client::config::{Config, TimeoutTier, TtlTier};
use jobhub_client::transport::{HttpTransport, Method};
use jobhub_client::{RequestLayer, RequestOptions, logging, metrics};

/// JobHub commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch an endpoint through the response cache.
    Get {
        /// The endpoint path, such as `/jobs/`.
        endpoint: String,

        /// A query parameter as `key=value`. Can be repeated.
        #[arg(long = "param", short = 'p', value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// How long the response is cached.
        #[arg(long, value_parser = parse_tier::<TtlTier>, default_value = "default")]
        ttl: TtlTier,

        /// The deadline of every attempt.
        #[arg(long, value_parser = parse_tier::<TimeoutTier>)]
        timeout: Option<TimeoutTier>,

        /// Retry a timed out attempt once with this longer deadline.
        #[arg(long, value_parser = parse_tier::<TimeoutTier>)]
        escalate_to: Option<TimeoutTier>,

        /// Treat the endpoint as a degradable dependency of this name.
        #[arg(long, value_name = "NAME")]
        degradable: Option<String>,

        /// Issue the same request this many times, to observe caching.
        #[arg(long, default_value_t = 1)]
        repeat: usize,
    },

    /// Send an uncached request.
    Send {
        /// One of GET, POST, PUT, PATCH or DELETE.
        #[arg(value_parser = parse_method)]
        method: Method,

        /// The request path.
        path: String,

        /// The JSON body.
        #[arg(long)]
        body: Option<String>,

        /// The deadline of every attempt.
        #[arg(long, value_parser = parse_tier::<TimeoutTier>)]
        timeout: Option<TimeoutTier>,
    },

    /// Validate the configuration file and exit.
    CheckConfig,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "jobhub", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the base URL of the configuration.
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Parses a tier name like `ai_results`.
fn parse_tier<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(Value::String(value.to_owned())).map_err(|error| error.to_string())
}

fn parse_param(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected `key=value`, got `{value}`")),
    }
}

fn parse_method(value: &str) -> Result<Method, String> {
    Ok(match value.to_ascii_uppercase().as_str() {
        "GET" => Method::Get,
        "POST" => Method::Post,
        "PUT" => Method::Put,
        "PATCH" => Method::Patch,
        "DELETE" => Method::Delete,
        _ => return Err(format!("unsupported method `{value}`")),
    })
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config
            .sentry_dsn
            .as_deref()
            .map(str::parse::<sentry::types::Dsn>)
            .transpose()
            .context("invalid sentry DSN")?,
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime has not been started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config.logging) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone()
            && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
        {
            tags.insert(tag, hostname);
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    if let Command::CheckConfig = cli.command {
        tracing::info!(base_url = %config.base_url, "Configuration is valid");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    let transport = HttpTransport::from_config(&config).context("failed to create HTTP client")?;
    let layer = RequestLayer::new(config, Arc::new(transport));

    match command {
        Command::Get {
            endpoint,
            params,
            ttl,
            timeout,
            escalate_to,
            degradable,
            repeat,
        } => {
            let params: Map<String, Value> = params
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect();
            let params = (!params.is_empty()).then_some(params);

            let options = RequestOptions {
                timeout,
                escalate_to,
                ..Default::default()
            };

            for attempt in 1..=repeat {
                let start = Instant::now();
                let value = match &degradable {
                    Some(dependency) => layer
                        .fetch_degradable(
                            &DependencyId::new(dependency),
                            &endpoint,
                            params.as_ref(),
                            ttl,
                            FallbackPolicy::OnOpenOrFailure,
                            || Value::Null,
                            options.clone(),
                        )
                        .await
                        .map(|outcome| outcome.into_inner()),
                    None => layer
                        .fetch_value(&endpoint, params.as_ref(), ttl, options.clone())
                        .await
                        .map(|value| Value::clone(&value)),
                };
                let elapsed = start.elapsed();

                match value {
                    Ok(value) => {
                        tracing::info!(attempt, ?elapsed, "Request succeeded");
                        if attempt == repeat {
                            println!("{}", serde_json::to_string_pretty(&value)?);
                        }
                    }
                    Err(error) => {
                        tracing::error!(attempt, ?elapsed, %error, "Request failed");
                        if attempt == repeat {
                            bail!(error.user_message());
                        }
                    }
                }
            }

            print_durations(&layer);
        }
        Command::Send {
            method,
            path,
            body,
            timeout,
        } => {
            let body = body
                .map(|body| serde_json::from_str(&body))
                .transpose()
                .context("body is not valid JSON")?;
            let options = RequestOptions {
                timeout,
                ..Default::default()
            };

            let value = layer.send(method, &path, body, options).await;
            print_durations(&layer);
            let value = value.map_err(|error| anyhow::anyhow!(error.user_message()))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::CheckConfig => {}
    }

    Ok(())
}

fn print_durations(layer: &RequestLayer) {
    let durations: BTreeMap<_, _> = layer.monitor().durations();
    for (operation, duration) in durations {
        tracing::debug!(%operation, ?duration, "Last duration");
    }
}
