//! duckbridge - run SQL against DuckDB through the async connection pool

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use duckbridge_core::{ConnectionPool, Operation, OperationOutput, PoolConfig, Reactor};
use tracing::{debug, info};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "duckbridge")]
#[command(about = "Execute SQL on a DuckDB database via a pool of worker threads", long_about = None)]
struct Args {
    /// Configuration file layered under DUCKBRIDGE_* environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database URL, e.g. duckdb:///:memory: or duckdb:///data/app.db
    #[arg(long)]
    database_url: Option<String>,

    #[arg(long)]
    min_threads: Option<usize>,

    #[arg(long)]
    max_threads: Option<usize>,

    /// Statement to execute; repeatable, run in order before any query
    #[arg(short, long = "execute", value_name = "SQL")]
    execute: Vec<String>,

    /// Query whose rows are printed tab-separated; repeatable
    #[arg(short, long = "query", value_name = "SQL")]
    query: Vec<String>,

    /// Print the pool snapshot as JSON once all statements have run
    #[arg(long)]
    stats: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PoolConfig::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => PoolConfig::load().context("failed to load configuration")?,
    };
    if let Some(url) = &args.database_url {
        config.database_url = url.clone();
    }
    if let Some(min) = args.min_threads {
        config.min_threads = min;
    }
    if let Some(max) = args.max_threads {
        config.max_threads = max;
    }
    config.validate().context("invalid configuration")?;

    init_tracing(&config, args.debug);
    debug!(?config, "pool config");

    let reactor = Reactor::new();
    let pool = ConnectionPool::open(&reactor, &config).context("failed to create connection pool")?;
    info!(url = %config.database_url, "starting duckbridge");

    let snapshot = reactor
        .run({
            let pool = pool.clone();
            async move {
                for sql in args.execute {
                    let output = pool
                        .run_with_connection(Operation::Execute(sql.clone()))
                        .await
                        .with_context(|| format!("statement failed: {sql}"))?;
                    if let OperationOutput::Affected(rows) = output {
                        info!(rows, "statement executed");
                    }
                }
                for sql in args.query {
                    let output = pool
                        .run_with_connection(Operation::Query(sql.clone()))
                        .await
                        .with_context(|| format!("query failed: {sql}"))?;
                    print_rows(output);
                }
                anyhow::Ok(args.stats.then(|| pool.snapshot()))
            }
        })
        .context("event loop failed")??;

    if let Some(snapshot) = snapshot {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

fn print_rows(output: OperationOutput) {
    for row in output.into_rows().unwrap_or_default() {
        let line: Vec<String> = row.iter().map(ToString::to_string).collect();
        println!("{}", line.join("\t"));
    }
}

fn init_tracing(config: &PoolConfig, debug: bool) {
    let default_filter = if debug {
        "debug"
    } else {
        "info,duckbridge_core=debug"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .init();
    }
}
