//! Bean ledger HTTP service
//!
//! ```bash
//! bean-api                                  # same as `bean-api serve`
//! bean-api import -f wallets.json --strict
//! ```

use actix_cors::Cors;
use actix_web::{dev::Service, middleware, web, App, HttpServer};
use anyhow::{anyhow, Context, Result};
use bean_api::{
    auth::{self, RequireAuth},
    config::{Config, LogConfig},
    handlers,
    import::{self, ImportOptions},
    metrics,
};
use bean_ledger::Ledger;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Bean ledger service and maintenance commands
#[derive(Parser)]
#[command(name = "bean-api")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (default)
    Serve,

    /// Import wallet balances from a JSON dump
    Import {
        /// File of `[{"nick": "alice", "beans": 12}, ...]`
        #[arg(short, long)]
        file: PathBuf,

        /// Also import wallets with a zero balance
        #[arg(long)]
        no_skip_zero: bool,

        /// Fail before writing if any record is invalid
        #[arg(long)]
        strict: bool,
    },
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    init_tracing(&config.log);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Import {
            file,
            no_skip_zero,
            strict,
        } => {
            let options = ImportOptions {
                skip_zero: !no_skip_zero,
                strict,
            };
            run_import(config, file, options).await
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting bean-api on {}:{}", config.server.host, config.server.port);

    let ledger = Ledger::open(config.ledger.clone())
        .await
        .context("Failed to open ledger")?;
    metrics::register_metrics(prometheus::default_registry())
        .map_err(|e| anyhow!("Failed to register metrics: {}", e))?;
    let _sweeper = ledger.spawn_token_sweeper();

    let authenticator = auth::authenticator_for(&config.auth, ledger.clone());
    let require_auth = RequireAuth::new(authenticator, &config.auth);
    let ledger = web::Data::new(ledger);

    HttpServer::new(move || {
        let cors = Cors::permissive();
        let require_auth = require_auth.clone();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .wrap_fn(|req, srv| {
                let method = req.method().as_str().to_owned();
                let fut = srv.call(req);
                async move {
                    let result = fut.await;
                    let status = match &result {
                        Ok(res) => res.status(),
                        Err(e) => e.as_response_error().status_code(),
                    };
                    metrics::HTTP_REQUESTS_TOTAL
                        .with_label_values(&[&method, metrics::status_class(status.as_u16())])
                        .inc();
                    result
                }
            })
            .app_data(ledger.clone())
            .app_data(handlers::json_config())
            .app_data(web::PayloadConfig::new(MAX_PAYLOAD_BYTES))
            .configure(|cfg| handlers::configure_routes(cfg, require_auth))
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}

async fn run_import(config: Config, file: PathBuf, options: ImportOptions) -> Result<()> {
    let ledger = Ledger::open(config.ledger)
        .await
        .context("Failed to open ledger")?;

    let summary = import::import_file(&ledger, &file, options)
        .await
        .with_context(|| format!("Import of {} failed", file.display()))?;

    println!("Import complete:");
    println!("  imported:        {}", summary.imported);
    println!("  total beans:     {}", summary.total_beans);
    println!("  skipped (zero):  {}", summary.skipped_zero);
    println!("  skipped (invalid): {}", summary.skipped_invalid);
    Ok(())
}
