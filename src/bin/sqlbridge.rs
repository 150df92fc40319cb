use sqlbridge::cli::{CliArgs, USAGE};
use sqlbridge::config;
use sqlbridge::driver::sqlite::SqliteDriver;
use sqlbridge::protocol::Server;
use std::io;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    // stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}\n{}", message, USAGE);
            process::exit(1);
        }
    };
    if args.help {
        println!("{}", USAGE);
        return;
    }

    let mut config = match config::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    if let Some(dsn) = args.dsn {
        config.connection.default_dsn = dsn;
    }

    info!("Starting sqlbridge...");
    let driver = Arc::new(SqliteDriver::new(config.dsn.clone()));
    let server = Server::new(driver, config);

    if let Err(e) = server.serve(io::stdin().lock(), io::stdout()) {
        error!("Server stopped: {}", e);
        process::exit(1);
    }
    info!("sqlbridge exiting");
}
