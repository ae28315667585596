//! drift-sync: reference host for the sync engine.
//!
//! Usage:
//!   drift-sync once                          run one sync pass
//!   drift-sync watch                         sync periodically until Ctrl-C
//!   drift-sync discography <artist_id> [--appears-on]
//!                                            fetch an artist's full discography
//!   drift-sync config                        print the example configuration

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use drift_sync::api::{HttpApi, RemoteApi};
use drift_sync::config::Config;
use drift_sync::db::LocalDb;
use drift_sync::discography::{DiscographyFetcher, FetchOutcome};
use drift_sync::driver::SyncDriver;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: drift-sync <once|watch|discography <artist_id> [--appears-on]|config>";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("drift_sync=info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        Some("once") => run_once().await,
        Some("watch") => run_watch().await,
        Some("discography") => match args.get(2) {
            Some(artist_id) => run_discography(artist_id, args.iter().any(|a| a == "--appears-on")).await,
            None => {
                eprintln!("{}", USAGE);
                std::process::exit(1);
            }
        },
        Some("config") => {
            print!("{}", Config::example_config());
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

struct Engine {
    config: Config,
    api: Arc<dyn RemoteApi>,
    driver: SyncDriver,
}

fn open_engine() -> Result<Engine> {
    let config = Config::load()?;
    let api: Arc<dyn RemoteApi> = Arc::new(HttpApi::new(&config.server)?);
    let path = config.storage.database_path()?;
    let db = Arc::new(LocalDb::open(&path)?);
    tracing::debug!("Local database at {}", path.display());
    let driver = SyncDriver::open(api.clone(), db, &config)?;
    Ok(Engine { config, api, driver })
}

async fn run_once() -> Result<()> {
    let engine = open_engine()?;
    let report = engine.driver.run_sync_pass().await;
    println!("{}", report);
    if !report.is_clean() {
        anyhow::bail!("sync pass did not complete");
    }
    Ok(())
}

async fn run_watch() -> Result<()> {
    let engine = open_engine()?;
    let interval = Duration::from_secs(engine.config.sync.interval_secs.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping");
        }
        let _ = shutdown_tx.send(true);
    });

    tracing::info!("Syncing every {}s against {}", interval.as_secs(), engine.config.server.base_url);
    engine.driver.run_periodic(interval, shutdown_rx).await;
    Ok(())
}

async fn run_discography(artist_id: &str, appears_on: bool) -> Result<()> {
    let engine = open_engine()?;
    let fetcher = DiscographyFetcher::new(
        engine.api.clone(),
        engine.driver.stores().clone(),
        engine.config.discography.page_size,
    );

    fetcher.fetch_first_page(artist_id, appears_on).await?;
    loop {
        match fetcher.fetch_more(artist_id, appears_on).await? {
            FetchOutcome::Fetched { has_more: true, .. } => continue,
            _ => break,
        }
    }

    let albums = engine.driver.stores().skeleton.discography(artist_id, appears_on)?;
    for album in &albums {
        println!("{:>4}  {}", album.order_index, album.album_id);
    }
    println!("{} albums", albums.len());
    Ok(())
}
