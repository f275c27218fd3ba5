//! Command line interface for operating a Geogram station: initialization,
//! serving the relay, scanning the LAN for other stations, and managing the
//! station directory, nickname registry, and this device's own relay role.

mod config;
mod directory;
mod discovery;
mod event;
mod filter;
mod identity;
mod registry;
mod relay;
mod replicate;
mod server;
mod store;
mod topology;
mod ws;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::bail;
use clap::{Parser, Subcommand};

use config::Settings;
use directory::{StationDirectory, StationRecord, StationStatus};
use discovery::{ScanConfig, Scanner};
use registry::NicknameRegistry;
use relay::{RelayEngine, RelayPolicy};
use replicate::Replicator;
use server::{serve_http, StationInfo};
use store::EventStore;
use topology::{NetworkPolicy, StationHost, StationNetwork};
use ws::serve_ws;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "geogram-station", author, version, about = "Geogram station relay and mesh tools")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the configuration file and data directories.
    Init,
    /// Run the relay and status endpoints in the foreground.
    Serve,
    /// Scan local networks for reachable stations.
    Scan {
        /// Also sweep the extended localhost port range from the config.
        #[arg(long)]
        extended: bool,
        /// Probe only localhost, skipping the LAN subnets.
        #[arg(long)]
        local_only: bool,
    },
    /// Manage the station directory.
    Stations {
        #[command(subcommand)]
        action: StationsAction,
    },
    /// Manage nickname registrations.
    Nick {
        #[command(subcommand)]
        action: NickAction,
    },
    /// Manage this device's own station role.
    Station {
        #[command(subcommand)]
        action: StationAction,
    },
}

/// Operations under `stations`.
#[derive(Subcommand)]
enum StationsAction {
    /// List known stations.
    List,
    /// Add a station by URL.
    Add { url: String },
    /// Remove a station by URL.
    Remove { url: String },
    /// Mark a station as the preferred relay.
    Prefer { url: String },
    /// Mark a station as a backup relay.
    Backup { url: String },
    /// Connect to a station and enrich its record.
    Connect { url: String },
}

/// Operations under `nick`.
#[derive(Subcommand)]
enum NickAction {
    /// Register or renew a nickname for a key.
    Register { nickname: String, npub: String },
    /// List live registrations.
    List,
    /// Sweep expired registrations.
    Purge,
}

/// Operations under `station`.
#[derive(Subcommand)]
enum StationAction {
    /// Found a new network with this device as its root station.
    CreateRoot {
        /// Network name.
        #[arg(long)]
        name: String,
        /// Operator npub owning this station.
        #[arg(long)]
        operator: String,
    },
    /// Join an existing network as a node station.
    Join {
        /// Network identifier.
        #[arg(long)]
        network_id: String,
        /// Network name.
        #[arg(long)]
        name: String,
        /// Root station public key (hex).
        #[arg(long)]
        root_pubkey: String,
        /// Root station callsign.
        #[arg(long)]
        root_callsign: String,
        /// Operator npub owning this station.
        #[arg(long)]
        operator: String,
    },
    /// Enable auto-start and run the station in the foreground.
    Start,
    /// Disable auto-start for future launches.
    Stop,
    /// Show the persisted station role.
    Status,
    /// Irreversibly delete this device's station role.
    Delete,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            EventStore::new(cfg.data_root.join("relay")).init()?;
            println!("initialized data tree at {}", cfg.data_root.display());
        }
        Commands::Serve => serve(&cfg).await?,
        Commands::Scan {
            extended,
            local_only,
        } => scan(&cfg, extended, local_only).await?,
        Commands::Stations { action } => handle_stations(&cfg, action).await?,
        Commands::Nick { action } => handle_nick(&cfg, action)?,
        Commands::Station { action } => handle_station(&cfg, action).await?,
    }
    Ok(())
}

/// How often the nickname registry sweeps expired entries while serving.
const NICK_PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Run the configured station role, or an ad-hoc relay when none exists.
async fn serve(cfg: &Settings) -> anyhow::Result<()> {
    let http_addr: SocketAddr = cfg.bind_http.parse()?;
    let ws_addr: SocketAddr = cfg.bind_ws.parse()?;
    spawn_nick_purge(cfg);
    match StationHost::load(cfg.data_root.join("station"))? {
        Some(mut host) => {
            host.start(ws_addr, http_addr).await?;
            if let Some(engine) = host.engine() {
                engine.set_allowed_authors(cfg.allowed_authors.iter().cloned().collect());
            }
            log::info!(
                "station {} serving relay on {} and status on {}",
                host.node().station.callsign,
                ws_addr,
                http_addr
            );
            tokio::signal::ctrl_c().await?;
            host.stop().await?;
        }
        None => {
            let relay_root = cfg.data_root.join("relay");
            let store = EventStore::new(relay_root.clone());
            store.init()?;
            let engine = Arc::new(RelayEngine::new(
                store,
                RelayPolicy {
                    auth_required: cfg.auth_required,
                    open_relay: cfg.open_relay,
                },
                Replicator::new(relay_root, cfg.replication),
            ));
            engine.set_allowed_authors(cfg.allowed_authors.iter().cloned().collect());
            let info = StationInfo {
                name: "geogram-station".into(),
                callsign: String::new(),
                description: "standalone relay".into(),
                location: None,
            };
            log::info!("relay on {} and status on {}", ws_addr, http_addr);
            let (shutdown_tx, mut ws_rx) = tokio::sync::watch::channel(false);
            let mut http_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });
            let engine_http = engine.clone();
            tokio::try_join!(
                serve_ws(ws_addr, engine, info.clone(), async move {
                    let _ = ws_rx.changed().await;
                }),
                serve_http(http_addr, engine_http, info, async move {
                    let _ = http_rx.changed().await;
                }),
            )?;
        }
    }
    Ok(())
}

/// Sweep expired nickname registrations on a fixed interval. The registry
/// also purges on load, so this only has work after long uptimes.
fn spawn_nick_purge(cfg: &Settings) {
    let mut registry = NicknameRegistry::load(
        cfg.data_root.join("nicknames.json"),
        cfg.reserved_nicknames.clone(),
        cfg.reserved_owner.clone(),
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(NICK_PURGE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match registry.purge_expired() {
                Ok(0) => {}
                Ok(removed) => log::info!("purged {removed} expired nickname(s)"),
                Err(e) => log::warn!("nickname purge failed: {e}"),
            }
        }
    });
}

/// Run one discovery pass and fold the results into the directory.
async fn scan(cfg: &Settings, extended: bool, local_only: bool) -> anyhow::Result<()> {
    let mut scan_cfg = ScanConfig::from_settings(cfg);
    if !extended {
        scan_cfg.local_port_range = None;
    }
    if local_only {
        scan_cfg.subnets = Some(vec![]);
    }
    let scanner = Scanner::new();
    let mut results = vec![];
    let summary = scanner
        .scan(&scan_cfg, |res| {
            println!(
                "found {} at {}",
                res.callsign.as_deref().unwrap_or("(unidentified station)"),
                res.url()
            );
            results.push(res.clone());
        })
        .await;
    let mut directory = StationDirectory::load(
        cfg.data_root.join("stations.json"),
        cfg.operator_coords,
    );
    for res in &results {
        directory.add(StationRecord::from_scan(res))?;
    }
    println!(
        "scan {}: {} station(s) known",
        if summary.cancelled { "cancelled" } else { "complete" },
        directory.stations().len()
    );
    Ok(())
}

async fn handle_stations(cfg: &Settings, action: StationsAction) -> anyhow::Result<()> {
    let mut directory = StationDirectory::load(
        cfg.data_root.join("stations.json"),
        cfg.operator_coords,
    );
    match action {
        StationsAction::List => {
            for s in directory.stations() {
                println!(
                    "{} {} {} {}",
                    match s.status {
                        StationStatus::Preferred => "*",
                        StationStatus::Backup => "+",
                        StationStatus::Available => "-",
                    },
                    s.callsign.as_deref().unwrap_or("--------"),
                    s.url,
                    if s.is_connected { "connected" } else { "" }
                );
            }
        }
        StationsAction::Add { url } => {
            let record = StationRecord {
                url: url.clone(),
                name: String::new(),
                callsign: None,
                status: StationStatus::Available,
                latency_ms: None,
                connected_devices: 0,
                description: String::new(),
                version: String::new(),
                location: None,
                is_connected: false,
            };
            if directory.add(record)? {
                println!("added {url}");
            } else {
                bail!("rejected {url}: client devices are not stations");
            }
        }
        StationsAction::Remove { url } => {
            if !directory.remove(&url)? {
                bail!("unknown station: {url}");
            }
            println!("removed {url}");
        }
        StationsAction::Prefer { url } => {
            directory.set_preferred(&url)?;
            println!("preferred {url}");
        }
        StationsAction::Backup { url } => {
            directory.set_backup(&url)?;
            println!("backup {url}");
        }
        StationsAction::Connect { url } => {
            if !directory.connect(&url).await? {
                bail!("station unreachable: {url}");
            }
            if let Some(station) = directory.get(&url) {
                println!(
                    "connected to {} ({} ms)",
                    station.callsign.as_deref().unwrap_or(&url),
                    station.latency_ms.unwrap_or(0)
                );
            }
        }
    }
    Ok(())
}

fn handle_nick(cfg: &Settings, action: NickAction) -> anyhow::Result<()> {
    let mut registry = NicknameRegistry::load(
        cfg.data_root.join("nicknames.json"),
        cfg.reserved_nicknames.clone(),
        cfg.reserved_owner.clone(),
    );
    match action {
        NickAction::Register { nickname, npub } => {
            registry.register(&nickname, &npub)?;
            println!("registered {nickname}");
        }
        NickAction::List => {
            for reg in registry.registrations() {
                println!("{} {} expires {}", reg.nickname, reg.npub, reg.expires_at);
            }
        }
        NickAction::Purge => {
            let removed = registry.purge_expired()?;
            println!("purged {removed} expired registration(s)");
        }
    }
    Ok(())
}

async fn handle_station(cfg: &Settings, action: StationAction) -> anyhow::Result<()> {
    let station_root = cfg.data_root.join("station");
    let policy = NetworkPolicy {
        open_relay: cfg.open_relay,
        auth_required: cfg.auth_required,
        replication: cfg.replication,
    };
    match action {
        StationAction::CreateRoot { name, operator } => {
            let (host, secret) = StationHost::create_root(station_root, &name, &operator, policy)?;
            let node = host.node();
            println!("created root station {} for network {}", node.station.callsign, node.network.id);
            println!("station secret key (store it safely, it is not kept here): {secret}");
        }
        StationAction::Join {
            network_id,
            name,
            root_pubkey,
            root_callsign,
            operator,
        } => {
            let network = StationNetwork {
                id: network_id,
                name,
                root_pubkey,
                root_callsign,
                policy,
            };
            let (host, secret) = StationHost::join(station_root, network, &operator)?;
            let node = host.node();
            println!("joined network {} as {}", node.network.id, node.station.callsign);
            println!("station secret key (store it safely, it is not kept here): {secret}");
        }
        StationAction::Start => {
            let Some(mut host) = StationHost::load(station_root)? else {
                bail!("no station role configured; run `station create-root` or `station join` first");
            };
            host.set_enabled(true)?;
            let http_addr: SocketAddr = cfg.bind_http.parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.parse()?;
            host.start(ws_addr, http_addr).await?;
            println!("station {} running; ctrl-c to stop", host.node().station.callsign);
            tokio::signal::ctrl_c().await?;
            host.stop().await?;
        }
        StationAction::Stop => {
            let Some(mut host) = StationHost::load(station_root)? else {
                bail!("no station role configured");
            };
            host.set_enabled(false)?;
            println!("auto-start disabled");
        }
        StationAction::Status => {
            let Some(host) = StationHost::load(station_root)? else {
                bail!("no station role configured");
            };
            let node = host.node();
            println!("callsign:  {}", node.station.callsign);
            println!("kind:      {:?}", node.kind);
            println!("network:   {} ({})", node.network.name, node.network.id);
            println!("status:    {:?}", node.status);
            println!("enabled:   {}", node.enabled);
        }
        StationAction::Delete => {
            let Some(host) = StationHost::load(station_root)? else {
                bail!("no station role configured");
            };
            host.delete().await?;
            println!("station role deleted");
        }
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let data_root = base_dir.join("geogram-data");
    let mut content = String::new();
    content.push_str(&format!("DATA_ROOT={}\n", display_path(&data_root)));
    content.push_str("BIND_HTTP=127.0.0.1:3456\n");
    content.push_str("BIND_WS=127.0.0.1:3457\n");
    content.push_str("AUTH_REQUIRED=0\n");
    content.push_str("OPEN_RELAY=0\n");
    content.push_str("REPLICATION=0\n");
    content.push_str("ALLOWED_AUTHORS=\n");
    content.push_str("SCAN_PRIMARY_PORTS=3456,8080\n");
    content.push_str("SCAN_SECONDARY_PORTS=80,8081,3000,5000\n");
    content.push_str("SCAN_BATCH=30\n");
    content.push_str("PROBE_TIMEOUT_MS=500\n");
    content.push_str("SCAN_LOCAL_PORTS=\n");
    content.push_str("OPERATOR_LAT=\n");
    content.push_str("OPERATOR_LON=\n");
    content.push_str("RESERVED_NICKNAMES=\n");
    content.push_str("RESERVED_OWNER=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();
    run(cli).await
}
