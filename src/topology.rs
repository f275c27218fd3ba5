//! This device's own relay role: root and node station lifecycle.

use std::{
    fs,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::{
    identity::{self, Identity, IdentityRole},
    relay::{RelayEngine, RelayPolicy},
    replicate::Replicator,
    server::{serve_http_on, StationInfo},
    store::EventStore,
    ws::serve_ws_on,
};

/// Role of this station within its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Root,
    Node,
}

/// Lifecycle state of the station role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum NodeStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

/// Relay behavior every station of a network agrees on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicy {
    #[serde(default)]
    pub open_relay: bool,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub replication: bool,
}

/// Network a station belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationNetwork {
    pub id: String,
    pub name: String,
    pub root_pubkey: String,
    pub root_callsign: String,
    pub policy: NetworkPolicy,
}

/// Persisted station role descriptor. The station identity is distinct from
/// the operator's; the station secret key is handed to the caller at
/// creation and never stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationNode {
    pub id: String,
    pub kind: NodeKind,
    pub station: Identity,
    pub operator_npub: String,
    pub network: StationNetwork,
    pub status: NodeStatus,
    /// Run-intent: whether the station should come up on process start.
    pub enabled: bool,
}

/// Sampled runtime counters for a running station.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub uptime_secs: u64,
    pub connected_devices: u32,
    pub frames_in: u64,
    pub frames_out: u64,
    pub events_stored: u64,
    pub storage_bytes: u64,
}

struct RunningNode {
    engine: Arc<RelayEngine>,
    shutdown_ws: oneshot::Sender<()>,
    shutdown_http: oneshot::Sender<()>,
    server_tasks: Vec<JoinHandle<()>>,
    stats_task: JoinHandle<()>,
    stats: Arc<Mutex<NodeStats>>,
}

/// Owner of one station role: its persisted descriptor, listeners, and
/// stats sampling. Several hosts can coexist in a process, each with its
/// own listeners; stopping one never touches another.
pub struct StationHost {
    root: PathBuf,
    node: StationNode,
    status_tx: watch::Sender<NodeStatus>,
    stats_interval: Duration,
    running: Option<RunningNode>,
}

impl StationHost {
    /// Found a new network with this device as its root authority. Returns
    /// the host and the freshly minted station secret key, which the caller
    /// must store — it is not persisted here.
    pub fn create_root(
        root: PathBuf,
        network_name: &str,
        operator_npub: &str,
        policy: NetworkPolicy,
    ) -> Result<(Self, String)> {
        let (station, secret) = identity::generate(IdentityRole::Station)?;
        let network = StationNetwork {
            id: fresh_id(),
            name: network_name.to_string(),
            root_pubkey: station.public_key.clone(),
            root_callsign: station.callsign.clone(),
            policy,
        };
        let host = Self::create(root, NodeKind::Root, station, operator_npub, network)?;
        Ok((host, secret))
    }

    /// Join an existing network as a node, recording the root's key and
    /// callsign for future trust checks.
    pub fn join(
        root: PathBuf,
        network: StationNetwork,
        operator_npub: &str,
    ) -> Result<(Self, String)> {
        let (station, secret) = identity::generate(IdentityRole::Station)?;
        let host = Self::create(root, NodeKind::Node, station, operator_npub, network)?;
        Ok((host, secret))
    }

    fn create(
        root: PathBuf,
        kind: NodeKind,
        station: Identity,
        operator_npub: &str,
        network: StationNetwork,
    ) -> Result<Self> {
        if station.npub == operator_npub {
            bail!("station identity must differ from operator identity");
        }
        let path = node_path(&root);
        if path.exists() {
            bail!("a station role already exists at {}", path.display());
        }
        let node = StationNode {
            id: fresh_id(),
            kind,
            station,
            operator_npub: operator_npub.to_string(),
            network,
            status: NodeStatus::Stopped,
            enabled: false,
        };
        let (status_tx, _) = watch::channel(node.status.clone());
        let host = Self {
            root,
            node,
            status_tx,
            stats_interval: Duration::from_secs(30),
            running: None,
        };
        host.save()?;
        Ok(host)
    }

    /// Load a persisted station role. A status left at `running`/`starting`
    /// by a dead process is forced back to `stopped`: a listening socket
    /// cannot survive a restart.
    pub fn load(root: PathBuf) -> Result<Option<Self>> {
        let path = node_path(&root);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(_) => return Ok(None),
        };
        let mut node: StationNode = match serde_json::from_str(&data) {
            Ok(node) => node,
            Err(e) => {
                log::warn!("station descriptor unreadable, ignoring: {e}");
                return Ok(None);
            }
        };
        if node.status != NodeStatus::Stopped && !matches!(node.status, NodeStatus::Error(_)) {
            node.status = NodeStatus::Stopped;
        }
        let (status_tx, _) = watch::channel(node.status.clone());
        let host = Self {
            root,
            node,
            status_tx,
            stats_interval: Duration::from_secs(30),
            running: None,
        };
        host.save()?;
        Ok(Some(host))
    }

    /// The persisted descriptor.
    pub fn node(&self) -> &StationNode {
        &self.node
    }

    /// Current lifecycle status.
    pub fn status(&self) -> NodeStatus {
        self.node.status.clone()
    }

    /// Observe status changes.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status_tx.subscribe()
    }

    /// Relay engine of the running station, if up.
    pub fn engine(&self) -> Option<Arc<RelayEngine>> {
        self.running.as_ref().map(|r| r.engine.clone())
    }

    /// Latest sampled stats; zeroed while stopped.
    pub fn stats(&self) -> NodeStats {
        self.running
            .as_ref()
            .map(|r| r.stats.lock().clone())
            .unwrap_or_default()
    }

    /// Interval between stats samples.
    pub fn set_stats_interval(&mut self, interval: Duration) {
        self.stats_interval = interval;
    }

    /// Persist the run-intent flag independently of the live status.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        self.node.enabled = enabled;
        self.save()
    }

    /// Bring the station up: bind both listeners, start serving, and begin
    /// stats sampling. Bind failures surface as status `error` and are
    /// returned to the caller.
    pub async fn start(&mut self, bind_ws: SocketAddr, bind_http: SocketAddr) -> Result<()> {
        match self.node.status {
            NodeStatus::Stopped | NodeStatus::Error(_) => {}
            _ => bail!("station is not stopped"),
        }
        self.set_status(NodeStatus::Starting)?;

        let relay_root = self.root.join("relay");
        let store = EventStore::new(relay_root.clone());
        if let Err(e) = store.init() {
            return self.fail_start(format!("store init failed: {e}"));
        }
        let policy = &self.node.network.policy;
        let engine = Arc::new(RelayEngine::new(
            store,
            RelayPolicy {
                auth_required: policy.auth_required,
                open_relay: policy.open_relay,
            },
            Replicator::new(relay_root, policy.replication),
        ));

        let ws_listener = match TcpListener::bind(bind_ws).await {
            Ok(listener) => listener,
            Err(e) => return self.fail_start(format!("relay bind failed on {bind_ws}: {e}")),
        };
        let http_listener = match TcpListener::bind(bind_http).await {
            Ok(listener) => listener,
            Err(e) => return self.fail_start(format!("status bind failed on {bind_http}: {e}")),
        };

        let info = StationInfo {
            name: self.node.network.name.clone(),
            callsign: self.node.station.callsign.clone(),
            description: match self.node.kind {
                NodeKind::Root => "root station".into(),
                NodeKind::Node => "network node".into(),
            },
            location: None,
        };
        let (shutdown_ws, ws_rx) = oneshot::channel::<()>();
        let (shutdown_http, http_rx) = oneshot::channel::<()>();
        let ws_engine = engine.clone();
        let ws_info = info.clone();
        let ws_task = tokio::spawn(async move {
            if let Err(e) = serve_ws_on(ws_listener, ws_engine, ws_info, async {
                let _ = ws_rx.await;
            })
            .await
            {
                log::error!("relay listener failed: {e}");
            }
        });
        let http_engine = engine.clone();
        let http_task = tokio::spawn(async move {
            if let Err(e) = serve_http_on(http_listener, http_engine, info, async {
                let _ = http_rx.await;
            })
            .await
            {
                log::error!("status listener failed: {e}");
            }
        });

        // Replace rather than accumulate: any previous sampler dies first.
        if let Some(prev) = self.running.take() {
            prev.stats_task.abort();
        }
        let stats = Arc::new(Mutex::new(NodeStats::default()));
        let stats_task = spawn_stats_sampler(engine.clone(), stats.clone(), self.stats_interval);

        self.running = Some(RunningNode {
            engine,
            shutdown_ws,
            shutdown_http,
            server_tasks: vec![ws_task, http_task],
            stats_task,
            stats,
        });
        self.set_status(NodeStatus::Running)?;
        Ok(())
    }

    fn fail_start(&mut self, message: String) -> Result<()> {
        self.set_status(NodeStatus::Error(message.clone()))?;
        Err(anyhow!(message))
    }

    /// Take the station down: release listeners and cancel the stats timer.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        self.set_status(NodeStatus::Stopping)?;
        running.stats_task.abort();
        let _ = running.shutdown_ws.send(());
        let _ = running.shutdown_http.send(());
        // Graceful shutdown stops accepting; aborting drops any connection
        // still held open so the listeners are released promptly.
        for task in running.server_tasks {
            task.abort();
            let _ = task.await;
        }
        self.set_status(NodeStatus::Stopped)?;
        Ok(())
    }

    /// Stop if running, then irreversibly remove every on-disk structure of
    /// this station role.
    pub async fn delete(mut self) -> Result<()> {
        self.stop().await?;
        fs::remove_dir_all(&self.root)?;
        Ok(())
    }

    fn set_status(&mut self, status: NodeStatus) -> Result<()> {
        self.node.status = status.clone();
        self.status_tx.send_replace(status);
        self.save()
    }

    fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = node_path(&self.root);
        let data = serde_json::to_string_pretty(&self.node)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        fs::write(tmp.path(), data)?;
        tmp.persist(path)?;
        Ok(())
    }
}

fn spawn_stats_sampler(
    engine: Arc<RelayEngine>,
    stats: Arc<Mutex<NodeStats>>,
    interval: Duration,
) -> JoinHandle<()> {
    let started = Instant::now();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let (frames_in, frames_out) = engine.frame_counts();
            let snapshot = NodeStats {
                uptime_secs: started.elapsed().as_secs(),
                connected_devices: engine.connection_count() as u32,
                frames_in,
                frames_out,
                events_stored: engine.store().count(),
                storage_bytes: engine.store().storage_bytes(),
            };
            *stats.lock() = snapshot;
        }
    })
}

fn node_path(root: &std::path::Path) -> PathBuf {
    root.join("station.json")
}

fn fresh_id() -> String {
    hex::encode(thread_rng().gen::<[u8; 8]>())
}
