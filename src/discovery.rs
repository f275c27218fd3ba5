//! LAN discovery of reachable stations.
//!
//! Scanning is phased: the primary ports are swept across localhost and every
//! derived subnet first, the secondary ports only afterwards, so the common
//! case produces results quickly. Probes run in fixed-size batches with both
//! per-probe and per-batch timeouts; a host that never answers costs one
//! timeout, never the whole scan.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use futures_util::future::join_all;
use std::future::Future;

use crate::{
    config::Settings,
    identity::is_station_callsign,
    server::{Location, StatusDocument},
};

/// Port used for UDP local-address probing during subnet derivation.
const DATA_PORT: u16 = 3456;

/// Gateways tried when interface enumeration yields nothing.
const COMMON_GATEWAYS: &[&str] = &["192.168.1.1", "192.168.0.1", "10.0.0.1", "172.16.0.1"];

/// Last-resort subnet prefixes.
const FALLBACK_SUBNETS: &[&str] = &["192.168.1", "192.168.0", "10.0.0", "10.0.1", "172.16.0"];

/// Tuning for one scan pass.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Ports swept in phase 1.
    pub primary_ports: Vec<u16>,
    /// Ports swept in phase 2.
    pub secondary_ports: Vec<u16>,
    /// Maximum probes in flight at once.
    pub batch_size: usize,
    /// Timeout for a single probe.
    pub probe_timeout: Duration,
    /// Extra localhost port range for multi-instance setups.
    pub local_port_range: Option<(u16, u16)>,
    /// Subnet prefixes to sweep (`"192.168.1"`); `None` derives them from
    /// the host's interfaces.
    pub subnets: Option<Vec<String>>,
}

impl ScanConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            primary_ports: settings.scan_primary_ports.clone(),
            secondary_ports: settings.scan_secondary_ports.clone(),
            batch_size: settings.scan_batch.max(1),
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            local_port_range: settings.scan_local_ports,
            subnets: None,
        }
    }
}

/// One endpoint classified as a station.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub ip: String,
    pub port: u16,
    pub callsign: Option<String>,
    pub name: String,
    pub description: String,
    pub version: String,
    pub location: Option<Location>,
}

impl ScanResult {
    /// Base URL of the discovered endpoint.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Whether the endpoint was reached over loopback.
    pub fn is_loopback(&self) -> bool {
        self.ip
            .parse::<Ipv4Addr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(self.ip == "localhost")
    }

    /// Identity key used to merge duplicate sightings of one station.
    pub fn dedup_key(&self) -> String {
        if let Some(cs) = self.callsign.as_deref().filter(|c| !c.is_empty()) {
            return format!("cs:{}:{}", cs, self.port);
        }
        if !self.name.is_empty() {
            return format!("name:{}:{}", self.name, self.port);
        }
        format!("addr:{}:{}", self.ip, self.port)
    }

    /// One point per piece of identifying information.
    pub fn info_score(&self) -> u32 {
        let mut score = 0;
        if self.callsign.as_deref().map_or(false, |c| !c.is_empty()) {
            score += 1;
        }
        if !self.description.is_empty() {
            score += 1;
        }
        if self.location.is_some() {
            score += 1;
        }
        if !self.version.is_empty() {
            score += 1;
        }
        if !self.is_loopback() {
            score += 1;
        }
        score
    }
}

/// Outcome of a scan pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSummary {
    pub found: usize,
    pub cancelled: bool,
}

/// Station scanner. One scan is in flight per instance at a time; a flag
/// left set by a crashed pass is reset on the next call instead of blocking
/// new callers.
pub struct Scanner {
    client: reqwest::Client,
    scanning: AtomicBool,
    cancel: AtomicBool,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            scanning: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        }
    }

    /// Ask a running scan to stop at the next batch boundary.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether a scan pass is currently marked in flight.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Run a full scan, invoking `on_result` as station entries appear or
    /// improve. Returns the final summary.
    pub async fn scan(
        &self,
        cfg: &ScanConfig,
        mut on_result: impl FnMut(&ScanResult),
    ) -> ScanSummary {
        if self.scanning.swap(true, Ordering::SeqCst) {
            log::warn!("scan flag was still set from a previous pass; resetting");
        }
        self.cancel.store(false, Ordering::SeqCst);

        let subnets = cfg
            .subnets
            .clone()
            .unwrap_or_else(derive_subnets);
        log::debug!("scanning subnets: {subnets:?}");

        let mut results: HashMap<String, ScanResult> = HashMap::new();
        let mut cancelled = false;
        for (phase, ports) in [(1, &cfg.primary_ports), (2, &cfg.secondary_ports)] {
            if cancelled || self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            let targets = phase_targets(ports, &subnets, if phase == 1 {
                cfg.local_port_range
            } else {
                None
            });
            log::debug!("phase {phase}: {} targets", targets.len());
            cancelled = run_batches(
                targets,
                cfg.batch_size,
                cfg.probe_timeout * 3,
                || self.cancel.load(Ordering::SeqCst),
                |(ip, port)| self.probe(ip, port, cfg.probe_timeout),
                |batch| {
                    for res in batch {
                        merge_result(&mut results, res, &mut on_result);
                    }
                },
            )
            .await;
        }

        self.scanning.store(false, Ordering::SeqCst);
        ScanSummary {
            found: results.len(),
            cancelled,
        }
    }

    /// Probe one endpoint. Every failure mode is "not a station".
    async fn probe(&self, ip: String, port: u16, timeout: Duration) -> Option<ScanResult> {
        let base = format!("http://{ip}:{port}");
        for path in ["/api/status", "/station/status"] {
            if let Ok(resp) = self
                .client
                .get(format!("{base}{path}"))
                .timeout(timeout)
                .send()
                .await
            {
                if resp.status().is_success() {
                    if let Ok(doc) = resp.json::<StatusDocument>().await {
                        if is_station_document(&doc) {
                            return Some(result_from_document(ip, port, doc));
                        }
                    }
                }
            }
        }
        // Last resort: sniff the landing page for station markers.
        let resp = self.client.get(&base).timeout(timeout).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body = resp.text().await.ok()?.to_lowercase();
        if body.contains("geogram") && body.contains("station") {
            return Some(ScanResult {
                ip,
                port,
                callsign: None,
                name: String::new(),
                description: String::new(),
                version: String::new(),
                location: None,
            });
        }
        None
    }
}

/// Whether a status document identifies a station service.
fn is_station_document(doc: &StatusDocument) -> bool {
    doc.service.to_lowercase().contains("station") || is_station_callsign(&doc.callsign)
}

fn result_from_document(ip: String, port: u16, doc: StatusDocument) -> ScanResult {
    ScanResult {
        ip,
        port,
        callsign: Some(doc.callsign).filter(|c| !c.is_empty()),
        name: doc.name,
        description: doc.description,
        version: doc.version,
        location: doc.location,
    }
}

/// Merge one sighting into the result map, reporting inserts and upgrades.
fn merge_result(
    results: &mut HashMap<String, ScanResult>,
    res: ScanResult,
    on_result: &mut impl FnMut(&ScanResult),
) {
    let key = res.dedup_key();
    match results.get(&key) {
        None => {
            on_result(&res);
            results.insert(key, res);
        }
        Some(existing) => {
            let replace = if existing.is_loopback() != res.is_loopback() {
                existing.is_loopback()
            } else {
                res.info_score() > existing.info_score()
            };
            if replace {
                on_result(&res);
                results.insert(key, res);
            }
        }
    }
}

/// Targets for one phase: localhost first, then each subnet host-by-host.
fn phase_targets(
    ports: &[u16],
    subnets: &[String],
    local_range: Option<(u16, u16)>,
) -> Vec<(String, u16)> {
    let mut targets = vec![];
    for &port in ports {
        targets.push(("127.0.0.1".to_string(), port));
    }
    if let Some((start, end)) = local_range {
        for port in start..=end {
            if !ports.contains(&port) {
                targets.push(("127.0.0.1".to_string(), port));
            }
        }
    }
    for subnet in subnets {
        for host in 1..=254u16 {
            for &port in ports {
                targets.push((format!("{subnet}.{host}"), port));
            }
        }
    }
    targets
}

/// Run probes over `targets` in sequential batches of `batch_size`, each
/// batch bounded by `outer_timeout`. Returns whether the pass was cancelled.
async fn run_batches<T, F, Fut, R>(
    targets: Vec<T>,
    batch_size: usize,
    outer_timeout: Duration,
    cancelled: impl Fn() -> bool,
    probe: F,
    mut on_batch: impl FnMut(Vec<R>),
) -> bool
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Option<R>>,
{
    let mut iter = targets.into_iter();
    loop {
        if cancelled() {
            return true;
        }
        let chunk: Vec<T> = iter.by_ref().take(batch_size.max(1)).collect();
        if chunk.is_empty() {
            return false;
        }
        let joined = join_all(chunk.into_iter().map(&probe));
        match tokio::time::timeout(outer_timeout, joined).await {
            Ok(found) => on_batch(found.into_iter().flatten().collect()),
            Err(_) => log::warn!("scan batch exceeded its deadline; dropping stragglers"),
        }
    }
}

/// Derive /24 prefixes for the local networks, falling back from interface
/// enumeration to UDP local-address tricks to a hardcoded list.
fn derive_subnets() -> Vec<String> {
    let mut prefixes: Vec<String> = vec![];
    if let Ok(ifaces) = if_addrs::get_if_addrs() {
        for iface in ifaces {
            if iface.is_loopback() {
                continue;
            }
            if let IpAddr::V4(ip) = iface.ip() {
                push_prefix(&mut prefixes, ip);
            }
        }
    }
    if prefixes.is_empty() {
        if let Some(ip) = local_ip_via_broadcast() {
            push_prefix(&mut prefixes, ip);
        }
    }
    if prefixes.is_empty() {
        for gateway in COMMON_GATEWAYS {
            if let Some(ip) = local_ip_toward(gateway) {
                push_prefix(&mut prefixes, ip);
                break;
            }
        }
    }
    if prefixes.is_empty() {
        prefixes = FALLBACK_SUBNETS.iter().map(|s| s.to_string()).collect();
    }
    prefixes
}

fn push_prefix(prefixes: &mut Vec<String>, ip: Ipv4Addr) {
    if ip.is_loopback() || ip.is_unspecified() {
        return;
    }
    let octets = ip.octets();
    let prefix = format!("{}.{}.{}", octets[0], octets[1], octets[2]);
    if !prefixes.contains(&prefix) {
        prefixes.push(prefix);
    }
}

/// Local address assigned when a broadcast-enabled socket is opened.
fn local_ip_via_broadcast() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.set_broadcast(true).ok()?;
    socket.connect(("255.255.255.255", DATA_PORT)).ok()?;
    usable_v4(socket.local_addr().ok()?)
}

/// Local address the OS would route toward a likely gateway.
fn local_ip_toward(gateway: &str) -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect((gateway, DATA_PORT)).ok()?;
    usable_v4(socket.local_addr().ok()?)
}

fn usable_v4(addr: SocketAddr) -> Option<Ipv4Addr> {
    match addr {
        SocketAddr::V4(v4) if !v4.ip().is_loopback() && !v4.ip().is_unspecified() => Some(*v4.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::SERVICE_NAME;
    use axum::{routing::get, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn result(ip: &str, port: u16, callsign: Option<&str>) -> ScanResult {
        ScanResult {
            ip: ip.into(),
            port,
            callsign: callsign.map(|s| s.to_string()),
            name: String::new(),
            description: String::new(),
            version: String::new(),
            location: None,
        }
    }

    #[tokio::test]
    async fn batches_bound_concurrency() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let targets: Vec<u32> = (0..100).collect();
        let (c, p) = (current.clone(), peak.clone());
        let cancelled = run_batches(
            targets,
            30,
            Duration::from_secs(5),
            || false,
            move |_t| {
                let (c, p) = (c.clone(), p.clone());
                async move {
                    let now = c.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    p.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    c.fetch_sub(1, AtomicOrdering::SeqCst);
                    Some(())
                }
            },
            |_batch| {},
        )
        .await;
        assert!(!cancelled);
        assert!(peak.load(AtomicOrdering::SeqCst) <= 30);
    }

    #[tokio::test]
    async fn batch_deadline_drops_stragglers() {
        let mut seen = 0usize;
        let cancelled = run_batches(
            vec![1u32, 2, 3],
            3,
            Duration::from_millis(50),
            || false,
            |t| async move {
                if t == 2 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Some(t)
            },
            |batch| seen += batch.len(),
        )
        .await;
        assert!(!cancelled);
        assert_eq!(seen, 0); // whole batch dropped at the deadline
    }

    #[tokio::test]
    async fn cancellation_stops_between_batches() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let cancelled = run_batches(
            (0..90u32).collect(),
            30,
            Duration::from_secs(5),
            {
                let ran = ran.clone();
                move || ran.load(AtomicOrdering::SeqCst) >= 30
            },
            move |_t| {
                let ran = ran_clone.clone();
                async move {
                    ran.fetch_add(1, AtomicOrdering::SeqCst);
                    Some(())
                }
            },
            |_batch| {},
        )
        .await;
        assert!(cancelled);
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 30);
    }

    #[test]
    fn merge_prefers_non_loopback_then_score() {
        let mut results = HashMap::new();
        let mut seen = vec![];
        let mut cb = |r: &ScanResult| seen.push(r.ip.clone());

        merge_result(&mut results, result("127.0.0.1", 3456, Some("X3AAAAAA")), &mut cb);
        merge_result(
            &mut results,
            result("192.168.1.50", 3456, Some("X3AAAAAA")),
            &mut cb,
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results.values().next().unwrap().ip, "192.168.1.50");

        // Lower-information non-loopback duplicate does not replace.
        let mut weaker = result("192.168.1.51", 3456, Some("X3AAAAAA"));
        weaker.callsign = Some("X3AAAAAA".into());
        merge_result(&mut results, weaker, &mut cb);
        assert_eq!(results.values().next().unwrap().ip, "192.168.1.50");
        assert_eq!(seen, vec!["127.0.0.1", "192.168.1.50"]);
    }

    #[test]
    fn merge_upgrades_on_information_score() {
        let mut results = HashMap::new();
        let mut cb = |_: &ScanResult| {};
        merge_result(&mut results, result("127.0.0.1", 3456, Some("X3AAAAAA")), &mut cb);
        let mut richer = result("127.0.0.1", 3456, Some("X3AAAAAA"));
        richer.description = "solar powered".into();
        richer.version = "1.2".into();
        merge_result(&mut results, richer, &mut cb);
        let kept = results.values().next().unwrap();
        assert_eq!(kept.description, "solar powered");
    }

    #[test]
    fn dedup_key_fallback_order() {
        assert!(result("1.2.3.4", 80, Some("X3AAAAAA"))
            .dedup_key()
            .starts_with("cs:"));
        let mut named = result("1.2.3.4", 80, None);
        named.name = "ridge".into();
        assert!(named.dedup_key().starts_with("name:"));
        assert!(result("1.2.3.4", 80, None).dedup_key().starts_with("addr:"));
    }

    #[test]
    fn localhost_targets_include_extended_range() {
        let targets = phase_targets(&[3456], &[], Some((4000, 4002)));
        assert!(targets.contains(&("127.0.0.1".into(), 3456)));
        assert!(targets.contains(&("127.0.0.1".into(), 4001)));
        assert_eq!(targets.len(), 4);
    }

    async fn spawn_station(callsign: &'static str) -> (u16, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route(
            "/api/status",
            get(move || async move {
                Json(StatusDocument {
                    service: SERVICE_NAME.into(),
                    callsign: callsign.into(),
                    name: "ridge relay".into(),
                    description: "hilltop".into(),
                    version: "0.1.0".into(),
                    ..Default::default()
                })
            }),
        );
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        (port, handle)
    }

    #[tokio::test]
    async fn scan_finds_local_station() {
        let (port, handle) = spawn_station("X3ABC123").await;
        let scanner = Scanner::new();
        let cfg = ScanConfig {
            primary_ports: vec![],
            secondary_ports: vec![],
            batch_size: 30,
            probe_timeout: Duration::from_millis(500),
            local_port_range: Some((port, port)),
            subnets: Some(vec![]),
        };
        let mut found = vec![];
        let summary = scanner.scan(&cfg, |r| found.push(r.clone())).await;
        assert_eq!(summary, ScanSummary { found: 1, cancelled: false });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].callsign.as_deref(), Some("X3ABC123"));
        assert_eq!(found[0].port, port);
        assert!(!scanner.is_scanning());
        handle.abort();
    }

    #[tokio::test]
    async fn scan_ignores_non_station_services() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route(
            "/api/status",
            get(|| async { Json(serde_json::json!({"service": "printer"})) }),
        );
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        let scanner = Scanner::new();
        let cfg = ScanConfig {
            primary_ports: vec![],
            secondary_ports: vec![],
            batch_size: 30,
            probe_timeout: Duration::from_millis(500),
            local_port_range: Some((port, port)),
            subnets: Some(vec![]),
        };
        let summary = scanner.scan(&cfg, |_| {}).await;
        assert_eq!(summary.found, 0);
        handle.abort();
    }

    #[tokio::test]
    async fn scan_sniffs_landing_page_markers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route(
            "/",
            get(|| async { "<html>Geogram Station portal</html>" }),
        );
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        let scanner = Scanner::new();
        let cfg = ScanConfig {
            primary_ports: vec![],
            secondary_ports: vec![],
            batch_size: 30,
            probe_timeout: Duration::from_millis(500),
            local_port_range: Some((port, port)),
            subnets: Some(vec![]),
        };
        let mut found = vec![];
        let summary = scanner.scan(&cfg, |r| found.push(r.clone())).await;
        assert_eq!(summary.found, 1);
        assert!(found[0].callsign.is_none());
        handle.abort();
    }

    #[tokio::test]
    async fn closed_ports_are_silent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let scanner = Scanner::new();
        let cfg = ScanConfig {
            primary_ports: vec![],
            secondary_ports: vec![],
            batch_size: 30,
            probe_timeout: Duration::from_millis(200),
            local_port_range: Some((port, port)),
            subnets: Some(vec![]),
        };
        let summary = scanner.scan(&cfg, |_| {}).await;
        assert_eq!(summary, ScanSummary { found: 0, cancelled: false });
    }
}
