//! Authoritative list of known stations and the single outbound connection.

use std::{fs, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use url::Url;

use crate::{
    discovery::ScanResult,
    identity::is_client_callsign,
    server::{Location, StatusDocument},
};

const ENRICH_TIMEOUT: Duration = Duration::from_secs(2);

/// Standing of a station within the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationStatus {
    Preferred,
    Backup,
    Available,
}

/// One known station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRecord {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub callsign: Option<String>,
    pub status: StationStatus,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub connected_devices: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub is_connected: bool,
}

impl StationRecord {
    /// Promote a discovery result into a directory record.
    pub fn from_scan(res: &ScanResult) -> Self {
        Self {
            url: res.url(),
            name: res.name.clone(),
            callsign: res.callsign.clone(),
            status: StationStatus::Available,
            latency_ms: None,
            connected_devices: 0,
            description: res.description.clone(),
            version: res.version.clone(),
            location: res.location.clone(),
            is_connected: false,
        }
    }

    fn host(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    fn port(&self) -> Option<u16> {
        Url::parse(&self.url).ok().and_then(|u| u.port_or_known_default())
    }

    fn is_loopback(&self) -> bool {
        matches!(self.host().as_deref(), Some("127.0.0.1") | Some("localhost"))
    }

    /// Identity key used to merge duplicate entries.
    fn dedup_key(&self) -> String {
        let port = self.port().unwrap_or(0);
        if let Some(cs) = self.callsign.as_deref().filter(|c| !c.is_empty()) {
            return format!("cs:{}:{}", cs, port);
        }
        if !self.name.is_empty() {
            return format!("name:{}:{}", self.name, port);
        }
        format!("url:{}", self.url)
    }

    fn info_score(&self) -> u32 {
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

    /// Records claiming a client-role callsign never belong here.
    fn is_client_device(&self) -> bool {
        self.callsign
            .as_deref()
            .map_or(false, is_client_callsign)
    }
}

#[derive(Serialize, Deserialize, Default)]
struct DirectoryFile {
    stations: Vec<StationRecord>,
}

struct ActiveConnection {
    url: String,
    task: JoinHandle<()>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Directory of known stations, persisted as one JSON document.
pub struct StationDirectory {
    path: PathBuf,
    operator_coords: Option<(f64, f64)>,
    stations: Vec<StationRecord>,
    current: Option<ActiveConnection>,
}

impl StationDirectory {
    /// Load the directory, dropping client-role entries and repairing the
    /// single-preferred invariant. Corrupt files fall back to empty.
    pub fn load(path: PathBuf, operator_coords: Option<(f64, f64)>) -> Self {
        let mut stations = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<DirectoryFile>(&data) {
                Ok(file) => file.stations,
                Err(e) => {
                    log::warn!("station directory unreadable, starting empty: {e}");
                    vec![]
                }
            },
            Err(_) => vec![],
        };
        let before = stations.len();
        stations.retain(|s| !s.is_client_device());
        if stations.len() < before {
            log::warn!("dropped {} client-device entries", before - stations.len());
        }
        let mut seen_preferred = false;
        for station in &mut stations {
            station.is_connected = false;
            if station.status == StationStatus::Preferred {
                if seen_preferred {
                    station.status = StationStatus::Backup;
                } else {
                    seen_preferred = true;
                }
            }
        }
        Self {
            path,
            operator_coords,
            stations,
            current: None,
        }
    }

    /// Persist the directory atomically.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
            let file = DirectoryFile {
                stations: self.stations.clone(),
            };
            let data = serde_json::to_string_pretty(&file)?;
            let tmp = tempfile::NamedTempFile::new_in(parent)?;
            fs::write(tmp.path(), data)?;
            tmp.persist(&self.path)?;
        }
        Ok(())
    }

    pub fn stations(&self) -> &[StationRecord] {
        &self.stations
    }

    pub fn get(&self, url: &str) -> Option<&StationRecord> {
        self.stations.iter().find(|s| s.url == url)
    }

    /// The current preferred station, if any.
    pub fn preferred(&self) -> Option<&StationRecord> {
        self.stations
            .iter()
            .find(|s| s.status == StationStatus::Preferred)
    }

    /// URL of the live outbound connection, if one is up.
    pub fn current_url(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.url.as_str())
    }

    /// Add or merge a station. The first station in an empty directory
    /// becomes preferred. Returns `false` when the record is rejected.
    pub fn add(&mut self, record: StationRecord) -> Result<bool> {
        if record.is_client_device() {
            log::warn!(
                "refusing client-device callsign {:?} in station directory",
                record.callsign
            );
            return Ok(false);
        }
        let key = record.dedup_key();
        match self.stations.iter().position(|s| s.dedup_key() == key) {
            Some(idx) => {
                let existing = &self.stations[idx];
                let replace = if existing.is_loopback() != record.is_loopback() {
                    existing.is_loopback()
                } else {
                    record.info_score() > existing.info_score()
                };
                if replace {
                    let mut merged = record;
                    merged.status = existing.status;
                    merged.is_connected = existing.is_connected;
                    merged.latency_ms = existing.latency_ms.or(merged.latency_ms);
                    self.stations[idx] = merged;
                }
            }
            None => self.stations.push(record),
        }
        if self.preferred().is_none() {
            self.reselect_preferred();
        }
        self.save()?;
        Ok(true)
    }

    /// Promote a station to preferred, demoting any prior preferred.
    pub fn set_preferred(&mut self, url: &str) -> Result<()> {
        if self.get(url).is_none() {
            return Err(anyhow!("unknown station: {url}"));
        }
        for station in &mut self.stations {
            if station.status == StationStatus::Preferred && station.url != url {
                station.status = StationStatus::Backup;
            }
        }
        if let Some(station) = self.stations.iter_mut().find(|s| s.url == url) {
            station.status = StationStatus::Preferred;
        }
        self.save()
    }

    /// Mark a station as backup; a demoted preferred triggers reselection.
    pub fn set_backup(&mut self, url: &str) -> Result<()> {
        let Some(station) = self.stations.iter_mut().find(|s| s.url == url) else {
            return Err(anyhow!("unknown station: {url}"));
        };
        let was_preferred = station.status == StationStatus::Preferred;
        station.status = StationStatus::Backup;
        if was_preferred {
            self.reselect_preferred();
        }
        self.save()
    }

    /// Delete a station; a deleted preferred triggers reselection.
    pub fn remove(&mut self, url: &str) -> Result<bool> {
        let Some(idx) = self.stations.iter().position(|s| s.url == url) else {
            return Ok(false);
        };
        let was_preferred = self.stations[idx].status == StationStatus::Preferred;
        if self.current_url() == Some(url) {
            self.disconnect();
        }
        self.stations.remove(idx);
        if was_preferred {
            self.reselect_preferred();
        }
        self.save()?;
        Ok(true)
    }

    /// Promote a replacement preferred station: a backup first, else the
    /// geographically closest available station, else the first available.
    /// May leave no station preferred; callers must cope.
    fn reselect_preferred(&mut self) {
        if self.preferred().is_some() {
            return;
        }
        if let Some(station) = self
            .stations
            .iter_mut()
            .find(|s| s.status == StationStatus::Backup)
        {
            station.status = StationStatus::Preferred;
            return;
        }
        let candidate = match self.operator_coords {
            Some(here) => self
                .stations
                .iter()
                .enumerate()
                .filter(|(_, s)| s.status == StationStatus::Available)
                .min_by(|(_, a), (_, b)| {
                    distance_from(here, a)
                        .partial_cmp(&distance_from(here, b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i),
            None => self
                .stations
                .iter()
                .position(|s| s.status == StationStatus::Available),
        };
        if let Some(idx) = candidate {
            self.stations[idx].status = StationStatus::Preferred;
        }
    }

    /// Open the single outbound connection to a station: WebSocket handshake
    /// with latency measurement, then `/api/status` enrichment. A connect to
    /// one station implicitly drops any prior connection. Unreachable
    /// stations are reported as `Ok(false)`, never as an error.
    pub async fn connect(&mut self, url: &str) -> Result<bool> {
        if self.get(url).is_none() {
            return Err(anyhow!("unknown station: {url}"));
        }
        self.disconnect();
        let ws_url = ws_url_for(url)?;
        let started = std::time::Instant::now();
        match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((stream, _)) => {
                let latency = started.elapsed().as_millis() as u64;
                let task = tokio::spawn(async move {
                    let (_write, mut read) = stream.split();
                    while let Some(Ok(_)) = read.next().await {}
                });
                let enriched = fetch_status(url).await;
                for station in &mut self.stations {
                    station.is_connected = station.url == url;
                }
                if let Some(station) = self.stations.iter_mut().find(|s| s.url == url) {
                    station.latency_ms = Some(latency);
                    if let Some(doc) = enriched {
                        station.connected_devices = doc.connected_devices;
                        if !doc.callsign.is_empty() {
                            station.callsign = Some(doc.callsign);
                        }
                        if !doc.name.is_empty() {
                            station.name = doc.name;
                        }
                        if !doc.version.is_empty() {
                            station.version = doc.version;
                        }
                        if doc.location.is_some() {
                            station.location = doc.location;
                        }
                    }
                }
                self.current = Some(ActiveConnection {
                    url: url.to_string(),
                    task,
                });
                self.save()?;
                Ok(true)
            }
            Err(e) => {
                log::debug!("station connect failed for {url}: {e}");
                if let Some(station) = self.stations.iter_mut().find(|s| s.url == url) {
                    station.is_connected = false;
                }
                self.save()?;
                Ok(false)
            }
        }
    }

    /// Drop the outbound connection, if any.
    pub fn disconnect(&mut self) {
        if let Some(active) = self.current.take() {
            if let Some(station) = self.stations.iter_mut().find(|s| s.url == active.url) {
                station.is_connected = false;
            }
        }
    }
}

async fn fetch_status(url: &str) -> Option<StatusDocument> {
    let client = reqwest::Client::new();
    client
        .get(format!("{url}/api/status"))
        .timeout(ENRICH_TIMEOUT)
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()
}

fn ws_url_for(url: &str) -> Result<String> {
    let parsed = Url::parse(url)?;
    let host = parsed.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    Ok(format!("ws://{host}:{port}/"))
}

fn distance_from(here: (f64, f64), station: &StationRecord) -> f64 {
    station
        .location
        .as_ref()
        .map(|loc| haversine_km(here, (loc.latitude, loc.longitude)))
        .unwrap_or(f64::MAX)
}

/// Great-circle distance between two coordinates, in kilometers.
fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}
