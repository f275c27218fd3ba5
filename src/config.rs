//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all persisted state.
    pub data_root: PathBuf,
    /// HTTP bind address for the status endpoints, e.g. `127.0.0.1:3456`.
    pub bind_http: String,
    /// WebSocket bind address for the relay, e.g. `127.0.0.1:3457`.
    pub bind_ws: String,
    /// Require NIP-42 authentication before accepting writes.
    pub auth_required: bool,
    /// Accept writes from any connection regardless of authentication.
    pub open_relay: bool,
    /// Enable opportunistic blob replication for allow-listed authors.
    pub replication: bool,
    /// Public keys allowed to write when authentication is required.
    pub allowed_authors: Vec<String>,
    /// Ports probed in the first discovery phase.
    pub scan_primary_ports: Vec<u16>,
    /// Ports probed in the second discovery phase.
    pub scan_secondary_ports: Vec<u16>,
    /// Maximum probes in flight at once.
    pub scan_batch: usize,
    /// Timeout for one probe, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Extra localhost port range (`start-end`) for multi-instance testing.
    pub scan_local_ports: Option<(u16, u16)>,
    /// Operator coordinates used for closest-station reselection.
    pub operator_coords: Option<(f64, f64)>,
    /// Nicknames only claimable by the reserved owner key.
    pub reserved_nicknames: Vec<String>,
    /// Public key allowed to claim reserved nicknames.
    pub reserved_owner: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let data_root = PathBuf::from(env::var("DATA_ROOT")?);
        let bind_http = env::var("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS")?;
        let auth_required = flag("AUTH_REQUIRED");
        let open_relay = flag("OPEN_RELAY");
        let replication = flag("REPLICATION");
        let allowed_authors = csv_strings(env::var("ALLOWED_AUTHORS").unwrap_or_default());
        let scan_primary_ports = ports_or("SCAN_PRIMARY_PORTS", &[3456, 8080]);
        let scan_secondary_ports = ports_or("SCAN_SECONDARY_PORTS", &[80, 8081, 3000, 5000]);
        let scan_batch = env::var("SCAN_BATCH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        let probe_timeout_ms = env::var("PROBE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);
        let scan_local_ports = env::var("SCAN_LOCAL_PORTS")
            .ok()
            .and_then(|s| parse_port_range(&s));
        let operator_coords = match (
            env::var("OPERATOR_LAT").ok().and_then(|s| s.parse().ok()),
            env::var("OPERATOR_LON").ok().and_then(|s| s.parse().ok()),
        ) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        };
        let reserved_nicknames = csv_strings(env::var("RESERVED_NICKNAMES").unwrap_or_default());
        let reserved_owner = env::var("RESERVED_OWNER").ok().filter(|s| !s.is_empty());
        Ok(Self {
            data_root,
            bind_http,
            bind_ws,
            auth_required,
            open_relay,
            replication,
            allowed_authors,
            scan_primary_ports,
            scan_secondary_ports,
            scan_batch,
            probe_timeout_ms,
            scan_local_ports,
            operator_coords,
            reserved_nicknames,
            reserved_owner,
        })
    }
}

fn flag(name: &str) -> bool {
    env::var(name).unwrap_or_else(|_| "0".into()) == "1"
}

fn ports_or(name: &str, default: &[u16]) -> Vec<u16> {
    let parsed = csv_u16(env::var(name).unwrap_or_default());
    if parsed.is_empty() {
        default.to_vec()
    } else {
        parsed
    }
}

/// Parse a `start-end` port range, returning `None` for malformed input.
pub fn parse_port_range(input: &str) -> Option<(u16, u16)> {
    let (start, end) = input.split_once('-')?;
    let start: u16 = start.trim().parse().ok()?;
    let end: u16 = end.trim().parse().ok()?;
    if start > end {
        return None;
    }
    Some((start, end))
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Split a comma-separated string into `u16` values, skipping invalid entries.
pub fn csv_u16(input: impl AsRef<str>) -> Vec<u16> {
    let s = input.as_ref();
    s.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}

/// Environment variables are process-global; every test that touches them
/// holds this lock.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};
    use tempfile::tempdir;

    const ALL_VARS: &[&str] = &[
        "DATA_ROOT",
        "BIND_HTTP",
        "BIND_WS",
        "AUTH_REQUIRED",
        "OPEN_RELAY",
        "REPLICATION",
        "ALLOWED_AUTHORS",
        "SCAN_PRIMARY_PORTS",
        "SCAN_SECONDARY_PORTS",
        "SCAN_BATCH",
        "PROBE_TIMEOUT_MS",
        "SCAN_LOCAL_PORTS",
        "OPERATOR_LAT",
        "OPERATOR_LON",
        "RESERVED_NICKNAMES",
        "RESERVED_OWNER",
    ];

    fn clear_vars() {
        for v in ALL_VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = TEST_ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "DATA_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:3456\n",
                "BIND_WS=127.0.0.1:3457\n",
                "AUTH_REQUIRED=1\n",
                "OPEN_RELAY=0\n",
                "REPLICATION=1\n",
                "ALLOWED_AUTHORS=aa,bb\n",
                "SCAN_PRIMARY_PORTS=3456\n",
                "SCAN_BATCH=10\n",
                "PROBE_TIMEOUT_MS=250\n",
                "SCAN_LOCAL_PORTS=3456-3460\n",
                "OPERATOR_LAT=38.7\n",
                "OPERATOR_LON=-9.1\n",
                "RESERVED_NICKNAMES=admin,geogram\n",
                "RESERVED_OWNER=cc\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.data_root, PathBuf::from("/tmp"));
        assert_eq!(cfg.bind_http, "127.0.0.1:3456");
        assert_eq!(cfg.bind_ws, "127.0.0.1:3457");
        assert!(cfg.auth_required);
        assert!(!cfg.open_relay);
        assert!(cfg.replication);
        assert_eq!(cfg.allowed_authors, vec!["aa", "bb"]);
        assert_eq!(cfg.scan_primary_ports, vec![3456]);
        assert_eq!(cfg.scan_secondary_ports, vec![80, 8081, 3000, 5000]);
        assert_eq!(cfg.scan_batch, 10);
        assert_eq!(cfg.probe_timeout_ms, 250);
        assert_eq!(cfg.scan_local_ports, Some((3456, 3460)));
        assert_eq!(cfg.operator_coords, Some((38.7, -9.1)));
        assert_eq!(cfg.reserved_nicknames, vec!["admin", "geogram"]);
        assert_eq!(cfg.reserved_owner.as_deref(), Some("cc"));
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = TEST_ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "DATA_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:3456\n",
                "BIND_WS=127.0.0.1:3457\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert!(!cfg.auth_required);
        assert!(!cfg.open_relay);
        assert!(!cfg.replication);
        assert!(cfg.allowed_authors.is_empty());
        assert_eq!(cfg.scan_primary_ports, vec![3456, 8080]);
        assert_eq!(cfg.scan_secondary_ports, vec![80, 8081, 3000, 5000]);
        assert_eq!(cfg.scan_batch, 30);
        assert_eq!(cfg.probe_timeout_ms, 500);
        assert!(cfg.scan_local_ports.is_none());
        assert!(cfg.operator_coords.is_none());
        assert!(cfg.reserved_nicknames.is_empty());
        assert!(cfg.reserved_owner.is_none());
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = TEST_ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "BIND_HTTP=127.0.0.1:3456\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn csv_helpers() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
        assert_eq!(csv_u16("1, 2, x,3"), vec![1, 2, 3]);
        assert!(csv_u16("").is_empty());
    }

    #[test]
    fn port_ranges() {
        assert_eq!(parse_port_range("3456-3460"), Some((3456, 3460)));
        assert_eq!(parse_port_range("3460-3456"), None);
        assert_eq!(parse_port_range("nope"), None);
        assert_eq!(parse_port_range("1-"), None);
    }
}
