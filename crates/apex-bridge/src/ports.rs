use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use apex_protocol::{BridgeEvent, PortRow};

use crate::state::BridgeState;

const SCAN_INTERVAL: Duration = Duration::from_secs(3);

/// The platform's own daemon always listens; its ports are noise.
const PLATFORM_DAEMON: &str = "daytona";

// ---------------------------------------------------------------------------
// netstat parsing
// ---------------------------------------------------------------------------

fn is_loopback_addr(host: &str) -> bool {
    host.starts_with("127.") || host == "::1" || host == "localhost"
}

/// Parse `netstat -tlnp` output into the externally visible listener list:
/// LISTEN rows only, loopback-only binds dropped, skip-listed ports and the
/// platform daemon dropped, deduped by port, sorted by port.
pub fn parse_netstat(output: &str, skip_ports: &[u16]) -> Vec<PortRow> {
    let mut by_port: BTreeMap<u16, PortRow> = BTreeMap::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || !fields[0].starts_with("tcp") {
            continue;
        }
        if fields[5] != "LISTEN" {
            continue;
        }

        let local = fields[3];
        let Some((host, port_str)) = local.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port_str.parse::<u16>() else {
            continue;
        };

        if is_loopback_addr(host) || skip_ports.contains(&port) {
            continue;
        }

        // "1234/node" when readable, "-" otherwise.
        let process = fields
            .get(6)
            .and_then(|pid_prog| pid_prog.split_once('/'))
            .map(|(_, name)| name.to_string())
            .unwrap_or_default();
        if process == PLATFORM_DAEMON {
            continue;
        }

        by_port.entry(port).or_insert(PortRow {
            port,
            protocol: "tcp".to_string(),
            process,
        });
    }

    by_port.into_values().collect()
}

// ---------------------------------------------------------------------------
// Scanner task
// ---------------------------------------------------------------------------

/// Scan every 3 s and emit `ports_update` only when the serialised snapshot
/// changed since the previous emission.
pub fn spawn_scanner(state: Arc<BridgeState>) {
    tokio::spawn(async move {
        let skip_ports = state.config.scanner_skip_ports();
        let mut last_snapshot = String::new();
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        loop {
            interval.tick().await;
            let output = match Command::new("netstat").args(["-tlnp"]).output().await {
                Ok(out) => String::from_utf8_lossy(&out.stdout).into_owned(),
                Err(err) => {
                    tracing::debug!("netstat failed: {err}");
                    continue;
                }
            };
            let ports = parse_netstat(&output, &skip_ports);
            let snapshot = match serde_json::to_string(&ports) {
                Ok(s) => s,
                Err(_) => continue,
            };
            if snapshot != last_snapshot {
                last_snapshot = snapshot;
                state.send_event(&BridgeEvent::PortsUpdate { ports });
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const NETSTAT_FIXTURE: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:3000            0.0.0.0:*               LISTEN      101/node
tcp        0      0 127.0.0.1:5432          0.0.0.0:*               LISTEN      102/postgres
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN      1/sshd
tcp        0      0 0.0.0.0:8080            0.0.0.0:*               LISTEN      103/apex-bridge
tcp        0      0 0.0.0.0:9090            0.0.0.0:*               LISTEN      104/code-server
tcp        0      0 0.0.0.0:2280            0.0.0.0:*               LISTEN      105/daytona
tcp6       0      0 :::3000                 :::*                    LISTEN      101/node
tcp6       0      0 ::1:6379                :::*                    LISTEN      106/redis
tcp6       0      0 :::5173                 :::*                    LISTEN      -
udp        0      0 0.0.0.0:68              0.0.0.0:*                           107/dhclient
";

    fn skip() -> Vec<u16> {
        vec![9090, 22, 8080]
    }

    #[test]
    fn keeps_only_external_listeners() {
        let rows = parse_netstat(NETSTAT_FIXTURE, &skip());
        let ports: Vec<u16> = rows.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![3000, 5173]);
    }

    #[test]
    fn drops_loopback_binds() {
        let rows = parse_netstat(NETSTAT_FIXTURE, &skip());
        assert!(rows.iter().all(|r| r.port != 5432), "127.0.0.1 bind kept");
        assert!(rows.iter().all(|r| r.port != 6379), "::1 bind kept");
    }

    #[test]
    fn drops_skip_listed_ports_and_platform_daemon() {
        let rows = parse_netstat(NETSTAT_FIXTURE, &skip());
        for forbidden in [22u16, 8080, 9090, 2280] {
            assert!(
                rows.iter().all(|r| r.port != forbidden),
                "port {forbidden} leaked"
            );
        }
    }

    #[test]
    fn dedupes_v4_and_v6_rows_for_the_same_port() {
        let rows = parse_netstat(NETSTAT_FIXTURE, &skip());
        assert_eq!(rows.iter().filter(|r| r.port == 3000).count(), 1);
        assert_eq!(rows[0].process, "node");
    }

    #[test]
    fn unreadable_process_column_is_empty() {
        let rows = parse_netstat(NETSTAT_FIXTURE, &skip());
        let anon = rows.iter().find(|r| r.port == 5173).unwrap();
        assert_eq!(anon.process, "");
    }

    #[test]
    fn output_is_sorted_by_port() {
        let fixture = "\
tcp        0      0 0.0.0.0:9000            0.0.0.0:*               LISTEN      1/b
tcp        0      0 0.0.0.0:80              0.0.0.0:*               LISTEN      2/a
";
        let rows = parse_netstat(fixture, &[]);
        let ports: Vec<u16> = rows.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![80, 9000]);
    }

    #[test]
    fn identical_snapshots_serialise_identically() {
        // The scanner's diff is on the serialised form; same input must not
        // produce a new emission.
        let a = serde_json::to_string(&parse_netstat(NETSTAT_FIXTURE, &skip())).unwrap();
        let b = serde_json::to_string(&parse_netstat(NETSTAT_FIXTURE, &skip())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn garbage_input_yields_empty_list() {
        assert!(parse_netstat("", &[]).is_empty());
        assert!(parse_netstat("complete nonsense\nmore nonsense", &[]).is_empty());
    }
}
