//! Periodic discovery of listening TCP ports in an agent's process tree,
//! plus dynamic forwarding for remote sessions.
//!
//! Every 5 s the scanner enumerates listeners (`lsof`, falling back to
//! `ss`) on each active session's worker, filters them to the session's
//! process subtree, and diffs against the previously observed set. New
//! ports on remote workers get a hub-local forward allocated through the
//! tunnel manager.

use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{ControlEvent, SessionStatus, WorkerKind, WorkerStatus};
use crate::pty::PtyMultiplexer;
use crate::store::SqliteStore;
use crate::tunnel::TunnelManager;

/// Scan cadence.
const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Ports below this are never reported.
const MIN_PORT: u16 = 1024;

/// Watches active sessions for newly opened (and closed) listening ports.
pub struct PortScanner {
    store: Arc<SqliteStore>,
    mux: Arc<PtyMultiplexer>,
    tunnel: Arc<TunnelManager>,
    observed: DashMap<Uuid, BTreeSet<u16>>,
    /// (session, remote port) -> hub-local forwarded port.
    forwards: DashMap<(Uuid, u16), u16>,
    cancel: CancellationToken,
}

impl PortScanner {
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        mux: Arc<PtyMultiplexer>,
        tunnel: Arc<TunnelManager>,
    ) -> Self {
        Self {
            store,
            mux,
            tunnel,
            observed: DashMap::new(),
            forwards: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the scan loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCAN_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scanner.scan_once().await,
                    () = scanner.cancel.cancelled() => break,
                }
            }
        })
    }

    async fn scan_once(&self) {
        let active = match self.store.list_sessions_by_status(SessionStatus::Active).await {
            Ok(active) => active,
            Err(e) => {
                tracing::debug!(error = %e, "Port scan cannot list sessions");
                return;
            }
        };

        let live_ids: HashSet<Uuid> = active.iter().map(|s| s.id).collect();
        self.observed.retain(|id, _| live_ids.contains(id));
        self.forwards.retain(|(id, _), _| live_ids.contains(id));

        for session in active {
            let Ok(Some(worker)) = self.store.get_worker(session.worker_id).await else {
                continue;
            };
            if worker.status != WorkerStatus::Connected {
                continue;
            }

            let ports = match worker.kind {
                WorkerKind::Local => {
                    let Some(pid) = session.pid else { continue };
                    self.scan_local(pid).await
                }
                WorkerKind::Remote => self.scan_remote(worker.id, session.id).await,
            };
            let Some(ports) = ports else { continue };

            self.publish_diff(session.id, worker.kind, worker.id, ports)
                .await;
        }
    }

    async fn publish_diff(
        &self,
        session_id: Uuid,
        worker_kind: WorkerKind,
        worker_id: Uuid,
        current: BTreeSet<u16>,
    ) {
        let previous = self
            .observed
            .get(&session_id)
            .map(|p| p.clone())
            .unwrap_or_default();

        for &port in current.difference(&previous) {
            let forwarded_to = if worker_kind == WorkerKind::Remote {
                match self.tunnel.forward_port(worker_id, port).await {
                    Ok(local) => {
                        self.forwards.insert((session_id, port), local);
                        Some(local)
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = %session_id,
                            port,
                            error = %e,
                            "Failed to forward detected port"
                        );
                        None
                    }
                }
            } else {
                None
            };
            tracing::info!(session_id = %session_id, port, ?forwarded_to, "Port detected");
            self.mux
                .send_control(session_id, ControlEvent::PortDetected { port, forwarded_to });
        }

        for &port in previous.difference(&current) {
            self.forwards.remove(&(session_id, port));
            tracing::info!(session_id = %session_id, port, "Port closed");
            self.mux
                .send_control(session_id, ControlEvent::PortClosed { port });
        }

        self.observed.insert(session_id, current);
    }

    /// Listening ports within a local process subtree.
    async fn scan_local(&self, root_pid: i32) -> Option<BTreeSet<u16>> {
        let ps = run_local("ps", &["-eo", "pid,ppid"]).await?;
        let subtree = descendants(root_pid, &parse_ps_tree(&ps));

        let listeners = match run_local("lsof", &["-i", "-P", "-n", "-sTCP:LISTEN"]).await {
            Some(output) => parse_lsof(&output),
            None => parse_ss(&run_local("ss", &["-tlnp"]).await?),
        };

        Some(filter_ports(listeners, &subtree))
    }

    /// Listening ports within a remote session's process subtree. The
    /// subtree root is located by the `C3_SESSION_ID` marker the spawner
    /// put in the agent's environment.
    async fn scan_remote(&self, worker_id: Uuid, session_id: Uuid) -> Option<BTreeSet<u16>> {
        let ps = self
            .tunnel
            .exec(worker_id, "ps axeww -o pid,ppid,command")
            .await
            .ok()?;
        let root_pid = find_session_root(&ps, session_id)?;
        let subtree = descendants(root_pid, &parse_ps_tree(&ps));

        let listeners = match self
            .tunnel
            .exec(worker_id, "lsof -i -P -n -sTCP:LISTEN 2>/dev/null")
            .await
        {
            Ok(output) if !output.trim().is_empty() => parse_lsof(&output),
            _ => parse_ss(&self.tunnel.exec(worker_id, "ss -tlnp").await.ok()?),
        };

        Some(filter_ports(listeners, &subtree))
    }
}

async fn run_local(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `pid ppid` pairs from `ps` output; extra columns are ignored.
fn parse_ps_tree(output: &str) -> Vec<(i32, i32)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect()
}

/// The PID set rooted at `root` (inclusive).
fn descendants(root: i32, pairs: &[(i32, i32)]) -> HashSet<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for &(pid, ppid) in pairs {
        children.entry(ppid).or_default().push(pid);
    }

    let mut result = HashSet::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if result.insert(pid) {
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids);
            }
        }
    }
    result
}

/// Find the PID whose environment (shown by `ps axeww`) carries this
/// session's id marker.
fn find_session_root(ps_output: &str, session_id: Uuid) -> Option<i32> {
    let marker = format!("C3_SESSION_ID={session_id}");
    ps_output.lines().find_map(|line| {
        if !line.contains(&marker) {
            return None;
        }
        line.split_whitespace().next()?.parse().ok()
    })
}

/// Parse `(pid, port)` pairs from `lsof -i -P -n -sTCP:LISTEN` output.
fn parse_lsof(output: &str) -> Vec<(i32, u16)> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let pid = fields.get(1)?.parse().ok()?;
            let name = fields.iter().find(|f| f.contains(':'))?;
            let port = name.rsplit(':').next()?.parse().ok()?;
            Some((pid, port))
        })
        .collect()
}

/// Parse `(pid, port)` pairs from `ss -tlnp` output.
fn parse_ss(output: &str) -> Vec<(i32, u16)> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // Local address is the 4th column ("LISTEN 0 128 *:3000 ...").
            let local = fields.get(3)?;
            let port = local.rsplit(':').next()?.parse().ok()?;
            let pid = line
                .split("pid=")
                .nth(1)?
                .split(|c: char| !c.is_ascii_digit())
                .next()?
                .parse()
                .ok()?;
            Some((pid, port))
        })
        .collect()
}

fn filter_ports(listeners: Vec<(i32, u16)>, subtree: &HashSet<i32>) -> BTreeSet<u16> {
    listeners
        .into_iter()
        .filter(|(pid, port)| subtree.contains(pid) && *port >= MIN_PORT)
        .map(|(_, port)| port)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descendants_walks_the_whole_subtree() {
        let pairs = vec![(10, 1), (20, 10), (21, 10), (30, 20), (99, 1)];
        let tree = descendants(10, &pairs);
        assert_eq!(tree, HashSet::from([10, 20, 21, 30]));
    }

    #[test]
    fn lsof_output_yields_pid_port_pairs() {
        let output = "\
COMMAND   PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
node     4242  dev   23u  IPv4 123456      0t0  TCP *:3000 (LISTEN)
node     4242  dev   24u  IPv6 123457      0t0  TCP [::1]:8080 (LISTEN)
sshd        7 root    3u  IPv4    999      0t0  TCP 0.0.0.0:22 (LISTEN)
";
        let pairs = parse_lsof(output);
        assert!(pairs.contains(&(4242, 3000)));
        assert!(pairs.contains(&(4242, 8080)));
        assert!(pairs.contains(&(7, 22)));
    }

    #[test]
    fn ss_output_yields_pid_port_pairs() {
        let output = "\
State   Recv-Q  Send-Q  Local Address:Port  Peer Address:Port  Process
LISTEN  0       128     0.0.0.0:5173        0.0.0.0:*          users:((\"vite\",pid=777,fd=23))
LISTEN  0       128     [::]:22             [::]:*             users:((\"sshd\",pid=1,fd=3))
";
        let pairs = parse_ss(output);
        assert!(pairs.contains(&(777, 5173)));
        assert!(pairs.contains(&(1, 22)));
    }

    #[test]
    fn low_ports_and_foreign_pids_are_filtered() {
        let subtree = HashSet::from([100, 101]);
        let ports = filter_ports(
            vec![(100, 3000), (100, 22), (999, 8080), (101, 5173)],
            &subtree,
        );
        assert_eq!(ports, BTreeSet::from([3000, 5173]));
    }

    #[test]
    fn session_root_is_found_by_env_marker() {
        let id = Uuid::new_v4();
        let ps = format!(
            "  PID  PPID COMMAND\n    1     0 /sbin/init\n 5150  4000 claude --settings x C3_SESSION_ID={id} C3_HUB_PORT=3000\n"
        );
        assert_eq!(find_session_root(&ps, id), Some(5150));
        assert_eq!(find_session_root(&ps, Uuid::new_v4()), None);
    }
}
