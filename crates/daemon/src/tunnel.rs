// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 proxid Contributors

// proxid - Tunnel Module
// Supervises the single `ssh -D` child process that backs the SOCKS port

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
#[cfg(test)]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use proxid_common::HostRecord;

const COMMAND_QUEUE_DEPTH: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Failures of the process primitives; never fatal to the control loop
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("failed to launch tunnel for '{host}': {source}")]
    Launch {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to stop tunnel for '{host}': {source}")]
    Termination {
        host: String,
        #[source]
        source: io::Error,
    },
}

/// Event emitted by the control loop after a state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Started { host: String, pid: Option<u32> },
    Stopped { host: String },
    /// The child went away without being asked to
    Exited { host: String, status: String },
    Failed { host: String, error: String },
}

/// Point-in-time view of the manager state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Active {
        host: String,
        pid: Option<u32>,
        since: DateTime<Utc>,
    },
}

/// How the tunnel client is invoked
#[derive(Debug, Clone)]
pub struct TunnelCommand {
    /// Tunnel client executable (normally `ssh`)
    pub program: PathBuf,
    /// Extra options placed before the tunnel arguments
    pub args: Vec<String>,
    /// Local SOCKS listen port handed to `-D`
    pub socks_port: u16,
}

impl TunnelCommand {
    /// Full argument list for a host: `<args> -D <port> -N [-i <key>] user@host -p <port>`
    pub fn args_for(&self, host: &HostRecord) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("-D".to_string());
        args.push(self.socks_port.to_string());
        args.push("-N".to_string());
        if let Some(identity) = &host.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        args.push(host.destination());
        args.push("-p".to_string());
        args.push(host.port.to_string());
        args
    }

    fn build(&self, host: &HostRecord) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

enum Request {
    Start {
        host: HostRecord,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<TunnelState>,
    },
}

/// Handle to the tunnel control loop
///
/// Every `start`/`stop` is queued and applied by a single task in arrival
/// order, so a switch from one host to another is never observed half done.
#[derive(Clone)]
pub struct TunnelManager {
    requests: mpsc::Sender<Request>,
    event_tx: broadcast::Sender<TunnelEvent>,
    socks_port: u16,
    #[cfg(test)]
    refuse_termination: Arc<AtomicBool>,
}

impl TunnelManager {
    /// Spawn the control loop on the current tokio runtime
    ///
    /// The loop stops (and reaps any running tunnel) once every handle is dropped.
    pub fn spawn(command: TunnelCommand) -> Self {
        let (requests, request_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let socks_port = command.socks_port;
        #[cfg(test)]
        let refuse_termination = Arc::new(AtomicBool::new(false));

        let worker = TunnelWorker {
            command,
            active: None,
            event_tx: event_tx.clone(),
            #[cfg(test)]
            refuse_termination: refuse_termination.clone(),
        };
        tokio::spawn(worker.run(request_rx));

        Self {
            requests,
            event_tx,
            socks_port,
            #[cfg(test)]
            refuse_termination,
        }
    }

    /// Make every termination of the running child fail until reset
    #[cfg(test)]
    fn refuse_termination(&self, refuse: bool) {
        self.refuse_termination.store(refuse, Ordering::SeqCst);
    }

    /// Subscribe to tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    /// Bring up the tunnel for `host`, replacing any tunnel to another host
    pub async fn start(&self, host: HostRecord) -> bool {
        self.request(|reply| Request::Start { host, reply })
            .await
            .unwrap_or(false)
    }

    /// Tear down the active tunnel, if any
    pub async fn stop(&self) -> bool {
        self.request(|reply| Request::Stop { reply })
            .await
            .unwrap_or(false)
    }

    /// Current state; `None` only when the control loop is gone
    pub async fn status(&self) -> Option<TunnelState> {
        self.request(|reply| Request::Status { reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self.requests.send(build(reply_tx)).await.is_err() {
            error!("Tunnel control loop is not running");
            return None;
        }

        match reply_rx.await {
            Ok(value) => Some(value),
            Err(_) => {
                error!("Tunnel control loop dropped a request without replying");
                None
            }
        }
    }
}

struct ActiveTunnel {
    host: String,
    child: Child,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

/// Owner of the tunnel state; only ever touched from the control loop task
struct TunnelWorker {
    command: TunnelCommand,
    active: Option<ActiveTunnel>,
    event_tx: broadcast::Sender<TunnelEvent>,
    #[cfg(test)]
    refuse_termination: Arc<AtomicBool>,
}

impl TunnelWorker {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        debug!("Tunnel control loop started");

        while let Some(request) = requests.recv().await {
            match request {
                Request::Start { host, reply } => {
                    let result = self.start(&host).await;
                    let _ = reply.send(self.settle(&host.name, result));
                }
                Request::Stop { reply } => {
                    let host = self.active_host().unwrap_or_default();
                    let result = self.stop().await;
                    let _ = reply.send(self.settle(&host, result));
                }
                Request::Status { reply } => {
                    self.reap_exited();
                    let _ = reply.send(self.state());
                }
            }
        }

        debug!("All tunnel manager handles dropped, shutting down control loop");
        if let Err(e) = self.stop().await {
            warn!("{}", e);
        }
    }

    /// Log and broadcast a failed transition, turning it into the caller's reply
    fn settle(&self, host: &str, result: Result<(), TunnelError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                error!("{}", e);
                self.emit(TunnelEvent::Failed {
                    host: host.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    async fn start(&mut self, host: &HostRecord) -> Result<(), TunnelError> {
        self.reap_exited();

        if let Some(active) = &self.active {
            if active.host == host.name {
                debug!(
                    "Tunnel to {} already running (pid {:?})",
                    active.host, active.pid
                );
                return Ok(());
            }

            info!("Switching tunnel from {} to {}", active.host, host.name);
            self.stop().await?;
        }

        self.launch(host)
    }

    fn launch(&mut self, host: &HostRecord) -> Result<(), TunnelError> {
        info!(
            "Starting tunnel to {} ({}:{} as {}) on SOCKS port {}",
            host.name, host.host_name, host.port, host.user, self.command.socks_port
        );

        let child = self
            .command
            .build(host)
            .spawn()
            .map_err(|source| TunnelError::Launch {
                host: host.name.clone(),
                source,
            })?;
        let pid = child.id();

        info!("Tunnel to {} running with pid {:?}", host.name, pid);
        self.active = Some(ActiveTunnel {
            host: host.name.clone(),
            child,
            pid,
            started_at: Utc::now(),
        });
        self.emit(TunnelEvent::Started {
            host: host.name.clone(),
            pid,
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TunnelError> {
        #[cfg(test)]
        let refused = self.refuse_termination.load(Ordering::SeqCst);

        let Some(active) = self.active.as_mut() else {
            debug!("No active tunnel to stop");
            return Ok(());
        };

        info!("Stopping tunnel to {} (pid {:?})", active.host, active.pid);

        #[cfg(test)]
        if refused {
            return Err(TunnelError::Termination {
                host: active.host.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "termination refused"),
            });
        }

        let status = terminate(&mut active.child)
            .await
            .map_err(|source| TunnelError::Termination {
                host: active.host.clone(),
                source,
            })?;

        if let Some(stopped) = self.active.take() {
            info!("Tunnel to {} stopped ({})", stopped.host, status);
            self.emit(TunnelEvent::Stopped { host: stopped.host });
        }

        Ok(())
    }

    /// Forget a child that has exited on its own so the next start relaunches it
    fn reap_exited(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let status = match active.child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to poll tunnel process for {}: {}", active.host, e);
                return;
            }
        };

        if let Some(exited) = self.active.take() {
            warn!("Tunnel to {} exited unexpectedly ({})", exited.host, status);
            self.emit(TunnelEvent::Exited {
                host: exited.host,
                status: status.to_string(),
            });
        }
    }

    fn active_host(&self) -> Option<String> {
        self.active.as_ref().map(|a| a.host.clone())
    }

    fn state(&self) -> TunnelState {
        match &self.active {
            Some(active) => TunnelState::Active {
                host: active.host.clone(),
                pid: active.pid,
                since: active.started_at,
            },
            None => TunnelState::Idle,
        }
    }

    fn emit(&self, event: TunnelEvent) {
        if let Err(e) = self.event_tx.send(event) {
            debug!("No subscribers for tunnel event: {:?}", e.0);
        }
    }
}

/// Signal the child and wait until it has been reaped
async fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    child.start_kill()?;
    child.wait().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn host(name: &str) -> HostRecord {
        HostRecord {
            name: name.to_string(),
            host_name: format!("{}.example.com", name),
            port: 22,
            user: "alice".to_string(),
            identity_file: None,
        }
    }

    /// A stand-in tunnel client that ignores its arguments and stays up
    fn sleeper() -> TunnelCommand {
        TunnelCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
            socks_port: 1080,
        }
    }

    fn is_running(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    async fn active_pid(manager: &TunnelManager) -> u32 {
        match manager.status().await {
            Some(TunnelState::Active { pid: Some(pid), .. }) => pid,
            other => panic!("expected an active tunnel, got {:?}", other),
        }
    }

    #[test]
    fn test_args_for_host() {
        let command = TunnelCommand {
            program: PathBuf::from("ssh"),
            args: vec!["-o".to_string(), "ExitOnForwardFailure=yes".to_string()],
            socks_port: 1080,
        };
        let mut work = HostRecord {
            name: "work".to_string(),
            host_name: "10.0.0.5".to_string(),
            port: 22,
            user: "alice".to_string(),
            identity_file: None,
        };

        assert_eq!(
            command.args_for(&work),
            vec![
                "-o",
                "ExitOnForwardFailure=yes",
                "-D",
                "1080",
                "-N",
                "alice@10.0.0.5",
                "-p",
                "22"
            ]
        );

        work.identity_file = Some(PathBuf::from("/keys/work"));
        let args = command.args_for(&work);
        assert_eq!(&args[5..7], ["-i", "/keys/work"]);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let manager = TunnelManager::spawn(sleeper());

        assert!(manager.start(host("work")).await);
        let pid = active_pid(&manager).await;
        assert!(is_running(pid));

        assert!(manager.stop().await);
        assert_eq!(manager.status().await, Some(TunnelState::Idle));
        // Reaped, not just signalled
        assert!(!is_running(pid));
    }

    #[tokio::test]
    async fn test_start_same_host_is_idempotent() {
        let manager = TunnelManager::spawn(sleeper());

        assert!(manager.start(host("work")).await);
        let first = active_pid(&manager).await;

        assert!(manager.start(host("work")).await);
        let second = active_pid(&manager).await;

        assert_eq!(first, second);
        assert!(manager.stop().await);
    }

    #[tokio::test]
    async fn test_switch_stops_previous_tunnel_first() {
        let manager = TunnelManager::spawn(sleeper());
        let mut events = manager.subscribe();

        assert!(manager.start(host("one")).await);
        let first = active_pid(&manager).await;

        assert!(manager.start(host("two")).await);
        let second = active_pid(&manager).await;

        assert_ne!(first, second);
        assert!(!is_running(first));
        assert!(is_running(second));
        match manager.status().await {
            Some(TunnelState::Active { host, .. }) => assert_eq!(host, "two"),
            other => panic!("unexpected state {:?}", other),
        }

        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::Started {
                host: "one".to_string(),
                pid: Some(first)
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::Stopped {
                host: "one".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::Started {
                host: "two".to_string(),
                pid: Some(second)
            }
        );

        assert!(manager.stop().await);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let manager = TunnelManager::spawn(sleeper());

        assert!(manager.stop().await);
        assert!(manager.stop().await);
        assert_eq!(manager.status().await, Some(TunnelState::Idle));
    }

    #[tokio::test]
    async fn test_launch_failure_stays_idle() {
        let manager = TunnelManager::spawn(TunnelCommand {
            program: PathBuf::from("/nonexistent/proxid-test-ssh"),
            args: Vec::new(),
            socks_port: 1080,
        });
        let mut events = manager.subscribe();

        assert!(!manager.start(host("work")).await);
        assert_eq!(manager.status().await, Some(TunnelState::Idle));
        assert!(matches!(
            events.recv().await.unwrap(),
            TunnelEvent::Failed { host, .. } if host == "work"
        ));

        // The loop keeps serving after a failure
        assert!(manager.stop().await);
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_tunnel() {
        let manager = TunnelManager::spawn(sleeper());

        assert!(manager.start(host("work")).await);
        let pid = active_pid(&manager).await;

        manager.refuse_termination(true);

        // The tunnel survives a stop that could not reap it
        assert!(!manager.stop().await);
        assert_eq!(active_pid(&manager).await, pid);
        assert!(is_running(pid));

        // A switch aborts before launching the new host
        let mut events = manager.subscribe();
        assert!(!manager.start(host("other")).await);
        match manager.status().await {
            Some(TunnelState::Active {
                host, pid: current, ..
            }) => {
                assert_eq!(host, "work");
                assert_eq!(current, Some(pid));
            }
            other => panic!("unexpected state {:?}", other),
        }

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 1, "unexpected events {:?}", seen);
        assert!(matches!(
            &seen[0],
            TunnelEvent::Failed { host, .. } if host == "other"
        ));

        manager.refuse_termination(false);
        assert!(manager.stop().await);
        assert!(!is_running(pid));
    }

    #[tokio::test]
    async fn test_exited_tunnel_is_relaunched() {
        let manager = TunnelManager::spawn(TunnelCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "exit 0".to_string()],
            socks_port: 1080,
        });

        assert!(manager.start(host("work")).await);

        let mut idle = false;
        for _ in 0..100 {
            if manager.status().await == Some(TunnelState::Idle) {
                idle = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(idle, "exited tunnel was never reaped");

        // Same host again launches a fresh process instead of a no-op
        let mut events = manager.subscribe();
        assert!(manager.start(host("work")).await);
        assert!(matches!(
            events.recv().await.unwrap(),
            TunnelEvent::Started { host, .. } if host == "work"
        ));
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_serialized() {
        let manager = TunnelManager::spawn(sleeper());
        let mut events = manager.subscribe();

        let mut handles = Vec::new();
        for i in 0..12 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                match i % 4 {
                    3 => manager.stop().await,
                    n => manager.start(host(&format!("host{}", n))).await,
                }
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        // Replaying the events sequentially must never show two live tunnels
        let mut live: Option<String> = None;
        while let Ok(event) = events.try_recv() {
            match event {
                TunnelEvent::Started { host, .. } => {
                    assert!(live.is_none(), "started {} while {:?} was live", host, live);
                    live = Some(host);
                }
                TunnelEvent::Stopped { host } => {
                    assert_eq!(live.as_deref(), Some(host.as_str()));
                    live = None;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        match manager.status().await {
            Some(TunnelState::Active { host, pid, .. }) => {
                assert_eq!(live, Some(host));
                assert!(is_running(pid.unwrap()));
            }
            Some(TunnelState::Idle) => assert!(live.is_none()),
            None => panic!("control loop is gone"),
        }

        assert!(manager.stop().await);
    }

    #[tokio::test]
    async fn test_dropping_manager_reaps_tunnel() {
        let manager = TunnelManager::spawn(sleeper());
        assert!(manager.start(host("work")).await);
        let pid = active_pid(&manager).await;

        drop(manager);

        let mut gone = false;
        for _ in 0..100 {
            if !is_running(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "tunnel process outlived its manager");
    }
}
