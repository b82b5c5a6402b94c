//! Test utilities: an in-memory cluster standing in for the remote machines.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hostpool::allocation::{AllocationEngine, EndpointProbe};
use hostpool::launcher::PortSelector;
use hostpool::registry::{HostRegistry, HostType};
use hostpool::remote::{
    CommandOutput, CommandRequest, Credential, RemoteError, RemoteResult, RemoteShell,
    RemoteTarget,
};

/// Probe answering from an offline set. Yields once so concurrent callers interleave.
#[derive(Default)]
pub struct StaticProbe {
    offline: Mutex<HashSet<String>>,
}

impl StaticProbe {
    pub fn set_offline(&self, hostname: &str) {
        self.offline.lock().unwrap().insert(hostname.to_string());
    }
}

#[async_trait]
impl EndpointProbe for StaticProbe {
    async fn is_online(&self, hostname: &str) -> bool {
        tokio::task::yield_now().await;
        !self.offline.lock().unwrap().contains(hostname)
    }
}

/// One recorded remote call.
#[derive(Debug, Clone)]
pub struct Call {
    pub target: RemoteTarget,
    pub credential: Credential,
    pub request: CommandRequest,
}

#[derive(Default)]
struct ClusterState {
    /// Running pids per machine address.
    running: HashMap<String, HashSet<u32>>,
    next_pid: u32,
    failing_launches: u32,
    unreachable: HashSet<String>,
    calls: Vec<Call>,
}

/// [`RemoteShell`] simulating the machines: launch scripts start a fake
/// process, `kill -s 0` and `kill -s KILL` act on it.
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new(first_pid: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ClusterState {
                next_pid: first_pid,
                ..Default::default()
            }),
        })
    }

    /// Make the next `count` launch scripts exit non-zero.
    pub fn fail_next_launches(&self, count: u32) {
        self.state.lock().unwrap().failing_launches = count;
    }

    pub fn set_unreachable(&self, host: &str) {
        self.state.lock().unwrap().unreachable.insert(host.to_string());
    }

    pub fn is_running(&self, host: &str, pid: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .running
            .get(host)
            .is_some_and(|pids| pids.contains(&pid))
    }

    /// Simulate the process dying on its own.
    pub fn crash(&self, host: &str, pid: u32) {
        if let Some(pids) = self.state.lock().unwrap().running.get_mut(host) {
            pids.remove(&pid);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn key_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.credential, Credential::Key(_)))
            .collect()
    }
}

fn exit(status: i32, stdout: impl Into<String>) -> RemoteResult<CommandOutput> {
    Ok(CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_status: Some(status),
    })
}

fn pid_arg(command: &str, prefix: &str) -> Option<u32> {
    command
        .strip_prefix(prefix)?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[async_trait]
impl RemoteShell for FakeCluster {
    async fn run(
        &self,
        target: &RemoteTarget,
        credential: &Credential,
        request: &CommandRequest,
    ) -> RemoteResult<CommandOutput> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            target: target.clone(),
            credential: credential.clone(),
            request: request.clone(),
        });

        if state.unreachable.contains(&target.host) {
            return Err(RemoteError::ConnectionFailed {
                target: target.to_string(),
                message: "No route to host".to_string(),
            });
        }

        if let Credential::Password(_) = credential {
            return exit(0, "warmup\n");
        }

        if request.stdin.is_some() {
            if state.failing_launches > 0 {
                state.failing_launches -= 1;
                return exit(1, "");
            }
            let pid = state.next_pid;
            state.next_pid += 1;
            state
                .running
                .entry(target.host.clone())
                .or_default()
                .insert(pid);
            return exit(0, format!("{pid}\n"));
        }

        let running = state.running.entry(target.host.clone()).or_default();
        if let Some(pid) = pid_arg(&request.command, "kill -s 0 ") {
            return exit(if running.contains(&pid) { 0 } else { 1 }, "");
        }
        if let Some(pid) = pid_arg(&request.command, "kill -s KILL ") {
            return exit(if running.remove(&pid) { 0 } else { 1 }, "");
        }
        exit(127, "")
    }
}

/// Ports handed out in order.
pub struct FixedPorts(Mutex<VecDeque<u16>>);

impl FixedPorts {
    pub fn new(ports: &[u16]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(ports.iter().copied().collect())))
    }
}

impl PortSelector for FixedPorts {
    fn next_port(&self) -> u16 {
        self.0.lock().unwrap().pop_front().unwrap_or(9000)
    }
}

pub fn pool(codename: &str, hosts: &[&str]) -> HostType {
    HostType::new(codename, hosts.iter().map(|h| h.to_string()).collect())
}

/// Engine over `types` with a probe the test controls.
pub fn engine(types: Vec<HostType>) -> (Arc<AllocationEngine>, Arc<StaticProbe>) {
    let registry = Arc::new(HostRegistry::new(types).unwrap());
    let probe = Arc::new(StaticProbe::default());
    (
        Arc::new(AllocationEngine::with_probe(registry, probe.clone())),
        probe,
    )
}
