use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use benchfleet::remote::{BoxFuture, RemoteError, RemoteOutput, RemoteShell};

#[derive(Debug, Clone, Copy)]
struct HostSpec {
    cpus: u32,
    mem_mb: u64,
    free_pct: f64,
    cpu_util: f64,
}

#[derive(Debug, Default)]
struct State {
    hosts: HashMap<String, HostSpec>,
    unreachable: HashSet<String>,
    alive: HashSet<String>,
    liveness_errors: HashSet<String>,
    alive_on_launch: bool,
    fail_launches: bool,
    launches: Vec<(String, String)>,
    liveness_queries: usize,
}

/// Scriptable `RemoteShell`.
///
/// Recognises the commands benchfleet sends (capacity probes, free-memory
/// and CPU queries, liveness queries, worker launches) and answers them from
/// in-memory state. Hosts that were never registered behave like hosts
/// whose ssh cannot start.
#[derive(Debug, Clone, Default)]
pub struct FakeShell {
    state: Arc<Mutex<State>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn host(self, name: &str, cpus: u32, mem_mb: u64, free_pct: f64) -> Self {
        self.with_state(|s| {
            s.hosts.insert(
                name.to_string(),
                HostSpec {
                    cpus,
                    mem_mb,
                    free_pct,
                    cpu_util: 10.0,
                },
            )
        });
        self
    }

    pub fn set_free_mem(&self, host: &str, pct: f64) {
        self.with_state(|s| {
            if let Some(spec) = s.hosts.get_mut(host) {
                spec.free_pct = pct;
            }
        });
    }

    /// Every command to `host` times out.
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        self.with_state(|s| {
            if unreachable {
                s.unreachable.insert(host.to_string());
            } else {
                s.unreachable.remove(host);
            }
        });
    }

    pub fn set_alive(&self, id: &str, alive: bool) {
        self.with_state(|s| {
            if alive {
                s.alive.insert(id.to_string());
            } else {
                s.alive.remove(id);
            }
        });
    }

    /// Liveness queries for `id` exit non-zero.
    pub fn set_liveness_error(&self, id: &str, failing: bool) {
        self.with_state(|s| {
            if failing {
                s.liveness_errors.insert(id.to_string());
            } else {
                s.liveness_errors.remove(id);
            }
        });
    }

    /// Launched workers show up as alive.
    pub fn alive_on_launch(self, yes: bool) -> Self {
        self.with_state(|s| s.alive_on_launch = yes);
        self
    }

    pub fn fail_launches(&self, fail: bool) {
        self.with_state(|s| s.fail_launches = fail);
    }

    pub fn launches(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.launches.clone())
    }

    /// `(host, experiment id)` of every successful launch.
    pub fn launched(&self) -> Vec<(String, String)> {
        self.launches()
            .into_iter()
            .filter_map(|(host, cmd)| Some((host, launched_id(&cmd)?)))
            .collect()
    }

    pub fn liveness_queries(&self) -> usize {
        self.with_state(|s| s.liveness_queries)
    }

    fn answer(&self, host: &str, command: &str, timeout: Duration) -> Result<RemoteOutput, RemoteError> {
        self.with_state(|s| {
            if s.unreachable.contains(host) {
                return Err(RemoteError::Timeout {
                    host: host.to_string(),
                    timeout,
                });
            }
            let Some(spec) = s.hosts.get(host).copied() else {
                return Err(RemoteError::Spawn {
                    host: host.to_string(),
                    source: std::io::Error::other("unknown host"),
                });
            };

            if command.contains("/environ") {
                s.liveness_queries += 1;
                let id = queried_id(command).unwrap_or_default();
                if s.liveness_errors.contains(&id) {
                    return Ok(output(255, ""));
                }
                let count = if s.alive.contains(&id) { "1" } else { "0" };
                return Ok(output(0, count));
            }

            let answer = if command.contains("lscpu") {
                spec.cpus.to_string()
            } else if command.contains("vmstat") {
                format!("{:.1}", spec.cpu_util)
            } else if command.contains("printf") {
                format!("{:.2}", spec.free_pct)
            } else if command.contains("free -m") {
                spec.mem_mb.to_string()
            } else {
                return Ok(output(127, ""));
            };
            Ok(output(0, &answer))
        })
    }
}

fn output(status: i32, stdout: &str) -> RemoteOutput {
    RemoteOutput {
        status,
        stdout: format!("{stdout}\n"),
        stderr: String::new(),
    }
}

/// Experiment id from `grep -zlsxF TAG=id /proc/...`.
fn queried_id(command: &str) -> Option<String> {
    let rest = command.strip_prefix("grep -zlsxF ")?;
    let arg = rest.split(" /proc/").next()?.trim_matches('\'');
    Some(arg.split_once('=')?.1.to_string())
}

/// Experiment id from `... nohup env TAG=id <cmd> ...`.
fn launched_id(command: &str) -> Option<String> {
    let (_, rest) = command.split_once("nohup env ")?;
    let tag = rest.split_whitespace().next()?.trim_matches('\'');
    Some(tag.split_once('=')?.1.to_string())
}

impl RemoteShell for FakeShell {
    fn run<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RemoteOutput, RemoteError>> {
        Box::pin(async move { self.answer(host, command, timeout) })
    }

    fn launch<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            self.with_state(|s| {
                if s.fail_launches || !s.hosts.contains_key(host) {
                    return Err(RemoteError::Spawn {
                        host: host.to_string(),
                        source: std::io::Error::other("launch refused"),
                    });
                }
                s.launches.push((host.to_string(), command.to_string()));
                if s.alive_on_launch {
                    if let Some(id) = launched_id(command) {
                        s.alive.insert(id);
                    }
                }
                Ok(())
            })
        })
    }
}
