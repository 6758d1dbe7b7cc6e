// src/remote/probe.rs

//! Host resource probe: turns raw host capacity into a scheduling budget and
//! answers live free-memory / CPU-utilisation queries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ProbeSection;
use crate::types::Resources;

use super::RemoteShell;

const CPU_COUNT_CMD: &str = "lscpu | grep '^CPU(s):' | awk '{print $2}'";
const TOTAL_MEM_CMD: &str = "free -m | awk '/^Mem:/ {print $2}'";
const FREE_MEM_PERCENT_CMD: &str = r#"free -m | awk '/^Mem:/ {printf "%.2f", $7/$2 * 100.0}'"#;
const CPU_UTIL_CMD: &str = "vmstat 1 2 | tail -1 | awk '{print 100.0 - $15}'";

/// A scheduling target with its immutable budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub budget: Resources,
    /// The first configured host doubles as the control host.
    pub primary: bool,
}

#[derive(Debug, Clone)]
pub struct HostProbe {
    shell: Arc<dyn RemoteShell>,
    cfg: ProbeSection,
}

impl HostProbe {
    pub fn new(shell: Arc<dyn RemoteShell>, cfg: ProbeSection) -> Self {
        Self { shell, cfg }
    }

    /// Derive a budget for every host, in configured order.
    ///
    /// A host that cannot be probed gets the configured fallback budget; one
    /// unreachable host never fails discovery for the rest.
    pub async fn discover(&self, hosts: &[String]) -> Vec<Host> {
        let mut out = Vec::with_capacity(hosts.len());

        for (idx, name) in hosts.iter().enumerate() {
            let primary = idx == 0;
            let role = if primary { "primary" } else { "worker" };

            let budget = match self.capacity(name).await {
                Some(total) => {
                    let budget = self.budget_for(total, primary);
                    info!(host = %name, role, total = %total, budget = %budget, "probed host");
                    budget
                }
                None => {
                    let budget = if primary {
                        self.cfg.primary_fallback
                    } else {
                        self.cfg.worker_fallback
                    };
                    warn!(host = %name, role, budget = %budget, "probe failed; using fallback budget");
                    budget
                }
            };

            out.push(Host {
                name: name.clone(),
                budget,
                primary,
            });
        }

        let total = out
            .iter()
            .fold(Resources::ZERO, |acc, h| acc.add(h.budget));
        info!(hosts = out.len(), total = %total, "host budgets ready");
        out
    }

    /// Usable share of a host's raw capacity, truncated to whole units.
    pub fn budget_for(&self, total: Resources, primary: bool) -> Resources {
        let (cpu_frac, mem_frac) = if primary {
            (self.cfg.primary_cpu_fraction, self.cfg.primary_mem_fraction)
        } else {
            (self.cfg.worker_cpu_fraction, self.cfg.worker_mem_fraction)
        };
        Resources::new(
            (total.cpu * cpu_frac).floor(),
            (total.mem_mb * mem_frac).floor(),
        )
    }

    async fn capacity(&self, host: &str) -> Option<Resources> {
        let cpu = self.query_number(host, CPU_COUNT_CMD, self.cfg.timeout).await?;
        let mem = self.query_number(host, TOTAL_MEM_CMD, self.cfg.timeout).await?;
        if cpu <= 0.0 || mem <= 0.0 {
            warn!(host = %host, cpu, mem, "probe returned non-positive capacity");
            return None;
        }
        Some(Resources::new(cpu, mem))
    }

    /// Percentage of memory currently available on `host`. `None` means the
    /// host could not be asked, which admission treats as "do not schedule".
    pub async fn free_mem_percent(&self, host: &str) -> Option<f64> {
        self.query_number(host, FREE_MEM_PERCENT_CMD, self.cfg.free_mem_timeout)
            .await
    }

    /// CPU utilisation percentage over a one second window.
    pub async fn cpu_util_percent(&self, host: &str) -> Option<f64> {
        self.query_number(host, CPU_UTIL_CMD, self.cfg.free_mem_timeout)
            .await
    }

    async fn query_number(&self, host: &str, command: &str, timeout: Duration) -> Option<f64> {
        let output = match self.shell.run(host, command, timeout).await {
            Ok(out) => out,
            Err(err) => {
                warn!(host = %host, error = %err, "remote query failed");
                return None;
            }
        };

        if !output.success() {
            warn!(
                host = %host,
                code = output.status,
                stderr = %super::truncate(output.stderr.trim(), 200),
                "remote query exited with failure"
            );
            return None;
        }

        let text = output.stdout_trimmed();
        match text.parse::<f64>() {
            Ok(value) if value.is_finite() => Some(value),
            _ => {
                warn!(host = %host, output = %super::truncate(&text, 80), "unparseable remote query output");
                None
            }
        }
    }
}
