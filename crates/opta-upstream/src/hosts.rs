//! Candidate host table and attempt planning. Pure state, no I/O.

use std::net::Ipv6Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    Preferred,
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    Healthy,
    Cooling { until: Instant },
}

impl HostState {
    /// Healthy, or cooling with a deadline that has passed.
    pub fn is_eligible(&self, now: Instant) -> bool {
        match self {
            Self::Healthy => true,
            Self::Cooling { until } => now >= *until,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HostCandidate {
    /// Display label, `host` or `host:port` as configured.
    pub host: String,
    pub base_url: String,
    pub role: HostRole,
    pub state: HostState,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub host: String,
    pub role: HostRole,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooling_remaining_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub active: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSnapshot {
    pub active_host: Option<String>,
    pub hosts: Vec<HostStatus>,
}

pub struct HostTable {
    candidates: Vec<HostCandidate>,
    active: usize,
    cooldown: Duration,
}

/// Build the base URL for a configured host entry. An entry that already
/// carries a port keeps it. Bare IPv6 literals are bracketed.
pub fn base_url(scheme: &str, entry: &str, default_port: u16) -> String {
    if entry.parse::<Ipv6Addr>().is_ok() {
        return format!("{scheme}://[{entry}]:{default_port}");
    }
    if let Some(rest) = entry.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((_, "")) => format!("{scheme}://{entry}:{default_port}"),
            _ => format!("{scheme}://{entry}"),
        };
    }
    match entry.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => format!("{scheme}://{entry}"),
        _ => format!("{scheme}://{entry}:{default_port}"),
    }
}

impl HostTable {
    /// The first entry is the preferred host, the rest are fallbacks in
    /// priority order. Duplicates and blanks are dropped.
    pub fn new(
        preferred: &str,
        fallbacks: &[String],
        scheme: &str,
        port: u16,
        cooldown: Duration,
    ) -> Self {
        let mut candidates: Vec<HostCandidate> = Vec::new();
        let entries = std::iter::once(preferred).chain(fallbacks.iter().map(String::as_str));
        for entry in entries.map(str::trim).filter(|e| !e.is_empty()) {
            if candidates.iter().any(|c| c.host == entry) {
                continue;
            }
            let role = if candidates.is_empty() {
                HostRole::Preferred
            } else {
                HostRole::Fallback
            };
            candidates.push(HostCandidate {
                host: entry.to_string(),
                base_url: base_url(scheme, entry, port),
                role,
                state: HostState::Healthy,
                last_failure: None,
                last_error: None,
            });
        }
        Self {
            candidates,
            active: 0,
            cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidate(&self, idx: usize) -> &HostCandidate {
        &self.candidates[idx]
    }

    pub fn active(&self) -> Option<&HostCandidate> {
        self.candidates.get(self.active)
    }

    /// Attempt order for one call.
    ///
    /// While a fallback is active, an eligible preferred host is probed
    /// first so the table switches back once it recovers. Then the active
    /// host, then everything else by priority. Cooling hosts are skipped
    /// unless that would leave nothing to try.
    pub fn plan(&self, now: Instant) -> Vec<usize> {
        let n = self.candidates.len();
        if n == 0 {
            return Vec::new();
        }
        let eligible = |i: usize| self.candidates[i].state.is_eligible(now);

        let mut order = Vec::with_capacity(n);
        if self.active != 0 && eligible(0) {
            order.push(0);
        }
        if !order.contains(&self.active) {
            order.push(self.active);
        }
        for i in 0..n {
            if !order.contains(&i) {
                order.push(i);
            }
        }

        let filtered: Vec<usize> = order.iter().copied().filter(|&i| eligible(i)).collect();
        if filtered.is_empty() {
            (0..n).collect()
        } else {
            filtered
        }
    }

    /// Returns true when this changed the active host.
    pub fn mark_healthy(&mut self, idx: usize) -> bool {
        let candidate = &mut self.candidates[idx];
        candidate.state = HostState::Healthy;
        let switched = self.active != idx;
        self.active = idx;
        switched
    }

    pub fn mark_cooling(&mut self, idx: usize, now: Instant, reason: String) {
        let candidate = &mut self.candidates[idx];
        candidate.state = HostState::Cooling {
            until: now + self.cooldown,
        };
        candidate.last_failure = Some(Utc::now());
        candidate.last_error = Some(reason);
    }

    pub fn snapshot(&self, now: Instant) -> UpstreamSnapshot {
        let hosts = self
            .candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let (state, remaining) = match c.state {
                    HostState::Healthy => ("healthy", None),
                    HostState::Cooling { until } => (
                        "cooling",
                        Some(until.saturating_duration_since(now).as_millis() as u64),
                    ),
                };
                HostStatus {
                    host: c.host.clone(),
                    role: c.role,
                    state,
                    cooling_remaining_ms: remaining,
                    last_failure: c.last_failure,
                    last_error: c.last_error.clone(),
                    active: i == self.active,
                }
            })
            .collect();
        UpstreamSnapshot {
            active_host: self.active().map(|c| c.host.clone()),
            hosts,
        }
    }
}
