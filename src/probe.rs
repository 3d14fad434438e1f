use std::{
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// How recently the onboarding page must have been open for `enable` to skip pointing at it.
pub const RECENT_VISIT_WINDOW: Duration = Duration::from_secs(5);

/// Tracks onboarding page visits so the first automatic open can be told apart from a revisit.
#[derive(Debug)]
pub struct Probe {
    state: Mutex<ProbeState>,
}

#[derive(Debug, Clone, Copy)]
struct ProbeState {
    started_at: SystemTime,
    last_ping: Option<SystemTime>,
    pings: u64,
}

impl ProbeState {
    fn fresh() -> Self {
        Self {
            started_at: SystemTime::now(),
            last_ping: None,
            pings: 0,
        }
    }
}

/// Environment facts reported next to the probe counters.
#[derive(Debug, Clone)]
pub struct ProbeContext<'a> {
    pub version: &'a str,
    pub backend: &'a str,
    pub proxy_addr: &'a str,
    pub auto_config: bool,
    pub cert_installed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub version: String,
    pub backend: String,
    pub proxy_addr: String,
    pub auto_config: bool,
    pub cert_installed: Option<bool>,
    pub first_visit: bool,
    pub pings: u64,
    pub probe_started_unix_ms: u64,
    pub last_ping_unix_ms: Option<u64>,
}

impl DebugInfo {
    /// Whether the page pinged within `window` before `now`.
    pub fn visited_within(&self, window: Duration, now: SystemTime) -> bool {
        let Some(last_ping) = self.last_ping_unix_ms else {
            return false;
        };
        let last_ping = UNIX_EPOCH + Duration::from_millis(last_ping);
        match now.duration_since(last_ping) {
            Ok(elapsed) => elapsed <= window,
            // Pinged "after" now: clocks of the two processes disagree slightly.
            Err(_) => true,
        }
    }
}

impl Default for Probe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProbeState::fresh()),
        }
    }

    pub fn reset(&self) {
        *self.lock() = ProbeState::fresh();
    }

    pub fn ping(&self) {
        let mut state = self.lock();
        state.last_ping = Some(SystemTime::now());
        state.pings = state.pings.saturating_add(1);
    }

    pub fn snapshot(&self, context: &ProbeContext<'_>) -> DebugInfo {
        let state = *self.lock();
        DebugInfo {
            version: context.version.to_owned(),
            backend: context.backend.to_owned(),
            proxy_addr: context.proxy_addr.to_owned(),
            auto_config: context.auto_config,
            cert_installed: context.cert_installed,
            first_visit: state.pings == 0,
            pings: state.pings,
            probe_started_unix_ms: unix_ms(state.started_at),
            last_ping_unix_ms: state.last_ping.map(unix_ms),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProbeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn unix_ms(time: SystemTime) -> u64 {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::{DebugInfo, Probe, ProbeContext, RECENT_VISIT_WINDOW};

    fn context() -> ProbeContext<'static> {
        ProbeContext {
            version: "0.0.3",
            backend: "sane",
            proxy_addr: "127.0.0.1:9590",
            auto_config: false,
            cert_installed: None,
        }
    }

    #[test]
    fn first_snapshot_is_a_first_visit() {
        let probe = Probe::new();
        let info = probe.snapshot(&context());
        assert!(info.first_visit);
        assert_eq!(info.pings, 0);
        assert_eq!(info.last_ping_unix_ms, None);
        assert_eq!(info.cert_installed, None);
    }

    #[test]
    fn ping_marks_revisit_until_reset() {
        let probe = Probe::new();
        probe.ping();
        probe.ping();

        let info = probe.snapshot(&context());
        assert!(!info.first_visit);
        assert_eq!(info.pings, 2);
        assert!(info.visited_within(RECENT_VISIT_WINDOW, SystemTime::now()));

        probe.reset();
        let info = probe.snapshot(&context());
        assert!(info.first_visit);
        assert!(!info.visited_within(RECENT_VISIT_WINDOW, SystemTime::now()));
    }

    #[test]
    fn cert_state_comes_from_context() {
        let mut context = context();
        context.cert_installed = Some(true);
        assert_eq!(Probe::new().snapshot(&context).cert_installed, Some(true));
    }

    #[test]
    fn stale_ping_is_not_a_recent_visit() {
        let mut info = Probe::new().snapshot(&context());
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        info.last_ping_unix_ms = Some(994_000);
        assert!(!info.visited_within(RECENT_VISIT_WINDOW, now));
        info.last_ping_unix_ms = Some(996_000);
        assert!(info.visited_within(RECENT_VISIT_WINDOW, now));
        info.last_ping_unix_ms = Some(1_000_500);
        assert!(info.visited_within(RECENT_VISIT_WINDOW, now));
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let probe = Probe::new();
        probe.ping();
        let info = probe.snapshot(&context());
        let value = serde_json::to_value(&info).expect("debug info should serialize");
        for field in [
            "version",
            "backend",
            "proxy_addr",
            "auto_config",
            "cert_installed",
            "first_visit",
            "pings",
            "probe_started_unix_ms",
            "last_ping_unix_ms",
        ] {
            assert!(value.get(field).is_some(), "missing {field}: {value}");
        }
        let parsed: DebugInfo = serde_json::from_value(value).expect("debug info should parse");
        assert_eq!(parsed, info);
    }
}
