use std::{
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::constants::{INTERNET_CHECK_INTERVAL_MS, INTERNET_PROBE_HOST, INTERNET_PROBE_TIMEOUT};

const NEVER_CHECKED: u64 = u64::MAX;

/// Station association flag shared between the WiFi manager (writer) and
/// everything gated on it.
#[derive(Debug, Clone, Default)]
pub struct LinkState(Arc<AtomicBool>);

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, up: bool) {
        self.0.store(up, Ordering::Release);
    }
}

pub trait ReachabilityProbe: Send + Sync {
    /// One bounded attempt. No retries.
    fn probe(&self, timeout: Duration) -> bool;
}

/// Opens and immediately drops a TCP connection to a well-known host.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target: String,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    fn resolve(&self) -> Option<SocketAddr> {
        match self.target.to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(err) => {
                log::debug!("probe target {} did not resolve: {err}", self.target);
                None
            }
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(INTERNET_PROBE_HOST)
    }
}

impl ReachabilityProbe for TcpProbe {
    fn probe(&self, timeout: Duration) -> bool {
        let Some(addr) = self.resolve() else {
            return false;
        };
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => true,
            Err(err) => {
                log::debug!("reachability probe to {addr} failed: {err}");
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct StatusCell {
    available: AtomicBool,
    last_checked_ms: AtomicU64,
    refresh_pending: AtomicBool,
}

/// Periodic reachability check gated on the station link.
///
/// Clones share status, so the MQTT session can re-probe to classify a
/// failed connect while the scheduler keeps driving the periodic check.
#[derive(Clone)]
pub struct InternetProber {
    link: LinkState,
    probe: Arc<dyn ReachabilityProbe>,
    status: Arc<StatusCell>,
    interval_ms: u64,
}

impl InternetProber {
    pub fn new(link: LinkState, probe: Arc<dyn ReachabilityProbe>) -> Self {
        let status = StatusCell {
            last_checked_ms: AtomicU64::new(NEVER_CHECKED),
            ..StatusCell::default()
        };
        Self {
            link,
            probe,
            status: Arc::new(status),
            interval_ms: INTERNET_CHECK_INTERVAL_MS,
        }
    }

    /// Always false while the station is not associated.
    pub fn is_available(&self) -> bool {
        self.link.is_up() && self.status.available.load(Ordering::Acquire)
    }

    pub fn last_checked_ms(&self) -> Option<u64> {
        match self.status.last_checked_ms.load(Ordering::Acquire) {
            NEVER_CHECKED => None,
            at => Some(at),
        }
    }

    pub fn check_internet_connectivity(&self, now_ms: u64) -> bool {
        self.status.last_checked_ms.store(now_ms, Ordering::Release);

        if !self.link.is_up() {
            self.mark_unavailable();
            return false;
        }

        let reachable = self.probe.probe(INTERNET_PROBE_TIMEOUT);
        let was_available = self.status.available.swap(reachable, Ordering::AcqRel);
        if reachable && !was_available {
            log::info!("internet connectivity available");
            self.status.refresh_pending.store(true, Ordering::Release);
        } else if !reachable && was_available {
            log::warn!("internet connectivity lost");
        }
        reachable
    }

    /// Runs the check when the interval has elapsed.
    pub fn update(&self, now_ms: u64) {
        let due = match self.last_checked_ms() {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        };
        if due {
            self.check_internet_connectivity(now_ms);
        }
    }

    pub fn mark_unavailable(&self) {
        if self.status.available.swap(false, Ordering::AcqRel) {
            log::info!("internet marked unavailable");
        }
    }

    /// One-shot signal raised on each transition to available.
    pub fn take_refresh_request(&self) -> bool {
        self.status.refresh_pending.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    pub(crate) struct ScriptedProbe {
        pub reachable: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl ScriptedProbe {
        pub(crate) fn reachable(value: bool) -> Arc<Self> {
            let probe = Self::default();
            probe.reachable.store(value, Ordering::SeqCst);
            Arc::new(probe)
        }
    }

    impl ReachabilityProbe for ScriptedProbe {
        fn probe(&self, _timeout: Duration) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reachable.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn unavailable_without_station_link() {
        let link = LinkState::new();
        let probe = ScriptedProbe::reachable(true);
        let prober = InternetProber::new(link.clone(), probe.clone());

        assert!(!prober.check_internet_connectivity(1_000));
        assert!(!prober.is_available());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(prober.last_checked_ms(), Some(1_000));
    }

    #[test]
    fn link_drop_hides_stale_availability() {
        let link = LinkState::new();
        link.set(true);
        let prober = InternetProber::new(link.clone(), ScriptedProbe::reachable(true));

        assert!(prober.check_internet_connectivity(0));
        link.set(false);
        assert!(!prober.is_available());
    }

    #[test]
    fn update_respects_interval() {
        let link = LinkState::new();
        link.set(true);
        let probe = ScriptedProbe::reachable(true);
        let prober = InternetProber::new(link, probe.clone());

        prober.update(0);
        prober.update(29_999);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        prober.update(30_000);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn refresh_requested_once_per_transition() {
        let link = LinkState::new();
        link.set(true);
        let probe = ScriptedProbe::reachable(true);
        let prober = InternetProber::new(link, probe.clone());

        prober.check_internet_connectivity(0);
        prober.check_internet_connectivity(1);
        assert!(prober.take_refresh_request());
        assert!(!prober.take_refresh_request());

        probe.reachable.store(false, Ordering::SeqCst);
        prober.check_internet_connectivity(2);
        probe.reachable.store(true, Ordering::SeqCst);
        prober.check_internet_connectivity(3);
        assert!(prober.take_refresh_request());
    }

    #[test]
    fn tcp_probe_reaches_local_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let probe = TcpProbe::new(listener.local_addr().unwrap().to_string());

        assert!(probe.probe(Duration::from_secs(1)));
    }
}
