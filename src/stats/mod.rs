//! Per-proxy traffic accounting
//!
//! `ProxyStats` holds the byte counters for one named proxy. The relays call
//! `add_upload`/`add_download` from many tasks at once, so every counter is a
//! plain atomic and the hot path never takes a lock. The calendar month is
//! packed into a single `AtomicU32` key (`year * 100 + month`); rollover is a
//! compare-exchange so that exactly one racer zeroes the monthly counters at
//! a month boundary.
//!
//! `StatsManager` is the registry: name → shared `ProxyStats`, guarded by one
//! reader-writer lock. Counter values themselves are internally synchronized,
//! so the lock only covers map lookups and registration.

mod format;
pub mod persistence;

pub use format::{format_bytes, parse_bytes};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};

/// Forwarding protocol for a proxy entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Both,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Both => write!(f, "both"),
        }
    }
}

/// Descriptive configuration carried by a counter. These fields do not
/// affect accounting; re-registering a name may update them in place.
#[derive(Debug, Clone, Copy)]
pub struct ProxyInfo {
    pub protocol: Protocol,
    pub listen_port: u16,
    pub target_port: u16,
}

/// Byte counters for one named proxy
///
/// Shared between the relays, the registry, the persistence task and the
/// HTTP API via `Arc`. All mutation goes through atomic operations.
#[derive(Debug)]
pub struct ProxyStats {
    name: String,
    info: RwLock<ProxyInfo>,
    total_upload: AtomicU64,
    total_download: AtomicU64,
    monthly_upload: AtomicU64,
    monthly_download: AtomicU64,
    /// Calendar month as `year * 100 + month`, e.g. 202411 for 2024-11
    month_key: AtomicU32,
    /// Cap on total upload + download in bytes; 0 = unlimited
    limit: AtomicU64,
    /// Cap on monthly upload + download in bytes; 0 = unlimited
    limit_monthly: AtomicU64,
}

fn current_month_key() -> u32 {
    let now = Local::now();
    now.year() as u32 * 100 + now.month()
}

fn month_key_to_string(key: u32) -> String {
    format!("{:04}-{:02}", key / 100, key % 100)
}

fn month_key_from_str(s: &str) -> Option<u32> {
    let (year, month) = s.split_once('-')?;
    let year: u32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    if (1..=12).contains(&month) {
        Some(year * 100 + month)
    } else {
        None
    }
}

impl ProxyStats {
    fn new(
        name: &str,
        protocol: Protocol,
        listen_port: u16,
        target_port: u16,
        limit: u64,
        limit_monthly: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            info: RwLock::new(ProxyInfo {
                protocol,
                listen_port,
                target_port,
            }),
            total_upload: AtomicU64::new(0),
            total_download: AtomicU64::new(0),
            monthly_upload: AtomicU64::new(0),
            monthly_download: AtomicU64::new(0),
            month_key: AtomicU32::new(current_month_key()),
            limit: AtomicU64::new(limit),
            limit_monthly: AtomicU64::new(limit_monthly),
        }
    }

    /// Restore a counter from a persisted snapshot. The map key is the
    /// authoritative name; an unparseable month tag starts a fresh month.
    fn from_persisted(name: String, p: PersistedStats) -> Self {
        let (month_key, monthly_upload, monthly_download) = match month_key_from_str(&p.current_month)
        {
            Some(key) => (key, p.monthly_upload, p.monthly_download),
            None => (current_month_key(), 0, 0),
        };
        Self {
            name,
            info: RwLock::new(ProxyInfo {
                protocol: p.protocol,
                listen_port: p.listen_port,
                target_port: p.target_port,
            }),
            total_upload: AtomicU64::new(p.total_upload),
            total_download: AtomicU64::new(p.total_download),
            monthly_upload: AtomicU64::new(monthly_upload),
            monthly_download: AtomicU64::new(monthly_download),
            month_key: AtomicU32::new(month_key),
            limit: AtomicU64::new(p.limit),
            limit_monthly: AtomicU64::new(p.limit_monthly),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> ProxyInfo {
        *self.info.read().unwrap()
    }

    /// Record `n` bytes forwarded from client to upstream.
    pub fn add_upload(&self, n: u64) {
        self.record_upload(n, current_month_key());
    }

    /// Record `n` bytes forwarded from upstream to client.
    pub fn add_download(&self, n: u64) {
        self.record_download(n, current_month_key());
    }

    fn record_upload(&self, n: u64, month: u32) {
        self.roll_month(month);
        self.total_upload.fetch_add(n, Ordering::Relaxed);
        self.monthly_upload.fetch_add(n, Ordering::Relaxed);
    }

    fn record_download(&self, n: u64, month: u32) {
        self.roll_month(month);
        self.total_download.fetch_add(n, Ordering::Relaxed);
        self.monthly_download.fetch_add(n, Ordering::Relaxed);
    }

    /// Reset the monthly counters if the wall clock has moved to a new month.
    pub fn check_month_reset(&self) {
        self.roll_month(current_month_key());
    }

    /// Only the thread that wins the compare-exchange zeroes the monthly
    /// counters, so the reset happens exactly once per boundary. Increments
    /// racing with the swap may land in either month.
    fn roll_month(&self, now: u32) {
        let stored = self.month_key.load(Ordering::Acquire);
        if stored != now
            && self
                .month_key
                .compare_exchange(stored, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.monthly_upload.store(0, Ordering::Release);
            self.monthly_download.store(0, Ordering::Release);
        }
    }

    /// True once the total or monthly cap has been reached. The comparison is
    /// `>=`: the byte that crosses the cap is still counted, the next
    /// connection is refused.
    pub fn is_limit_exceeded(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit > 0 && self.total() >= limit {
            return true;
        }
        let limit_monthly = self.limit_monthly.load(Ordering::Relaxed);
        limit_monthly > 0 && self.monthly_total() >= limit_monthly
    }

    pub fn total(&self) -> u64 {
        self.total_upload() + self.total_download()
    }

    pub fn monthly_total(&self) -> u64 {
        self.monthly_upload() + self.monthly_download()
    }

    pub fn total_upload(&self) -> u64 {
        self.total_upload.load(Ordering::Relaxed)
    }

    pub fn total_download(&self) -> u64 {
        self.total_download.load(Ordering::Relaxed)
    }

    pub fn monthly_upload(&self) -> u64 {
        self.monthly_upload.load(Ordering::Relaxed)
    }

    pub fn monthly_download(&self) -> u64 {
        self.monthly_download.load(Ordering::Relaxed)
    }

    /// The month the monthly counters are accumulating for, `YYYY-MM`.
    pub fn current_month(&self) -> String {
        month_key_to_string(self.month_key.load(Ordering::Acquire))
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn limit_monthly(&self) -> u64 {
        self.limit_monthly.load(Ordering::Relaxed)
    }

    fn update_config(
        &self,
        protocol: Protocol,
        listen_port: u16,
        target_port: u16,
        limit: u64,
        limit_monthly: u64,
    ) {
        *self.info.write().unwrap() = ProxyInfo {
            protocol,
            listen_port,
            target_port,
        };
        self.limit.store(limit, Ordering::Relaxed);
        self.limit_monthly.store(limit_monthly, Ordering::Relaxed);
    }

    /// Point-in-time copy of every field for persistence. Each counter is an
    /// individually consistent atomic load; the four loads are not taken
    /// under a common lock.
    pub fn snapshot(&self) -> PersistedStats {
        let info = self.info();
        PersistedStats {
            name: self.name.clone(),
            protocol: info.protocol,
            listen_port: info.listen_port,
            target_port: info.target_port,
            total_upload: self.total_upload(),
            total_download: self.total_download(),
            monthly_upload: self.monthly_upload(),
            monthly_download: self.monthly_download(),
            current_month: self.current_month(),
            limit: self.limit(),
            limit_monthly: self.limit_monthly(),
        }
    }
}

/// On-disk form of a counter. Unknown fields in the data file are ignored,
/// missing fields default to zero/empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedStats {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub total_upload: u64,
    #[serde(default)]
    pub total_download: u64,
    #[serde(default)]
    pub monthly_upload: u64,
    #[serde(default)]
    pub monthly_download: u64,
    #[serde(default)]
    pub current_month: String,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub limit_monthly: u64,
}

/// Registry of counters keyed by proxy name
#[derive(Debug, Default)]
pub struct StatsManager {
    stats: RwLock<HashMap<String, Arc<ProxyStats>>>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the counter for `name`. An existing counter keeps its
    /// byte counts but picks up the limit, protocol and port fields from the
    /// configuration, so edits survive a restart without losing history.
    pub fn register(
        &self,
        name: &str,
        protocol: Protocol,
        listen_port: u16,
        target_port: u16,
        limit: u64,
        limit_monthly: u64,
    ) -> Arc<ProxyStats> {
        let mut map = self.stats.write().unwrap();

        if let Some(existing) = map.get(name) {
            existing.update_config(protocol, listen_port, target_port, limit, limit_monthly);
            return existing.clone();
        }

        let stats = Arc::new(ProxyStats::new(
            name,
            protocol,
            listen_port,
            target_port,
            limit,
            limit_monthly,
        ));
        map.insert(name.to_string(), stats.clone());
        stats
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProxyStats>> {
        self.stats.read().unwrap().get(name).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<ProxyStats>> {
        self.stats.read().unwrap().values().cloned().collect()
    }

    /// Swap in a whole mapping at once. Used by persistence during load,
    /// before any relay starts.
    pub fn replace_all(&self, stats: HashMap<String, Arc<ProxyStats>>) {
        *self.stats.write().unwrap() = stats;
    }

    /// Shallow copy of the mapping for persistence.
    pub fn snapshot(&self) -> HashMap<String, Arc<ProxyStats>> {
        self.stats.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stats(limit: u64, limit_monthly: u64) -> ProxyStats {
        ProxyStats::new("test", Protocol::Tcp, 19001, 19002, limit, limit_monthly)
    }

    #[test]
    fn test_add_accumulates_total_and_monthly() {
        let stats = test_stats(0, 0);
        stats.add_upload(100);
        stats.add_upload(250);
        stats.add_download(75);

        assert_eq!(stats.total_upload(), 350);
        assert_eq!(stats.total_download(), 75);
        assert_eq!(stats.monthly_upload(), 350);
        assert_eq!(stats.monthly_download(), 75);
        assert_eq!(stats.total(), 425);
    }

    #[test]
    fn test_concurrent_adds_lose_nothing() {
        let stats = Arc::new(test_stats(0, 0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    stats.add_upload(3);
                    stats.add_download(7);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.total_upload(), 8 * 10_000 * 3);
        assert_eq!(stats.total_download(), 8 * 10_000 * 7);
        assert_eq!(stats.monthly_upload(), 8 * 10_000 * 3);
        assert_eq!(stats.monthly_download(), 8 * 10_000 * 7);
    }

    #[test]
    fn test_month_rollover() {
        let stats = test_stats(0, 0);
        let november = 2024 * 100 + 11;
        let december = 2024 * 100 + 12;

        stats.month_key.store(november, Ordering::SeqCst);
        stats.record_upload(500, november);
        assert_eq!(stats.monthly_upload(), 500);
        assert_eq!(stats.current_month(), "2024-11");

        stats.record_upload(300, december);
        assert_eq!(stats.total_upload(), 800);
        assert_eq!(stats.monthly_upload(), 300);
        assert_eq!(stats.monthly_download(), 0);
        assert_eq!(stats.current_month(), "2024-12");
    }

    #[test]
    fn test_rollover_preserves_totals() {
        let stats = test_stats(0, 0);
        let january = 2025 * 100 + 1;
        let february = 2025 * 100 + 2;

        stats.month_key.store(january, Ordering::SeqCst);
        stats.record_upload(1000, january);
        stats.record_download(2000, january);
        stats.roll_month(february);

        assert_eq!(stats.total_upload(), 1000);
        assert_eq!(stats.total_download(), 2000);
        assert_eq!(stats.monthly_upload(), 0);
        assert_eq!(stats.monthly_download(), 0);
    }

    #[test]
    fn test_limit_boundary_uses_gte() {
        let stats = test_stats(1024, 0);
        assert!(!stats.is_limit_exceeded());

        stats.add_upload(600);
        stats.add_download(423);
        assert!(!stats.is_limit_exceeded());

        stats.add_download(1);
        assert!(stats.is_limit_exceeded());
    }

    #[test]
    fn test_monthly_limit() {
        let stats = test_stats(0, 500);
        stats.add_upload(499);
        assert!(!stats.is_limit_exceeded());
        stats.add_upload(1);
        assert!(stats.is_limit_exceeded());

        // A new month clears the monthly counters and un-trips the cap.
        let next = stats.month_key.load(Ordering::SeqCst) + 1;
        stats.roll_month(next);
        assert!(!stats.is_limit_exceeded());
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let stats = test_stats(0, 0);
        stats.add_upload(u32::MAX as u64);
        assert!(!stats.is_limit_exceeded());
    }

    #[test]
    fn test_register_reuses_counters() {
        let manager = StatsManager::new();
        let first = manager.register("proxy1", Protocol::Tcp, 8001, 9001, 1000, 0);
        first.add_upload(400);

        let second = manager.register("proxy1", Protocol::Both, 8002, 9002, 2000, 100);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.total_upload(), 400);
        assert_eq!(second.limit(), 2000);
        assert_eq!(second.limit_monthly(), 100);
        assert_eq!(second.info().protocol, Protocol::Both);
        assert_eq!(second.info().listen_port, 8002);
    }

    #[test]
    fn test_manager_get_and_get_all() {
        let manager = StatsManager::new();
        manager.register("a", Protocol::Tcp, 1, 2, 0, 0);
        manager.register("b", Protocol::Udp, 3, 4, 0, 0);

        assert!(manager.get("a").is_some());
        assert!(manager.get("missing").is_none());
        assert_eq!(manager.get_all().len(), 2);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let stats = test_stats(2048, 512);
        stats.add_upload(111);
        stats.add_download(222);

        let snap = stats.snapshot();
        let restored = ProxyStats::from_persisted(snap.name.clone(), snap.clone());

        assert_eq!(restored.name(), "test");
        assert_eq!(restored.total_upload(), 111);
        assert_eq!(restored.total_download(), 222);
        assert_eq!(restored.monthly_upload(), 111);
        assert_eq!(restored.monthly_download(), 222);
        assert_eq!(restored.current_month(), snap.current_month);
        assert_eq!(restored.limit(), 2048);
        assert_eq!(restored.limit_monthly(), 512);
    }

    #[test]
    fn test_persisted_bad_month_starts_fresh() {
        let persisted = PersistedStats {
            name: "x".into(),
            total_upload: 10,
            monthly_upload: 10,
            current_month: "not-a-month".into(),
            ..Default::default()
        };
        let restored = ProxyStats::from_persisted("x".into(), persisted);

        assert_eq!(restored.total_upload(), 10);
        assert_eq!(restored.monthly_upload(), 0);
        assert_eq!(restored.current_month(), month_key_to_string(current_month_key()));
    }

    #[test]
    fn test_month_key_parsing() {
        assert_eq!(month_key_from_str("2024-11"), Some(202411));
        assert_eq!(month_key_from_str("2024-13"), None);
        assert_eq!(month_key_from_str("2024"), None);
        assert_eq!(month_key_from_str(""), None);
        assert_eq!(month_key_to_string(202403), "2024-03");
    }
}
