//! TTL cache of per-port enrichment data.
//!
//! EEPROM reads go through USB vendor requests and can take tens of
//! milliseconds per device; discovery runs far more often than chips are
//! re-plugged. The cache keeps the joined (OS + EEPROM) view per port for a
//! TTL, coalesces concurrent misses for the same port into a single
//! underlying read, and keeps short-lived negative entries so a failing
//! device does not get hammered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::discovery::ftdi::{EepromBlob, EepromReader};
use crate::discovery::PortInfo;

/// Default time a successful read stays fresh.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
/// Default time a failed read is remembered before retrying.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(15);

/// The joined (OS + EEPROM) enrichment for one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    /// Port this information belongs to.
    pub port_name: String,
    /// OS device id of the port.
    pub device_id: String,
    /// Chip serial number, if known.
    pub serial_number: Option<String>,
    /// EEPROM `ProductDescription`, if read.
    pub product_description: Option<String>,
    /// EEPROM `Manufacturer`, if read.
    pub manufacturer: Option<String>,
    /// Full EEPROM blob.
    pub eeprom: EepromBlob,
    /// Whether the EEPROM portion was read directly from the device.
    pub is_data_valid: bool,
    /// When this information was produced.
    pub read_at: SystemTime,
}

struct CacheEntry {
    info: SystemInfo,
    inserted: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.inserted.elapsed() < self.ttl
    }
}

/// Counters exposed by [`SystemInfoCache::statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatistics {
    /// Lookups served from a fresh entry.
    pub hits: u64,
    /// Lookups that required an underlying read.
    pub misses: u64,
    /// Underlying reads that failed and produced a negative entry.
    pub failed_reads: u64,
    /// Entries removed by the sweeper.
    pub swept: u64,
}

/// Cache of [`SystemInfo`] keyed by port name.
pub struct SystemInfoCache {
    entries: DashMap<String, CacheEntry>,
    read_locks: DashMap<String, Arc<Mutex<()>>>,
    reader: Arc<dyn EepromReader>,
    ttl: Duration,
    negative_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    failed_reads: AtomicU64,
    swept: AtomicU64,
}

impl SystemInfoCache {
    /// Creates a cache with the default TTLs.
    pub fn new(reader: Arc<dyn EepromReader>) -> Self {
        Self::with_ttl(reader, DEFAULT_TTL, DEFAULT_NEGATIVE_TTL)
    }

    /// Creates a cache with explicit TTLs.
    pub fn with_ttl(reader: Arc<dyn EepromReader>, ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            read_locks: DashMap::new(),
            reader,
            ttl,
            negative_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failed_reads: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }
    }

    /// Returns the enrichment for `port`, reading through on a miss.
    ///
    /// `force_refresh` bypasses a fresh entry. Concurrent calls for the
    /// same port coalesce: only one performs the underlying read, the rest
    /// wait and reuse its result. A failed read yields an invalid
    /// [`SystemInfo`] held for the (short) negative TTL, so the cache is
    /// never poisoned by one bad read.
    pub fn get(&self, port: &PortInfo, force_refresh: bool) -> SystemInfo {
        if !force_refresh {
            if let Some(entry) = self.entries.get(&port.port_name) {
                if entry.is_fresh() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return entry.info.clone();
                }
            }
        }

        let key_lock = self
            .read_locks
            .entry(port.port_name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = key_lock.lock().unwrap();

        // Another caller may have completed the read while we waited.
        if !force_refresh {
            if let Some(entry) = self.entries.get(&port.port_name) {
                if entry.is_fresh() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return entry.info.clone();
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let info = self.read_port(port);
        let ttl = if info.is_data_valid {
            self.ttl
        } else {
            self.failed_reads.fetch_add(1, Ordering::Relaxed);
            self.negative_ttl
        };
        self.entries.insert(
            port.port_name.clone(),
            CacheEntry {
                info: info.clone(),
                inserted: Instant::now(),
                ttl,
            },
        );
        info
    }

    fn read_port(&self, port: &PortInfo) -> SystemInfo {
        let mut info = SystemInfo {
            port_name: port.port_name.clone(),
            device_id: port.device_id.clone(),
            serial_number: port.identity.as_ref().map(|i| i.serial_number.clone()),
            product_description: None,
            manufacturer: None,
            eeprom: EepromBlob::placeholder(),
            is_data_valid: false,
            read_at: SystemTime::now(),
        };

        let Some(identity) = &port.identity else {
            return info;
        };

        match self.reader.read(identity) {
            Ok(blob) => {
                info.product_description = blob.product_description().map(str::to_owned);
                info.manufacturer = blob.manufacturer().map(str::to_owned);
                info.is_data_valid = blob.is_valid();
                info.eeprom = blob;
            }
            Err(e) => {
                tracing::warn!(port = %port.port_name, "EEPROM enrichment failed: {e}");
            }
        }
        info
    }

    /// Drops the entry for a port, forcing the next `get` to re-read.
    pub fn invalidate(&self, port_name: &str) {
        self.entries.remove(port_name);
    }

    /// Removes expired entries, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh());
        let removed = before - self.entries.len();
        if removed > 0 {
            self.swept.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "cache sweep");
        }
        removed
    }

    /// Current counter values.
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    /// Spawns the background sweeper task. The task stops when `shutdown`
    /// is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        cache.sweep();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::enumerator::{fake_ftdi_port, fake_plain_port};
    use crate::discovery::ftdi::{EepromReader, FakeEepromReader, FtdiError, FtdiIdentity};
    use pretty_assertions::assert_eq;

    /// Counts underlying reads so coalescing can be asserted.
    struct CountingReader {
        inner: FakeEepromReader,
        reads: AtomicU64,
    }

    impl CountingReader {
        fn new(serial: &str, product: &str) -> Self {
            let inner = FakeEepromReader::new();
            inner.insert(serial, product);
            Self {
                inner,
                reads: AtomicU64::new(0),
            }
        }
    }

    impl EepromReader for CountingReader {
        fn read(&self, identity: &FtdiIdentity) -> Result<EepromBlob, FtdiError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            // A small delay widens the race window for the coalescing test.
            std::thread::sleep(Duration::from_millis(10));
            self.inner.read(identity)
        }
    }

    #[test]
    fn fresh_entry_is_served_from_cache() {
        let reader = Arc::new(CountingReader::new("AAA", "client_demo"));
        let cache = SystemInfoCache::new(reader.clone() as Arc<dyn EepromReader>);
        let port = fake_ftdi_port("COM3", "AAA", 0x6011);

        let first = cache.get(&port, false);
        let second = cache.get(&port, false);
        assert_eq!(first.product_description.as_deref(), Some("client_demo"));
        assert_eq!(first, second);
        assert_eq!(reader.reads.load(Ordering::SeqCst), 1);

        let stats = cache.statistics();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn force_refresh_bypasses_cache() {
        let reader = Arc::new(CountingReader::new("AAA", "client_demo"));
        let cache = SystemInfoCache::new(reader.clone() as Arc<dyn EepromReader>);
        let port = fake_ftdi_port("COM3", "AAA", 0x6011);

        cache.get(&port, false);
        cache.get(&port, true);
        assert_eq!(reader.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_misses_coalesce_to_one_read() {
        let reader = Arc::new(CountingReader::new("AAA", "client_demo"));
        let cache = Arc::new(SystemInfoCache::new(reader.clone() as Arc<dyn EepromReader>));
        let port = fake_ftdi_port("COM3", "AAA", 0x6011);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let port = port.clone();
            handles.push(std::thread::spawn(move || cache.get(&port, false)));
        }
        for handle in handles {
            let info = handle.join().unwrap();
            assert!(info.is_data_valid);
        }
        assert_eq!(reader.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_read_yields_short_lived_negative_entry() {
        let reader = Arc::new(FakeEepromReader::new()); // knows no serials
        let cache = SystemInfoCache::with_ttl(
            reader,
            Duration::from_secs(300),
            Duration::from_millis(10),
        );
        let port = fake_ftdi_port("COM3", "ZZZ", 0x6011);

        let info = cache.get(&port, false);
        assert!(!info.is_data_valid);
        assert_eq!(cache.statistics().failed_reads, 1);

        // After the negative TTL the entry is retried, not served stale.
        std::thread::sleep(Duration::from_millis(20));
        cache.get(&port, false);
        assert_eq!(cache.statistics().misses, 2);
    }

    #[test]
    fn non_ftdi_port_is_cached_invalid_without_reading() {
        let reader = Arc::new(CountingReader::new("AAA", "client_demo"));
        let cache = SystemInfoCache::new(reader.clone() as Arc<dyn EepromReader>);
        let info = cache.get(&fake_plain_port("COM9"), false);
        assert!(!info.is_data_valid);
        assert_eq!(reader.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let reader = Arc::new(FakeEepromReader::new());
        reader.insert("AAA", "client_demo");
        let cache = SystemInfoCache::with_ttl(
            reader,
            Duration::from_millis(5),
            Duration::from_millis(5),
        );
        cache.get(&fake_ftdi_port("COM3", "AAA", 0x6011), false);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.statistics().swept, 1);
    }
}
