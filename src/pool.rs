//! Connection pool: connected, configured pump drivers cached per session.
//!
//! Connecting and configuring a chain of pumps takes seconds, so drivers are
//! kept across the dispense cycles of one session.  The pool is owned by the
//! service process and passed to the orchestrator by reference; nothing else
//! mutates it.
//!
//! Initialisation is sequential.  Concurrent opens on a daisy-chained bus
//! conflict, and the driver's global open lock enforces the same ordering
//! even if a caller tries otherwise.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{info, warn};

use crate::app::ports::{PortConnector, TimePort};
use crate::config::PumpConfig;
use crate::drivers::PumpDriver;
use crate::error::{PumpError, Result};

/// Drivers keyed by ingredient name, in stable order.
pub type PumpSet = BTreeMap<String, PumpDriver>;

struct SessionPumps {
    pumps: PumpSet,
    port: String,
    burst_initialized: bool,
}

pub struct PumpPool {
    connector: Arc<dyn PortConnector>,
    clock: Arc<dyn TimePort>,
    max_retries: u32,
    response_timeout_ms: u64,
    sessions: HashMap<String, SessionPumps>,
}

impl PumpPool {
    pub fn new(
        connector: Arc<dyn PortConnector>,
        clock: Arc<dyn TimePort>,
        max_retries: u32,
        response_timeout_ms: u64,
    ) -> Self {
        Self {
            connector,
            clock,
            max_retries,
            response_timeout_ms,
            sessions: HashMap::new(),
        }
    }

    pub fn connector(&self) -> &dyn PortConnector {
        self.connector.as_ref()
    }

    pub fn clock(&self) -> Arc<dyn TimePort> {
        self.clock.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    fn is_healthy(&self, key: &str, config: &PumpConfig) -> bool {
        self.sessions.get(key).is_some_and(|s| {
            s.port == config.serial_port
                && s.pumps.len() == config.pumps.len()
                && config.pumps.iter().all(|p| {
                    s.pumps
                        .get(&p.ingredient)
                        .is_some_and(|d| d.is_connected() && d.address() == p.address)
                })
        })
    }

    /// Return the cached drivers for `key` if every one is still connected
    /// and matches `config`; otherwise tear down and initialise afresh.
    pub fn get_or_create_pumps(&mut self, key: &str, config: &PumpConfig) -> Result<&mut PumpSet> {
        if !self.is_healthy(key, config) {
            if self.sessions.contains_key(key) {
                warn!("pool: pumps for {key} are stale, reinitialising");
                self.cleanup(key);
            }
            let pumps = self.initialize(config)?;
            info!("pool: {} pump(s) ready for {key}", pumps.len());
            self.sessions.insert(
                key.to_string(),
                SessionPumps {
                    pumps,
                    port: config.serial_port.clone(),
                    burst_initialized: false,
                },
            );
        }
        self.sessions
            .get_mut(key)
            .map(|s| &mut s.pumps)
            .ok_or_else(|| PumpError::Connection(format!("no pumps cached for {key}")))
    }

    /// Cached drivers for `key`, without any health check.
    pub fn pumps_mut(&mut self, key: &str) -> Option<&mut PumpSet> {
        self.sessions.get_mut(key).map(|s| &mut s.pumps)
    }

    /// Connect and configure each pump in turn.  On any failure the pumps
    /// already opened are disconnected before the error is returned.
    fn initialize(&self, config: &PumpConfig) -> Result<PumpSet> {
        let settings = config.serial_settings(self.response_timeout_ms);
        let mut pumps = PumpSet::new();

        for pump in &config.pumps {
            let mut driver = PumpDriver::new(
                pump.address,
                settings.clone(),
                self.clock.clone(),
                self.max_retries,
            );
            let configured = pump.diameter_mm().and_then(|diameter| {
                driver.connect(self.connector.as_ref())?;
                driver.set_diameter(diameter)?;
                driver.set_rate(config.dispensing_rate_ul_min)
            });
            if let Err(e) = configured {
                warn!(
                    "pool: pump {:02} ({}) failed to initialise: {e}",
                    pump.address, pump.ingredient
                );
                driver.disconnect();
                for opened in pumps.values_mut() {
                    opened.disconnect();
                }
                if !self.port_in_use(&config.serial_port) {
                    self.connector.release(&config.serial_port);
                }
                return Err(e);
            }
            pumps.insert(pump.ingredient.clone(), driver);
        }
        Ok(pumps)
    }

    fn port_in_use(&self, port: &str) -> bool {
        self.sessions.values().any(|s| s.port == port)
    }

    /// Disconnect a session's pumps and drop them from the cache.
    pub fn cleanup(&mut self, key: &str) {
        let Some(mut session) = self.sessions.remove(key) else {
            return;
        };
        for driver in session.pumps.values_mut() {
            driver.disconnect();
        }
        if !self.port_in_use(&session.port) {
            self.connector.release(&session.port);
        }
        info!("pool: released pumps for {key}");
    }

    /// Drop every session cached on `port`.
    ///
    /// Used after something outside a session (a refill) has reprogrammed
    /// pumps on that bus.  The next dispense reconnects, re-sends diameter
    /// and rate, and repeats the burst setup.
    pub fn invalidate_port(&mut self, port: &str) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.port == port)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.cleanup(key);
        }
        if !stale.is_empty() {
            info!("pool: {} session(s) on {port} invalidated", stale.len());
        }
    }

    /// Emergency teardown: stop every pump (best effort) and disconnect all.
    pub fn cleanup_all(&mut self) {
        for (key, mut session) in self.sessions.drain() {
            for (ingredient, driver) in &mut session.pumps {
                if let Err(e) = driver.stop() {
                    warn!("pool: stop of {ingredient} in {key} failed: {e}");
                }
                driver.disconnect();
            }
            self.connector.release(&session.port);
        }
        info!("pool: all pumps released");
    }

    pub fn is_burst_initialized(&self, key: &str) -> bool {
        self.sessions.get(key).is_some_and(|s| s.burst_initialized)
    }

    pub fn set_burst_initialized(&mut self, key: &str, initialized: bool) {
        if let Some(s) = self.sessions.get_mut(key) {
            s.burst_initialized = initialized;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;

    use super::*;
    use crate::config::PumpAddressConfig;
    use crate::transport::{SerialSettings, SharedTransport, Transport, share};

    /// Answers "stopped" to everything.
    struct Agreeable;

    impl Transport for Agreeable {
        fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn read_reply(&mut self) -> io::Result<Vec<u8>> {
            Ok(b"S\r".to_vec())
        }
        fn drain(&mut self) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        opens: Mutex<usize>,
        releases: Mutex<Vec<String>>,
        fail: bool,
    }

    impl PortConnector for CountingConnector {
        fn open(&self, settings: &SerialSettings) -> Result<SharedTransport> {
            if self.fail {
                return Err(PumpError::Connection(format!("{} busy", settings.port)));
            }
            *self.opens.lock() += 1;
            Ok(share(Agreeable))
        }
        fn release(&self, port: &str) {
            self.releases.lock().push(port.to_string());
        }
    }

    struct NoSleep;

    impl TimePort for NoSleep {
        fn sleep(&self, _duration: Duration) {}
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    fn config() -> PumpConfig {
        PumpConfig {
            pumps: vec![
                PumpAddressConfig::new(0, "Sugar", 26.59),
                PumpAddressConfig::new(1, "Water", 26.59),
            ],
            ..PumpConfig::default()
        }
    }

    fn pool(connector: Arc<CountingConnector>) -> PumpPool {
        PumpPool::new(connector, Arc::new(NoSleep), 1, 50)
    }

    #[test]
    fn second_request_reuses_cached_pumps() {
        let connector = Arc::new(CountingConnector::default());
        let mut pool = pool(connector.clone());
        let cfg = config();

        assert_eq!(pool.get_or_create_pumps("s1", &cfg).unwrap().len(), 2);
        assert_eq!(*connector.opens.lock(), 2);
        pool.get_or_create_pumps("s1", &cfg).unwrap();
        assert_eq!(*connector.opens.lock(), 2);
    }

    #[test]
    fn disconnected_pump_forces_reinitialisation() {
        let connector = Arc::new(CountingConnector::default());
        let mut pool = pool(connector.clone());
        let cfg = config();

        pool.get_or_create_pumps("s1", &cfg)
            .unwrap()
            .get_mut("Sugar")
            .unwrap()
            .disconnect();
        pool.get_or_create_pumps("s1", &cfg).unwrap();
        assert_eq!(*connector.opens.lock(), 4);
    }

    #[test]
    fn failed_open_leaves_nothing_cached() {
        let connector = Arc::new(CountingConnector {
            fail: true,
            ..CountingConnector::default()
        });
        let mut pool = pool(connector);
        assert!(matches!(
            pool.get_or_create_pumps("s1", &config()),
            Err(PumpError::Connection(_))
        ));
        assert!(!pool.contains("s1"));
    }

    #[test]
    fn burst_flag_is_per_session_and_reset_on_cleanup() {
        let connector = Arc::new(CountingConnector::default());
        let mut pool = pool(connector.clone());
        let cfg = config();
        pool.get_or_create_pumps("s1", &cfg).unwrap();
        pool.get_or_create_pumps("s2", &cfg).unwrap();

        pool.set_burst_initialized("s1", true);
        assert!(pool.is_burst_initialized("s1"));
        assert!(!pool.is_burst_initialized("s2"));

        pool.cleanup("s1");
        assert!(!pool.is_burst_initialized("s1"));
        // s2 still uses the port
        assert!(connector.releases.lock().is_empty());

        pool.cleanup_all();
        assert_eq!(pool.session_count(), 0);
        assert_eq!(*connector.releases.lock(), vec!["/dev/ttyUSB0".to_string()]);
    }

    #[test]
    fn invalidating_a_port_drops_only_its_sessions() {
        let connector = Arc::new(CountingConnector::default());
        let mut pool = pool(connector.clone());
        let cfg = config();
        let other = PumpConfig {
            serial_port: "/dev/ttyUSB1".to_string(),
            ..config()
        };
        pool.get_or_create_pumps("s1", &cfg).unwrap();
        pool.get_or_create_pumps("s2", &cfg).unwrap();
        pool.get_or_create_pumps("s3", &other).unwrap();
        pool.set_burst_initialized("s1", true);

        pool.invalidate_port("/dev/ttyUSB0");

        assert!(!pool.contains("s1"));
        assert!(!pool.contains("s2"));
        assert!(pool.contains("s3"));
        assert_eq!(*connector.releases.lock(), vec!["/dev/ttyUSB0".to_string()]);

        pool.get_or_create_pumps("s1", &cfg).unwrap();
        assert!(!pool.is_burst_initialized("s1"));
        assert_eq!(*connector.opens.lock(), 8);
    }
}
