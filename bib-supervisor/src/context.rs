//! Shared supervisor state.
//!
//! The context wires the subsystems together and is passed explicitly to
//! everything that needs shared state; there are no process-wide
//! singletons. Build one at startup, hand out the `Arc`, cancel it at
//! shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::bib::{BibConfiguration, BitBangConfig};
use crate::config::mapper::BibMapper;
use crate::config::registry::BibRegistry;
use crate::discovery::cache::SystemInfoCache;
use crate::discovery::enumerator::{PortEnumerator, SystemPortEnumerator};
use crate::discovery::ftdi::{EepromReader, NusbEepromReader};
use crate::discovery::grouping::{analyze, GroupSnapshot};
use crate::discovery::validator::{validate, ValidationConfig};
use crate::discovery::PortInfo;
use crate::gpio::poller::GpioPoller;
use crate::gpio::{BitBangProvider, InputEvent, NullBitBang};
use crate::pool::reservation::ReservationService;
use crate::pool::PortPool;
use crate::protocol::ProtocolRegistry;

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const RESERVATION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the supervisor's tasks share.
pub struct SupervisorContext {
    /// OS port enumerator.
    pub enumerator: Arc<dyn PortEnumerator>,
    /// Per-port enrichment cache.
    pub cache: Arc<SystemInfoCache>,
    /// The port pool.
    pub pool: Arc<PortPool>,
    /// Reservation layer over the pool.
    pub reservations: Arc<ReservationService>,
    /// Loaded BIB configurations.
    pub registry: Arc<BibRegistry>,
    /// Dynamic BIB selection.
    pub mapper: Arc<BibMapper>,
    /// Protocol factories.
    pub protocols: Arc<ProtocolRegistry>,
    /// Bit-bang hardware (null when absent).
    pub gpio: Arc<dyn BitBangProvider>,
    /// Debounced GPIO input transitions.
    pub gpio_events: broadcast::Sender<InputEvent>,
    /// Active port eligibility rules.
    pub validation: ValidationConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SupervisorContext {
    /// Starts building a context.
    pub fn builder() -> SupervisorContextBuilder {
        SupervisorContextBuilder::default()
    }

    /// One discovery cycle: enumerate, enrich through the cache, validate
    /// and group.
    #[tracing::instrument(skip_all)]
    pub fn discover(&self) -> GroupSnapshot {
        let mut ports = self.enumerator.enumerate();
        let mut infos = HashMap::new();
        for port in &mut ports {
            let info = self.cache.get(port, false);
            if info.is_data_valid {
                if let Some(identity) = &mut port.identity {
                    identity.eeprom = info.eeprom.clone();
                }
            }
            infos.insert(port.port_name.clone(), info);
            let outcome = validate(port, &self.validation);
            port.validation = Some(outcome);
        }
        let snapshot = analyze(ports, &self.validation, &infos);
        tracing::debug!(
            ports = snapshot.ports.len(),
            devices = snapshot.groups.len(),
            "discovery cycle"
        );
        snapshot
    }

    /// Resolves the BIB configuration for a discovered port via the
    /// EEPROM `ProductDescription` and the mapper.
    pub fn resolve_bib(&self, port: &PortInfo) -> Option<Arc<BibConfiguration>> {
        let info = self.cache.get(port, false);
        let bib_id = self.mapper.map(
            info.product_description.as_deref(),
            info.serial_number.as_deref(),
            &port.device_id,
        )?;
        let bib = self.registry.get(&bib_id);
        if bib.is_none() {
            tracing::warn!(bib = %bib_id, "mapped BIB is not registered");
        }
        bib
    }

    /// Spawns the cache and reservation sweepers.
    pub fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(
            self.cache
                .spawn_sweeper(CACHE_SWEEP_INTERVAL, self.shutdown.child_token()),
        );
        tasks.push(
            self.reservations
                .spawn_sweeper(RESERVATION_SWEEP_INTERVAL, self.shutdown.child_token()),
        );
    }

    /// Spawns the GPIO input poller for the given hardware configuration.
    pub fn start_gpio_poller(&self, config: &BitBangConfig) {
        let task = GpioPoller::spawn(
            Arc::clone(&self.gpio),
            config,
            self.gpio_events.clone(),
            self.shutdown.child_token(),
        );
        self.tasks.lock().unwrap().push(task);
    }

    /// A token cancelled when the context shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Stops background tasks and releases every allocation.
    pub async fn shutdown(&self) {
        tracing::info!("supervisor shutting down");
        self.shutdown.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.pool.dispose();
    }
}

/// Builder for [`SupervisorContext`]; every part has a hardware-backed
/// default and a test seam.
pub struct SupervisorContextBuilder {
    enumerator: Arc<dyn PortEnumerator>,
    eeprom: Arc<dyn EepromReader>,
    gpio: Arc<dyn BitBangProvider>,
    protocols: Arc<ProtocolRegistry>,
    mapper: BibMapper,
    validation: ValidationConfig,
}

impl Default for SupervisorContextBuilder {
    fn default() -> Self {
        Self {
            enumerator: Arc::new(SystemPortEnumerator::new()),
            eeprom: Arc::new(NusbEepromReader::new()),
            gpio: Arc::new(NullBitBang::new()),
            protocols: Arc::new(ProtocolRegistry::with_defaults()),
            mapper: BibMapper::new(),
            validation: ValidationConfig::default(),
        }
    }
}

impl SupervisorContextBuilder {
    /// Overrides the port enumerator.
    pub fn enumerator(mut self, enumerator: Arc<dyn PortEnumerator>) -> Self {
        self.enumerator = enumerator;
        self
    }

    /// Overrides the EEPROM reader.
    pub fn eeprom(mut self, eeprom: Arc<dyn EepromReader>) -> Self {
        self.eeprom = eeprom;
        self
    }

    /// Overrides the GPIO provider.
    pub fn gpio(mut self, gpio: Arc<dyn BitBangProvider>) -> Self {
        self.gpio = gpio;
        self
    }

    /// Overrides the protocol registry.
    pub fn protocols(mut self, protocols: Arc<ProtocolRegistry>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Sets the dynamic BIB mapper.
    pub fn mapper(mut self, mapper: BibMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Sets the port eligibility rules.
    pub fn validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }

    /// Assembles the context.
    pub fn build(self) -> Arc<SupervisorContext> {
        let cache = Arc::new(SystemInfoCache::new(Arc::clone(&self.eeprom)));
        let pool = Arc::new(PortPool::new(Arc::clone(&self.enumerator)));
        let reservations = Arc::new(ReservationService::new(Arc::clone(&pool)));
        let (gpio_events, _) = broadcast::channel(64);

        Arc::new(SupervisorContext {
            enumerator: self.enumerator,
            cache,
            pool,
            reservations,
            registry: Arc::new(BibRegistry::new()),
            mapper: Arc::new(self.mapper),
            protocols: self.protocols,
            gpio: self.gpio,
            gpio_events,
            validation: self.validation,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::enumerator::{fake_ftdi_port, FakePortEnumerator};
    use crate::discovery::ftdi::FakeEepromReader;
    use pretty_assertions::assert_eq;

    fn context() -> Arc<SupervisorContext> {
        let enumerator = Arc::new(FakePortEnumerator::new());
        enumerator.set_ports(vec![
            fake_ftdi_port("COM10", "AAA", 0x6011),
            fake_ftdi_port("COM11", "AAA", 0x6011),
        ]);
        let eeprom = Arc::new(FakeEepromReader::new());
        eeprom.insert("AAA", "client_demo");

        SupervisorContext::builder()
            .enumerator(enumerator)
            .eeprom(eeprom)
            .mapper(BibMapper::new().with_mapping("client_demo", "client_demo"))
            .validation(ValidationConfig::strict())
            .build()
    }

    #[test]
    fn discover_enriches_validates_and_groups() {
        let ctx = context();
        let snapshot = ctx.discover();
        assert_eq!(snapshot.ports.len(), 2);
        assert_eq!(snapshot.groups.len(), 1);

        let group = snapshot.group("AAA").unwrap();
        assert!(group.is_client_valid);
        let shared = group.shared_system_info.as_ref().unwrap();
        assert_eq!(shared.product_description.as_deref(), Some("client_demo"));

        for port in &snapshot.ports {
            // EEPROM enrichment raised the score to the full 100.
            assert_eq!(port.validation.as_ref().unwrap().score, 100);
            assert!(port.identity.as_ref().unwrap().eeprom.is_valid());
        }
    }

    #[test]
    fn resolve_bib_uses_product_description() {
        let ctx = context();
        let bib = crate::config::xml::parse_str(
            r#"<bib id="client_demo"><uut id="u"><port number="1">
                 <start><command>A</command><expected_response>OK</expected_response></start>
                 <test><command>B</command><expected_response>OK</expected_response></test>
                 <stop><command>C</command><expected_response>OK</expected_response></stop>
               </port></uut></bib>"#,
        )
        .unwrap();
        ctx.registry.insert(bib);

        let snapshot = ctx.discover();
        let resolved = ctx.resolve_bib(&snapshot.ports[0]).unwrap();
        assert_eq!(resolved.id, "client_demo");
    }
}
