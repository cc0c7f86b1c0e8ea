//! End-to-end scenarios against fake hardware: discovery and grouping,
//! dynamic BIB selection, multi-level validation with hardware signalling,
//! continue-on-failure, hot-add with auto-execute, and allocation under
//! contention.

use std::sync::Arc;
use std::time::Duration;

use bib_supervisor::config::bib::{BitBangConfig, InputBit, OutputBit, Phase};
use bib_supervisor::config::watcher::{ConfigEvent, ConfigWatcher, WatcherSettings};
use bib_supervisor::config::xml;
use bib_supervisor::context::SupervisorContext;
use bib_supervisor::discovery::enumerator::{fake_ftdi_port, FakePortEnumerator};
use bib_supervisor::discovery::ftdi::FakeEepromReader;
use bib_supervisor::discovery::validator::ValidationConfig;
use bib_supervisor::gpio::bitbang::{FakeBitBangHandle, FtdiBitBang};
use bib_supervisor::gpio::{
    BitBangProvider, InputEvent, INPUT_POWER_DOWN_HEADS_UP, OUTPUT_CRITICAL_FAIL,
};
use bib_supervisor::pool::reservation::ReservationCriteria;
use bib_supervisor::protocol::{FakeProtocolFactory, FakeScript, ProtocolRegistry};
use bib_supervisor::validation::ValidationLevel;
use bib_supervisor::workflow::{PhaseStatus, StopReason, WorkflowEngine};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const BIB_CLIENT_DEMO: &str = r#"
<bib id="client_demo">
  <uut id="uut1">
    <port number="1">
      <protocol>rs232</protocol>
      <speed>115200</speed>
      <data_pattern>n81</data_pattern>
      <start><command>INIT</command><expected_response regex="true">^READY$</expected_response></start>
      <test>
        <command>RUN</command>
        <expected_response regex="true">^PASS$</expected_response>
        <validation_levels>
          <warn regex="true">^PASS_WITH_WARNINGS$</warn>
          <fail regex="true">^FAIL$</fail>
          <critical regex="true" trigger_hardware="true">^CRITICAL$</critical>
        </validation_levels>
      </test>
      <stop><command>QUIT</command><expected_response regex="true">^BYE$</expected_response></stop>
    </port>
  </uut>
</bib>
"#;

struct Bench {
    ctx: Arc<SupervisorContext>,
    script: Arc<FakeScript>,
}

fn bench_with_gpio(gpio: Option<Arc<dyn BitBangProvider>>) -> Bench {
    let enumerator = Arc::new(FakePortEnumerator::new());
    enumerator.set_ports(vec![
        fake_ftdi_port("COM10", "AAA", 0x6011),
        fake_ftdi_port("COM11", "AAA", 0x6011),
        fake_ftdi_port("COM12", "AAA", 0x6011),
        fake_ftdi_port("COM13", "AAA", 0x6011),
        fake_ftdi_port("COM20", "BBB", 0x6011),
        fake_ftdi_port("COM21", "BBB", 0x6011),
        fake_ftdi_port("COM22", "BBB", 0x6011),
        fake_ftdi_port("COM23", "BBB", 0x6011),
    ]);
    let eeprom = Arc::new(FakeEepromReader::new());
    eeprom.insert("AAA", "client_demo");
    eeprom.insert("BBB", "client_demo");

    let protocols = Arc::new(ProtocolRegistry::new());
    let (factory, script) = FakeProtocolFactory::new();
    protocols.register(Arc::new(factory));

    let mut builder = SupervisorContext::builder()
        .enumerator(enumerator)
        .eeprom(eeprom)
        .protocols(protocols)
        .mapper(
            bib_supervisor::config::BibMapper::new().with_mapping("client_demo", "client_demo"),
        )
        .validation(ValidationConfig::strict());
    if let Some(gpio) = gpio {
        builder = builder.gpio(gpio);
    }
    let ctx = builder.build();
    ctx.registry.insert(xml::parse_str(BIB_CLIENT_DEMO).unwrap());
    Bench { ctx, script }
}

fn bench() -> Bench {
    bench_with_gpio(None)
}

fn critical_fail_gpio() -> (Arc<FtdiBitBang>, FakeBitBangHandle) {
    let config = BitBangConfig {
        enabled: true,
        inputs: vec![InputBit {
            name: INPUT_POWER_DOWN_HEADS_UP.to_owned(),
            bit: 1,
            active_low: false,
            debounce: Duration::from_millis(1),
        }],
        outputs: vec![OutputBit {
            name: OUTPUT_CRITICAL_FAIL.to_owned(),
            bit: 4,
            active_low: true,
            pulse_width: None,
        }],
        ..BitBangConfig::default()
    };
    let (driver, handle) = FakeBitBangHandle::new();
    (
        Arc::new(FtdiBitBang::new(config, Box::new(driver)).unwrap()),
        handle,
    )
}

#[test]
fn two_quad_chips_discover_as_two_valid_devices() {
    let bench = bench();
    let snapshot = bench.ctx.discover();

    assert_eq!(snapshot.ports.len(), 8);
    assert_eq!(snapshot.groups.len(), 2);
    for serial in ["AAA", "BBB"] {
        let group = snapshot.group(serial).expect("group missing");
        assert!(group.is_multi_port);
        assert_eq!(group.port_count(), 4);
        assert!(group.is_client_valid);
    }

    let total: usize = snapshot.groups.iter().map(|g| g.port_count()).sum();
    assert_eq!(total, snapshot.ports.len());
}

#[tokio::test]
async fn dynamic_bib_selection_runs_the_mapped_workflow() {
    let bench = bench();
    bench.script.push_response("READY");
    bench.script.push_response("PASS");
    bench.script.push_response("BYE");

    let snapshot = bench.ctx.discover();
    let bib = bench
        .ctx
        .resolve_bib(&snapshot.ports[0])
        .expect("no BIB resolved from ProductDescription");
    assert_eq!(bib.id, "client_demo");

    let engine = WorkflowEngine::new(bench.ctx.clone());
    let result = engine
        .run(bib, "uut1", 1, CancellationToken::new())
        .await;

    assert_eq!(result.aggregate, ValidationLevel::Pass);
    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(result.phases.len(), 3);
    assert_eq!(
        bench.script.sent_commands(),
        vec![b"INIT\r\n".to_vec(), b"RUN\r\n".to_vec(), b"QUIT\r\n".to_vec()]
    );
    // The reservation was released on completion.
    assert_eq!(bench.ctx.pool.statistics().allocated_ports, 0);
}

#[tokio::test]
async fn critical_response_stops_and_raises_the_hardware_signal() {
    let (gpio, handle) = critical_fail_gpio();
    let bench = bench_with_gpio(Some(gpio));
    bench.script.push_response("READY");
    bench.script.push_response("CRITICAL");
    bench.script.push_response("BYE");

    let engine = WorkflowEngine::new(bench.ctx.clone());
    let bib = bench.ctx.registry.get("client_demo").unwrap();
    let result = engine
        .run(bib, "uut1", 1, CancellationToken::new())
        .await;

    assert_eq!(result.aggregate, ValidationLevel::Critical);
    assert_eq!(
        result.stop_reason,
        StopReason::ValidationStop(ValidationLevel::Critical)
    );
    let test_phase = result.phase(Phase::Test).unwrap();
    assert_eq!(test_phase.level(), Some(ValidationLevel::Critical));
    // Stop still ran for cleanup.
    assert!(matches!(
        result.phase(Phase::Stop).unwrap().status,
        PhaseStatus::Completed { .. }
    ));

    // Active-low critical-fail line (bit 4) was driven low.
    let last = handle.last_written().expect("no GPIO write recorded");
    assert_eq!(last & 0b0001_0000, 0);
}

#[tokio::test]
async fn continue_on_failure_lets_stop_run_and_aggregates_fail() {
    let bench = bench();
    let xml_text = BIB_CLIENT_DEMO.replace(
        "<test>",
        "<test continue_on_failure=\"true\">",
    );
    bench.ctx.registry.insert(xml::parse_str(&xml_text).unwrap());

    bench.script.push_response("READY");
    bench.script.push_response("FAIL");
    bench.script.push_response("BYE");

    let engine = WorkflowEngine::new(bench.ctx.clone());
    let bib = bench.ctx.registry.get("client_demo").unwrap();
    let result = engine
        .run(bib, "uut1", 1, CancellationToken::new())
        .await;

    assert_eq!(result.aggregate, ValidationLevel::Fail);
    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(
        result.phase(Phase::Test).unwrap().level(),
        Some(ValidationLevel::Fail)
    );
    assert_eq!(
        result.phase(Phase::Stop).unwrap().level(),
        Some(ValidationLevel::Pass)
    );
}

#[tokio::test]
async fn timeout_without_critical_pattern_is_a_fail_stop() {
    let bench = bench();
    bench.script.push_response("READY");
    bench.script.push_timeout();
    bench.script.push_response("BYE");

    let engine = WorkflowEngine::new(bench.ctx.clone());
    let bib = bench.ctx.registry.get("client_demo").unwrap();
    let result = engine
        .run(bib, "uut1", 1, CancellationToken::new())
        .await;

    assert_eq!(result.aggregate, ValidationLevel::Fail);
    assert_eq!(
        result.stop_reason,
        StopReason::ValidationStop(ValidationLevel::Fail)
    );
    match &result.phase(Phase::Test).unwrap().status {
        PhaseStatus::Completed { response, outcome } => {
            assert!(response.is_none());
            assert_eq!(outcome.reason, "response timeout");
        }
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn power_down_heads_up_cancels_and_still_cleans_up() {
    let bench = bench();
    // Start takes long enough for the power-down event to land mid-phase.
    bench
        .script
        .push_response_after("READY", Duration::from_millis(300));
    bench.script.push_response("BYE");

    let engine = WorkflowEngine::new(bench.ctx.clone());
    let bib = bench.ctx.registry.get("client_demo").unwrap();

    let events = bench.ctx.gpio_events.clone();
    let pusher = tokio::spawn(async move {
        // Give the run time to open the session and subscribe.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = events.send(InputEvent {
            name: INPUT_POWER_DOWN_HEADS_UP.to_owned(),
            value: true,
            at: std::time::SystemTime::now(),
        });
    });

    let result = engine
        .run(bib, "uut1", 1, CancellationToken::new())
        .await;
    pusher.await.unwrap();

    assert_eq!(result.stop_reason, StopReason::PowerDownRequested);
    assert_eq!(
        result.phase(Phase::Test).unwrap().status,
        PhaseStatus::Skipped
    );
    // The stop phase still executed its cleanup command.
    assert!(matches!(
        result.phase(Phase::Stop).unwrap().status,
        PhaseStatus::Completed { .. }
    ));
    assert_eq!(bench.ctx.pool.statistics().allocated_ports, 0);
}

#[tokio::test]
async fn hot_add_within_debounce_window_loads_once_and_triggers_workflows() {
    let dir = tempfile::tempdir().unwrap();
    let bench = bench();
    bench.script.push_response("READY");
    bench.script.push_response("PASS");
    bench.script.push_response("BYE");
    bench.script.push_response("READY");
    bench.script.push_response("PASS");
    bench.script.push_response("BYE");

    let settings = WatcherSettings {
        watch_directory: dir.path().to_owned(),
        debounce_delay: Duration::from_millis(200),
        auto_execute_on_discovery: true,
        perform_initial_discovery: false,
    };

    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let watcher = ConfigWatcher::spawn_with_source(
        settings,
        bench.ctx.registry.clone(),
        raw_rx,
        Some(trigger_tx),
        shutdown.clone(),
    );
    let mut events = watcher.subscribe();

    // Two files appear within a 50 ms window, each written twice.
    let path_a = dir.path().join("bib_line_a.xml");
    let path_b = dir.path().join("bib_line_b.xml");
    let file_a = BIB_CLIENT_DEMO.replace("client_demo", "line_a");
    let file_b = BIB_CLIENT_DEMO.replace("client_demo", "line_b");
    for _ in 0..2 {
        std::fs::write(&path_a, &file_a).unwrap();
        raw_tx.send(path_a.clone()).unwrap();
        std::fs::write(&path_b, &file_b).unwrap();
        raw_tx.send(path_b.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let mut loaded = Vec::new();
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no event")
            .expect("channel closed")
        {
            ConfigEvent::Loaded { bib_id, .. } => loaded.push(bib_id),
            other => panic!("expected exactly one load per file, got {other:?}"),
        }
    }
    loaded.sort();
    assert_eq!(loaded, vec!["line_a".to_owned(), "line_b".to_owned()]);

    // Close the watcher so the trigger channel drains and closes.
    shutdown.cancel();
    watcher.join().await;

    let engine = WorkflowEngine::new(bench.ctx.clone());
    let results = engine
        .serve_triggers(trigger_rx, CancellationToken::new())
        .await;
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.aggregate, ValidationLevel::Pass);
    }
}

#[test]
fn reservation_storm_grants_each_port_once() {
    let bench = bench();

    let mut handles = Vec::new();
    for i in 0..8 {
        let reservations = bench.ctx.reservations.clone();
        handles.push(std::thread::spawn(move || {
            reservations.reserve(&ReservationCriteria::new(format!("client-{i}")))
        }));
    }
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let granted: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    // All eight fake ports are eligible, so every caller wins one.
    assert_eq!(granted.len(), 8);

    let mut ports: Vec<_> = results
        .iter()
        .flatten()
        .map(|r| r.allocation.port_name.clone())
        .collect();
    ports.sort();
    ports.dedup();
    assert_eq!(ports.len(), 8);
    assert_eq!(bench.ctx.pool.statistics().allocated_ports, 8);
}
