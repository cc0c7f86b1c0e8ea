//! The BIB → UUT → PORT configuration tree.
//!
//! Configurations are immutable after load; reloads publish a fresh
//! [`std::sync::Arc`] snapshot through the registry, so in-flight workflow
//! runs keep the tree they started with.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::validation::LevelRule;

/// One of the three workflow phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Bring the UUT into a testable state.
    Start,
    /// Exercise the UUT.
    Test,
    /// Return the UUT to a safe state; runs even after a stop decision.
    Stop,
}

impl Phase {
    /// Execution order of the phases.
    pub const SEQUENCE: [Phase; 3] = [Phase::Start, Phase::Test, Phase::Stop];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Start => "start",
            Phase::Test => "test",
            Phase::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Parity of the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityMode {
    /// No parity bit.
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Flow control of the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handshake {
    /// No flow control.
    #[default]
    None,
    /// XON/XOFF software flow control.
    Software,
    /// RTS/CTS hardware flow control.
    Hardware,
}

/// Parsed `data_pattern` such as `n81`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPattern {
    /// Parity bit mode.
    pub parity: ParityMode,
    /// Data bits per character (5..=8).
    pub data_bits: u8,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
}

impl DataPattern {
    /// The ubiquitous no-parity, 8 data bits, 1 stop bit.
    pub const N81: DataPattern = DataPattern {
        parity: ParityMode::None,
        data_bits: 8,
        stop_bits: 1,
    };

    /// Parses the compact `<parity><data><stop>` notation, e.g. `n81`,
    /// `e71`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut chars = text.chars();
        let parity = match chars.next()?.to_ascii_lowercase() {
            'n' => ParityMode::None,
            'e' => ParityMode::Even,
            'o' => ParityMode::Odd,
            _ => return None,
        };
        let data_bits = chars.next()?.to_digit(10)? as u8;
        let stop_bits = chars.next()?.to_digit(10)? as u8;
        if chars.next().is_some() || !(5..=8).contains(&data_bits) || !(1..=2).contains(&stop_bits)
        {
            return None;
        }
        Some(Self {
            parity,
            data_bits,
            stop_bits,
        })
    }
}

/// One phase's command plus its validation rules and timing.
#[derive(Debug, Clone)]
pub struct ProtocolCommand {
    /// Bytes written to the port for this phase.
    pub command: Vec<u8>,
    /// Level rules, including the Pass rule lowered from
    /// `<expected_response>`.
    pub rules: Vec<LevelRule>,
    /// How long to wait for a response.
    pub timeout: Duration,
    /// Resend attempts on I/O errors.
    pub retry_count: u32,
    /// Continue the workflow when this phase ends at Fail level.
    pub continue_on_failure: bool,
}

/// Workflow policy knobs of one port.
#[derive(Debug, Clone)]
pub struct WorkflowControl {
    /// Default continue-on-failure for phases that don't override it.
    pub continue_on_failure: bool,
    /// Source knob allowing continuation past Critical. Refused in strict
    /// mode; the orchestrator logs and ignores it there.
    pub continue_on_critical: bool,
    /// Gate the run on the power-on-ready input.
    pub wait_for_power_on_ready: bool,
    /// How long to wait for power-on-ready before failing the run.
    pub power_on_ready_timeout: Duration,
}

impl Default for WorkflowControl {
    fn default() -> Self {
        Self {
            continue_on_failure: false,
            continue_on_critical: false,
            wait_for_power_on_ready: false,
            power_on_ready_timeout: Duration::from_secs(5),
        }
    }
}

/// Serial and workflow configuration of one UUT port.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Port number within the UUT (1-based in configuration files).
    pub number: u32,
    /// Protocol handler name, e.g. `rs232`.
    pub protocol: String,
    /// Baud rate.
    pub speed: u32,
    /// Line framing.
    pub data_pattern: DataPattern,
    /// Read timeout of the serial line.
    pub read_timeout: Duration,
    /// Write timeout of the serial line.
    pub write_timeout: Duration,
    /// Flow control.
    pub handshake: Handshake,
    /// Assert RTS after open.
    pub rts_enable: bool,
    /// Assert DTR after open.
    pub dtr_enable: bool,
    /// Workflow policy knobs.
    pub workflow: WorkflowControl,
    /// Start phase.
    pub start: ProtocolCommand,
    /// Test phase.
    pub test: ProtocolCommand,
    /// Stop phase.
    pub stop: ProtocolCommand,
}

impl PortConfig {
    /// The command of a phase.
    pub fn command(&self, phase: Phase) -> &ProtocolCommand {
        match phase {
            Phase::Start => &self.start,
            Phase::Test => &self.test,
            Phase::Stop => &self.stop,
        }
    }
}

/// One unit under test and its ports.
#[derive(Debug, Clone)]
pub struct UutConfig {
    /// UUT id, unique within the BIB.
    pub id: String,
    /// Ports, in file order.
    pub ports: Vec<PortConfig>,
}

impl UutConfig {
    /// Looks up a port by number.
    pub fn port(&self, number: u32) -> Option<&PortConfig> {
        self.ports.iter().find(|p| p.number == number)
    }
}

/// A debounced input line of the bit-bang interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBit {
    /// Logical signal name, e.g. `power_on_ready`.
    pub name: String,
    /// Bit position on the data bus.
    pub bit: u8,
    /// The signal is asserted when the line is low.
    pub active_low: bool,
    /// Stability window before a change is reported.
    pub debounce: Duration,
}

/// An output line of the bit-bang interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBit {
    /// Logical signal name, e.g. `critical_fail`.
    pub name: String,
    /// Bit position on the data bus.
    pub bit: u8,
    /// The signal is asserted by driving the line low.
    pub active_low: bool,
    /// Width used by pulse writes, when configured.
    pub pulse_width: Option<Duration>,
}

/// Hardware GPIO configuration of a BIB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitBangConfig {
    /// Whether the bit-bang interface is enabled at all.
    pub enabled: bool,
    /// Device id of the FTDI chip carrying the GPIO lines, if pinned.
    pub device_id: Option<String>,
    /// Serial number of that chip, if pinned.
    pub serial: Option<String>,
    /// Input lines.
    pub inputs: Vec<InputBit>,
    /// Output lines.
    pub outputs: Vec<OutputBit>,
    /// Input sampling cadence.
    pub polling_interval: Duration,
    /// How long the critical-fail signal is held when auto-clear is on.
    pub signal_hold: Duration,
    /// Clear the critical-fail signal automatically after `signal_hold`.
    pub auto_clear: bool,
}

impl Default for BitBangConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device_id: None,
            serial: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            polling_interval: Duration::from_millis(100),
            signal_hold: Duration::from_millis(500),
            auto_clear: false,
        }
    }
}

impl BitBangConfig {
    /// Looks up an input line by name.
    pub fn input(&self, name: &str) -> Option<&InputBit> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Looks up an output line by name.
    pub fn output(&self, name: &str) -> Option<&OutputBit> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// A complete Board Interface Box configuration.
#[derive(Debug, Clone)]
pub struct BibConfiguration {
    /// BIB id, the key configurations are registered under.
    pub id: String,
    /// Free-form metadata from the file.
    pub metadata: BTreeMap<String, String>,
    /// Optional GPIO hardware configuration.
    pub hardware: Option<BitBangConfig>,
    /// Units under test.
    pub uuts: Vec<UutConfig>,
}

impl BibConfiguration {
    /// Looks up a UUT by id.
    pub fn uut(&self, id: &str) -> Option<&UutConfig> {
        self.uuts.iter().find(|u| u.id == id)
    }

    /// Looks up a port by UUT id and port number.
    pub fn port(&self, uut_id: &str, number: u32) -> Option<&PortConfig> {
        self.uut(uut_id).and_then(|u| u.port(number))
    }
}
