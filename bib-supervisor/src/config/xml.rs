//! XML configuration loader.
//!
//! One file holds one BIB. Unknown elements are ignored with a warning so
//! newer files keep loading on older supervisors; missing mandatory
//! attributes fail with [`ConfigError::ConfigInvalid`] naming the offending
//! location. All validation patterns are compiled eagerly at load time
//! through the process-wide pattern cache.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use roxmltree::Node;

use crate::config::bib::{
    BibConfiguration, BitBangConfig, DataPattern, Handshake, InputBit, OutputBit, Phase,
    PortConfig, ProtocolCommand, UutConfig, WorkflowControl,
};
use crate::config::ConfigError;
use crate::validation::{LevelRule, ValidationLevel};

/// Loads a BIB configuration from a file.
pub fn load_file(path: &Path) -> Result<BibConfiguration, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::ConfigNotFound(path.to_owned()))
        }
        Err(e) => return Err(e.into()),
    };
    parse_str(&text)
}

/// Parses a BIB configuration from XML text.
pub fn parse_str(text: &str) -> Result<BibConfiguration, ConfigError> {
    let doc = roxmltree::Document::parse(text)?;
    let root = doc.root_element();
    if root.tag_name().name() != "bib" {
        return Err(ConfigError::invalid(
            "/",
            format!("expected root element <bib>, found <{}>", root.tag_name().name()),
        ));
    }

    let id = require_attr(&root, "id", "/bib")?.to_owned();
    let xpath = "/bib".to_owned();

    let mut metadata = BTreeMap::new();
    let mut hardware = None;
    let mut uuts = Vec::new();
    let mut uut_index = 0usize;

    for child in elements(&root) {
        match child.tag_name().name() {
            "metadata" => {
                for entry in elements(&child) {
                    metadata.insert(
                        entry.tag_name().name().to_owned(),
                        entry.text().unwrap_or_default().trim().to_owned(),
                    );
                }
            }
            "hardware_config" => {
                hardware = Some(parse_hardware(&child, &format!("{xpath}/hardware_config"))?);
            }
            "uut" => {
                uut_index += 1;
                uuts.push(parse_uut(&child, &format!("{xpath}/uut[{uut_index}]"))?);
            }
            other => {
                tracing::warn!(element = other, "ignoring unknown element under <bib>");
            }
        }
    }

    if uuts.is_empty() {
        return Err(ConfigError::invalid(&xpath, "a BIB needs at least one <uut>"));
    }

    Ok(BibConfiguration {
        id,
        metadata,
        hardware,
        uuts,
    })
}

fn parse_uut(node: &Node, xpath: &str) -> Result<UutConfig, ConfigError> {
    let id = require_attr(node, "id", xpath)?.to_owned();

    let mut ports = Vec::new();
    let mut port_index = 0usize;
    for child in elements(node) {
        match child.tag_name().name() {
            "port" => {
                port_index += 1;
                ports.push(parse_port(&child, &format!("{xpath}/port[{port_index}]"))?);
            }
            other => tracing::warn!(element = other, "ignoring unknown element under <uut>"),
        }
    }

    if ports.is_empty() {
        return Err(ConfigError::invalid(xpath, "a UUT needs at least one <port>"));
    }
    Ok(UutConfig { id, ports })
}

fn parse_port(node: &Node, xpath: &str) -> Result<PortConfig, ConfigError> {
    let number: u32 = require_attr(node, "number", xpath)?
        .parse()
        .map_err(|_| ConfigError::invalid(format!("{xpath}/@number"), "not a number"))?;

    let mut protocol = "rs232".to_owned();
    let mut speed = 115_200u32;
    let mut data_pattern = DataPattern::N81;
    let mut read_timeout = Duration::from_millis(2000);
    let mut write_timeout = Duration::from_millis(2000);
    let mut handshake = Handshake::None;
    let mut rts_enable = false;
    let mut dtr_enable = false;
    let mut workflow = WorkflowControl::default();
    let mut phases: [Option<ProtocolCommand>; 3] = [None, None, None];

    for child in elements(node) {
        let name = child.tag_name().name();
        let child_path = format!("{xpath}/{name}");
        match name {
            "protocol" => protocol = text_of(&child).to_lowercase(),
            "speed" => {
                speed = text_of(&child)
                    .parse()
                    .map_err(|_| ConfigError::invalid(&child_path, "not a number"))?;
            }
            "data_pattern" => {
                data_pattern = DataPattern::parse(text_of(&child)).ok_or_else(|| {
                    ConfigError::invalid(&child_path, "expected e.g. 'n81'")
                })?;
            }
            "read_timeout" => read_timeout = parse_ms(&child, &child_path)?,
            "write_timeout" => write_timeout = parse_ms(&child, &child_path)?,
            "handshake" => {
                handshake = match text_of(&child).to_lowercase().as_str() {
                    "none" => Handshake::None,
                    "software" | "xonxoff" => Handshake::Software,
                    "hardware" | "rtscts" => Handshake::Hardware,
                    other => {
                        return Err(ConfigError::invalid(
                            &child_path,
                            format!("unknown handshake '{other}'"),
                        ))
                    }
                };
            }
            "rts_enable" => rts_enable = parse_bool_text(&child, &child_path)?,
            "dtr_enable" => dtr_enable = parse_bool_text(&child, &child_path)?,
            "workflow_control" => workflow = parse_workflow(&child, &child_path)?,
            "start" => phases[0] = Some(parse_phase(&child, Phase::Start, &child_path)?),
            "test" => phases[1] = Some(parse_phase(&child, Phase::Test, &child_path)?),
            "stop" => phases[2] = Some(parse_phase(&child, Phase::Stop, &child_path)?),
            other => tracing::warn!(element = other, "ignoring unknown element under <port>"),
        }
    }

    let [start, test, stop] = phases;
    let missing = |phase: &str| ConfigError::invalid(xpath, format!("missing <{phase}> phase"));
    Ok(PortConfig {
        number,
        protocol,
        speed,
        data_pattern,
        read_timeout,
        write_timeout,
        handshake,
        rts_enable,
        dtr_enable,
        workflow,
        start: start.ok_or_else(|| missing("start"))?,
        test: test.ok_or_else(|| missing("test"))?,
        stop: stop.ok_or_else(|| missing("stop"))?,
    })
}

fn parse_workflow(node: &Node, xpath: &str) -> Result<WorkflowControl, ConfigError> {
    let mut control = WorkflowControl::default();
    for child in elements(node) {
        let name = child.tag_name().name();
        let child_path = format!("{xpath}/{name}");
        match name {
            "continue_on_failure" => {
                control.continue_on_failure = parse_bool_text(&child, &child_path)?
            }
            "continue_on_critical" => {
                control.continue_on_critical = parse_bool_text(&child, &child_path)?
            }
            "wait_for_power_on_ready" => {
                control.wait_for_power_on_ready = parse_bool_text(&child, &child_path)?
            }
            "power_on_ready_timeout_ms" => {
                control.power_on_ready_timeout = parse_ms(&child, &child_path)?
            }
            other => {
                tracing::warn!(element = other, "ignoring unknown element under <workflow_control>")
            }
        }
    }
    Ok(control)
}

fn parse_phase(node: &Node, phase: Phase, xpath: &str) -> Result<ProtocolCommand, ConfigError> {
    let timeout_ms: u64 = match node.attribute("timeout_ms") {
        Some(text) => text
            .parse()
            .map_err(|_| ConfigError::invalid(format!("{xpath}/@timeout_ms"), "not a number"))?,
        None => 2000,
    };
    if timeout_ms == 0 {
        return Err(ConfigError::invalid(
            format!("{xpath}/@timeout_ms"),
            "a phase timeout of 0 is not allowed",
        ));
    }
    let retry_count: u32 = match node.attribute("retry_count") {
        Some(text) => text
            .parse()
            .map_err(|_| ConfigError::invalid(format!("{xpath}/@retry_count"), "not a number"))?,
        None => 0,
    };
    let continue_on_failure = attr_bool(node, "continue_on_failure", xpath)?.unwrap_or(false);

    let mut command = None;
    let mut pass_rule = None;
    let mut extra_rules: Vec<LevelRule> = Vec::new();

    for child in elements(node) {
        let name = child.tag_name().name();
        let child_path = format!("{xpath}/{name}");
        match name {
            "command" => {
                let mut bytes = text_of(&child).as_bytes().to_vec();
                // Commands are line oriented unless the file says otherwise.
                if child.attribute("eol") != Some("none") {
                    bytes.extend_from_slice(b"\r\n");
                }
                command = Some(bytes);
            }
            "expected_response" => {
                let is_regex = attr_bool(&child, "regex", &child_path)?.unwrap_or(false);
                let ignore_case = attr_bool(&child, "ignore_case", &child_path)?.unwrap_or(false);
                pass_rule = Some(
                    LevelRule::new(ValidationLevel::Pass, text_of(&child), is_regex, ignore_case)
                        .map_err(|e| {
                            ConfigError::invalid(&child_path, format!("bad pattern: {e}"))
                        })?,
                );
            }
            "validation_levels" => {
                for level_node in elements(&child) {
                    let rule = parse_level(&level_node, &child_path)?;
                    if extra_rules.iter().any(|r| r.level == rule.level) {
                        return Err(ConfigError::invalid(
                            &child_path,
                            format!("duplicate {} level", rule.level),
                        ));
                    }
                    extra_rules.push(rule);
                }
            }
            other => tracing::warn!(
                element = other,
                phase = %phase,
                "ignoring unknown element in phase"
            ),
        }
    }

    let mut rules = Vec::with_capacity(extra_rules.len() + 1);
    // A phase with only <expected_response> is one with a single Pass rule.
    if let Some(pass) = pass_rule {
        if extra_rules.iter().any(|r| r.level == ValidationLevel::Pass) {
            return Err(ConfigError::invalid(
                xpath,
                "both <expected_response> and a pass level are defined",
            ));
        }
        rules.push(pass);
    }
    rules.extend(extra_rules);
    if rules.is_empty() {
        return Err(ConfigError::invalid(
            xpath,
            "a phase needs <expected_response> or <validation_levels>",
        ));
    }

    Ok(ProtocolCommand {
        command: command
            .ok_or_else(|| ConfigError::invalid(xpath, "missing <command>"))?,
        rules,
        timeout: Duration::from_millis(timeout_ms),
        retry_count,
        continue_on_failure,
    })
}

fn parse_level(node: &Node, xpath: &str) -> Result<LevelRule, ConfigError> {
    let name = node.tag_name().name();
    let child_path = format!("{xpath}/{name}");
    let level = match name {
        "pass" => ValidationLevel::Pass,
        "warn" => ValidationLevel::Warn,
        "fail" => ValidationLevel::Fail,
        "critical" => ValidationLevel::Critical,
        other => {
            return Err(ConfigError::invalid(
                &child_path,
                format!("unknown validation level '{other}'"),
            ))
        }
    };

    let is_regex = attr_bool(node, "regex", &child_path)?.unwrap_or(false);
    let ignore_case = attr_bool(node, "ignore_case", &child_path)?.unwrap_or(false);
    let mut rule = LevelRule::new(level, text_of(node), is_regex, ignore_case)
        .map_err(|e| ConfigError::invalid(&child_path, format!("bad pattern: {e}")))?;
    rule.trigger_hardware = attr_bool(node, "trigger_hardware", &child_path)?.unwrap_or(false);
    rule.stop_workflow = attr_bool(node, "stop_workflow", &child_path)?;
    rule.continue_on_failure = attr_bool(node, "continue_on_failure", &child_path)?;
    Ok(rule)
}

fn parse_hardware(node: &Node, xpath: &str) -> Result<BitBangConfig, ConfigError> {
    let mut config = BitBangConfig::default();

    for proto in elements(node) {
        if proto.tag_name().name() != "bit_bang_protocol" {
            tracing::warn!(
                element = proto.tag_name().name(),
                "ignoring unknown element under <hardware_config>"
            );
            continue;
        }
        let proto_path = format!("{xpath}/bit_bang_protocol");
        config.enabled = attr_bool(&proto, "enabled", &proto_path)?.unwrap_or(true);

        for child in elements(&proto) {
            let name = child.tag_name().name();
            let child_path = format!("{proto_path}/{name}");
            match name {
                "device_id" => config.device_id = Some(text_of(&child).to_owned()),
                "serial" => config.serial = Some(text_of(&child).to_owned()),
                "input_bits" => {
                    for (i, bit) in elements(&child).enumerate() {
                        let bit_path = format!("{child_path}/bit[{}]", i + 1);
                        config.inputs.push(InputBit {
                            name: require_attr(&bit, "name", &bit_path)?.to_owned(),
                            bit: parse_bit_attr(&bit, &bit_path)?,
                            active_low: attr_bool(&bit, "active_low", &bit_path)?
                                .unwrap_or(false),
                            debounce: Duration::from_millis(
                                attr_u64(&bit, "debounce_ms", &bit_path)?.unwrap_or(50),
                            ),
                        });
                    }
                }
                "output_bits" => {
                    for (i, bit) in elements(&child).enumerate() {
                        let bit_path = format!("{child_path}/bit[{}]", i + 1);
                        config.outputs.push(OutputBit {
                            name: require_attr(&bit, "name", &bit_path)?.to_owned(),
                            bit: parse_bit_attr(&bit, &bit_path)?,
                            active_low: attr_bool(&bit, "active_low", &bit_path)?
                                .unwrap_or(false),
                            pulse_width: attr_u64(&bit, "pulse_width_ms", &bit_path)?
                                .map(Duration::from_millis),
                        });
                    }
                }
                "timing" => {
                    if let Some(ms) = attr_u64(&child, "polling_interval_ms", &child_path)? {
                        config.polling_interval = Duration::from_millis(ms);
                    }
                    if let Some(ms) = attr_u64(&child, "signal_hold_ms", &child_path)? {
                        config.signal_hold = Duration::from_millis(ms);
                    }
                    if let Some(auto) = attr_bool(&child, "auto_clear", &child_path)? {
                        config.auto_clear = auto;
                    }
                }
                other => tracing::warn!(
                    element = other,
                    "ignoring unknown element under <bit_bang_protocol>"
                ),
            }
        }
    }
    Ok(config)
}

fn elements<'a, 'input>(node: &Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn text_of<'a>(node: &Node<'a, '_>) -> &'a str {
    node.text().unwrap_or_default().trim()
}

fn require_attr<'a>(node: &Node<'a, '_>, name: &str, xpath: &str) -> Result<&'a str, ConfigError> {
    node.attribute(name)
        .ok_or_else(|| ConfigError::invalid(format!("{xpath}/@{name}"), "missing attribute"))
}

fn attr_bool(node: &Node, name: &str, xpath: &str) -> Result<Option<bool>, ConfigError> {
    match node.attribute(name) {
        None => Ok(None),
        Some("true") | Some("1") => Ok(Some(true)),
        Some("false") | Some("0") => Ok(Some(false)),
        Some(other) => Err(ConfigError::invalid(
            format!("{xpath}/@{name}"),
            format!("expected true/false, found '{other}'"),
        )),
    }
}

fn attr_u64(node: &Node, name: &str, xpath: &str) -> Result<Option<u64>, ConfigError> {
    match node.attribute(name) {
        None => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(format!("{xpath}/@{name}"), "not a number")),
    }
}

fn parse_bit_attr(node: &Node, xpath: &str) -> Result<u8, ConfigError> {
    let value = attr_u64(node, "bit", xpath)?
        .ok_or_else(|| ConfigError::invalid(format!("{xpath}/@bit"), "missing attribute"))?;
    if value > 7 {
        return Err(ConfigError::invalid(
            format!("{xpath}/@bit"),
            "bit positions are 0..=7",
        ));
    }
    Ok(value as u8)
}

fn parse_ms(node: &Node, xpath: &str) -> Result<Duration, ConfigError> {
    text_of(node)
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::invalid(xpath, "not a number of milliseconds"))
}

fn parse_bool_text(node: &Node, xpath: &str) -> Result<bool, ConfigError> {
    match text_of(node) {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ConfigError::invalid(
            xpath,
            format!("expected true/false, found '{other}'"),
        )),
    }
}
