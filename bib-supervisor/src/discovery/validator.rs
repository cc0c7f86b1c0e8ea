//! Per-port eligibility rules.
//!
//! The validator decides whether a discovered port may be handed out by the
//! pool. It is a pure function of the port snapshot and the active
//! configuration; criterion names are stable strings consumed by tests and
//! logs.

use serde::{Deserialize, Serialize};

use crate::discovery::ftdi::ChipFamily;
use crate::discovery::PortInfo;
use crate::validation::{ValidationLevel, ValidationOutcome};

/// Criterion name: the port must sit behind an FTDI bridge.
pub const CRITERION_IS_FTDI: &str = "is_ftdi";
/// Criterion name: the chip family must be in the allow-list.
pub const CRITERION_CHIP_FAMILY: &str = "chip_family_allowed";
/// Criterion name: the EEPROM blob must have been read from the device.
pub const CRITERION_EEPROM_VALID: &str = "eeprom_valid";
/// Criterion name: the accumulated score must reach the minimum.
pub const CRITERION_MIN_SCORE: &str = "min_score";

const SCORE_FTDI: u8 = 40;
const SCORE_FAMILY: u8 = 40;
const SCORE_EEPROM: u8 = 20;

/// Eligibility rules applied to each discovered port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Ports that are not FTDI-backed are rejected outright.
    pub require_ftdi: bool,
    /// Chip families that score; in strict mode membership is mandatory.
    pub allowed_families: Vec<ChipFamily>,
    /// Minimum score a port must reach to pass.
    pub min_score: u8,
    /// Strict mode: family membership becomes mandatory and Critical-stop
    /// overrides are refused by the orchestrator.
    pub strict: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            require_ftdi: true,
            allowed_families: vec![
                ChipFamily::FT232R,
                ChipFamily::FT2232H,
                ChipFamily::FT4232H,
                ChipFamily::FT232H,
            ],
            min_score: 40,
            strict: false,
        }
    }
}

impl ValidationConfig {
    /// The strict production profile: FT4232H only, EEPROM expected.
    pub fn strict() -> Self {
        Self {
            require_ftdi: true,
            allowed_families: vec![ChipFamily::FT4232H],
            min_score: 80,
            strict: true,
        }
    }

    /// Whether a chip family is on the allow-list.
    pub fn family_allowed(&self, family: Option<ChipFamily>) -> bool {
        family.is_some_and(|f| self.allowed_families.contains(&f))
    }
}

/// Scores a port against the configuration.
///
/// Scoring: +40 if FTDI, +40 if the chip family is allow-listed, +20 if the
/// EEPROM blob is valid. The outcome is Pass iff the score reaches
/// `min_score` and no mandatory criterion failed; otherwise Fail reporting
/// the first violated criterion.
pub fn validate(port: &PortInfo, config: &ValidationConfig) -> ValidationOutcome {
    let mut score = 0u8;
    let mut failed = Vec::new();

    let is_ftdi = port.is_ftdi && port.identity.as_ref().is_some_and(|i| i.is_ftdi());
    if is_ftdi {
        score += SCORE_FTDI;
    } else if config.require_ftdi {
        failed.push(CRITERION_IS_FTDI.to_owned());
    }

    let family = port.identity.as_ref().and_then(|i| i.chip_family);
    if config.family_allowed(family) {
        score += SCORE_FAMILY;
    } else if config.strict {
        failed.push(CRITERION_CHIP_FAMILY.to_owned());
    }

    if port
        .identity
        .as_ref()
        .is_some_and(|i| i.eeprom.is_valid())
    {
        score += SCORE_EEPROM;
    }

    if !failed.is_empty() {
        let first = failed[0].clone();
        let mut outcome =
            ValidationOutcome::fail(format!("criterion '{first}' violated"), failed);
        outcome.score = score;
        return outcome;
    }

    if score < config.min_score {
        let mut outcome = ValidationOutcome::fail(
            format!("score {score} below minimum {}", config.min_score),
            vec![CRITERION_MIN_SCORE.to_owned()],
        );
        outcome.score = score;
        return outcome;
    }

    let mut outcome = ValidationOutcome::pass("port eligible");
    outcome.score = score;
    debug_assert!(outcome.level == ValidationLevel::Pass && outcome.failed_criteria.is_empty());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::enumerator::{fake_ftdi_port, fake_plain_port};
    use pretty_assertions::assert_eq;

    #[test]
    fn ftdi_quad_passes_strict_config() {
        let port = fake_ftdi_port("COM3", "AAA", 0x6011);
        let outcome = validate(&port, &ValidationConfig::strict());
        // FTDI (+40) and family (+40) meet the strict minimum of 80 even
        // with a placeholder EEPROM.
        assert_eq!(outcome.score, 80);
        assert_eq!(outcome.level, ValidationLevel::Pass);
        assert!(outcome.failed_criteria.is_empty());
    }

    #[test]
    fn non_ftdi_port_fails_with_stable_criterion() {
        let port = fake_plain_port("COM9");
        let outcome = validate(&port, &ValidationConfig::default());
        assert_eq!(outcome.level, ValidationLevel::Fail);
        assert_eq!(outcome.failed_criteria[0], CRITERION_IS_FTDI);
    }

    #[test]
    fn wrong_family_fails_only_in_strict_mode() {
        let port = fake_ftdi_port("COM4", "BBB", 0x6001); // FT232R

        let relaxed = ValidationConfig {
            allowed_families: vec![ChipFamily::FT4232H],
            min_score: 40,
            strict: false,
            ..ValidationConfig::default()
        };
        assert_eq!(validate(&port, &relaxed).level, ValidationLevel::Pass);

        let strict = ValidationConfig {
            allowed_families: vec![ChipFamily::FT4232H],
            strict: true,
            ..relaxed
        };
        let outcome = validate(&port, &strict);
        assert_eq!(outcome.level, ValidationLevel::Fail);
        assert_eq!(outcome.failed_criteria[0], CRITERION_CHIP_FAMILY);
    }

    #[test]
    fn score_below_minimum_reports_min_score() {
        let port = fake_ftdi_port("COM5", "CCC", 0x6011);
        let config = ValidationConfig {
            min_score: 90, // EEPROM placeholder caps the score at 80
            ..ValidationConfig::default()
        };
        let outcome = validate(&port, &config);
        assert_eq!(outcome.level, ValidationLevel::Fail);
        assert_eq!(outcome.failed_criteria, vec![CRITERION_MIN_SCORE.to_owned()]);
    }
}
