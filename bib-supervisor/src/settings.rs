//! Startup settings of the supervisor.
//!
//! Settings merge three layers, last one wins: built-in defaults, an
//! optional `Supervisor.toml` next to the working directory, and the
//! environment variables `WatchDirectory`, `DebounceDelayMs`,
//! `AutoExecuteOnDiscovery` and `PerformInitialDiscovery`.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::config::watcher::WatcherSettings;

/// Supervisor startup settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Directory watched for `bib_*.xml` configuration files.
    pub watch_directory: PathBuf,
    /// Debounce window applied to raw filesystem events, in milliseconds.
    pub debounce_delay_ms: u64,
    /// Run a workflow for every (UUT, port) of a newly loaded BIB.
    pub auto_execute_on_discovery: bool,
    /// Scan the watch directory for pre-existing files at startup.
    pub perform_initial_discovery: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            watch_directory: PathBuf::from("configuration"),
            debounce_delay_ms: 500,
            auto_execute_on_discovery: false,
            perform_initial_discovery: true,
        }
    }
}

impl SupervisorSettings {
    /// Loads settings from defaults, `Supervisor.toml` and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// The figment the settings are extracted from; exposed so hosts can
    /// stack their own providers on top.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("Supervisor.toml"))
            .merge(Self::env_provider())
    }

    fn env_provider() -> Env {
        Env::raw()
            .only(&[
                "WatchDirectory",
                "DebounceDelayMs",
                "AutoExecuteOnDiscovery",
                "PerformInitialDiscovery",
            ])
            .map(|key| {
                let key = key.as_str();
                let mapped = if key.eq_ignore_ascii_case("WatchDirectory") {
                    "watch_directory"
                } else if key.eq_ignore_ascii_case("DebounceDelayMs") {
                    "debounce_delay_ms"
                } else if key.eq_ignore_ascii_case("AutoExecuteOnDiscovery") {
                    "auto_execute_on_discovery"
                } else if key.eq_ignore_ascii_case("PerformInitialDiscovery") {
                    "perform_initial_discovery"
                } else {
                    key
                };
                mapped.to_owned().into()
            })
    }

    /// The watcher's view of these settings.
    pub fn watcher(&self) -> WatcherSettings {
        WatcherSettings {
            watch_directory: self.watch_directory.clone(),
            debounce_delay: Duration::from_millis(self.debounce_delay_ms),
            auto_execute_on_discovery: self.auto_execute_on_discovery,
            perform_initial_discovery: self.perform_initial_discovery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_sane() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.watch_directory, PathBuf::from("configuration"));
        assert_eq!(settings.debounce_delay_ms, 500);
        assert!(!settings.auto_execute_on_discovery);
        assert!(settings.perform_initial_discovery);
    }

    #[test]
    fn environment_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("WatchDirectory", "/etc/bib");
            jail.set_env("DebounceDelayMs", "250");
            jail.set_env("AutoExecuteOnDiscovery", "true");

            let settings: SupervisorSettings = SupervisorSettings::figment().extract()?;
            assert_eq!(settings.watch_directory, PathBuf::from("/etc/bib"));
            assert_eq!(settings.debounce_delay_ms, 250);
            assert!(settings.auto_execute_on_discovery);
            assert!(settings.perform_initial_discovery);
            Ok(())
        });
    }

    #[test]
    fn toml_profile_sits_between_defaults_and_environment() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "Supervisor.toml",
                r#"
                    watch_directory = "/opt/benches"
                    debounce_delay_ms = 100
                "#,
            )?;
            jail.set_env("DebounceDelayMs", "750");

            let settings: SupervisorSettings = SupervisorSettings::figment().extract()?;
            assert_eq!(settings.watch_directory, PathBuf::from("/opt/benches"));
            assert_eq!(settings.debounce_delay_ms, 750);
            Ok(())
        });
    }

    #[test]
    fn watcher_settings_convert_units() {
        let settings = SupervisorSettings {
            debounce_delay_ms: 200,
            ..SupervisorSettings::default()
        };
        let watcher = settings.watcher();
        assert_eq!(watcher.debounce_delay, Duration::from_millis(200));
    }
}
