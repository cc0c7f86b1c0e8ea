//! Dynamic BIB selection.
//!
//! A discovered device announces what it is through the EEPROM
//! `ProductDescription`; the mapper turns that string into a BIB id. A
//! static fallback table keyed by device id covers devices with blank or
//! unreadable EEPROMs, and a successful mapping is remembered per FTDI
//! serial for as long as the device stays connected.

use std::collections::HashMap;
use std::sync::Mutex;

/// ProductDescription → BIB id resolution with static fallback.
#[derive(Debug, Default)]
pub struct BibMapper {
    mappings: HashMap<String, String>,
    device_fallback: HashMap<String, String>,
    default_bib: Option<String>,
    resolved: Mutex<HashMap<String, String>>,
}

impl BibMapper {
    /// Creates an empty mapper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `ProductDescription` → BIB id mapping.
    pub fn with_mapping(mut self, product_description: &str, bib_id: &str) -> Self {
        self.mappings
            .insert(product_description.to_owned(), bib_id.to_owned());
        self
    }

    /// Adds a device-id → BIB id fallback entry.
    pub fn with_fallback(mut self, device_id: &str, bib_id: &str) -> Self {
        self.device_fallback
            .insert(device_id.to_owned(), bib_id.to_owned());
        self
    }

    /// Sets the BIB id used when nothing else matches.
    pub fn with_default(mut self, bib_id: &str) -> Self {
        self.default_bib = Some(bib_id.to_owned());
        self
    }

    /// Resolves a BIB id for a device.
    ///
    /// Resolution order: cached result for the serial, the
    /// `ProductDescription` mapping table, the device-id fallback table,
    /// then the static default.
    pub fn map(
        &self,
        product_description: Option<&str>,
        serial: Option<&str>,
        device_id: &str,
    ) -> Option<String> {
        if let Some(serial) = serial {
            if let Some(hit) = self.resolved.lock().unwrap().get(serial) {
                return Some(hit.clone());
            }
        }

        let resolved = product_description
            .and_then(|pd| self.mappings.get(pd))
            .or_else(|| self.device_fallback.get(device_id))
            .or(self.default_bib.as_ref())
            .cloned();

        match (&resolved, serial) {
            (Some(bib_id), Some(serial)) => {
                tracing::debug!(serial = %serial, bib = %bib_id, "BIB mapping resolved");
                self.resolved
                    .lock()
                    .unwrap()
                    .insert(serial.to_owned(), bib_id.clone());
            }
            (None, _) => {
                tracing::warn!(
                    device = %device_id,
                    product = product_description.unwrap_or("-"),
                    "no BIB mapping found"
                );
            }
            _ => {}
        }
        resolved
    }

    /// Forgets the cached mapping of a disconnected device.
    pub fn forget(&self, serial: &str) {
        self.resolved.lock().unwrap().remove(serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn product_description_maps_directly() {
        let mapper = BibMapper::new().with_mapping("client_demo", "client_demo");
        assert_eq!(
            mapper.map(Some("client_demo"), Some("AAA"), "FTDIBUS\\X"),
            Some("client_demo".to_owned())
        );
    }

    #[test]
    fn falls_back_to_device_id_then_default() {
        let mapper = BibMapper::new()
            .with_mapping("known", "bib_known")
            .with_fallback("FTDIBUS\\DEV1", "bib_dev1")
            .with_default("bib_default");

        assert_eq!(
            mapper.map(Some("unknown"), None, "FTDIBUS\\DEV1"),
            Some("bib_dev1".to_owned())
        );
        assert_eq!(
            mapper.map(None, None, "FTDIBUS\\OTHER"),
            Some("bib_default".to_owned())
        );
    }

    #[test]
    fn no_match_without_default_is_none() {
        let mapper = BibMapper::new().with_mapping("known", "bib_known");
        assert_eq!(mapper.map(Some("unknown"), None, "DEV"), None);
    }

    #[test]
    fn successful_mapping_is_cached_per_serial() {
        let mapper = BibMapper::new().with_mapping("client_demo", "client_demo");
        assert!(mapper.map(Some("client_demo"), Some("AAA"), "DEV").is_some());

        // Even with an unreadable EEPROM the cached mapping answers.
        assert_eq!(
            mapper.map(None, Some("AAA"), "DEV"),
            Some("client_demo".to_owned())
        );

        mapper.forget("AAA");
        assert_eq!(mapper.map(None, Some("AAA"), "DEV"), None);
    }
}
