//! Clustering ports into physical devices.
//!
//! A multi-port FTDI chip enumerates as several serial ports that share one
//! serial number. The analyzer partitions a port snapshot by that key and
//! produces one [`DeviceGroup`] per physical device. Grouping is a pure
//! function of the snapshot; groups hold indices into it instead of
//! back-pointers.

use std::collections::{BTreeMap, HashMap};

use crate::discovery::cache::SystemInfo;
use crate::discovery::ftdi::FtdiIdentity;
use crate::discovery::validator::ValidationConfig;
use crate::discovery::PortInfo;

/// One physical device: every port that shares its grouping key.
#[derive(Debug, Clone)]
pub struct DeviceGroup {
    /// Device id: the FTDI serial for FTDI devices, else the OS device id.
    pub device_id: String,
    /// Indices into the snapshot's port list, ordered by port name.
    pub ports: Vec<usize>,
    /// The shared FTDI identity, when the device is FTDI-backed.
    pub identity: Option<FtdiIdentity>,
    /// Whether the device exposes more than one port.
    pub is_multi_port: bool,
    /// Whether the device is an FTDI chip of an allow-listed family.
    pub is_client_valid: bool,
    /// The enrichment shared by every member port, when they all agree.
    pub shared_system_info: Option<SystemInfo>,
}

impl DeviceGroup {
    /// Number of ports in the group.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}

/// A discovery snapshot together with its device partition.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    /// The port snapshot the groups index into.
    pub ports: Vec<PortInfo>,
    /// Device groups, ordered by device id.
    pub groups: Vec<DeviceGroup>,
}

impl GroupSnapshot {
    /// The member ports of a group, in group order.
    pub fn ports_of<'a>(&'a self, group: &'a DeviceGroup) -> impl Iterator<Item = &'a PortInfo> {
        group.ports.iter().map(|&i| &self.ports[i])
    }

    /// Looks up a group by device id.
    pub fn group(&self, device_id: &str) -> Option<&DeviceGroup> {
        self.groups.iter().find(|g| g.device_id == device_id)
    }
}

/// Partitions a port snapshot into device groups.
///
/// `system_info` supplies per-port enrichment (typically from the
/// [`crate::discovery::SystemInfoCache`]); pass an empty map when
/// enrichment is unavailable.
pub fn analyze(
    ports: Vec<PortInfo>,
    config: &ValidationConfig,
    system_info: &HashMap<String, SystemInfo>,
) -> GroupSnapshot {
    // BTreeMap keeps group order independent of enumeration order.
    let mut partitions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, port) in ports.iter().enumerate() {
        partitions
            .entry(port.grouping_key().to_owned())
            .or_default()
            .push(index);
    }

    let mut groups = Vec::with_capacity(partitions.len());
    for (device_id, mut members) in partitions {
        members.sort_by(|&a, &b| ports[a].port_name.cmp(&ports[b].port_name));

        let identity = ports[members[0]].identity.clone();
        let is_client_valid = ports[members[0]].is_ftdi
            && config.family_allowed(identity.as_ref().and_then(|i| i.chip_family));

        let shared_system_info = shared_info(&ports, &members, system_info);

        groups.push(DeviceGroup {
            is_multi_port: members.len() > 1,
            device_id,
            ports: members,
            identity,
            is_client_valid,
            shared_system_info,
        });
    }

    GroupSnapshot { ports, groups }
}

/// The enrichment shared by all member ports: present only when every port
/// has valid info agreeing on the serial number.
fn shared_info(
    ports: &[PortInfo],
    members: &[usize],
    system_info: &HashMap<String, SystemInfo>,
) -> Option<SystemInfo> {
    let mut shared: Option<SystemInfo> = None;
    for &index in members {
        let info = system_info.get(&ports[index].port_name)?;
        if !info.is_data_valid {
            return None;
        }
        match &shared {
            None => shared = Some(info.clone()),
            Some(existing) if existing.serial_number == info.serial_number => {}
            Some(_) => return None,
        }
    }
    shared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::cache::SystemInfoCache;
    use crate::discovery::enumerator::{fake_ftdi_port, fake_plain_port};
    use crate::discovery::ftdi::FakeEepromReader;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn two_quads() -> Vec<PortInfo> {
        vec![
            fake_ftdi_port("COM10", "AAA", 0x6011),
            fake_ftdi_port("COM11", "AAA", 0x6011),
            fake_ftdi_port("COM12", "AAA", 0x6011),
            fake_ftdi_port("COM13", "AAA", 0x6011),
            fake_ftdi_port("COM20", "BBB", 0x6011),
            fake_ftdi_port("COM21", "BBB", 0x6011),
            fake_ftdi_port("COM22", "BBB", 0x6011),
            fake_ftdi_port("COM23", "BBB", 0x6011),
        ]
    }

    #[test]
    fn two_quad_chips_form_two_groups() {
        let snapshot = analyze(two_quads(), &ValidationConfig::strict(), &HashMap::new());
        assert_eq!(snapshot.groups.len(), 2);
        for group in &snapshot.groups {
            assert!(group.is_multi_port);
            assert_eq!(group.port_count(), 4);
            assert!(group.is_client_valid);
        }
        assert!(snapshot.group("AAA").is_some());
        assert!(snapshot.group("BBB").is_some());
    }

    #[test]
    fn every_port_belongs_to_exactly_one_group() {
        let mut ports = two_quads();
        ports.push(fake_plain_port("COM30"));
        let count = ports.len();
        let snapshot = analyze(ports, &ValidationConfig::default(), &HashMap::new());

        let total: usize = snapshot.groups.iter().map(DeviceGroup::port_count).sum();
        assert_eq!(total, count);

        let mut seen = std::collections::HashSet::new();
        for group in &snapshot.groups {
            assert!(!group.ports.is_empty());
            for &index in &group.ports {
                assert!(seen.insert(index), "port {index} appears in two groups");
            }
        }
    }

    #[test]
    fn grouping_is_stable_under_snapshot_reordering() {
        let mut reordered = two_quads();
        reordered.reverse();
        let a = analyze(two_quads(), &ValidationConfig::strict(), &HashMap::new());
        let b = analyze(reordered, &ValidationConfig::strict(), &HashMap::new());

        let names = |s: &GroupSnapshot| {
            s.groups
                .iter()
                .map(|g| {
                    (
                        g.device_id.clone(),
                        s.ports_of(g).map(|p| p.port_name.clone()).collect::<Vec<_>>(),
                    )
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn non_ftdi_port_groups_by_device_id() {
        let snapshot = analyze(
            vec![fake_plain_port("COM30")],
            &ValidationConfig::default(),
            &HashMap::new(),
        );
        assert_eq!(snapshot.groups.len(), 1);
        let group = &snapshot.groups[0];
        assert_eq!(group.device_id, "COM30");
        assert!(!group.is_multi_port);
        assert!(!group.is_client_valid);
    }

    #[test]
    fn shared_system_info_requires_agreement() {
        let reader = Arc::new(FakeEepromReader::new());
        reader.insert("AAA", "client_demo");
        let cache = SystemInfoCache::new(reader);

        let ports = vec![
            fake_ftdi_port("COM10", "AAA", 0x6011),
            fake_ftdi_port("COM11", "AAA", 0x6011),
        ];
        let infos: HashMap<_, _> = ports
            .iter()
            .map(|p| (p.port_name.clone(), cache.get(p, false)))
            .collect();

        let snapshot = analyze(ports, &ValidationConfig::strict(), &infos);
        let group = snapshot.group("AAA").unwrap();
        let shared = group.shared_system_info.as_ref().unwrap();
        assert_eq!(shared.product_description.as_deref(), Some("client_demo"));

        // Without enrichment there is nothing shared.
        let bare = analyze(
            vec![fake_ftdi_port("COM10", "AAA", 0x6011)],
            &ValidationConfig::strict(),
            &HashMap::new(),
        );
        assert!(bare.group("AAA").unwrap().shared_system_info.is_none());
    }
}
