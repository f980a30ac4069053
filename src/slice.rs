//! Tenant slices: the static definitions the hypervisor is configured with
//! and the registry the rest of the core reads them through.

use serde::Deserialize;

use crate::tag::{MAX_PORT_ID, MAX_SLICE_ID};

/// Configuration of one slice, as consumed from the external loader.
#[derive(Debug, Clone, Deserialize)]
pub struct SliceConfig {
    pub id: u8,
    pub controller_host: String,
    pub controller_port: u16,
    pub max_rate_pps: u32,
    #[serde(default, rename = "virtual_switch")]
    pub virtual_switches: Vec<VirtualSwitchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualSwitchConfig {
    pub datapath_id: u64,
    #[serde(default, rename = "port")]
    pub ports: Vec<PortMapConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PortMapConfig {
    pub virtual_port: u32,
    pub physical_datapath_id: u64,
    pub physical_port: u32,
}

/// Check that the configured ids fit the tag fields they get packed into.
pub fn validate(configs: &[SliceConfig]) -> Result<(), String> {
    for slice in configs {
        if slice.id > MAX_SLICE_ID {
            return Err(format!("slice id {} does not fit the tag space", slice.id));
        }
        for virtual_switch in &slice.virtual_switches {
            for port in &virtual_switch.ports {
                if port.virtual_port >= MAX_PORT_ID {
                    return Err(format!(
                        "virtual port {} on switch {:#x} does not fit the tag space",
                        port.virtual_port, virtual_switch.datapath_id
                    ));
                }
                if port.physical_port >= MAX_PORT_ID {
                    return Err(format!(
                        "physical port {} on datapath {:#x} does not fit the tag space",
                        port.physical_port, port.physical_datapath_id
                    ));
                }
            }
        }
    }
    Ok(())
}

/// A tenant namespace: its controller endpoint, its rate cap and the
/// datapath ids of the virtual switches it owns.
#[derive(Debug, Clone)]
pub struct Slice {
    id: u8,
    controller_host: String,
    controller_port: u16,
    max_rate: u32,
    started: bool,
    virtual_switches: Vec<u64>,
}

impl Slice {
    pub fn new(config: &SliceConfig) -> Slice {
        Slice {
            id: config.id,
            controller_host: config.controller_host.clone(),
            controller_port: config.controller_port,
            max_rate: config.max_rate_pps,
            started: true,
            virtual_switches: config
                .virtual_switches
                .iter()
                .map(|vs| vs.datapath_id)
                .collect(),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Maximum packet rate in packets per second, enforced by the per-slice
    /// drop meter.
    pub fn max_rate(&self) -> u32 {
        self.max_rate
    }

    pub fn controller_endpoint(&self) -> (&str, u16) {
        (&self.controller_host, self.controller_port)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn set_started(&mut self, started: bool) {
        self.started = started;
    }

    pub fn virtual_switches(&self) -> &[u64] {
        &self.virtual_switches
    }
}

/// All configured slices. Slices are created at startup and live for the
/// whole process.
#[derive(Debug, Default)]
pub struct SliceRegistry {
    slices: Vec<Slice>,
}

impl SliceRegistry {
    pub fn new(configs: &[SliceConfig]) -> SliceRegistry {
        SliceRegistry {
            slices: configs.iter().map(Slice::new).collect(),
        }
    }

    pub fn get(&self, id: u8) -> Option<&Slice> {
        self.slices.iter().find(|slice| slice.id == id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Slice> {
        self.slices.iter_mut().find(|slice| slice.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slice> {
        self.slices.iter()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice_config() -> SliceConfig {
        SliceConfig {
            id: 0,
            controller_host: "127.0.0.1".to_string(),
            controller_port: 6654,
            max_rate_pps: 1000,
            virtual_switches: vec![VirtualSwitchConfig {
                datapath_id: 0x100,
                ports: vec![PortMapConfig {
                    virtual_port: 1,
                    physical_datapath_id: 0xa,
                    physical_port: 1,
                }],
            }],
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SliceRegistry::new(&[slice_config()]);
        assert_eq!(registry.len(), 1);
        let slice = registry.get(0).unwrap();
        assert_eq!(slice.max_rate(), 1000);
        assert_eq!(slice.controller_endpoint(), ("127.0.0.1", 6654));
        assert!(slice.is_started());
        assert_eq!(slice.virtual_switches(), &[0x100]);
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn test_validation_rejects_oversized_ids() {
        let mut config = slice_config();
        config.id = 64;
        assert!(validate(&[config]).is_err());

        let mut config = slice_config();
        config.virtual_switches[0].ports[0].virtual_port = 63;
        assert!(validate(&[config]).is_err());

        assert!(validate(&[slice_config()]).is_ok());
    }
}
