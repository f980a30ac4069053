//! The tag codec.
//!
//! Two tag families share the 12-bit VLAN id. Port tags carry
//! `(slice, tenant port)` for packets crossing a shared link between managed
//! switches; switch tags carry the destination switch id for packets in
//! transit, marked by the reserved port field value `MAX_PORT_ID`. The
//! 64-bit pipeline metadata register carries the group-taken flag and the
//! virtual-switch id between the hypervisor tables and the tenant tables.

use crate::bits::make_mask;
use crate::message::{Action, Instruction, Mask, Match};

pub const SLICE_BITS: u32 = 6;
pub const PORT_BITS: u32 = 6;

/// Reserved value of the port field marking a switch-scoped tag.
pub const MAX_PORT_ID: u32 = (1 << PORT_BITS) - 1;
pub const MAX_SLICE_ID: u8 = (1 << SLICE_BITS) - 1;

/// The present bit OpenFlow 1.3 requires in a VLAN id match on tagged
/// packets.
pub const OFPVID_PRESENT: u16 = 0x1000;

/// Metadata bits carrying the virtual-switch id.
pub const VIRTUAL_SWITCH_BITS: u32 = 12;
/// Bits of metadata claimed by the hypervisor: the group-taken flag plus the
/// virtual-switch id. Tenant metadata is shifted up by this amount.
pub const METADATA_TAG_BITS: u32 = VIRTUAL_SWITCH_BITS + 1;

/// A decoded VLAN id field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanTag {
    Port { slice: u8, port: u8 },
    Switch { switch_id: u8 },
}

impl VlanTag {
    /// Decode the 12-bit VLAN id of an OXM field; the present bit and
    /// anything above it are ignored.
    pub fn decode(vid: u16) -> VlanTag {
        let vid = vid & 0x0fff;
        let port = (u32::from(vid) >> SLICE_BITS) & MAX_PORT_ID;
        let low = (u32::from(vid) & MAX_PORT_ID) as u8;
        if port == MAX_PORT_ID {
            VlanTag::Switch { switch_id: low }
        } else {
            VlanTag::Port {
                slice: low,
                port: port as u8,
            }
        }
    }
}

/// A `(slice, port)` VLAN tag under construction. Fields left unset match
/// (or rewrite) nothing, so a tag with only the port set matches that port
/// in every slice.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortVlanTag {
    slice: Option<u8>,
    port: Option<u8>,
}

impl PortVlanTag {
    pub fn new() -> PortVlanTag {
        PortVlanTag::default()
    }

    pub fn set_slice(&mut self, slice: u8) {
        self.slice = Some(slice & MAX_SLICE_ID);
    }

    /// Set the port field. Values are truncated to the tag width; passing
    /// `MAX_PORT_ID` turns this into the shared-link form of the tag.
    pub fn set_port(&mut self, port: u32) {
        self.port = Some((port & MAX_PORT_ID) as u8);
    }

    fn value_and_mask(&self) -> (u16, u16) {
        let mut value = 0u16;
        let mut mask = 0u16;
        if let Some(slice) = self.slice {
            value |= u16::from(slice);
            mask |= make_mask(SLICE_BITS) as u16;
        }
        if let Some(port) = self.port {
            value |= u16::from(port) << SLICE_BITS;
            mask |= (make_mask(PORT_BITS) as u16) << SLICE_BITS;
        }
        (value, mask)
    }

    /// Add a VLAN id match for this tag; a partially set tag becomes a
    /// masked match.
    pub fn add_to_match(&self, m: &mut Match) {
        let (value, mask) = self.value_and_mask();
        if mask == 0x0fff {
            m.vlan_vid = Some(Mask {
                value: value | OFPVID_PRESENT,
                mask: None,
            });
        } else {
            m.vlan_vid = Some(Mask {
                value: value | OFPVID_PRESENT,
                mask: Some(mask | OFPVID_PRESENT),
            });
        }
    }

    /// Add a set-field rewriting this tag onto the packet. A partially set
    /// tag becomes a masked set-field touching only its own bits.
    pub fn add_to_actions(&self, actions: &mut Vec<Action>) {
        let (value, mask) = self.value_and_mask();
        if mask == 0x0fff {
            actions.push(Action::SetVlanVid {
                vid: value | OFPVID_PRESENT,
                mask: None,
            });
        } else {
            actions.push(Action::SetVlanVid {
                vid: value,
                mask: Some(mask),
            });
        }
    }
}

/// A switch-scoped VLAN tag: the reserved port field plus the destination
/// switch id in the slice bits.
#[derive(Debug, Clone, Copy)]
pub struct SwitchVlanTag {
    switch_id: u8,
}

impl SwitchVlanTag {
    pub fn new(switch_id: u32) -> SwitchVlanTag {
        SwitchVlanTag {
            switch_id: (switch_id as u64 & make_mask(SLICE_BITS)) as u8,
        }
    }

    fn value(&self) -> u16 {
        u16::from(self.switch_id) | ((MAX_PORT_ID as u16) << SLICE_BITS)
    }

    pub fn add_to_match(&self, m: &mut Match) {
        m.vlan_vid = Some(Mask {
            value: self.value() | OFPVID_PRESENT,
            mask: None,
        });
    }

    pub fn add_to_actions(&self, actions: &mut Vec<Action>) {
        actions.push(Action::SetVlanVid {
            vid: self.value() | OFPVID_PRESENT,
            mask: None,
        });
    }
}

/// The pipeline-metadata tag: bit 0 is the group-taken flag, the next
/// `VIRTUAL_SWITCH_BITS` bits carry the virtual-switch id. The remaining
/// high bits belong to the (shifted) tenant metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataTag {
    group: Option<bool>,
    virtual_switch: Option<u32>,
}

impl MetadataTag {
    pub fn new() -> MetadataTag {
        MetadataTag::default()
    }

    pub fn set_group(&mut self, group: bool) {
        self.group = Some(group);
    }

    pub fn set_virtual_switch(&mut self, virtual_switch: u32) {
        self.virtual_switch = Some(virtual_switch);
    }

    fn value_and_mask(&self) -> (u64, u64) {
        let mut value = 0u64;
        let mut mask = 0u64;
        if let Some(group) = self.group {
            value |= group as u64;
            mask |= 1;
        }
        if let Some(virtual_switch) = self.virtual_switch {
            value |= (u64::from(virtual_switch) & make_mask(VIRTUAL_SWITCH_BITS)) << 1;
            mask |= make_mask(VIRTUAL_SWITCH_BITS) << 1;
        }
        (value, mask)
    }

    /// Add a masked metadata match for the set fields.
    pub fn add_to_match(&self, m: &mut Match) {
        let (value, mask) = self.value_and_mask();
        m.metadata = Some(Mask {
            value,
            mask: Some(mask),
        });
    }

    /// Add a write-metadata instruction for the set fields.
    pub fn add_to_instructions(&self, instructions: &mut Vec<Instruction>) {
        let (value, mask) = self.value_and_mask();
        instructions.push(Instruction::WriteMetadata {
            metadata: value,
            mask,
        });
    }

    /// The `(group, virtual switch)` encoded in a metadata value.
    pub fn decode(metadata: u64) -> (bool, u32) {
        let group = metadata & 1 == 1;
        let virtual_switch = ((metadata >> 1) & make_mask(VIRTUAL_SWITCH_BITS)) as u32;
        (group, virtual_switch)
    }
}

/// Whether a tenant-supplied metadata mask touches the bits that would be
/// shifted out of the register to make room for the hypervisor tag.
pub fn mask_uses_reserved_bits(mask: u64) -> bool {
    let reserved = make_mask(METADATA_TAG_BITS) << (64 - METADATA_TAG_BITS);
    mask & reserved != 0
}
