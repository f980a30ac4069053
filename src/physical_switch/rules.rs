//! The rule installer: the static rule set a switch gets once at startup,
//! the dynamic rules that track topology and port interest, and the
//! rewriting of tenant flow-mods into the shared pipeline.

use log::info;

use super::{
    ForwardGroup, ForwardGroupState, OutputGroup, OutputGroupState, PhysicalSwitch,
    PortRuleState, SwitchId,
};
use crate::bits::make_mask;
use crate::hypervisor::Hypervisor;
use crate::message::{
    Action, BadActionCode, BadInstructionCode, BadMatchCode, Bucket, ErrorMsg, FlowMod,
    FlowModCmd, GroupMod, GroupModCmd, GroupModFailedCode, GroupType, Instruction, Mask, Message,
    MeterBand, MeterMod, MeterModCmd, OfpPort, ALL_TABLES, OFPG_ANY, OFPMF_PKTPS, OFP_NO_BUFFER,
};
use crate::tag::{
    self, MetadataTag, PortVlanTag, SwitchVlanTag, MAX_PORT_ID, METADATA_TAG_BITS,
    VIRTUAL_SWITCH_BITS,
};
use crate::topology::{self, INFINITE};
use crate::virtual_switch::VirtualSwitch;

/// The highest table id a tenant rule may name, leaving room for the shift
/// past the two hypervisor tables.
const MAX_TENANT_TABLE: u8 = 0xfe - 2;

/// Why a tenant message could not be rewritten into the shared pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RewriteError {
    ReservedMetadataBits,
    UnsupportedInstruction,
    BadTableId,
    UnsupportedAction,
    UnknownPort(u32),
    UnknownInPort(u32),
    UnknownGroup(u32),
    GroupTypeUnsupported,
}

impl RewriteError {
    /// The OpenFlow error sent back to the tenant for this rejection.
    pub(crate) fn to_error_msg(self, data: Vec<u8>) -> ErrorMsg {
        match self {
            RewriteError::ReservedMetadataBits => {
                ErrorMsg::bad_instruction(BadInstructionCode::UnsupMetadataMask, data)
            }
            RewriteError::UnsupportedInstruction => {
                ErrorMsg::bad_instruction(BadInstructionCode::UnsupInst, data)
            }
            RewriteError::BadTableId => {
                ErrorMsg::bad_instruction(BadInstructionCode::BadTableId, data)
            }
            RewriteError::UnsupportedAction => ErrorMsg::bad_action(BadActionCode::BadType, data),
            RewriteError::UnknownPort(_) => ErrorMsg::bad_action(BadActionCode::BadOutPort, data),
            RewriteError::UnknownInPort(_) => ErrorMsg::bad_match(BadMatchCode::BadValue, data),
            RewriteError::UnknownGroup(_) => {
                ErrorMsg::bad_action(BadActionCode::BadOutGroup, data)
            }
            RewriteError::GroupTypeUnsupported => {
                ErrorMsg::group_mod_failed(GroupModFailedCode::InvalidGroup, data)
            }
        }
    }
}

impl PhysicalSwitch {
    /// Install the rules that live for the whole session.
    pub(crate) fn create_static_rules(&mut self, hypervisor: &Hypervisor) {
        self.make_topology_discovery_rule();

        // Error detection rules: traffic missing every rule in the
        // hypervisor tables surfaces at the controller with a recognizable
        // cookie.
        let mut trap = FlowMod {
            cookie: 2,
            ..FlowMod::new(FlowModCmd::AddFlow)
        };
        trap.instructions.push(Instruction::WriteActions(vec![Action::output(
            OfpPort::OFPPController as u32,
        )]));
        self.send(Message::FlowMod(trap.clone()));
        trap.table_id = 1;
        trap.cookie = 3;
        self.send(Message::FlowMod(trap));

        // Packets the hypervisor injects are handled as if they arrived
        // over a shared link.
        let mut loopback = FlowMod {
            priority: 10,
            cookie: u64::from(OfpPort::OFPPController as u32),
            ..FlowMod::new(FlowModCmd::AddFlow)
        };
        loopback.pattern.in_port = Some(OfpPort::OFPPController as u32);
        loopback.instructions.push(Instruction::GotoTable(1));
        self.send(Message::FlowMod(loopback));

        // The per-slice rate caps. Meter ids start at 1.
        for slice in hypervisor.slices().iter() {
            self.send(Message::MeterMod(MeterMod {
                command: MeterModCmd::Add,
                flags: OFPMF_PKTPS,
                meter_id: u32::from(slice.id()) + 1,
                bands: vec![MeterBand::Drop {
                    rate: slice.max_rate(),
                    // Burst needs to be 0 unless the burst flag is used.
                    burst_size: 0,
                }],
            }));
        }

        // The group that hands a packet back to the controller.
        self.send(Message::GroupMod(GroupMod {
            command: GroupModCmd::Add,
            group_type: GroupType::Indirect,
            group_id: 0,
            buckets: vec![Bucket::indirect(vec![Action::output(
                OfpPort::OFPPController as u32,
            )])],
        }));
    }

    fn make_topology_discovery_rule(&mut self) {
        let mut flowmod = FlowMod {
            priority: 50,
            cookie: 1,
            ..FlowMod::new(FlowModCmd::AddFlow)
        };
        flowmod.pattern.eth_type = Some(topology::PROBE_ETH_TYPE);
        flowmod.instructions.push(Instruction::WriteActions(vec![Action::output(
            OfpPort::OFPPController as u32,
        )]));
        self.send(Message::FlowMod(flowmod));
    }

    /// Bring the installed dynamic rules in line with the current topology
    /// and port-interest state. No-op updates are suppressed by comparing
    /// against the recorded per-port and per-group state.
    pub fn update_dynamic_rules(&mut self, hypervisor: &Hypervisor) {
        info!("{} updating dynamic flow rules", self);

        // Two rule sets per port: table 0 priority 10 decides what happens
        // to packets arriving over it, table 1 priority 10 decides how
        // packets tagged for it leave.
        let mut port_nos: Vec<u32> = self.ports.keys().copied().collect();
        port_nos.sort_unstable();
        for port_no in port_nos {
            let has_link = self
                .ports
                .get(&port_no)
                .and_then(|port| port.link)
                .is_some();
            let (current_state, host_switch) = if has_link {
                (PortRuleState::LinkRule, None)
            } else {
                // A port can only be a host port if exactly one virtual
                // switch is interested in it and it has no link.
                let live = self.live_interested(hypervisor, port_no);
                if live.len() == 1 {
                    (PortRuleState::HostRule, Some(live[0]))
                } else {
                    (PortRuleState::DropRule, None)
                }
            };

            let prev_state = self
                .ports
                .get(&port_no)
                .map(|port| port.state)
                .unwrap_or(PortRuleState::NoRule);
            if prev_state == current_state {
                continue;
            }
            let command = if prev_state == PortRuleState::NoRule {
                FlowModCmd::AddFlow
            } else {
                FlowModCmd::ModFlow
            };
            let table1_installed = matches!(
                prev_state,
                PortRuleState::LinkRule | PortRuleState::HostRule
            );
            if let Some(port) = self.ports.get_mut(&port_no) {
                port.state = current_state;
            }

            info!(
                "{} updating port rule for port {} to {}",
                self, port_no, current_state
            );

            let mut flowmod_0 = FlowMod {
                priority: 10,
                cookie: u64::from(port_no),
                ..FlowMod::new(command)
            };
            flowmod_0.pattern.in_port = Some(port_no);
            match current_state {
                PortRuleState::LinkRule => {
                    flowmod_0.instructions.push(Instruction::GotoTable(1));
                }
                PortRuleState::HostRule => {
                    if let Some(virtual_switch_id) = host_switch {
                        let mut metadata_tag = MetadataTag::new();
                        metadata_tag.set_group(false);
                        metadata_tag.set_virtual_switch(virtual_switch_id);
                        metadata_tag.add_to_instructions(&mut flowmod_0.instructions);
                        flowmod_0.instructions.push(Instruction::GotoTable(2));
                    }
                }
                // A drop rule has no instructions.
                PortRuleState::DropRule | PortRuleState::NoRule => {}
            }
            self.send(Message::FlowMod(flowmod_0));

            if current_state == PortRuleState::DropRule {
                // No egress rule for a drop port; packets tagged for it hit
                // the table-1 miss. Remove the stale rule if one exists.
                if table1_installed {
                    let mut delete = FlowMod {
                        table_id: 1,
                        priority: 10,
                        cookie: u64::from(port_no),
                        ..FlowMod::new(FlowModCmd::DeleteStrictFlow)
                    };
                    let mut vlan_tag = PortVlanTag::new();
                    vlan_tag.set_port(port_no);
                    vlan_tag.add_to_match(&mut delete.pattern);
                    self.send(Message::FlowMod(delete));
                }
            } else {
                let command_1 = if table1_installed {
                    FlowModCmd::ModFlow
                } else {
                    FlowModCmd::AddFlow
                };
                let mut flowmod_1 = FlowMod {
                    table_id: 1,
                    priority: 10,
                    cookie: u64::from(port_no),
                    ..FlowMod::new(command_1)
                };
                let mut vlan_tag = PortVlanTag::new();
                vlan_tag.set_port(port_no);
                vlan_tag.add_to_match(&mut flowmod_1.pattern);

                let mut actions = vec![];
                if current_state == PortRuleState::HostRule {
                    // Remove the VLAN tag before forwarding to a host.
                    actions.push(Action::PopVlan);
                } else {
                    // Rewrite the port tag to a shared-link tag; the slice
                    // bits stay untouched.
                    let mut link_tag = PortVlanTag::new();
                    link_tag.set_port(MAX_PORT_ID);
                    link_tag.add_to_actions(&mut actions);
                }
                actions.push(Action::output(port_no));
                flowmod_1.instructions.push(Instruction::WriteActions(actions));
                self.send(Message::FlowMod(flowmod_1));
            }

            // Shared-link ingress rules, table 1 priority 30: packets from
            // another switch addressed to a tenant pipeline on this one.
            let entering_link = current_state == PortRuleState::LinkRule;
            let leaving_link = prev_state == PortRuleState::LinkRule;
            if entering_link || leaving_link {
                for virtual_switch_id in self.live_interested(hypervisor, port_no) {
                    let Some(virtual_switch) =
                        hypervisor.virtual_switch_by_id(virtual_switch_id)
                    else {
                        continue;
                    };
                    let command = if entering_link {
                        FlowModCmd::AddFlow
                    } else {
                        FlowModCmd::DeleteStrictFlow
                    };
                    let mut flowmod = FlowMod {
                        table_id: 1,
                        priority: 30,
                        ..FlowMod::new(command)
                    };
                    let mut vlan_tag = PortVlanTag::new();
                    vlan_tag.set_slice(virtual_switch.slice_id());
                    vlan_tag.set_port(MAX_PORT_ID);
                    vlan_tag.add_to_match(&mut flowmod.pattern);
                    flowmod.pattern.in_port = Some(port_no);

                    if entering_link {
                        flowmod
                            .instructions
                            .push(Instruction::ApplyActions(vec![Action::PopVlan]));
                        let mut metadata_tag = MetadataTag::new();
                        metadata_tag.set_group(false);
                        metadata_tag.set_virtual_switch(virtual_switch_id);
                        metadata_tag.add_to_instructions(&mut flowmod.instructions);
                        flowmod.instructions.push(Instruction::GotoTable(2));
                    }
                    self.send(Message::FlowMod(flowmod));
                }
            }
        }

        // Transit rules, table 1 priority 20: traffic meant for a different
        // switch. Compare the installed next-hop with the wanted one.
        let mut others: Vec<SwitchId> = self
            .next
            .keys()
            .chain(self.current_next.keys())
            .copied()
            .collect();
        others.sort_unstable();
        others.dedup();
        for other in others {
            if other == self.id {
                continue;
            }
            let wanted = self.next.get(&other).copied();
            let installed = self.current_next.get(&other).copied();
            let command = match (installed, wanted) {
                (None, None) => continue,
                (Some(current), Some(next)) if current == next => continue,
                (None, Some(_)) => FlowModCmd::AddFlow,
                (Some(_), Some(_)) => FlowModCmd::ModFlow,
                (Some(_), None) => FlowModCmd::DeleteStrictFlow,
            };

            let mut flowmod = FlowMod {
                table_id: 1,
                priority: 20,
                ..FlowMod::new(command)
            };
            SwitchVlanTag::new(other.0).add_to_match(&mut flowmod.pattern);

            if let Some(next_port) = wanted {
                let mut actions = vec![];
                if self.get_distance(other) == 1 {
                    // Last transit hop; the packet must arrive without the
                    // switch tag.
                    actions.push(Action::PopVlan);
                }
                actions.push(Action::output(next_port));
                flowmod.instructions.push(Instruction::WriteActions(actions));
                self.current_next.insert(other, next_port);
            } else {
                self.current_next.remove(&other);
            }
            self.send(Message::FlowMod(flowmod));
        }

        self.update_groups(hypervisor);
    }

    /// Create or update the per-virtual-port output groups and the
    /// switch-forward groups they chain to.
    pub(crate) fn update_groups(&mut self, hypervisor: &Hypervisor) {
        self.rewrite_map
            .retain(|id, _| hypervisor.virtual_switch_by_id(*id).is_some());

        let mut virtual_switch_ids: Vec<u32> = self.rewrite_map.keys().copied().collect();
        virtual_switch_ids.sort_unstable();

        let mut pending = vec![];
        for virtual_switch_id in virtual_switch_ids {
            let Some(virtual_switch) = hypervisor.virtual_switch_by_id(virtual_switch_id) else {
                continue;
            };
            self.collect_output_group_updates(virtual_switch, hypervisor, &mut pending);
        }

        self.update_forward_groups();
        for group_mod in pending {
            self.send(Message::GroupMod(group_mod));
        }
    }

    /// Update the groups serving one virtual switch. Used directly when a
    /// tenant message allocated groups while its switch is off the registry.
    pub(crate) fn update_groups_for(
        &mut self,
        virtual_switch: &VirtualSwitch,
        hypervisor: &Hypervisor,
    ) {
        let mut pending = vec![];
        self.collect_output_group_updates(virtual_switch, hypervisor, &mut pending);
        self.update_forward_groups();
        for group_mod in pending {
            self.send(Message::GroupMod(group_mod));
        }
    }

    fn collect_output_group_updates(
        &mut self,
        virtual_switch: &VirtualSwitch,
        hypervisor: &Hypervisor,
        pending: &mut Vec<GroupMod>,
    ) {
        let virtual_switch_id = virtual_switch.id();
        let slice_id = virtual_switch.slice_id();

        let mut virtual_ports: Vec<(u32, crate::virtual_switch::VirtualPort)> = virtual_switch
            .ports()
            .iter()
            .map(|(port, mapping)| (*port, *mapping))
            .collect();
        virtual_ports.sort_unstable_by_key(|(port, _)| *port);

        for (virtual_port, mapping) in virtual_ports {
            self.ensure_output_group(virtual_switch_id, virtual_port);

            // The bucket shape depends on where the destination lives.
            let decision = if mapping.datapath_id == self.features.datapath_id {
                let to_link = self
                    .ports
                    .get(&mapping.port_no)
                    .map_or(false, |port| port.link.is_some());
                if to_link {
                    Some((OutputGroupState::SharedLinkRule, mapping.port_no, None))
                } else {
                    Some((OutputGroupState::HostRule, mapping.port_no, None))
                }
            } else {
                match hypervisor.switch_id_by_datapath(mapping.datapath_id) {
                    Some(other) if self.get_distance(other) == 1 => self
                        .get_next(other)
                        .map(|next| (OutputGroupState::SwitchOneHopRule, next, None)),
                    Some(other) if self.get_distance(other) < INFINITE => self
                        .get_next(other)
                        .map(|next| (OutputGroupState::SwitchRule, next, Some(other))),
                    // Unreachable right now; the group keeps its last shape
                    // until the topology recovers.
                    _ => None,
                }
            };
            let Some((new_state, new_output, via)) = decision else {
                continue;
            };

            let forward_group = via.map(|other| self.forward_group_id(other));

            let Some(group) = self
                .rewrite_map
                .get_mut(&virtual_switch_id)
                .and_then(|entry| entry.output_groups.get_mut(&virtual_port))
            else {
                continue;
            };
            if group.state == new_state && group.output_port == new_output {
                continue;
            }
            let command = if group.state == OutputGroupState::NoRule {
                GroupModCmd::Add
            } else {
                GroupModCmd::Modify
            };
            group.state = new_state;
            group.output_port = new_output;
            let group_id = group.group_id;

            let mut actions = vec![];
            match new_state {
                OutputGroupState::HostRule => {
                    actions.push(Action::output(new_output));
                }
                OutputGroupState::SharedLinkRule => {
                    actions.push(Action::PushVlan(0x8100));
                    let mut vlan_tag = PortVlanTag::new();
                    vlan_tag.set_slice(slice_id);
                    vlan_tag.set_port(MAX_PORT_ID);
                    vlan_tag.add_to_actions(&mut actions);
                    actions.push(Action::output(new_output));
                }
                OutputGroupState::SwitchOneHopRule => {
                    actions.push(Action::PushVlan(0x8100));
                    let mut vlan_tag = PortVlanTag::new();
                    vlan_tag.set_slice(slice_id);
                    vlan_tag.set_port(mapping.port_no);
                    vlan_tag.add_to_actions(&mut actions);
                    actions.push(Action::output(new_output));
                }
                OutputGroupState::SwitchRule => {
                    let Some(forward_group) = forward_group else {
                        continue;
                    };
                    actions.push(Action::PushVlan(0x8100));
                    let mut vlan_tag = PortVlanTag::new();
                    vlan_tag.set_slice(slice_id);
                    vlan_tag.set_port(mapping.port_no);
                    vlan_tag.add_to_actions(&mut actions);
                    actions.push(Action::Group(forward_group));
                }
                OutputGroupState::NoRule => continue,
            };
            pending.push(GroupMod {
                command,
                group_type: GroupType::Indirect,
                group_id,
                buckets: vec![Bucket::indirect(actions)],
            });
        }
    }

    /// Switch-forward groups go out before the pending output groups so a
    /// chained group id is never unknown to the switch.
    fn update_forward_groups(&mut self) {
        let mut forward_ids: Vec<SwitchId> = self.switch_forward_groups.keys().copied().collect();
        forward_ids.sort_unstable();
        for switch_id in forward_ids {
            let Some(next_port) = self.get_next(switch_id) else {
                continue;
            };
            let Some(forward) = self.switch_forward_groups.get_mut(&switch_id) else {
                continue;
            };
            let command = if forward.state == ForwardGroupState::NoRule {
                forward.state = ForwardGroupState::ForwardRule;
                GroupModCmd::Add
            } else if forward.output_port == next_port {
                continue;
            } else {
                GroupModCmd::Modify
            };
            forward.output_port = next_port;
            let group_id = forward.group_id;

            let mut actions = vec![Action::PushVlan(0x8100)];
            SwitchVlanTag::new(switch_id.0).add_to_actions(&mut actions);
            actions.push(Action::output(next_port));
            self.send(Message::GroupMod(GroupMod {
                command,
                group_type: GroupType::Indirect,
                group_id,
                buckets: vec![Bucket::indirect(actions)],
            }));
        }
    }

    fn ensure_output_group(&mut self, virtual_switch_id: u32, virtual_port: u32) -> u32 {
        let next_group_id = &mut self.next_group_id;
        let entry = self.rewrite_map.entry(virtual_switch_id).or_default();
        let group = entry.output_groups.entry(virtual_port).or_insert_with(|| {
            let group_id = *next_group_id;
            *next_group_id += 1;
            OutputGroup {
                group_id,
                state: OutputGroupState::NoRule,
                output_port: u32::MAX,
            }
        });
        group.group_id
    }

    /// The output group standing in for a tenant output action, allocated
    /// on first use.
    pub(crate) fn output_group_id(
        &mut self,
        virtual_switch: &VirtualSwitch,
        virtual_port: u32,
    ) -> Result<u32, RewriteError> {
        if virtual_switch.physical_port(virtual_port).is_none() {
            return Err(RewriteError::UnknownPort(virtual_port));
        }
        Ok(self.ensure_output_group(virtual_switch.id(), virtual_port))
    }

    pub(crate) fn allocate_tenant_group(
        &mut self,
        virtual_switch_id: u32,
        tenant_group: u32,
    ) -> u32 {
        let next_group_id = &mut self.next_group_id;
        let entry = self.rewrite_map.entry(virtual_switch_id).or_default();
        *entry.group_map.entry(tenant_group).or_insert_with(|| {
            let group_id = *next_group_id;
            *next_group_id += 1;
            group_id
        })
    }

    pub(crate) fn lookup_tenant_group(
        &self,
        virtual_switch_id: u32,
        tenant_group: u32,
    ) -> Result<u32, RewriteError> {
        self.rewrite_map
            .get(&virtual_switch_id)
            .and_then(|entry| entry.group_map.get(&tenant_group))
            .copied()
            .ok_or(RewriteError::UnknownGroup(tenant_group))
    }

    fn forward_group_id(&mut self, switch_id: SwitchId) -> u32 {
        let next_group_id = &mut self.next_group_id;
        let forward = self
            .switch_forward_groups
            .entry(switch_id)
            .or_insert_with(|| {
                let group_id = *next_group_id;
                *next_group_id += 1;
                ForwardGroup {
                    group_id,
                    state: ForwardGroupState::NoRule,
                    output_port: u32::MAX,
                }
            });
        forward.group_id
    }

    /// Rewrite a tenant flow-mod for this switch: tables shifted past the
    /// hypervisor tables, the match pinned to the tenant pipeline, and the
    /// instruction set rewritten through the output groups.
    pub(crate) fn rewrite_flow_mod(
        &mut self,
        flow_mod: &FlowMod,
        virtual_switch: &VirtualSwitch,
    ) -> Result<FlowMod, RewriteError> {
        let mut pattern = flow_mod.pattern.clone();
        if let Some(virtual_port) = pattern.in_port {
            let mapping = virtual_switch
                .physical_port(virtual_port)
                .ok_or(RewriteError::UnknownInPort(virtual_port))?;
            if mapping.datapath_id != self.features.datapath_id {
                return Err(RewriteError::UnknownInPort(virtual_port));
            }
            pattern.in_port = Some(mapping.port_no);
        }

        // Pin the rule to this tenant's pipeline; the tenant's own metadata
        // match moves up past the tag bits.
        let mut metadata_value =
            (u64::from(virtual_switch.id()) & make_mask(VIRTUAL_SWITCH_BITS)) << 1;
        let mut metadata_mask = make_mask(VIRTUAL_SWITCH_BITS) << 1;
        if let Some(tenant) = pattern.metadata {
            let tenant_mask = tenant.mask.unwrap_or(make_mask(64 - METADATA_TAG_BITS));
            if tag::mask_uses_reserved_bits(tenant_mask)
                || tag::mask_uses_reserved_bits(tenant.value)
            {
                return Err(RewriteError::ReservedMetadataBits);
            }
            metadata_value |= tenant.value << METADATA_TAG_BITS;
            metadata_mask |= tenant_mask << METADATA_TAG_BITS;
        }
        pattern.metadata = Some(Mask {
            value: metadata_value,
            mask: Some(metadata_mask),
        });

        let deleting = matches!(
            flow_mod.command,
            FlowModCmd::DeleteFlow | FlowModCmd::DeleteStrictFlow
        );
        let table_id = if flow_mod.table_id == ALL_TABLES && deleting {
            // A delete across all tables stays a delete across all tables;
            // the metadata match keeps it away from rules that are not this
            // tenant's.
            ALL_TABLES
        } else if flow_mod.table_id <= MAX_TENANT_TABLE {
            flow_mod.table_id + 2
        } else {
            return Err(RewriteError::BadTableId);
        };

        // Delete filters are translated best-effort: a virtual port that
        // does not resolve on this switch widens to any.
        let out_port = if flow_mod.out_port < OfpPort::OFPPMax as u32 {
            virtual_switch
                .physical_port(flow_mod.out_port)
                .filter(|mapping| mapping.datapath_id == self.features.datapath_id)
                .map(|mapping| mapping.port_no)
                .unwrap_or(OfpPort::OFPPAny as u32)
        } else {
            flow_mod.out_port
        };
        let out_group = if flow_mod.out_group != OFPG_ANY {
            self.lookup_tenant_group(virtual_switch.id(), flow_mod.out_group)
                .unwrap_or(OFPG_ANY)
        } else {
            OFPG_ANY
        };

        let instructions = self.rewrite_instructions(&flow_mod.instructions, virtual_switch)?;

        Ok(FlowMod {
            cookie: flow_mod.cookie,
            cookie_mask: flow_mod.cookie_mask,
            table_id,
            command: flow_mod.command,
            idle_timeout: flow_mod.idle_timeout,
            hard_timeout: flow_mod.hard_timeout,
            priority: flow_mod.priority,
            // Tenant buffer ids mean nothing to the physical switch.
            buffer_id: OFP_NO_BUFFER,
            out_port,
            out_group,
            flags: flow_mod.flags,
            pattern,
            instructions,
        })
    }

    /// Rewrite a tenant instruction set. Produces both the variant carrying
    /// the rewritten outputs and the one without them; when the tenant's
    /// write-actions contained a group action the group wins the action set
    /// and the without-output variant is the one installed.
    pub(crate) fn rewrite_instructions(
        &mut self,
        instructions: &[Instruction],
        virtual_switch: &VirtualSwitch,
    ) -> Result<Vec<Instruction>, RewriteError> {
        let mut with_output = vec![];
        let mut without_output = vec![];
        let mut metadata_value = 0u64;
        let mut metadata_mask = 0u64;
        let mut tenant_used_group = false;

        for instruction in instructions {
            match instruction {
                Instruction::GotoTable(table_id) => {
                    if *table_id > MAX_TENANT_TABLE {
                        return Err(RewriteError::BadTableId);
                    }
                    with_output.push(Instruction::GotoTable(table_id + 2));
                    without_output.push(Instruction::GotoTable(table_id + 2));
                }
                Instruction::WriteMetadata { metadata, mask } => {
                    // Mask bits that would be shifted out are reserved.
                    if tag::mask_uses_reserved_bits(*mask) {
                        return Err(RewriteError::ReservedMetadataBits);
                    }
                    metadata_value |= metadata << METADATA_TAG_BITS;
                    metadata_mask |= mask << METADATA_TAG_BITS;
                }
                Instruction::WriteActions(actions) => {
                    let (with, without, has_group) =
                        self.rewrite_action_set(actions, virtual_switch)?;
                    if has_group {
                        metadata_value |= 1;
                        metadata_mask |= 1;
                        tenant_used_group = true;
                    }
                    with_output.push(Instruction::WriteActions(with));
                    without_output.push(Instruction::WriteActions(without));
                }
                Instruction::ApplyActions(actions) => {
                    let rewritten = self.rewrite_action_list(actions, virtual_switch)?;
                    with_output.push(Instruction::ApplyActions(rewritten.clone()));
                    without_output.push(Instruction::ApplyActions(rewritten));
                }
                Instruction::ClearActions => {
                    with_output.push(Instruction::ClearActions);
                    without_output.push(Instruction::ClearActions);
                    // The cleared action set can no longer take a group, so
                    // the group bit gets overwritten with a zero. A
                    // write-actions in the same instruction set executes
                    // after the clear and sets the bit again when needed.
                    metadata_mask |= 1;
                }
                Instruction::Meter(_) | Instruction::Other { .. } => {
                    return Err(RewriteError::UnsupportedInstruction);
                }
            }
        }

        if metadata_mask != 0 {
            let write_metadata = Instruction::WriteMetadata {
                metadata: metadata_value,
                mask: metadata_mask,
            };
            with_output.push(write_metadata.clone());
            without_output.push(write_metadata);
        }

        Ok(if tenant_used_group {
            without_output
        } else {
            with_output
        })
    }

    /// Rewrite a tenant write-actions set into the with-output and
    /// without-output variants.
    pub(crate) fn rewrite_action_set(
        &mut self,
        actions: &[Action],
        virtual_switch: &VirtualSwitch,
    ) -> Result<(Vec<Action>, Vec<Action>, bool), RewriteError> {
        let mut with_output = vec![];
        let mut without_output = vec![];
        let mut has_group = false;

        for action in actions {
            match action {
                Action::Output { port, .. } if *port < OfpPort::OFPPMax as u32 => {
                    let group_id = self.output_group_id(virtual_switch, *port)?;
                    with_output.push(Action::Group(group_id));
                }
                Action::Output { port, .. } if *port == OfpPort::OFPPController as u32 => {
                    with_output.push(action.clone());
                }
                Action::Output { .. } => return Err(RewriteError::UnsupportedAction),
                Action::Group(tenant_group) => {
                    has_group = true;
                    let group_id =
                        self.lookup_tenant_group(virtual_switch.id(), *tenant_group)?;
                    with_output.push(Action::Group(group_id));
                    without_output.push(Action::Group(group_id));
                }
                Action::SetQueue(_) => return Err(RewriteError::UnsupportedAction),
                other => {
                    with_output.push(other.clone());
                    without_output.push(other.clone());
                }
            }
        }

        Ok((with_output, without_output, has_group))
    }

    /// Rewrite a tenant apply-actions list (also used for packet-out
    /// actions and group buckets). Outputs toward virtual ports use the
    /// same output-group indirection as write-actions.
    pub(crate) fn rewrite_action_list(
        &mut self,
        actions: &[Action],
        virtual_switch: &VirtualSwitch,
    ) -> Result<Vec<Action>, RewriteError> {
        let mut rewritten = vec![];
        for action in actions {
            match action {
                Action::Output { port, .. } if *port < OfpPort::OFPPMax as u32 => {
                    rewritten.push(Action::Group(
                        self.output_group_id(virtual_switch, *port)?,
                    ));
                }
                Action::Output { port, .. } if *port == OfpPort::OFPPController as u32 => {
                    rewritten.push(action.clone());
                }
                // The remaining reserved ports name physical flooding
                // semantics the shared substrate cannot honor for a tenant.
                Action::Output { .. } => return Err(RewriteError::UnsupportedAction),
                Action::Group(tenant_group) => {
                    rewritten.push(Action::Group(
                        self.lookup_tenant_group(virtual_switch.id(), *tenant_group)?,
                    ));
                }
                Action::SetQueue(_) => return Err(RewriteError::UnsupportedAction),
                other => rewritten.push(other.clone()),
            }
        }
        Ok(rewritten)
    }

    /// Rewrite a tenant group-mod: the group id moves into the per-switch
    /// allocation and every bucket's actions are rewritten.
    pub(crate) fn rewrite_group_mod(
        &mut self,
        group_mod: &GroupMod,
        virtual_switch: &VirtualSwitch,
    ) -> Result<GroupMod, RewriteError> {
        if group_mod.group_type == GroupType::All && !self.fan_out_capable {
            return Err(RewriteError::GroupTypeUnsupported);
        }
        let group_id = match group_mod.command {
            GroupModCmd::Add => {
                self.allocate_tenant_group(virtual_switch.id(), group_mod.group_id)
            }
            GroupModCmd::Modify | GroupModCmd::Delete => {
                self.lookup_tenant_group(virtual_switch.id(), group_mod.group_id)?
            }
        };

        let mut buckets = vec![];
        for bucket in &group_mod.buckets {
            buckets.push(Bucket {
                weight: bucket.weight,
                watch_port: bucket.watch_port,
                watch_group: bucket.watch_group,
                actions: self.rewrite_action_list(&bucket.actions, virtual_switch)?,
            });
        }

        if group_mod.command == GroupModCmd::Delete {
            if let Some(entry) = self.rewrite_map.get_mut(&virtual_switch.id()) {
                entry.group_map.remove(&group_mod.group_id);
            }
        }

        Ok(GroupMod {
            command: group_mod.command,
            group_type: group_mod.group_type,
            group_id,
            buckets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ofp_connection::OfpConnection;
    use crate::slice::PortMapConfig;
    use tokio::sync::mpsc;

    fn switch() -> (PhysicalSwitch, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut switch = PhysicalSwitch::new(SwitchId(1), OfpConnection::new(tx));
        switch.features.datapath_id = 0xa;
        (switch, rx)
    }

    fn virtual_switch() -> VirtualSwitch {
        VirtualSwitch::new(
            5,
            0x100,
            0,
            &[
                PortMapConfig {
                    virtual_port: 1,
                    physical_datapath_id: 0xa,
                    physical_port: 7,
                },
                PortMapConfig {
                    virtual_port: 2,
                    physical_datapath_id: 0xb,
                    physical_port: 3,
                },
            ],
        )
    }

    fn flow_mod_with(instructions: Vec<Instruction>) -> FlowMod {
        FlowMod {
            priority: 5,
            instructions,
            ..FlowMod::new(FlowModCmd::AddFlow)
        }
    }

    #[test]
    fn test_goto_table_is_shifted_past_hypervisor_tables() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        let rewritten = switch
            .rewrite_flow_mod(&flow_mod_with(vec![Instruction::GotoTable(0)]), &vs)
            .unwrap();
        assert_eq!(rewritten.table_id, 2);
        assert_eq!(rewritten.instructions, vec![Instruction::GotoTable(2)]);
    }

    #[test]
    fn test_match_is_pinned_to_the_tenant_pipeline() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        let rewritten = switch.rewrite_flow_mod(&flow_mod_with(vec![]), &vs).unwrap();
        let metadata = rewritten.pattern.metadata.unwrap();
        assert_eq!(metadata.value, 5 << 1);
        assert_eq!(metadata.mask, Some(make_mask(VIRTUAL_SWITCH_BITS) << 1));
    }

    #[test]
    fn test_tenant_metadata_match_is_shifted() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        let mut flow_mod = flow_mod_with(vec![]);
        flow_mod.pattern.metadata = Some(Mask {
            value: 0x3,
            mask: Some(0x7),
        });
        let rewritten = switch.rewrite_flow_mod(&flow_mod, &vs).unwrap();
        let metadata = rewritten.pattern.metadata.unwrap();
        assert_eq!(metadata.value, (0x3 << METADATA_TAG_BITS) | (5 << 1));
        assert_eq!(
            metadata.mask,
            Some((0x7 << METADATA_TAG_BITS) | (make_mask(VIRTUAL_SWITCH_BITS) << 1))
        );
    }

    #[test]
    fn test_write_metadata_is_shifted() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        let rewritten = switch
            .rewrite_instructions(
                &[Instruction::WriteMetadata {
                    metadata: 0x5,
                    mask: 0xf,
                }],
                &vs,
            )
            .unwrap();
        assert_eq!(
            rewritten,
            vec![Instruction::WriteMetadata {
                metadata: 0x5 << METADATA_TAG_BITS,
                mask: 0xf << METADATA_TAG_BITS,
            }]
        );
    }

    #[test]
    fn test_reserved_metadata_mask_is_rejected() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        let result = switch.rewrite_instructions(
            &[Instruction::WriteMetadata {
                metadata: 0,
                mask: 0xf000_0000_0000_0000,
            }],
            &vs,
        );
        assert_eq!(result, Err(RewriteError::ReservedMetadataBits));
    }

    #[test]
    fn test_meter_and_set_queue_are_rejected() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        assert_eq!(
            switch.rewrite_instructions(&[Instruction::Meter(3)], &vs),
            Err(RewriteError::UnsupportedInstruction)
        );
        assert_eq!(
            switch.rewrite_instructions(
                &[Instruction::WriteActions(vec![Action::SetQueue(1)])],
                &vs
            ),
            Err(RewriteError::UnsupportedAction)
        );
        assert_eq!(
            switch.rewrite_instructions(
                &[Instruction::ApplyActions(vec![Action::SetQueue(1)])],
                &vs
            ),
            Err(RewriteError::UnsupportedAction)
        );
    }

    #[test]
    fn test_write_actions_output_becomes_a_group() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        let rewritten = switch
            .rewrite_instructions(
                &[Instruction::WriteActions(vec![Action::output(1)])],
                &vs,
            )
            .unwrap();
        let Instruction::WriteActions(actions) = &rewritten[0] else {
            panic!("expected write-actions, got {:?}", rewritten);
        };
        assert!(matches!(actions[..], [Action::Group(_)]));
        // Repeated rewrites reuse the same allocation.
        let again = switch
            .rewrite_instructions(
                &[Instruction::WriteActions(vec![Action::output(1)])],
                &vs,
            )
            .unwrap();
        assert_eq!(rewritten, again);
    }

    #[test]
    fn test_group_action_wins_the_action_set_and_marks_metadata() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        let physical_group = switch.allocate_tenant_group(vs.id(), 9);
        let rewritten = switch
            .rewrite_instructions(
                &[Instruction::WriteActions(vec![
                    Action::output(1),
                    Action::Group(9),
                ])],
                &vs,
            )
            .unwrap();
        // The installed variant keeps the tenant's group and drops the
        // output; the group-taken bit is set.
        assert_eq!(
            rewritten,
            vec![
                Instruction::WriteActions(vec![Action::Group(physical_group)]),
                Instruction::WriteMetadata {
                    metadata: 1,
                    mask: 1
                },
            ]
        );
    }

    #[test]
    fn test_unknown_tenant_group_is_rejected() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        assert_eq!(
            switch.rewrite_instructions(
                &[Instruction::WriteActions(vec![Action::Group(4)])],
                &vs
            ),
            Err(RewriteError::UnknownGroup(4))
        );
    }

    #[test]
    fn test_unknown_output_port_is_rejected() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        assert_eq!(
            switch.rewrite_instructions(
                &[Instruction::WriteActions(vec![Action::output(40)])],
                &vs
            ),
            Err(RewriteError::UnknownPort(40))
        );
    }

    #[test]
    fn test_in_port_match_is_mapped_to_the_physical_port() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        let mut flow_mod = flow_mod_with(vec![]);
        flow_mod.pattern.in_port = Some(1);
        let rewritten = switch.rewrite_flow_mod(&flow_mod, &vs).unwrap();
        assert_eq!(rewritten.pattern.in_port, Some(7));

        // Virtual port 2 lives on another datapath.
        flow_mod.pattern.in_port = Some(2);
        assert_eq!(
            switch.rewrite_flow_mod(&flow_mod, &vs),
            Err(RewriteError::UnknownInPort(2))
        );
    }

    #[test]
    fn test_group_mod_buckets_are_rewritten() {
        let (mut switch, _rx) = switch();
        let vs = virtual_switch();
        let group_mod = GroupMod {
            command: GroupModCmd::Add,
            group_type: GroupType::Indirect,
            group_id: 1,
            buckets: vec![Bucket::indirect(vec![Action::output(1)])],
        };
        let rewritten = switch.rewrite_group_mod(&group_mod, &vs).unwrap();
        assert_ne!(rewritten.group_id, 1);
        assert!(matches!(
            rewritten.buckets[0].actions[..],
            [Action::Group(_)]
        ));
        // The mapping persists for later modifies.
        assert_eq!(
            switch.lookup_tenant_group(vs.id(), 1).unwrap(),
            rewritten.group_id
        );
    }

    #[test]
    fn test_all_group_rejected_without_fan_out_support() {
        let (mut switch, _rx) = switch();
        switch.fan_out_capable = false;
        let vs = virtual_switch();
        let group_mod = GroupMod {
            command: GroupModCmd::Add,
            group_type: GroupType::All,
            group_id: 1,
            buckets: vec![],
        };
        assert_eq!(
            switch.rewrite_group_mod(&group_mod, &vs),
            Err(RewriteError::GroupTypeUnsupported)
        );
    }
}
