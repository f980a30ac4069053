//! The control-channel session with one real switch: handshake, feature and
//! port discovery, xid translation toward tenants, and the per-switch
//! routing state the rule installer works from.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use log::{error, info, trace, warn};
use tokio::task::JoinHandle;

use crate::hypervisor::Hypervisor;
use crate::message::{
    Capabilities, FlowMod, FlowModCmd, GroupFeatures, GroupType, Message, MeterFeatures,
    MultipartReq, MultipartReqBody, MultipartResp, MultipartRespBody, PacketIn, PacketOut,
    PortDesc, PortReason, PortStatus, ALL_TABLES,
};
use crate::ofp_connection::OfpConnection;
use crate::ofp_header::Xid;
use crate::ofp_message::OfpSerializationError;
use crate::tag::{self, MetadataTag};
use crate::topology::{self, LinkId, INFINITE};

mod rules;

pub(crate) use rules::RewriteError;

/// The internal id of a physical switch, assigned at connect and used for
/// routing and transit tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwitchId(pub u32);

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Unregistered,
    Registered,
}

/// The data learned from the features and get-config exchanges.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub capabilities: Capabilities,
    pub flags: u16,
    pub miss_send_len: u16,
}

/// Which dynamic in-port rule is currently installed for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRuleState {
    NoRule,
    LinkRule,
    HostRule,
    DropRule,
}

impl fmt::Display for PortRuleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            PortRuleState::NoRule => "no-rule",
            PortRuleState::LinkRule => "link",
            PortRuleState::HostRule => "host",
            PortRuleState::DropRule => "drop",
        })
    }
}

/// A port on this switch as it is in the network below.
#[derive(Debug, Clone)]
pub struct Port {
    pub desc: PortDesc,
    /// The discovered link on this port, if any. The two `link` fields on
    /// the endpoint ports own the link; the registry entry carries no owning
    /// back-references.
    pub link: Option<LinkId>,
    pub state: PortRuleState,
}

/// Where a translated request came from, so the reply can be returned with
/// its original xid. The virtual switch is referenced by id and resolved
/// through the registry; entries whose switch is gone are dropped on access.
struct RequestSource {
    original_xid: Xid,
    virtual_switch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputGroupState {
    NoRule,
    HostRule,
    SharedLinkRule,
    SwitchOneHopRule,
    SwitchRule,
}

/// The indirect group backing one virtual port of one virtual switch.
pub(crate) struct OutputGroup {
    pub(crate) group_id: u32,
    pub(crate) state: OutputGroupState,
    pub(crate) output_port: u32,
}

/// Per-virtual-switch rewrite state on this switch.
#[derive(Default)]
pub(crate) struct RewriteEntry {
    /// virtual port -> output group
    pub(crate) output_groups: HashMap<u32, OutputGroup>,
    /// tenant group id -> physical group id
    pub(crate) group_map: HashMap<u32, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForwardGroupState {
    NoRule,
    ForwardRule,
}

/// The indirect group pushing a switch tag and forwarding toward one remote
/// switch.
pub(crate) struct ForwardGroup {
    pub(crate) group_id: u32,
    pub(crate) state: ForwardGroupState,
    pub(crate) output_port: u32,
}

pub struct PhysicalSwitch {
    id: SwitchId,
    connection: OfpConnection,
    state: SwitchState,
    features: Features,
    group_features: Option<GroupFeatures>,
    meter_features: Option<MeterFeatures>,
    /// Cleared when the switch lacks the group support needed for
    /// multi-destination rules; no fan-out groups are created on it.
    fan_out_capable: bool,
    ports: HashMap<u32, Port>,
    /// The ports virtual switches name on this switch, whether or not the
    /// switch has reported them yet. Values are virtual-switch ids, pruned
    /// when they no longer resolve.
    needed_ports: HashMap<u32, BTreeSet<u32>>,
    topology_discovery_port: usize,
    topology_task: Option<JoinHandle<()>>,
    /// Hop count to every reachable switch.
    dist: HashMap<SwitchId, u32>,
    /// The port to forward over to reach a switch.
    next: HashMap<SwitchId, u32>,
    /// The next-hop actually installed in table 1 right now.
    current_next: HashMap<SwitchId, u32>,
    xid_map: HashMap<Xid, RequestSource>,
    rewrite_map: HashMap<u32, RewriteEntry>,
    switch_forward_groups: HashMap<SwitchId, ForwardGroup>,
    /// Monotonic group-id allocator; id 0 is the controller group and freed
    /// ids are not reused within a session.
    next_group_id: u32,
}

impl fmt::Display for PhysicalSwitch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[PhysicalSwitch id={}, dpid={:#x}]",
            self.id.0, self.features.datapath_id
        )
    }
}

impl PhysicalSwitch {
    pub fn new(id: SwitchId, connection: OfpConnection) -> PhysicalSwitch {
        PhysicalSwitch {
            id,
            connection,
            state: SwitchState::Unregistered,
            features: Features::default(),
            group_features: None,
            meter_features: None,
            fan_out_capable: true,
            ports: HashMap::new(),
            needed_ports: HashMap::new(),
            topology_discovery_port: 0,
            topology_task: None,
            dist: HashMap::new(),
            next: HashMap::new(),
            current_next: HashMap::new(),
            xid_map: HashMap::new(),
            rewrite_map: HashMap::new(),
            switch_forward_groups: HashMap::new(),
            next_group_id: 1,
        }
    }

    pub fn id(&self) -> SwitchId {
        self.id
    }

    pub fn datapath_id(&self) -> u64 {
        self.features.datapath_id
    }

    pub fn is_registered(&self) -> bool {
        self.state == SwitchState::Registered
    }

    pub fn fan_out_capable(&self) -> bool {
        self.fan_out_capable
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn group_features(&self) -> Option<&GroupFeatures> {
        self.group_features.as_ref()
    }

    pub fn meter_features(&self) -> Option<&MeterFeatures> {
        self.meter_features.as_ref()
    }

    pub fn ports(&self) -> &HashMap<u32, Port> {
        &self.ports
    }

    pub fn connection_mut(&mut self) -> &mut OfpConnection {
        &mut self.connection
    }

    /// The socket is ready: run the startup sequence. Probe emission is
    /// scheduled by the hypervisor right after this returns.
    pub fn start(&mut self, hypervisor: &Hypervisor) -> Result<(), OfpSerializationError> {
        self.connection.send_message(Message::Hello)?;
        self.connection.send_message(Message::FeaturesReq)?;
        self.connection.send_message(Message::MultipartReq(MultipartReq {
            flags: 0,
            body: MultipartReqBody::MeterFeatures,
        }))?;
        self.connection.send_message(Message::MultipartReq(MultipartReq {
            flags: 0,
            body: MultipartReqBody::GroupFeatures,
        }))?;
        self.connection.send_message(Message::MultipartReq(MultipartReq {
            flags: 0,
            body: MultipartReqBody::PortDesc,
        }))?;
        self.connection.send_message(Message::GetConfigReq)?;

        // Delete all the flow rules already in the switch, and make sure the
        // delete is executed before any new rules are added.
        self.connection
            .send_message(Message::FlowMod(FlowMod {
                table_id: ALL_TABLES,
                ..FlowMod::new(FlowModCmd::DeleteFlow)
            }))?;
        self.connection.send_message(Message::BarrierRequest)?;

        self.create_static_rules(hypervisor);
        self.update_dynamic_rules(hypervisor);

        info!("{} started", self);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.connection.stop();
        if let Some(task) = self.topology_task.take() {
            task.abort();
        }
        info!("{} stopped", self);
    }

    pub fn register_port_interest(&mut self, port: u32, virtual_switch: u32) {
        trace!("{} interest was registered for port {}", self, port);
        self.needed_ports.entry(port).or_default().insert(virtual_switch);
    }

    pub fn remove_port_interest(&mut self, port: u32, virtual_switch: u32) {
        trace!("{} interest was unregistered for port {}", self, port);
        if let Some(interested) = self.needed_ports.get_mut(&port) {
            interested.remove(&virtual_switch);
        }
    }

    /// Send a message that needs a response. The xid it actually went out
    /// with maps back to the original xid and the requesting virtual switch
    /// so the reply can be forwarded.
    pub(crate) fn send_request_message(
        &mut self,
        message: Message,
        original_xid: Xid,
        virtual_switch: u32,
    ) {
        match self.connection.send_message(message) {
            Ok(xid) => {
                self.xid_map.insert(
                    xid,
                    RequestSource {
                        original_xid,
                        virtual_switch,
                    },
                );
            }
            Err(error) => error!("{} could not serialize tenant request: {}", self, error),
        }
    }

    fn send(&mut self, message: Message) {
        if let Err(error) = self.connection.send_message(message) {
            error!("{} could not serialize message: {}", self, error);
        }
    }

    /// Dispatch an asymmetric message from the switch. Returns true when
    /// the topology changed and routes must be recomputed.
    pub fn handle_message(
        &mut self,
        xid: Xid,
        message: Message,
        hypervisor: &mut Hypervisor,
    ) -> bool {
        match message {
            Message::FeaturesReply(features) => {
                return self.handle_features_reply(features, hypervisor);
            }
            Message::GetConfigReply(config) => {
                info!("{} received get_config_reply", self);
                self.features.flags = config.flags;
                self.features.miss_send_len = config.miss_send_len;
            }
            Message::Error(error) => {
                info!(
                    "{} received error Type={} Code={}",
                    self, error.err_type, error.code
                );
                if !self.forward_reply(xid, Message::Error(error), hypervisor) {
                    trace!("{} error does not belong to a tenant request", self);
                }
            }
            Message::BarrierReply => {
                if !self.forward_reply(xid, Message::BarrierReply, hypervisor) {
                    trace!("{} barrier reply consumed", self);
                }
            }
            Message::PacketIn(packet_in) => {
                return self.handle_packet_in(packet_in, hypervisor);
            }
            Message::PortStatus(port_status) => {
                info!("{} received port_status", self);
                self.handle_port(port_status.desc, port_status.reason, hypervisor);
                self.update_dynamic_rules(hypervisor);
            }
            Message::MultipartReply(reply) => {
                self.handle_multipart_reply(xid, reply, hypervisor);
            }
            Message::FlowRemoved(_) => {
                trace!("{} received flow_removed", self);
            }
            Message::Unsupported { code } => {
                warn!("{} received unhandled message {}", self, code);
            }
            other => {
                warn!("{} received {:?} it shouldn't", self, other);
            }
        }
        false
    }

    fn handle_features_reply(
        &mut self,
        features: crate::message::SwitchFeatures,
        hypervisor: &mut Hypervisor,
    ) -> bool {
        info!("{} received features_reply", self);

        if self.state == SwitchState::Registered {
            error!("{} received features_reply while already registered", self);
        }

        self.features.datapath_id = features.datapath_id;
        self.features.n_buffers = features.num_buffers;
        self.features.n_tables = features.num_tables;
        self.features.capabilities = features.supported_capabilities;

        hypervisor.register_datapath(features.datapath_id, self.id);
        self.state = SwitchState::Registered;

        // Interests for every virtual port configured on this datapath can
        // be registered now that the datapath id is known.
        for virtual_switch in hypervisor.virtual_switches() {
            for (_, mapping) in virtual_switch.ports() {
                if mapping.datapath_id == self.features.datapath_id {
                    self.register_port_interest(mapping.port_no, virtual_switch.id());
                }
            }
        }

        // This can potentially allow a virtual switch that only depends on
        // this switch to come online.
        true
    }

    fn handle_multipart_reply(
        &mut self,
        xid: Xid,
        reply: MultipartResp,
        hypervisor: &mut Hypervisor,
    ) {
        match reply.body {
            MultipartRespBody::GroupFeatures(features) => {
                info!("{} received group features", self);
                if !features.supports(GroupType::All) {
                    error!(
                        "{} switch doesn't support ALL group type needed for multi-destination rules",
                        self
                    );
                    self.fan_out_capable = false;
                }
                if !features.supports(GroupType::Indirect) {
                    error!("{} switch doesn't support INDIRECT group type", self);
                }
                self.group_features = Some(features);
            }
            MultipartRespBody::MeterFeatures(features) => {
                info!("{} received meter features", self);
                if !features.supports_drop_band() {
                    error!("{} switch doesn't support drop meter band type", self);
                }
                if (features.max_meter as usize) < hypervisor.slices().len() {
                    error!("{} switch doesn't support enough meters", self);
                }
                self.meter_features = Some(features);
            }
            MultipartRespBody::PortDesc(ports) => {
                info!("{} received multipart reply port description", self);
                // Just act as if we received all the ports via PortStatus
                // add messages.
                for port in ports {
                    self.handle_port(port, PortReason::PortAdd, hypervisor);
                }
                self.update_dynamic_rules(hypervisor);
            }
            MultipartRespBody::Desc { .. } | MultipartRespBody::Other { .. } => {
                trace!("{} multipart reply xid={} ignored", self, xid);
            }
        }
    }

    /// Update the local port map for an add/modify/delete and forward the
    /// rewritten port-status to every interested, connected virtual switch.
    fn handle_port(&mut self, port: PortDesc, reason: PortReason, hypervisor: &mut Hypervisor) {
        let port_no = port.port_no;
        let effective_reason = if !self.ports.contains_key(&port_no) {
            if reason == PortReason::PortDelete {
                // A delete for a port we didn't know about.
                return;
            }
            self.ports.insert(
                port_no,
                Port {
                    desc: port.clone(),
                    link: None,
                    state: PortRuleState::NoRule,
                },
            );
            PortReason::PortAdd
        } else if reason == PortReason::PortDelete {
            let link = self.ports.remove(&port_no).and_then(|known| known.link);
            if let Some(link_id) = link {
                hypervisor.clear_link(link_id, self);
            }
            PortReason::PortDelete
        } else {
            if let Some(known) = self.ports.get_mut(&port_no) {
                known.desc = port.clone();
            }
            PortReason::PortModify
        };

        let interested: Vec<u32> = self
            .needed_ports
            .get(&port_no)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for virtual_switch_id in interested {
            let datapath_id = self.features.datapath_id;
            let Some(virtual_switch) = hypervisor.virtual_switch_by_id_mut(virtual_switch_id)
            else {
                continue;
            };
            if !virtual_switch.is_connected() {
                continue;
            }
            let Some(virtual_port) = virtual_switch.virtual_port_no(datapath_id, port_no) else {
                continue;
            };
            let mut desc = port.clone();
            desc.port_no = virtual_port;
            virtual_switch.send_async_message(Message::PortStatus(PortStatus {
                reason: effective_reason,
                desc,
            }));
        }
    }

    fn handle_packet_in(&mut self, packet_in: PacketIn, hypervisor: &mut Hypervisor) -> bool {
        let Some(in_port) = packet_in.in_port() else {
            warn!("{} received packet_in without an in-port", self);
            return false;
        };

        if packet_in.table_id == 0 {
            // This packet was generated from a hypervisor reserved table.
            if packet_in.cookie == 1 {
                match topology::decode_probe(packet_in.payload.bytes()) {
                    Some(peer) => return hypervisor.link_discovered(self, in_port, peer),
                    None => {
                        warn!("{} received undecodable probe on port {}", self, in_port);
                    }
                }
            } else {
                error!(
                    "{} received packet in via error detection rule on port {}",
                    self, in_port
                );
            }
            return false;
        }

        if packet_in.table_id < 2 {
            error!(
                "{} received packet in via error detection rule in table 1 on port {}",
                self, in_port
            );
            return false;
        }

        // The metadata written in table 0/1 identifies the tenant pipeline
        // this packet was traversing.
        let metadata = packet_in
            .pattern
            .metadata
            .map(|m| m.value)
            .unwrap_or_default();
        let (_, virtual_switch_id) = MetadataTag::decode(metadata);
        let datapath_id = self.features.datapath_id;

        let Some(virtual_switch) = hypervisor.virtual_switch_by_id_mut(virtual_switch_id) else {
            warn!(
                "{} packet in from unknown virtual switch {}",
                self, virtual_switch_id
            );
            return false;
        };
        if !virtual_switch.is_connected() {
            return false;
        }
        let Some(virtual_port) = virtual_switch.virtual_port_no(datapath_id, in_port) else {
            warn!(
                "{} packet in on port {} outside the virtual switch port map",
                self, in_port
            );
            return false;
        };

        let mut pattern = packet_in.pattern.clone();
        pattern.in_port = Some(virtual_port);
        // Return the tenant's own metadata bits to their original position.
        let tenant_metadata = metadata >> tag::METADATA_TAG_BITS;
        pattern.metadata = if tenant_metadata != 0 {
            Some(crate::message::Mask {
                value: tenant_metadata,
                mask: None,
            })
        } else {
            None
        };

        virtual_switch.send_async_message(Message::PacketIn(PacketIn {
            total_len: packet_in.total_len,
            reason: packet_in.reason,
            table_id: packet_in.table_id - 2,
            cookie: packet_in.cookie,
            pattern,
            payload: packet_in.payload,
        }));
        false
    }

    /// Route a reply carrying a translated xid back to the virtual switch
    /// that issued the request. Returns false for xids we did not allocate.
    fn forward_reply(&mut self, xid: Xid, message: Message, hypervisor: &mut Hypervisor) -> bool {
        let Some(source) = self.xid_map.remove(&xid) else {
            return false;
        };
        match hypervisor.virtual_switch_by_id_mut(source.virtual_switch) {
            Some(virtual_switch) if virtual_switch.is_connected() => {
                virtual_switch.send_to_controller(source.original_xid, message);
            }
            _ => {
                trace!("{} dropping reply for a virtual switch that is gone", self);
            }
        }
        true
    }

    /// Reset all shortest-path data to its seeded state: this switch at
    /// distance 0, every directly linked neighbour at distance 1.
    pub fn reset_distances(&mut self, links: &HashMap<LinkId, topology::DiscoveredLink>) {
        self.dist.clear();
        self.next.clear();

        self.set_distance(self.id, 0);
        for (port_no, port) in &self.ports {
            let Some(link_id) = port.link else { continue };
            let Some(link) = links.get(&link_id) else { continue };
            if let Some((other, _)) = link.other_endpoint(self.id) {
                self.dist.insert(other, 1);
                self.next.insert(other, *port_no);
            }
        }
    }

    pub fn get_distance(&self, switch_id: SwitchId) -> u32 {
        self.dist.get(&switch_id).copied().unwrap_or(INFINITE)
    }

    pub fn set_distance(&mut self, switch_id: SwitchId, distance: u32) {
        self.dist.insert(switch_id, distance);
    }

    pub fn get_next(&self, switch_id: SwitchId) -> Option<u32> {
        self.next.get(&switch_id).copied()
    }

    pub fn set_next(&mut self, switch_id: SwitchId, port_no: u32) {
        self.next.insert(switch_id, port_no);
    }

    pub fn set_link(&mut self, port_no: u32, link: LinkId) {
        if let Some(port) = self.ports.get_mut(&port_no) {
            port.link = Some(link);
        }
    }

    pub fn clear_port_link(&mut self, port_no: u32) {
        if let Some(port) = self.ports.get_mut(&port_no) {
            port.link = None;
        }
    }

    pub fn port_link(&self, port_no: u32) -> Option<LinkId> {
        self.ports.get(&port_no).and_then(|port| port.link)
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn set_topology_task(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.topology_task.replace(task) {
            previous.abort();
        }
    }

    /// Emit the next round-robin topology probe as a packet-out.
    pub fn emit_topology_probe(&mut self) {
        if self.ports.is_empty() {
            return;
        }
        let mut port_nos: Vec<u32> = self.ports.keys().copied().collect();
        port_nos.sort_unstable();
        self.topology_discovery_port %= port_nos.len();
        let port_no = port_nos[self.topology_discovery_port];
        self.topology_discovery_port += 1;

        let payload = topology::encode_probe(self.id, port_no);
        self.send(Message::PacketOut(PacketOut {
            payload: crate::message::Payload::NotBuffered(payload),
            in_port: crate::message::OfpPort::OFPPController as u32,
            actions: vec![crate::message::Action::output(port_no)],
        }));
    }

    /// The virtual switches interested in a port that still resolve through
    /// the registry. Dead ids are dropped from the interest set.
    fn live_interested(&mut self, hypervisor: &Hypervisor, port_no: u32) -> Vec<u32> {
        let Some(interested) = self.needed_ports.get_mut(&port_no) else {
            return vec![];
        };
        interested.retain(|id| hypervisor.virtual_switch_by_id(*id).is_some());
        interested.iter().copied().collect()
    }
}
