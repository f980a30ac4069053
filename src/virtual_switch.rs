//! A tenant's virtual switch: the state machine deciding when it is
//! reachable on the substrate, the controller-facing session, and the
//! translation of everything the tenant controller says into the shared
//! pipeline.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::hypervisor::{Event, Hypervisor};
use crate::message::{
    Action, BadMatchCode, BadRequestCode, Capabilities, ErrorMsg, ErrorType, FlowMod, GroupMod,
    Message, MultipartReq, MultipartReqBody, MultipartResp, MultipartRespBody, OfpPort, PacketOut,
    PortConfig, PortDesc, PortState, SwitchConfig, SwitchFeatures, OFPCML_NO_BUFFER,
};
use crate::ofp_connection::{OfpConnection, SessionPeer};
use crate::ofp_header::Xid;
use crate::ofp_message::OfpMessage;
use crate::physical_switch::SwitchId;
use crate::slice::PortMapConfig;

/// Tables the synthesized features-reply advertises to the tenant.
const TENANT_TABLE_COUNT: u8 = 64;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualSwitchState {
    Down,
    TryConnecting,
    Connected,
}

impl fmt::Display for VirtualSwitchState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            VirtualSwitchState::Down => "down",
            VirtualSwitchState::TryConnecting => "try-connecting",
            VirtualSwitchState::Connected => "connected",
        })
    }
}

/// Where a tenant-visible port really lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPort {
    pub datapath_id: u64,
    pub port_no: u32,
}

pub struct VirtualSwitch {
    /// Small integer id carried in metadata tags and interest sets.
    id: u32,
    datapath_id: u64,
    slice_id: u8,
    ports: HashMap<u32, VirtualPort>,
    state: VirtualSwitchState,
    connection: Option<OfpConnection>,
    backoff: Duration,
    connect_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

impl fmt::Display for VirtualSwitch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[VirtualSwitch dpid={:#x}, state={}]",
            self.datapath_id, self.state
        )
    }
}

impl VirtualSwitch {
    pub fn new(id: u32, datapath_id: u64, slice_id: u8, ports: &[PortMapConfig]) -> VirtualSwitch {
        VirtualSwitch {
            id,
            datapath_id,
            slice_id,
            ports: ports
                .iter()
                .map(|port| {
                    (
                        port.virtual_port,
                        VirtualPort {
                            datapath_id: port.physical_datapath_id,
                            port_no: port.physical_port,
                        },
                    )
                })
                .collect(),
            state: VirtualSwitchState::Down,
            connection: None,
            backoff: INITIAL_BACKOFF,
            connect_task: None,
            retry_task: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn datapath_id(&self) -> u64 {
        self.datapath_id
    }

    pub fn slice_id(&self) -> u8 {
        self.slice_id
    }

    pub fn ports(&self) -> &HashMap<u32, VirtualPort> {
        &self.ports
    }

    pub fn state(&self) -> VirtualSwitchState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == VirtualSwitchState::Connected
    }

    /// The physical location of a tenant-visible port.
    pub fn physical_port(&self, virtual_port: u32) -> Option<VirtualPort> {
        self.ports.get(&virtual_port).copied()
    }

    /// The tenant-visible number of a physical port, if this switch maps it.
    pub fn virtual_port_no(&self, datapath_id: u64, port_no: u32) -> Option<u32> {
        self.ports
            .iter()
            .find(|(_, mapping)| {
                mapping.datapath_id == datapath_id && mapping.port_no == port_no
            })
            .map(|(virtual_port, _)| *virtual_port)
    }

    /// Called after the substrate changed: start the controller connection
    /// when every referenced physical switch is registered and reachable,
    /// drop it when that stops being true.
    pub fn check_online(&mut self, hypervisor: &Hypervisor) {
        let viable = hypervisor.virtual_switch_viable(self);
        match self.state {
            VirtualSwitchState::Down if viable => {
                let Some(slice) = hypervisor.slices().get(self.slice_id) else {
                    return;
                };
                let (host, port) = slice.controller_endpoint();
                info!("{} substrate is viable, connecting to controller", self);
                self.try_connect((host.to_string(), port), hypervisor.event_tx().clone());
            }
            VirtualSwitchState::TryConnecting | VirtualSwitchState::Connected if !viable => {
                info!("{} substrate is no longer viable", self);
                self.go_down();
            }
            _ => {}
        }
    }

    fn try_connect(&mut self, endpoint: (String, u16), event_tx: mpsc::UnboundedSender<Event>) {
        self.state = VirtualSwitchState::TryConnecting;
        let datapath_id = self.datapath_id;
        let task = tokio::spawn(async move {
            let result = TcpStream::connect(endpoint).await;
            let _ = event_tx.send(Event::TenantConnected(datapath_id, result));
        });
        if let Some(previous) = self.connect_task.replace(task) {
            previous.abort();
        }
    }

    /// The outbound connect finished.
    pub(crate) fn handle_connected(
        &mut self,
        stream: TcpStream,
        event_tx: mpsc::UnboundedSender<Event>,
    ) {
        if self.state != VirtualSwitchState::TryConnecting {
            // Went down while the connect was in flight.
            return;
        }
        let mut connection =
            OfpConnection::open(stream, SessionPeer::Tenant(self.datapath_id), event_tx);
        if let Err(error) = connection.send_message(Message::Hello) {
            error!("{} could not send hello: {}", self, error);
        }
        self.connection = Some(connection);
        self.state = VirtualSwitchState::Connected;
        self.backoff = INITIAL_BACKOFF;
        info!("{} got connected", self);
    }

    /// The outbound connect failed; back off and try again.
    pub(crate) fn handle_connect_failed(&mut self, event_tx: mpsc::UnboundedSender<Event>) {
        if self.state != VirtualSwitchState::TryConnecting {
            return;
        }
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        debug!("{} controller connect failed, retrying in {:?}", self, delay);
        let datapath_id = self.datapath_id;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(Event::TenantRetry(datapath_id));
        });
        if let Some(previous) = self.retry_task.replace(task) {
            previous.abort();
        }
    }

    /// The backoff expired; connect again if still wanted.
    pub(crate) fn retry(&mut self, endpoint: (String, u16), event_tx: mpsc::UnboundedSender<Event>) {
        if self.state != VirtualSwitchState::TryConnecting {
            return;
        }
        self.try_connect(endpoint, event_tx);
    }

    /// Close the controller session and cancel whatever is pending.
    pub fn go_down(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.stop();
        }
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        if self.state != VirtualSwitchState::Down {
            info!("{} went down", self);
        }
        self.state = VirtualSwitchState::Down;
        self.backoff = INITIAL_BACKOFF;
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut OfpConnection> {
        self.connection.as_mut()
    }

    /// Install an already-established controller session. Test hook.
    #[cfg(test)]
    pub(crate) fn force_connected(&mut self, connection: OfpConnection) {
        self.connection = Some(connection);
        self.state = VirtualSwitchState::Connected;
    }

    /// Send a reply carrying the tenant's xid.
    pub fn send_to_controller(&mut self, xid: Xid, message: Message) {
        let Some(connection) = self.connection.as_mut() else {
            trace!("{} dropping message, not connected", self);
            return;
        };
        if let Err(error) = connection.send_message_with_xid(xid, message) {
            error!("{} could not serialize message: {}", self, error);
        }
    }

    /// Send an asynchronous notification (packet-in, port-status).
    pub fn send_async_message(&mut self, message: Message) {
        let Some(connection) = self.connection.as_mut() else {
            trace!("{} dropping message, not connected", self);
            return;
        };
        if let Err(error) = connection.send_message(message) {
            error!("{} could not serialize message: {}", self, error);
        }
    }

    /// Dispatch an asymmetric message from the tenant controller.
    pub fn handle_message(&mut self, xid: Xid, message: Message, hypervisor: &mut Hypervisor) {
        match message {
            Message::FeaturesReq => {
                let features = SwitchFeatures {
                    datapath_id: self.datapath_id,
                    num_buffers: 0,
                    num_tables: TENANT_TABLE_COUNT,
                    auxiliary_id: 0,
                    supported_capabilities: Capabilities::default(),
                };
                self.send_to_controller(xid, Message::FeaturesReply(features));
            }
            Message::GetConfigReq => {
                self.send_to_controller(
                    xid,
                    Message::GetConfigReply(SwitchConfig {
                        flags: 0,
                        miss_send_len: OFPCML_NO_BUFFER,
                    }),
                );
            }
            Message::SetConfig(_) => {
                trace!("{} set_config accepted and ignored", self);
            }
            Message::BarrierRequest => {
                // Barriers are not fanned out across the substrate; answer
                // for the virtual switch itself.
                self.send_to_controller(xid, Message::BarrierReply);
            }
            Message::FlowMod(flow_mod) => {
                self.handle_flow_mod(xid, flow_mod, hypervisor);
            }
            Message::GroupMod(group_mod) => {
                self.handle_group_mod(xid, group_mod, hypervisor);
            }
            Message::MeterMod(_) => {
                warn!("{} received meter mod, not supported", self);
                self.send_to_controller(
                    xid,
                    Message::Error(ErrorMsg::new(ErrorType::MeterModFailed, 0, vec![])),
                );
            }
            Message::PacketOut(packet_out) => {
                self.handle_packet_out(packet_out, hypervisor);
            }
            Message::MultipartReq(request) => {
                self.handle_multipart_request(xid, request);
            }
            Message::Unsupported { code } => {
                warn!("{} received unhandled message {}", self, code);
                self.send_to_controller(
                    xid,
                    Message::Error(ErrorMsg::bad_request(BadRequestCode::BadType, vec![])),
                );
            }
            other => {
                warn!("{} received {:?} it shouldn't", self, other);
            }
        }
    }

    /// The first 64 bytes of the offending message, as error payload.
    fn offending_data(xid: Xid, message: Message) -> Vec<u8> {
        let mut data = Message::marshal(xid, message).unwrap_or_default();
        data.truncate(64);
        data
    }

    fn handle_flow_mod(&mut self, xid: Xid, flow_mod: FlowMod, hypervisor: &mut Hypervisor) {
        if let Some(virtual_port) = flow_mod.pattern.in_port {
            if self.physical_port(virtual_port).is_none() {
                warn!(
                    "{} flow mod matches unknown virtual port {}",
                    self, virtual_port
                );
                let data = Self::offending_data(xid, Message::FlowMod(flow_mod));
                self.send_to_controller(
                    xid,
                    Message::Error(ErrorMsg::bad_match(BadMatchCode::BadValue, data)),
                );
                return;
            }
        }

        let targets = self.target_switches(&flow_mod, hypervisor);
        if targets.is_empty() {
            debug!("{} flow mod has no registered target switches", self);
            return;
        }

        for switch_id in targets {
            let Some(mut physical) = hypervisor.take_physical_switch(switch_id) else {
                continue;
            };
            match physical.rewrite_flow_mod(&flow_mod, self) {
                Ok(rewritten) => {
                    // New output groups referenced by the rewrite must hit
                    // the switch before the flow-mod does.
                    physical.update_groups_for(self, hypervisor);
                    physical.send_request_message(Message::FlowMod(rewritten), xid, self.id);
                    hypervisor.restore_physical_switch(switch_id, physical);
                }
                Err(error) => {
                    hypervisor.restore_physical_switch(switch_id, physical);
                    warn!("{} flow mod rejected: {:?}", self, error);
                    let data = Self::offending_data(xid, Message::FlowMod(flow_mod));
                    self.send_to_controller(xid, Message::Error(error.to_error_msg(data)));
                    return;
                }
            }
        }
    }

    fn handle_group_mod(&mut self, xid: Xid, group_mod: GroupMod, hypervisor: &mut Hypervisor) {
        for switch_id in self.hosting_switches(hypervisor) {
            let Some(mut physical) = hypervisor.take_physical_switch(switch_id) else {
                continue;
            };
            match physical.rewrite_group_mod(&group_mod, self) {
                Ok(rewritten) => {
                    physical.update_groups_for(self, hypervisor);
                    physical.send_request_message(Message::GroupMod(rewritten), xid, self.id);
                    hypervisor.restore_physical_switch(switch_id, physical);
                }
                Err(error) => {
                    hypervisor.restore_physical_switch(switch_id, physical);
                    warn!("{} group mod rejected: {:?}", self, error);
                    let data = Self::offending_data(xid, Message::GroupMod(group_mod));
                    self.send_to_controller(xid, Message::Error(error.to_error_msg(data)));
                    return;
                }
            }
        }
    }

    fn handle_packet_out(&mut self, packet_out: PacketOut, hypervisor: &mut Hypervisor) {
        let Some(switch_id) = self.packet_out_target(&packet_out, hypervisor) else {
            warn!("{} packet out with no registered target switch", self);
            return;
        };
        let Some(mut physical) = hypervisor.take_physical_switch(switch_id) else {
            return;
        };
        match physical.rewrite_action_list(&packet_out.actions, self) {
            Ok(actions) => {
                physical.update_groups_for(self, hypervisor);
                let message = Message::PacketOut(PacketOut {
                    payload: packet_out.payload,
                    in_port: OfpPort::OFPPController as u32,
                    actions,
                });
                if let Err(error) = physical.connection_mut().send_message(message) {
                    error!("{} could not serialize packet out: {}", self, error);
                }
                hypervisor.restore_physical_switch(switch_id, physical);
            }
            Err(error) => {
                hypervisor.restore_physical_switch(switch_id, physical);
                warn!("{} packet out rejected: {:?}", self, error);
                self.send_async_message(Message::Error(error.to_error_msg(vec![])));
            }
        }
    }

    /// The switch a tenant packet-out is injected at: the owner of the
    /// tenant's in-port when it is physical, else the owner of the first
    /// output's port, else any registered hosting switch. The output groups
    /// carry the packet the rest of the way.
    fn packet_out_target(
        &self,
        packet_out: &PacketOut,
        hypervisor: &Hypervisor,
    ) -> Option<SwitchId> {
        if packet_out.in_port < OfpPort::OFPPMax as u32 {
            if let Some(target) = self
                .physical_port(packet_out.in_port)
                .and_then(|mapping| hypervisor.switch_id_by_datapath(mapping.datapath_id))
            {
                return Some(target);
            }
        }
        for action in &packet_out.actions {
            let Action::Output { port, .. } = action else {
                continue;
            };
            if *port >= OfpPort::OFPPMax as u32 {
                continue;
            }
            if let Some(target) = self
                .physical_port(*port)
                .and_then(|mapping| hypervisor.switch_id_by_datapath(mapping.datapath_id))
            {
                return Some(target);
            }
        }
        self.hosting_switches(hypervisor).into_iter().next()
    }

    /// Registered physical switches hosting a port of this virtual switch.
    fn hosting_switches(&self, hypervisor: &Hypervisor) -> Vec<SwitchId> {
        let mut switches: Vec<SwitchId> = self
            .ports
            .values()
            .filter_map(|mapping| hypervisor.switch_id_by_datapath(mapping.datapath_id))
            .collect();
        switches.sort_unstable();
        switches.dedup();
        switches
    }

    /// Flow-mods matching on a tenant in-port only make sense on the switch
    /// owning that port; everything else goes to all hosting switches.
    fn target_switches(&self, flow_mod: &FlowMod, hypervisor: &Hypervisor) -> Vec<SwitchId> {
        if let Some(virtual_port) = flow_mod.pattern.in_port {
            return self
                .physical_port(virtual_port)
                .and_then(|mapping| hypervisor.switch_id_by_datapath(mapping.datapath_id))
                .into_iter()
                .collect();
        }
        self.hosting_switches(hypervisor)
    }

    fn handle_multipart_request(&mut self, xid: Xid, request: MultipartReq) {
        match request.body {
            MultipartReqBody::Desc => {
                self.send_to_controller(
                    xid,
                    Message::MultipartReply(MultipartResp {
                        flags: 0,
                        body: MultipartRespBody::Desc {
                            manufacturer: "ofvisor".to_string(),
                            hardware: "network hypervisor".to_string(),
                            software: env!("CARGO_PKG_VERSION").to_string(),
                            serial_number: String::new(),
                            datapath: format!("virtual switch {:#x}", self.datapath_id),
                        },
                    }),
                );
            }
            MultipartReqBody::PortDesc => {
                let ports = self.port_descriptions();
                self.send_to_controller(
                    xid,
                    Message::MultipartReply(MultipartResp {
                        flags: 0,
                        body: MultipartRespBody::PortDesc(ports),
                    }),
                );
            }
            _ => {
                // Stats are not synthesized across physical switches.
                self.send_to_controller(
                    xid,
                    Message::Error(ErrorMsg::bad_request(BadRequestCode::BadMultipart, vec![])),
                );
            }
        }
    }

    /// Port descriptions synthesized from the configured port map.
    fn port_descriptions(&self) -> Vec<PortDesc> {
        let mut virtual_ports: Vec<u32> = self.ports.keys().copied().collect();
        virtual_ports.sort_unstable();
        virtual_ports
            .into_iter()
            .map(|virtual_port| PortDesc {
                port_no: virtual_port,
                hw_addr: 0x0200_0000_0000
                    | (u64::from(self.id) << 8)
                    | u64::from(virtual_port & 0xff),
                name: format!("veth{}", virtual_port),
                config: PortConfig::default(),
                state: PortState {
                    link_down: false,
                    blocked: false,
                    live: true,
                },
                curr: 0,
                advertised: 0,
                supported: 0,
                peer: 0,
                curr_speed: 0,
                max_speed: 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn virtual_switch() -> VirtualSwitch {
        VirtualSwitch::new(
            3,
            0x100,
            1,
            &[
                PortMapConfig {
                    virtual_port: 1,
                    physical_datapath_id: 0xa,
                    physical_port: 7,
                },
                PortMapConfig {
                    virtual_port: 2,
                    physical_datapath_id: 0xb,
                    physical_port: 9,
                },
            ],
        )
    }

    #[test]
    fn test_port_map_lookups() {
        let vs = virtual_switch();
        assert_eq!(
            vs.physical_port(1),
            Some(VirtualPort {
                datapath_id: 0xa,
                port_no: 7
            })
        );
        assert_eq!(vs.physical_port(4), None);
        assert_eq!(vs.virtual_port_no(0xb, 9), Some(2));
        assert_eq!(vs.virtual_port_no(0xb, 7), None);
        assert_eq!(vs.virtual_port_no(0xc, 9), None);
    }

    #[test]
    fn test_port_descriptions_follow_the_port_map() {
        let vs = virtual_switch();
        let descriptions = vs.port_descriptions();
        assert_eq!(descriptions.len(), 2);
        assert_eq!(descriptions[0].port_no, 1);
        assert_eq!(descriptions[0].name, "veth1");
        assert_eq!(descriptions[1].port_no, 2);
        assert!(descriptions[1].state.live);
        // Locally administered unicast MAC.
        assert_eq!(descriptions[0].hw_addr >> 40, 0x02);
    }

    #[test]
    fn test_starts_down() {
        let vs = virtual_switch();
        assert_eq!(vs.state(), VirtualSwitchState::Down);
        assert!(!vs.is_connected());
    }
}
