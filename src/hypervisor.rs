//! The hypervisor: the registries tying everything together and the single
//! event loop every session, timer and topology change funnels into.
//!
//! All state lives here and is only mutated from `handle_event`, which the
//! reactor drives from one task; sessions and timers communicate through
//! the event channel, so no locks guard any of the core structures.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::message::Message;
use crate::ofp_connection::{self, OfpConnection, SessionPeer};
use crate::ofp_header::Xid;
use crate::physical_switch::{PhysicalSwitch, SwitchId};
use crate::slice::{SliceConfig, SliceRegistry};
use crate::topology::{self, DiscoveredLink, LinkId, INFINITE};
use crate::virtual_switch::VirtualSwitch;

/// Everything that can happen to the hypervisor.
#[derive(Debug)]
pub enum Event {
    /// A physical switch finished its TCP handshake.
    SwitchAccepted(TcpStream),
    SwitchMessage(SwitchId, Xid, Message),
    SwitchEchoTick(SwitchId),
    SwitchClosed(SwitchId),
    /// A switch's turn to emit its next topology probe.
    TopologyTick(SwitchId),
    /// Periodic scan for links that stopped being refreshed.
    LinkSweep,
    /// An outbound tenant-controller connect finished.
    TenantConnected(u64, io::Result<TcpStream>),
    TenantMessage(u64, Xid, Message),
    TenantEchoTick(u64),
    TenantClosed(u64),
    /// A tenant-controller connect backoff expired.
    TenantRetry(u64),
}

pub struct Hypervisor {
    event_tx: mpsc::UnboundedSender<Event>,
    slices: SliceRegistry,
    physical_switches: HashMap<SwitchId, PhysicalSwitch>,
    datapath_to_switch: HashMap<u64, SwitchId>,
    virtual_switches: HashMap<u64, VirtualSwitch>,
    /// internal id -> datapath id, for resolving the weak references held
    /// in xid maps and interest sets.
    virtual_switch_ids: HashMap<u32, u64>,
    links: HashMap<LinkId, DiscoveredLink>,
    next_switch_id: u32,
    next_link_id: u64,
}

impl Hypervisor {
    /// Build the hypervisor and its virtual switches from the configured
    /// slices. The returned receiver feeds `run`.
    pub fn new(configs: &[SliceConfig]) -> (Hypervisor, mpsc::UnboundedReceiver<Event>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut virtual_switches = HashMap::new();
        let mut virtual_switch_ids = HashMap::new();
        let mut next_id = 0u32;
        for config in configs {
            for switch_config in &config.virtual_switches {
                let id = next_id;
                next_id += 1;
                virtual_switches.insert(
                    switch_config.datapath_id,
                    VirtualSwitch::new(id, switch_config.datapath_id, config.id, &switch_config.ports),
                );
                virtual_switch_ids.insert(id, switch_config.datapath_id);
            }
        }

        (
            Hypervisor {
                event_tx,
                slices: SliceRegistry::new(configs),
                physical_switches: HashMap::new(),
                datapath_to_switch: HashMap::new(),
                virtual_switches,
                virtual_switch_ids,
                links: HashMap::new(),
                next_switch_id: 1,
                next_link_id: 1,
            },
            event_rx,
        )
    }

    pub fn slices(&self) -> &SliceRegistry {
        &self.slices
    }

    pub fn event_tx(&self) -> &mpsc::UnboundedSender<Event> {
        &self.event_tx
    }

    pub fn register_datapath(&mut self, datapath_id: u64, switch_id: SwitchId) {
        if let Some(previous) = self.datapath_to_switch.insert(datapath_id, switch_id) {
            if previous != switch_id {
                error!(
                    "datapath {:#x} re-registered by switch {} while owned by {}",
                    datapath_id, switch_id, previous
                );
            }
        }
    }

    pub fn switch_id_by_datapath(&self, datapath_id: u64) -> Option<SwitchId> {
        self.datapath_to_switch.get(&datapath_id).copied()
    }

    pub fn physical_switch(&self, id: SwitchId) -> Option<&PhysicalSwitch> {
        self.physical_switches.get(&id)
    }

    pub(crate) fn take_physical_switch(&mut self, id: SwitchId) -> Option<PhysicalSwitch> {
        self.physical_switches.remove(&id)
    }

    pub(crate) fn restore_physical_switch(&mut self, id: SwitchId, switch: PhysicalSwitch) {
        self.physical_switches.insert(id, switch);
    }

    pub fn virtual_switches(&self) -> impl Iterator<Item = &VirtualSwitch> {
        self.virtual_switches.values()
    }

    pub fn virtual_switch_by_datapath(&self, datapath_id: u64) -> Option<&VirtualSwitch> {
        self.virtual_switches.get(&datapath_id)
    }

    pub fn virtual_switch_by_id(&self, id: u32) -> Option<&VirtualSwitch> {
        let datapath_id = self.virtual_switch_ids.get(&id)?;
        self.virtual_switches.get(datapath_id)
    }

    pub fn virtual_switch_by_id_mut(&mut self, id: u32) -> Option<&mut VirtualSwitch> {
        let datapath_id = self.virtual_switch_ids.get(&id).copied()?;
        self.virtual_switches.get_mut(&datapath_id)
    }

    /// Serve events forever: the accept loop and the link sweep feed the
    /// channel alongside every session's tasks.
    pub async fn run(mut self, listener: TcpListener, mut event_rx: mpsc::UnboundedReceiver<Event>) {
        let accept_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, address)) => {
                        info!("physical switch connection from {}", address);
                        if accept_tx.send(Event::SwitchAccepted(stream)).is_err() {
                            return;
                        }
                    }
                    Err(error) => error!("accept failed: {}", error),
                }
            }
        });

        let sweep_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(topology::PERIOD);
            interval.tick().await;
            loop {
                interval.tick().await;
                if sweep_tx.send(Event::LinkSweep).is_err() {
                    return;
                }
            }
        });

        while let Some(event) = event_rx.recv().await {
            self.handle_event(event);
        }
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::SwitchAccepted(stream) => self.handle_switch_accepted(stream),
            Event::SwitchMessage(id, xid, message) => self.handle_switch_message(id, xid, message),
            Event::SwitchEchoTick(id) => self.handle_switch_echo_tick(id),
            Event::SwitchClosed(id) => {
                if let Some(switch) = self.physical_switches.remove(&id) {
                    info!("{} connection closed", switch);
                    self.stop_physical(switch);
                }
            }
            Event::TopologyTick(id) => self.handle_topology_tick(id),
            Event::LinkSweep => self.handle_link_sweep(),
            Event::TenantConnected(datapath_id, result) => {
                self.handle_tenant_connected(datapath_id, result)
            }
            Event::TenantMessage(datapath_id, xid, message) => {
                self.handle_tenant_message(datapath_id, xid, message)
            }
            Event::TenantEchoTick(datapath_id) => self.handle_tenant_echo_tick(datapath_id),
            Event::TenantClosed(datapath_id) => self.handle_tenant_closed(datapath_id),
            Event::TenantRetry(datapath_id) => self.handle_tenant_retry(datapath_id),
        }
    }

    fn handle_switch_accepted(&mut self, stream: TcpStream) {
        let id = SwitchId(self.next_switch_id);
        self.next_switch_id += 1;
        let connection =
            OfpConnection::open(stream, SessionPeer::Physical(id), self.event_tx.clone());
        let mut switch = PhysicalSwitch::new(id, connection);
        if let Err(error) = switch.start(self) {
            error!("physical switch {} failed to start: {}", id, error);
            switch.stop();
            return;
        }
        self.physical_switches.insert(id, switch);
        self.schedule_topology_tick(id, topology::PERIOD);
    }

    fn handle_switch_message(&mut self, id: SwitchId, xid: Xid, message: Message) {
        let Some(mut switch) = self.physical_switches.remove(&id) else {
            trace!("message for unknown switch {} dropped", id);
            return;
        };
        match ofp_connection::handle_symmetric(switch.connection_mut(), xid, &message) {
            Ok(true) => {
                self.physical_switches.insert(id, switch);
                return;
            }
            Ok(false) => {}
            Err(error) => warn!("{} session error: {}", switch, error),
        }
        let recompute = switch.handle_message(xid, message, self);
        self.physical_switches.insert(id, switch);
        if recompute {
            self.recompute_routes();
        }
    }

    fn handle_switch_echo_tick(&mut self, id: SwitchId) {
        let Some(mut switch) = self.physical_switches.remove(&id) else {
            return;
        };
        let connection = switch.connection_mut();
        if !connection.echo_received() {
            info!("{} echo timeout", switch);
            self.stop_physical(switch);
            return;
        }
        connection.set_echo_received(false);
        if let Err(error) = connection.send_message(Message::EchoRequest(vec![])) {
            warn!("{} could not send echo request: {}", switch, error);
        }
        self.physical_switches.insert(id, switch);
    }

    /// Tear down a switch that is already out of the registry: cancel its
    /// tasks, forget its datapath, drop its links and let the whole network
    /// recalculate. A virtual switch that only depended on this switch gets
    /// stopped by the recompute.
    fn stop_physical(&mut self, mut switch: PhysicalSwitch) {
        switch.stop();
        let datapath_id = switch.datapath_id();
        if self.datapath_to_switch.get(&datapath_id) == Some(&switch.id()) {
            self.datapath_to_switch.remove(&datapath_id);
        }
        let link_ids: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, link)| link.other_endpoint(switch.id()).is_some())
            .map(|(id, _)| *id)
            .collect();
        for link_id in link_ids {
            self.clear_link(link_id, &mut switch);
        }
        self.recompute_routes();
    }

    /// Remove a link and clear both endpoint ports. `current` is the switch
    /// currently taken out of the registry, if any.
    pub(crate) fn clear_link(&mut self, link_id: LinkId, current: &mut PhysicalSwitch) {
        let Some(link) = self.links.remove(&link_id) else {
            return;
        };
        for (switch_id, port_no) in [link.endpoint_a, link.endpoint_b] {
            if switch_id == current.id() {
                current.clear_port_link(port_no);
            } else if let Some(switch) = self.physical_switches.get_mut(&switch_id) {
                switch.clear_port_link(port_no);
            }
        }
    }

    fn handle_topology_tick(&mut self, id: SwitchId) {
        let Some(switch) = self.physical_switches.get_mut(&id) else {
            return;
        };
        switch.emit_topology_probe();
        let ports = switch.port_count().max(1) as u32;
        self.schedule_topology_tick(id, topology::PERIOD / ports);
    }

    fn schedule_topology_tick(&mut self, id: SwitchId, delay: Duration) {
        let event_tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(Event::TopologyTick(id));
        });
        match self.physical_switches.get_mut(&id) {
            Some(switch) => switch.set_topology_task(task),
            None => task.abort(),
        }
    }

    fn handle_link_sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, link)| link.expired(now))
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for link_id in expired {
            let Some(link) = self.links.remove(&link_id) else {
                continue;
            };
            info!(
                "link {}:{} <-> {}:{} lost",
                link.endpoint_a.0, link.endpoint_a.1, link.endpoint_b.0, link.endpoint_b.1
            );
            for (switch_id, port_no) in [link.endpoint_a, link.endpoint_b] {
                if let Some(switch) = self.physical_switches.get_mut(&switch_id) {
                    switch.clear_port_link(port_no);
                }
            }
        }
        self.recompute_routes();
    }

    /// A probe emitted by `peer` arrived on `local_port` of `local`. Create
    /// or refresh the edge. Returns true when the topology changed.
    pub(crate) fn link_discovered(
        &mut self,
        local: &mut PhysicalSwitch,
        local_port: u32,
        peer: (SwitchId, u32),
    ) -> bool {
        let local_endpoint = (local.id(), local_port);

        if let Some(link_id) = local.port_link(local_port) {
            if let Some(link) = self.links.get_mut(&link_id) {
                if link.connects(local_endpoint, peer) {
                    link.refresh();
                    return false;
                }
            }
        }

        let peer_known = peer.0 == local.id() || self.physical_switches.contains_key(&peer.0);
        if !peer_known {
            warn!("probe from unknown switch {} dropped", peer.0);
            return false;
        }

        // Both endpoints forget whatever they believed before.
        if let Some(previous) = local.port_link(local_port) {
            self.clear_link(previous, local);
        }
        let peer_previous = if peer.0 == local.id() {
            local.port_link(peer.1)
        } else {
            self.physical_switches
                .get(&peer.0)
                .and_then(|switch| switch.port_link(peer.1))
        };
        if let Some(previous) = peer_previous {
            self.clear_link(previous, local);
        }

        let link_id = LinkId(self.next_link_id);
        self.next_link_id += 1;
        self.links
            .insert(link_id, DiscoveredLink::new(peer, local_endpoint));
        local.set_link(local_port, link_id);
        if peer.0 == local.id() {
            local.set_link(peer.1, link_id);
        } else if let Some(switch) = self.physical_switches.get_mut(&peer.0) {
            switch.set_link(peer.1, link_id);
        }
        info!(
            "discovered link {}:{} <-> {}:{}",
            peer.0, peer.1, local_endpoint.0, local_endpoint.1
        );
        true
    }

    fn handle_tenant_connected(&mut self, datapath_id: u64, result: io::Result<TcpStream>) {
        let Some(mut virtual_switch) = self.virtual_switches.remove(&datapath_id) else {
            return;
        };
        match result {
            Ok(stream) => virtual_switch.handle_connected(stream, self.event_tx.clone()),
            Err(error) => {
                debug!("{} controller connect failed: {}", virtual_switch, error);
                virtual_switch.handle_connect_failed(self.event_tx.clone());
            }
        }
        self.virtual_switches.insert(datapath_id, virtual_switch);
    }

    fn handle_tenant_message(&mut self, datapath_id: u64, xid: Xid, message: Message) {
        let Some(mut virtual_switch) = self.virtual_switches.remove(&datapath_id) else {
            trace!("message for unknown virtual switch {:#x} dropped", datapath_id);
            return;
        };
        if let Some(connection) = virtual_switch.connection_mut() {
            match ofp_connection::handle_symmetric(connection, xid, &message) {
                Ok(true) => {
                    self.virtual_switches.insert(datapath_id, virtual_switch);
                    return;
                }
                Ok(false) => {}
                Err(error) => warn!("{} session error: {}", virtual_switch, error),
            }
        }
        virtual_switch.handle_message(xid, message, self);
        self.virtual_switches.insert(datapath_id, virtual_switch);
    }

    fn handle_tenant_echo_tick(&mut self, datapath_id: u64) {
        let Some(mut virtual_switch) = self.virtual_switches.remove(&datapath_id) else {
            return;
        };
        let alive = virtual_switch
            .connection_mut()
            .map(|connection| connection.echo_received());
        match alive {
            None => {}
            Some(false) => {
                info!("{} echo timeout", virtual_switch);
                virtual_switch.go_down();
                virtual_switch.check_online(self);
            }
            Some(true) => {
                if let Some(connection) = virtual_switch.connection_mut() {
                    connection.set_echo_received(false);
                    if let Err(error) = connection.send_message(Message::EchoRequest(vec![])) {
                        warn!("{} could not send echo request: {}", virtual_switch, error);
                    }
                }
            }
        }
        self.virtual_switches.insert(datapath_id, virtual_switch);
    }

    fn handle_tenant_closed(&mut self, datapath_id: u64) {
        let Some(mut virtual_switch) = self.virtual_switches.remove(&datapath_id) else {
            return;
        };
        virtual_switch.go_down();
        // The substrate may still be viable; reconnect if so.
        virtual_switch.check_online(self);
        self.virtual_switches.insert(datapath_id, virtual_switch);
    }

    fn handle_tenant_retry(&mut self, datapath_id: u64) {
        let Some(mut virtual_switch) = self.virtual_switches.remove(&datapath_id) else {
            return;
        };
        let endpoint = self.slices.get(virtual_switch.slice_id()).map(|slice| {
            let (host, port) = slice.controller_endpoint();
            (host.to_string(), port)
        });
        if let Some(endpoint) = endpoint {
            virtual_switch.retry(endpoint, self.event_tx.clone());
        }
        self.virtual_switches.insert(datapath_id, virtual_switch);
    }

    /// A virtual switch may come online when every physical switch it names
    /// is registered and they can all reach each other.
    pub fn virtual_switch_viable(&self, virtual_switch: &VirtualSwitch) -> bool {
        let Some(slice) = self.slices.get(virtual_switch.slice_id()) else {
            return false;
        };
        if !slice.is_started() {
            return false;
        }

        let mut switch_ids = vec![];
        for mapping in virtual_switch.ports().values() {
            let Some(id) = self.switch_id_by_datapath(mapping.datapath_id) else {
                return false;
            };
            let Some(switch) = self.physical_switches.get(&id) else {
                return false;
            };
            if !switch.is_registered() {
                return false;
            }
            switch_ids.push(id);
        }
        switch_ids.sort_unstable();
        switch_ids.dedup();

        // Reachability from the first switch carries to every pair because
        // the discovered links are symmetric.
        let Some((first, rest)) = switch_ids.split_first() else {
            return false;
        };
        let Some(first_switch) = self.physical_switches.get(first) else {
            return false;
        };
        rest.iter()
            .all(|other| first_switch.get_distance(*other) < INFINITE)
    }

    /// Recompute all-pairs shortest paths over the live edge set, bring the
    /// dynamic rules everywhere in line, and re-evaluate every virtual
    /// switch.
    pub fn recompute_routes(&mut self) {
        debug!(
            "recomputing routes over {} switches and {} links",
            self.physical_switches.len(),
            self.links.len()
        );

        let links = &self.links;
        for switch in self.physical_switches.values_mut() {
            switch.reset_distances(links);
        }

        let mut ids: Vec<SwitchId> = self.physical_switches.keys().copied().collect();
        ids.sort_unstable();
        for k in &ids {
            for i in &ids {
                if i == k {
                    continue;
                }
                let Some(via) = self
                    .physical_switches
                    .get(i)
                    .and_then(|switch| switch.get_next(*k))
                else {
                    continue;
                };
                let d_ik = self
                    .physical_switches
                    .get(i)
                    .map(|switch| switch.get_distance(*k))
                    .unwrap_or(INFINITE);
                if d_ik >= INFINITE {
                    continue;
                }
                for j in &ids {
                    if j == i {
                        continue;
                    }
                    let d_kj = self
                        .physical_switches
                        .get(k)
                        .map(|switch| switch.get_distance(*j))
                        .unwrap_or(INFINITE);
                    if d_kj >= INFINITE {
                        continue;
                    }
                    let d_ij = self
                        .physical_switches
                        .get(i)
                        .map(|switch| switch.get_distance(*j))
                        .unwrap_or(INFINITE);
                    if d_ik + d_kj < d_ij {
                        if let Some(switch) = self.physical_switches.get_mut(i) {
                            switch.set_distance(*j, d_ik + d_kj);
                            switch.set_next(*j, via);
                        }
                    }
                }
            }
        }

        for id in ids {
            if let Some(mut switch) = self.physical_switches.remove(&id) {
                switch.update_dynamic_rules(self);
                self.physical_switches.insert(id, switch);
            }
        }

        self.calculate_online();
    }

    /// Re-run the online check on every virtual switch.
    pub fn calculate_online(&mut self) {
        let datapath_ids: Vec<u64> = self.virtual_switches.keys().copied().collect();
        for datapath_id in datapath_ids {
            if let Some(mut virtual_switch) = self.virtual_switches.remove(&datapath_id) {
                virtual_switch.check_online(self);
                self.virtual_switches.insert(datapath_id, virtual_switch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;
    use crate::ofp_header::{OfpHeader, OFP_HEADER_LENGTH};
    use crate::ofp_message::OfpMessage;
    use crate::slice::{PortMapConfig, VirtualSwitchConfig};
    use crate::tag::{MetadataTag, VIRTUAL_SWITCH_BITS};
    use crate::virtual_switch::VirtualSwitchState;

    const SWITCH_A: SwitchId = SwitchId(1);
    const SWITCH_B: SwitchId = SwitchId(2);
    const SWITCH_C: SwitchId = SwitchId(3);
    const DPID_A: u64 = 0xa;
    const DPID_B: u64 = 0xb;
    const DPID_C: u64 = 0xc;
    const TENANT_DPID: u64 = 0x100;

    fn test_config() -> Vec<SliceConfig> {
        vec![SliceConfig {
            id: 0,
            controller_host: "127.0.0.1".to_string(),
            // A port nothing listens on; connects fail fast.
            controller_port: 1,
            max_rate_pps: 1000,
            virtual_switches: vec![VirtualSwitchConfig {
                datapath_id: TENANT_DPID,
                ports: vec![
                    PortMapConfig {
                        virtual_port: 1,
                        physical_datapath_id: DPID_A,
                        physical_port: 1,
                    },
                    PortMapConfig {
                        virtual_port: 2,
                        physical_datapath_id: DPID_B,
                        physical_port: 1,
                    },
                ],
            }],
        }]
    }

    fn port_desc(port_no: u32) -> PortDesc {
        PortDesc {
            port_no,
            hw_addr: 0xaabbcc000000 | u64::from(port_no),
            name: format!("eth{}", port_no),
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
        }
    }

    /// Wire a switch straight into the registry with a captive byte queue
    /// and walk it through the handshake.
    fn add_switch(
        hypervisor: &mut Hypervisor,
        id: SwitchId,
        datapath_id: u64,
        ports: &[u32],
    ) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut switch = PhysicalSwitch::new(id, OfpConnection::new(tx));
        switch.start(hypervisor).unwrap();
        hypervisor.physical_switches.insert(id, switch);

        hypervisor.handle_event(Event::SwitchMessage(
            id,
            1,
            Message::FeaturesReply(SwitchFeatures {
                datapath_id,
                num_buffers: 256,
                num_tables: 254,
                auxiliary_id: 0,
                supported_capabilities: Capabilities::default(),
            }),
        ));
        hypervisor.handle_event(Event::SwitchMessage(
            id,
            2,
            Message::MultipartReply(MultipartResp {
                flags: 0,
                body: MultipartRespBody::PortDesc(ports.iter().map(|p| port_desc(*p)).collect()),
            }),
        ));
        rx
    }

    /// Deliver a probe from (`from`, `from_port`) into `to` on `in_port`.
    fn deliver_probe(
        hypervisor: &mut Hypervisor,
        to: SwitchId,
        in_port: u32,
        from: SwitchId,
        from_port: u32,
    ) {
        let payload = topology::encode_probe(from, from_port);
        hypervisor.handle_event(Event::SwitchMessage(
            to,
            7,
            Message::PacketIn(PacketIn {
                total_len: payload.len() as u16,
                reason: PacketInReason::Action,
                table_id: 0,
                cookie: 1,
                pattern: Match {
                    in_port: Some(in_port),
                    ..Match::match_all()
                },
                payload: Payload::NotBuffered(payload),
            }),
        ));
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<(Xid, Message)> {
        let mut messages = vec![];
        while let Ok(bytes) = rx.try_recv() {
            let header = OfpHeader::parse(&bytes[..OFP_HEADER_LENGTH]).unwrap();
            let (xid, message) = Message::parse(&header, &bytes[OFP_HEADER_LENGTH..]).unwrap();
            messages.push((xid, message));
        }
        messages
    }

    fn tenant_state(hypervisor: &Hypervisor) -> VirtualSwitchState {
        hypervisor
            .virtual_switch_by_datapath(TENANT_DPID)
            .unwrap()
            .state()
    }

    /// Pretend the tenant controller session is established, capturing what
    /// the hypervisor sends it.
    fn connect_tenant(hypervisor: &mut Hypervisor) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        hypervisor
            .virtual_switches
            .get_mut(&TENANT_DPID)
            .unwrap()
            .force_connected(OfpConnection::new(tx));
        rx
    }

    fn two_switch_setup(
        hypervisor: &mut Hypervisor,
    ) -> (
        mpsc::UnboundedReceiver<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let rx_a = add_switch(hypervisor, SWITCH_A, DPID_A, &[1, 2]);
        let rx_b = add_switch(hypervisor, SWITCH_B, DPID_B, &[1, 3]);
        // One probe each way establishes and confirms the link.
        deliver_probe(hypervisor, SWITCH_B, 3, SWITCH_A, 2);
        deliver_probe(hypervisor, SWITCH_A, 2, SWITCH_B, 3);
        (rx_a, rx_b)
    }

    #[tokio::test]
    async fn test_handshake_installs_static_rules() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let mut rx = add_switch(&mut hypervisor, SWITCH_A, DPID_A, &[1]);
        let messages = drain(&mut rx);

        // Startup order: hello before anything else.
        assert_eq!(messages[0].1, Message::Hello);
        assert!(matches!(messages[1].1, Message::FeaturesReq));

        // Blanket delete over all tables followed by a barrier.
        let delete_at = messages
            .iter()
            .position(|(_, m)| {
                matches!(m, Message::FlowMod(fm) if fm.command == FlowModCmd::DeleteFlow
                    && fm.table_id == ALL_TABLES)
            })
            .unwrap();
        assert!(matches!(messages[delete_at + 1].1, Message::BarrierRequest));

        // The probe rule with cookie 1.
        assert!(messages.iter().any(|(_, m)| {
            matches!(m, Message::FlowMod(fm) if fm.cookie == 1
                && fm.pattern.eth_type == Some(topology::PROBE_ETH_TYPE))
        }));
        // Error traps with cookies 2 and 3.
        for (cookie, table) in [(2u64, 0u8), (3, 1)] {
            assert!(messages.iter().any(|(_, m)| {
                matches!(m, Message::FlowMod(fm) if fm.cookie == cookie
                    && fm.table_id == table && fm.priority == 0)
            }));
        }
        // The per-slice meter.
        assert!(messages.iter().any(|(_, m)| {
            matches!(m, Message::MeterMod(mm) if mm.meter_id == 1 && mm.flags == OFPMF_PKTPS)
        }));
        // The controller group.
        assert!(messages.iter().any(|(_, m)| {
            matches!(m, Message::GroupMod(gm) if gm.group_id == 0
                && gm.group_type == GroupType::Indirect)
        }));
    }

    #[tokio::test]
    async fn test_port_with_single_interest_gets_a_host_rule() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let mut rx = add_switch(&mut hypervisor, SWITCH_A, DPID_A, &[1, 2]);
        let messages = drain(&mut rx);

        // Port 1 is named by the tenant: metadata tag plus goto table 2.
        let mut expected = vec![];
        let mut tag = MetadataTag::new();
        tag.set_group(false);
        tag.set_virtual_switch(0);
        tag.add_to_instructions(&mut expected);
        expected.push(Instruction::GotoTable(2));
        assert!(messages.iter().any(|(_, m)| {
            matches!(m, Message::FlowMod(fm) if fm.table_id == 0
                && fm.pattern.in_port == Some(1) && fm.instructions == expected)
        }));

        // Port 2 interests nobody and has no link: drop rule, no
        // instructions, and no table-1 egress rule.
        assert!(messages.iter().any(|(_, m)| {
            matches!(m, Message::FlowMod(fm) if fm.table_id == 0
                && fm.pattern.in_port == Some(2) && fm.instructions.is_empty())
        }));
        assert!(!messages.iter().any(|(_, m)| {
            matches!(m, Message::FlowMod(fm) if fm.table_id == 1 && fm.cookie == 2)
        }));
    }

    #[tokio::test]
    async fn test_link_discovery_computes_routes_and_starts_the_tenant() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        assert_eq!(tenant_state(&hypervisor), VirtualSwitchState::Down);

        let (mut rx_a, _rx_b) = two_switch_setup(&mut hypervisor);

        let switch_a = hypervisor.physical_switch(SWITCH_A).unwrap();
        let switch_b = hypervisor.physical_switch(SWITCH_B).unwrap();
        assert_eq!(switch_a.get_distance(SWITCH_B), 1);
        assert_eq!(switch_a.get_next(SWITCH_B), Some(2));
        assert_eq!(switch_b.get_distance(SWITCH_A), 1);
        assert_eq!(switch_b.get_next(SWITCH_A), Some(3));

        // The substrate became viable; the tenant connect is under way.
        assert_eq!(tenant_state(&hypervisor), VirtualSwitchState::TryConnecting);

        // Port 2 of switch A flipped from drop to link: goto table 1.
        let messages = drain(&mut rx_a);
        assert!(messages.iter().any(|(_, m)| {
            matches!(m, Message::FlowMod(fm) if fm.table_id == 0
                && fm.command == FlowModCmd::ModFlow
                && fm.pattern.in_port == Some(2)
                && fm.instructions == vec![Instruction::GotoTable(1)])
        }));
    }

    #[tokio::test]
    async fn test_probe_refresh_does_not_recompute() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (mut rx_a, _rx_b) = two_switch_setup(&mut hypervisor);
        drain(&mut rx_a);

        // The same edge again only refreshes the deadline.
        deliver_probe(&mut hypervisor, SWITCH_B, 3, SWITCH_A, 2);
        assert_eq!(hypervisor.links.len(), 1);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_link_loss_takes_the_tenant_down() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (_rx_a, _rx_b) = two_switch_setup(&mut hypervisor);
        assert_eq!(tenant_state(&hypervisor), VirtualSwitchState::TryConnecting);

        for link in hypervisor.links.values_mut() {
            link.expire_now();
        }
        hypervisor.handle_event(Event::LinkSweep);

        assert!(hypervisor.links.is_empty());
        let switch_a = hypervisor.physical_switch(SWITCH_A).unwrap();
        assert_eq!(switch_a.get_distance(SWITCH_B), INFINITE);
        assert!(switch_a.ports().values().all(|port| port.link.is_none()));
        assert_eq!(tenant_state(&hypervisor), VirtualSwitchState::Down);
    }

    #[tokio::test]
    async fn test_switch_loss_takes_the_tenant_down() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (_rx_a, _rx_b) = two_switch_setup(&mut hypervisor);

        hypervisor.handle_event(Event::SwitchClosed(SWITCH_B));

        assert!(hypervisor.physical_switch(SWITCH_B).is_none());
        assert_eq!(hypervisor.switch_id_by_datapath(DPID_B), None);
        assert!(hypervisor.links.is_empty());
        assert_eq!(tenant_state(&hypervisor), VirtualSwitchState::Down);
    }

    #[tokio::test]
    async fn test_echo_timeout_stops_the_switch() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let mut rx = add_switch(&mut hypervisor, SWITCH_A, DPID_A, &[1]);
        drain(&mut rx);

        // First tick sends the request.
        hypervisor.handle_event(Event::SwitchEchoTick(SWITCH_A));
        let messages = drain(&mut rx);
        assert!(messages
            .iter()
            .any(|(_, m)| matches!(m, Message::EchoRequest(_))));
        assert!(hypervisor.physical_switch(SWITCH_A).is_some());

        // No reply by the second tick: the session dies.
        hypervisor.handle_event(Event::SwitchEchoTick(SWITCH_A));
        assert!(hypervisor.physical_switch(SWITCH_A).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_controller_keeps_retrying() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (_rx_a, _rx_b) = two_switch_setup(&mut hypervisor);
        assert_eq!(tenant_state(&hypervisor), VirtualSwitchState::TryConnecting);

        hypervisor.handle_event(Event::TenantConnected(
            TENANT_DPID,
            Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
        ));
        assert_eq!(tenant_state(&hypervisor), VirtualSwitchState::TryConnecting);

        hypervisor.handle_event(Event::TenantRetry(TENANT_DPID));
        assert_eq!(tenant_state(&hypervisor), VirtualSwitchState::TryConnecting);
    }

    #[tokio::test]
    async fn test_three_switch_chain_routes_through_the_middle() {
        let mut config = test_config();
        config[0].virtual_switches[0].ports[1].physical_datapath_id = DPID_C;
        let (mut hypervisor, _events) = Hypervisor::new(&config);

        let mut rx_a = add_switch(&mut hypervisor, SWITCH_A, DPID_A, &[1, 2]);
        let mut rx_b = add_switch(&mut hypervisor, SWITCH_B, DPID_B, &[1, 2]);
        let _rx_c = add_switch(&mut hypervisor, SWITCH_C, DPID_C, &[1, 2]);
        deliver_probe(&mut hypervisor, SWITCH_B, 1, SWITCH_A, 2);
        drain(&mut rx_a);
        drain(&mut rx_b);
        // The second edge makes C reachable from A through B.
        deliver_probe(&mut hypervisor, SWITCH_C, 1, SWITCH_B, 2);

        let switch_a = hypervisor.physical_switch(SWITCH_A).unwrap();
        assert_eq!(switch_a.get_distance(SWITCH_B), 1);
        assert_eq!(switch_a.get_distance(SWITCH_C), 2);
        // Following next from A leads toward B.
        assert_eq!(switch_a.get_next(SWITCH_C), Some(2));
        let switch_b = hypervisor.physical_switch(SWITCH_B).unwrap();
        assert_eq!(switch_b.get_next(SWITCH_C), Some(2));

        // A carries a transit rule for C without a pop (two hops out).
        let messages = drain(&mut rx_a);
        assert!(messages.iter().any(|(_, m)| {
            matches!(m, Message::FlowMod(fm) if fm.table_id == 1 && fm.priority == 20
                && fm.instructions == vec![Instruction::WriteActions(vec![Action::output(2)])])
        }));
        // B is the penultimate hop toward C: its transit rule pops the tag.
        let messages = drain(&mut rx_b);
        assert!(messages.iter().any(|(_, m)| {
            matches!(m, Message::FlowMod(fm) if fm.table_id == 1 && fm.priority == 20
                && fm.instructions
                    == vec![Instruction::WriteActions(vec![
                        Action::PopVlan,
                        Action::output(2)
                    ])])
        }));

        // The tenant spans A and C which can reach each other through B.
        assert_eq!(tenant_state(&hypervisor), VirtualSwitchState::TryConnecting);
    }

    #[tokio::test]
    async fn test_tenant_flow_mod_is_rewritten_and_fanned_out() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (mut rx_a, mut rx_b) = two_switch_setup(&mut hypervisor);
        let _tenant_rx = connect_tenant(&mut hypervisor);
        drain(&mut rx_a);
        drain(&mut rx_b);

        // goto table 0 and write-actions output to virtual port 2.
        let flow_mod = FlowMod {
            priority: 7,
            instructions: vec![
                Instruction::WriteActions(vec![Action::output(2)]),
                Instruction::GotoTable(0),
            ],
            ..FlowMod::new(FlowModCmd::AddFlow)
        };
        hypervisor.handle_event(Event::TenantMessage(
            TENANT_DPID,
            42,
            Message::FlowMod(flow_mod),
        ));

        for rx in [&mut rx_a, &mut rx_b] {
            let messages = drain(rx);
            let flow_mods: Vec<&FlowMod> = messages
                .iter()
                .filter_map(|(_, m)| match m {
                    Message::FlowMod(fm) => Some(fm),
                    _ => None,
                })
                .collect();
            assert_eq!(flow_mods.len(), 1);
            let rewritten = flow_mods[0];
            // Tenant table 0 becomes table 2, the goto moves with it.
            assert_eq!(rewritten.table_id, 2);
            assert!(rewritten
                .instructions
                .contains(&Instruction::GotoTable(2)));
            // The match is pinned to the tenant pipeline.
            let metadata = rewritten.pattern.metadata.unwrap();
            assert_eq!(metadata.value, 0);
            assert_eq!(
                metadata.mask,
                Some(crate::bits::make_mask(VIRTUAL_SWITCH_BITS) << 1)
            );
            // The output became an indirect group that exists on the switch.
            let group_id = rewritten
                .instructions
                .iter()
                .find_map(|instruction| match instruction {
                    Instruction::WriteActions(actions) => match actions[..] {
                        [Action::Group(group_id)] => Some(group_id),
                        _ => None,
                    },
                    _ => None,
                })
                .unwrap();
            assert!(messages.iter().any(|(_, m)| {
                matches!(m, Message::GroupMod(gm) if gm.group_id == group_id
                    && gm.group_type == GroupType::Indirect)
            }));
        }
    }

    #[tokio::test]
    async fn test_remote_output_group_pushes_the_port_tag() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (mut rx_a, _rx_b) = two_switch_setup(&mut hypervisor);
        let _tenant_rx = connect_tenant(&mut hypervisor);
        drain(&mut rx_a);

        // A packet-out entering at virtual port 1 (switch A) toward virtual
        // port 2 (switch B, one hop away).
        hypervisor.handle_event(Event::TenantMessage(
            TENANT_DPID,
            9,
            Message::PacketOut(PacketOut {
                payload: Payload::NotBuffered(vec![0xab; 20]),
                in_port: 1,
                actions: vec![Action::output(2)],
            }),
        ));

        let messages = drain(&mut rx_a);
        // The packet-out was rewritten to use the output group and enter
        // from the controller port.
        let packet_out = messages
            .iter()
            .find_map(|(_, m)| match m {
                Message::PacketOut(po) => Some(po),
                _ => None,
            })
            .unwrap();
        assert_eq!(packet_out.in_port, OfpPort::OFPPController as u32);
        let [Action::Group(group_id)] = packet_out.actions[..] else {
            panic!("expected a group action, got {:?}", packet_out.actions);
        };

        // That group pushes a port tag carrying slice 0 and the foreign
        // port number, and outputs toward switch B.
        let group_mod = messages
            .iter()
            .find_map(|(_, m)| match m {
                Message::GroupMod(gm) if gm.group_id == group_id => Some(gm),
                _ => None,
            })
            .unwrap();
        let actions = &group_mod.buckets[0].actions;
        assert_eq!(actions[0], Action::PushVlan(0x8100));
        assert_eq!(
            actions[1],
            Action::SetVlanVid {
                vid: 0x1000 | 1 << 6,
                mask: None
            }
        );
        assert_eq!(actions[2], Action::output(2));
    }

    #[tokio::test]
    async fn test_reserved_metadata_mask_is_rejected_with_an_error() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (mut rx_a, _rx_b) = two_switch_setup(&mut hypervisor);
        let mut tenant_rx = connect_tenant(&mut hypervisor);
        drain(&mut rx_a);

        let flow_mod = FlowMod {
            instructions: vec![Instruction::WriteMetadata {
                metadata: 0,
                mask: 0xf000_0000_0000_0000,
            }],
            ..FlowMod::new(FlowModCmd::AddFlow)
        };
        hypervisor.handle_event(Event::TenantMessage(
            TENANT_DPID,
            17,
            Message::FlowMod(flow_mod),
        ));

        // Nothing reached the substrate; the tenant got a bad-instruction
        // error under its own xid.
        assert!(drain(&mut rx_a)
            .iter()
            .all(|(_, m)| !matches!(m, Message::FlowMod(_))));
        let replies = drain(&mut tenant_rx);
        assert_eq!(replies.len(), 1);
        let (xid, Message::Error(error)) = &replies[0] else {
            panic!("expected an error reply, got {:?}", replies[0]);
        };
        assert_eq!(*xid, 17);
        assert_eq!(error.err_type, ErrorType::BadInstruction as u16);
        assert_eq!(error.code, BadInstructionCode::UnsupMetadataMask as u16);
    }

    #[tokio::test]
    async fn test_xid_translation_round_trip() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (mut rx_a, mut rx_b) = two_switch_setup(&mut hypervisor);
        let mut tenant_rx = connect_tenant(&mut hypervisor);
        drain(&mut rx_a);
        drain(&mut rx_b);

        hypervisor.handle_event(Event::TenantMessage(
            TENANT_DPID,
            1234,
            Message::FlowMod(FlowMod::new(FlowModCmd::AddFlow)),
        ));

        // Find the xid switch A's copy went out with.
        let translated = drain(&mut rx_a)
            .iter()
            .find_map(|(xid, m)| match m {
                Message::FlowMod(_) => Some(*xid),
                _ => None,
            })
            .unwrap();
        assert_ne!(translated, 1234);

        // The switch reports an error for that request.
        hypervisor.handle_event(Event::SwitchMessage(
            SWITCH_A,
            translated,
            Message::Error(ErrorMsg {
                err_type: ErrorType::FlowModFailed as u16,
                code: 0,
                data: vec![],
            }),
        ));
        let replies = drain(&mut tenant_rx);
        assert!(matches!(
            replies[..],
            [(1234, Message::Error(_))]
        ));

        // A reply with an unknown xid is not forwarded.
        hypervisor.handle_event(Event::SwitchMessage(
            SWITCH_A,
            0xdeadbeef,
            Message::Error(ErrorMsg {
                err_type: ErrorType::FlowModFailed as u16,
                code: 0,
                data: vec![],
            }),
        ));
        assert!(drain(&mut tenant_rx).is_empty());
    }

    #[tokio::test]
    async fn test_tenant_features_and_port_desc_are_synthesized() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (_rx_a, _rx_b) = two_switch_setup(&mut hypervisor);
        let mut tenant_rx = connect_tenant(&mut hypervisor);

        hypervisor.handle_event(Event::TenantMessage(TENANT_DPID, 5, Message::FeaturesReq));
        hypervisor.handle_event(Event::TenantMessage(
            TENANT_DPID,
            6,
            Message::MultipartReq(MultipartReq {
                flags: 0,
                body: MultipartReqBody::PortDesc,
            }),
        ));
        hypervisor.handle_event(Event::TenantMessage(
            TENANT_DPID,
            7,
            Message::MultipartReq(MultipartReq {
                flags: 0,
                body: MultipartReqBody::Other {
                    req_type: MultipartType::Flow as u16,
                    body: vec![],
                },
            }),
        ));

        let replies = drain(&mut tenant_rx);
        let (xid, Message::FeaturesReply(features)) = &replies[0] else {
            panic!("expected features reply, got {:?}", replies[0]);
        };
        assert_eq!(*xid, 5);
        assert_eq!(features.datapath_id, TENANT_DPID);

        let (_, Message::MultipartReply(reply)) = &replies[1] else {
            panic!("expected port desc reply, got {:?}", replies[1]);
        };
        let MultipartRespBody::PortDesc(ports) = &reply.body else {
            panic!("expected port descriptions");
        };
        assert_eq!(
            ports.iter().map(|p| p.port_no).collect::<Vec<_>>(),
            vec![1, 2]
        );

        // Flow stats are not synthesized.
        let (_, Message::Error(error)) = &replies[2] else {
            panic!("expected an error reply, got {:?}", replies[2]);
        };
        assert_eq!(error.err_type, ErrorType::BadRequest as u16);
        assert_eq!(error.code, BadRequestCode::BadMultipart as u16);
    }

    #[tokio::test]
    async fn test_port_status_is_rewritten_for_the_tenant() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let (_rx_a, _rx_b) = two_switch_setup(&mut hypervisor);
        let mut tenant_rx = connect_tenant(&mut hypervisor);

        hypervisor.handle_event(Event::SwitchMessage(
            SWITCH_A,
            0,
            Message::PortStatus(PortStatus {
                reason: PortReason::PortModify,
                desc: port_desc(1),
            }),
        ));

        let replies = drain(&mut tenant_rx);
        let (_, Message::PortStatus(status)) = &replies[0] else {
            panic!("expected port status, got {:?}", replies[0]);
        };
        assert_eq!(status.reason, PortReason::PortModify);
        // Physical port 1 on switch A is the tenant's port 1.
        assert_eq!(status.desc.port_no, 1);

        // A port the tenant does not map stays invisible.
        hypervisor.handle_event(Event::SwitchMessage(
            SWITCH_A,
            0,
            Message::PortStatus(PortStatus {
                reason: PortReason::PortModify,
                desc: port_desc(2),
            }),
        ));
        assert!(drain(&mut tenant_rx).is_empty());
    }

    #[tokio::test]
    async fn test_group_features_deficiency_marks_the_switch() {
        let (mut hypervisor, _events) = Hypervisor::new(&test_config());
        let _rx = add_switch(&mut hypervisor, SWITCH_A, DPID_A, &[1]);
        assert!(hypervisor.physical_switch(SWITCH_A).unwrap().fan_out_capable());

        hypervisor.handle_event(Event::SwitchMessage(
            SWITCH_A,
            3,
            Message::MultipartReply(MultipartResp {
                flags: 0,
                body: MultipartRespBody::GroupFeatures(GroupFeatures {
                    // INDIRECT only; no ALL support.
                    types: 1 << GroupType::Indirect as u32,
                    capabilities: 0,
                    max_groups: [0, 0, 16, 0],
                    actions: [0; 4],
                }),
            }),
        ));

        let switch = hypervisor.physical_switch(SWITCH_A).unwrap();
        assert!(!switch.fan_out_capable());
        // The session itself survives.
        assert!(switch.is_registered());
    }
}
