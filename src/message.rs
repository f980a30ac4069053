//! Typed OpenFlow 1.3 messages, independent of their wire form.
//!
//! The wire codec lives in `openflow0x04`; everything in here is plain data
//! the rest of the hypervisor builds, inspects and rewrites.

use std::fmt;

use crate::bits::test_bit;

pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;
pub const OFPCML_NO_BUFFER: u16 = 0xffff;
pub const ALL_TABLES: u8 = 0xff;

pub const OFPG_ANY: u32 = 0xffff_ffff;
pub const OFPG_ALL: u32 = 0xffff_fffc;

/// Reserved port numbers.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OfpPort {
    OFPPMax = 0xffff_ff00,
    OFPPInPort = 0xffff_fff8,
    OFPPTable = 0xffff_fff9,
    OFPPNormal = 0xffff_fffa,
    OFPPFlood = 0xffff_fffb,
    OFPPAll = 0xffff_fffc,
    OFPPController = 0xffff_fffd,
    OFPPLocal = 0xffff_fffe,
    OFPPAny = 0xffff_ffff,
}

/// A value with an optional mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mask<T> {
    pub value: T,
    pub mask: Option<T>,
}

/// Fields to match against packets; the OXM subset the hypervisor uses.
/// Unknown OXM entries are skipped on parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Match {
    pub in_port: Option<u32>,
    pub metadata: Option<Mask<u64>>,
    pub eth_type: Option<u16>,
    pub vlan_vid: Option<Mask<u16>>,
}

impl Match {
    pub fn match_all() -> Match {
        Match::default()
    }
}

/// Actions associated with flows and packets.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Output { port: u32, max_len: u16 },
    Group(u32),
    SetQueue(u32),
    PushVlan(u16),
    PopVlan,
    /// Set-field on the VLAN id. A mask limits the rewrite to the covered
    /// bits, which the egress rules use to retag a packet while keeping the
    /// slice bits intact.
    SetVlanVid { vid: u16, mask: Option<u16> },
    /// Any other action, kept as raw body bytes so it can be passed through
    /// unchanged when rewriting tenant messages.
    Other { action_type: u16, body: Vec<u8> },
}

impl Action {
    pub fn output(port: u32) -> Action {
        Action::Output {
            port,
            max_len: OFPCML_NO_BUFFER,
        }
    }
}

/// Flow-mod instructions.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    GotoTable(u8),
    WriteMetadata { metadata: u64, mask: u64 },
    WriteActions(Vec<Action>),
    ApplyActions(Vec<Action>),
    ClearActions,
    Meter(u32),
    /// An instruction the hypervisor does not understand, kept raw.
    Other { instruction_type: u16, body: Vec<u8> },
}

/// Type of modification to perform on a flow table.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModCmd {
    AddFlow = 0,
    ModFlow = 1,
    ModStrictFlow = 2,
    DeleteFlow = 3,
    DeleteStrictFlow = 4,
}

/// Represents modifications to a flow table from the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowMod {
    pub cookie: u64,
    pub cookie_mask: u64,
    pub table_id: u8,
    pub command: FlowModCmd,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: u32,
    pub out_group: u32,
    pub flags: u16,
    pub pattern: Match,
    pub instructions: Vec<Instruction>,
}

impl FlowMod {
    /// A flow-mod with empty match, no instructions and the usual defaults.
    pub fn new(command: FlowModCmd) -> FlowMod {
        FlowMod {
            cookie: 0,
            cookie_mask: 0,
            table_id: 0,
            command,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: 0,
            buffer_id: OFP_NO_BUFFER,
            out_port: OfpPort::OFPPAny as u32,
            out_group: OFPG_ANY,
            flags: 0,
            pattern: Match::match_all(),
            instructions: vec![],
        }
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupModCmd {
    Add = 0,
    Modify = 1,
    Delete = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    All = 0,
    Select = 1,
    Indirect = 2,
    FastFailover = 3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub weight: u16,
    pub watch_port: u32,
    pub watch_group: u32,
    pub actions: Vec<Action>,
}

impl Bucket {
    /// The bucket shape used in indirect groups: no weight, nothing watched.
    pub fn indirect(actions: Vec<Action>) -> Bucket {
        Bucket {
            weight: 0,
            watch_port: OfpPort::OFPPAny as u32,
            watch_group: OFPG_ANY,
            actions,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMod {
    pub command: GroupModCmd,
    pub group_type: GroupType,
    pub group_id: u32,
    pub buckets: Vec<Bucket>,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterModCmd {
    Add = 0,
    Modify = 1,
    Delete = 2,
}

/// Meter flag: rate is in packets per second.
pub const OFPMF_PKTPS: u16 = 1 << 1;
/// Meter band type bit: drop.
pub const OFPMBT_DROP: u16 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum MeterBand {
    Drop { rate: u32, burst_size: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterMod {
    pub command: MeterModCmd,
    pub flags: u16,
    pub meter_id: u32,
    pub bands: Vec<MeterBand>,
}

/// The data associated with a packet received by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Buffered(u32, Vec<u8>),
    NotBuffered(Vec<u8>),
}

impl Payload {
    pub fn size_of(payload: &Payload) -> usize {
        match *payload {
            Payload::Buffered(_, ref buf) | Payload::NotBuffered(ref buf) => buf.len(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Buffered(_, buf) | Payload::NotBuffered(buf) => buf,
        }
    }
}

/// The reason a packet arrives at the controller.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketInReason {
    NoMatch = 0,
    Action = 1,
    InvalidTtl = 2,
}

/// Represents packets received by the datapath and sent to the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketIn {
    pub total_len: u16,
    pub reason: PacketInReason,
    pub table_id: u8,
    pub cookie: u64,
    pub pattern: Match,
    pub payload: Payload,
}

impl PacketIn {
    pub fn in_port(&self) -> Option<u32> {
        self.pattern.in_port
    }
}

/// Represents packets sent from the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketOut {
    pub payload: Payload,
    pub in_port: u32,
    pub actions: Vec<Action>,
}

/// Reason a flow was removed from a switch.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRemovedReason {
    IdleTimeout = 0,
    HardTimeout = 1,
    Delete = 2,
    GroupDelete = 3,
}

/// Flow removed (datapath -> controller).
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRemoved {
    pub cookie: u64,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    pub table_id: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub packet_count: u64,
    pub byte_count: u64,
    pub pattern: Match,
}

/// Flags to indicate behavior of the physical port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortConfig {
    pub down: bool,
    pub no_recv: bool,
    pub no_fwd: bool,
    pub no_packet_in: bool,
}

impl PortConfig {
    pub fn of_int(d: u32) -> PortConfig {
        PortConfig {
            down: test_bit(0, d as u64),
            no_recv: test_bit(2, d as u64),
            no_fwd: test_bit(5, d as u64),
            no_packet_in: test_bit(6, d as u64),
        }
    }

    pub fn to_int(self) -> u32 {
        (self.down as u32)
            | (self.no_recv as u32) << 2
            | (self.no_fwd as u32) << 5
            | (self.no_packet_in as u32) << 6
    }
}

/// Current state of a physical port. Not configurable by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortState {
    pub link_down: bool,
    pub blocked: bool,
    pub live: bool,
}

impl PortState {
    pub fn of_int(d: u32) -> PortState {
        PortState {
            link_down: test_bit(0, d as u64),
            blocked: test_bit(1, d as u64),
            live: test_bit(2, d as u64),
        }
    }

    pub fn to_int(self) -> u32 {
        (self.link_down as u32) | (self.blocked as u32) << 1 | (self.live as u32) << 2
    }
}

/// Description of a physical port. The feature words are kept raw; the
/// hypervisor only passes them through.
#[derive(Debug, Clone, PartialEq)]
pub struct PortDesc {
    pub port_no: u32,
    pub hw_addr: u64,
    pub name: String,
    pub config: PortConfig,
    pub state: PortState,
    pub curr: u32,
    pub advertised: u32,
    pub supported: u32,
    pub peer: u32,
    pub curr_speed: u32,
    pub max_speed: u32,
}

/// What changed about a physical port.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortReason {
    PortAdd = 0,
    PortDelete = 1,
    PortModify = 2,
}

/// A physical port has changed in the datapath.
#[derive(Debug, Clone, PartialEq)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

/// Capabilities supported by the datapath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub flow_stats: bool,
    pub table_stats: bool,
    pub port_stats: bool,
    pub group_stats: bool,
    pub ip_reasm: bool,
    pub queue_stats: bool,
    pub port_blocked: bool,
}

impl Capabilities {
    pub fn of_int(d: u32) -> Capabilities {
        Capabilities {
            flow_stats: test_bit(0, d as u64),
            table_stats: test_bit(1, d as u64),
            port_stats: test_bit(2, d as u64),
            group_stats: test_bit(3, d as u64),
            ip_reasm: test_bit(5, d as u64),
            queue_stats: test_bit(6, d as u64),
            port_blocked: test_bit(8, d as u64),
        }
    }

    pub fn to_int(self) -> u32 {
        (self.flow_stats as u32)
            | (self.table_stats as u32) << 1
            | (self.port_stats as u32) << 2
            | (self.group_stats as u32) << 3
            | (self.ip_reasm as u32) << 5
            | (self.queue_stats as u32) << 6
            | (self.port_blocked as u32) << 8
    }
}

/// Switch features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub num_buffers: u32,
    pub num_tables: u8,
    pub auxiliary_id: u8,
    pub supported_capabilities: Capabilities,
}

/// The body of get-config replies and set-config requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchConfig {
    pub flags: u16,
    pub miss_send_len: u16,
}

/// Multipart request/reply type codes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartType {
    Desc = 0,
    Flow = 1,
    Aggregate = 2,
    Table = 3,
    PortStats = 4,
    Queue = 5,
    Group = 6,
    GroupDesc = 7,
    GroupFeatures = 8,
    Meter = 9,
    MeterConfig = 10,
    MeterFeatures = 11,
    TableFeatures = 12,
    PortDesc = 13,
}

/// Group capabilities of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupFeatures {
    pub types: u32,
    pub capabilities: u32,
    pub max_groups: [u32; 4],
    pub actions: [u32; 4],
}

impl GroupFeatures {
    pub fn supports(&self, group_type: GroupType) -> bool {
        test_bit(group_type as u32, self.types as u64)
    }
}

/// Meter capabilities of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterFeatures {
    pub max_meter: u32,
    pub band_types: u32,
    pub capabilities: u32,
    pub max_bands: u8,
    pub max_color: u8,
}

impl MeterFeatures {
    pub fn supports_drop_band(&self) -> bool {
        test_bit(OFPMBT_DROP as u32, self.band_types as u64)
    }
}

/// Body of a multipart request.
#[derive(Debug, Clone, PartialEq)]
pub enum MultipartReqBody {
    Desc,
    GroupFeatures,
    MeterFeatures,
    PortDesc,
    /// A request type the hypervisor does not act on, kept raw.
    Other { req_type: u16, body: Vec<u8> },
}

impl MultipartReqBody {
    pub fn type_code(&self) -> u16 {
        match self {
            MultipartReqBody::Desc => MultipartType::Desc as u16,
            MultipartReqBody::GroupFeatures => MultipartType::GroupFeatures as u16,
            MultipartReqBody::MeterFeatures => MultipartType::MeterFeatures as u16,
            MultipartReqBody::PortDesc => MultipartType::PortDesc as u16,
            MultipartReqBody::Other { req_type, .. } => *req_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipartReq {
    pub flags: u16,
    pub body: MultipartReqBody,
}

/// Body of a multipart reply.
#[derive(Debug, Clone, PartialEq)]
pub enum MultipartRespBody {
    Desc {
        manufacturer: String,
        hardware: String,
        software: String,
        serial_number: String,
        datapath: String,
    },
    GroupFeatures(GroupFeatures),
    MeterFeatures(MeterFeatures),
    PortDesc(Vec<PortDesc>),
    /// A reply type the hypervisor does not act on, kept raw.
    Other { resp_type: u16, body: Vec<u8> },
}

impl MultipartRespBody {
    pub fn type_code(&self) -> u16 {
        match self {
            MultipartRespBody::Desc { .. } => MultipartType::Desc as u16,
            MultipartRespBody::GroupFeatures(_) => MultipartType::GroupFeatures as u16,
            MultipartRespBody::MeterFeatures(_) => MultipartType::MeterFeatures as u16,
            MultipartRespBody::PortDesc(_) => MultipartType::PortDesc as u16,
            MultipartRespBody::Other { resp_type, .. } => *resp_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipartResp {
    pub flags: u16,
    pub body: MultipartRespBody,
}

/// High-level OpenFlow error types.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    HelloFailed = 0,
    BadRequest = 1,
    BadAction = 2,
    BadInstruction = 3,
    BadMatch = 4,
    FlowModFailed = 5,
    GroupModFailed = 6,
    PortModFailed = 7,
    TableModFailed = 8,
    QueueOpFailed = 9,
    SwitchConfigFailed = 10,
    RoleRequestFailed = 11,
    MeterModFailed = 12,
    TableFeaturesFailed = 13,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadRequestCode {
    BadVersion = 0,
    BadType = 1,
    BadMultipart = 2,
    BadExperimenter = 3,
    BadExpType = 4,
    EPerm = 5,
    BadLen = 6,
    BufferEmpty = 7,
    BufferUnknown = 8,
    BadTableId = 9,
    IsSlave = 10,
    BadPort = 11,
    BadPacket = 12,
    MultipartBufferOverflow = 13,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadInstructionCode {
    UnknownInst = 0,
    UnsupInst = 1,
    BadTableId = 2,
    UnsupMetadata = 3,
    UnsupMetadataMask = 4,
    BadExperimenter = 5,
    BadExpType = 6,
    BadLen = 7,
    EPerm = 8,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadActionCode {
    BadType = 0,
    BadLen = 1,
    BadExperimenter = 2,
    BadExpType = 3,
    BadOutPort = 4,
    BadArgument = 5,
    EPerm = 6,
    TooMany = 7,
    BadQueue = 8,
    BadOutGroup = 9,
    MatchInconsistent = 10,
    UnsupportedOrder = 11,
    BadTag = 12,
    BadSetType = 13,
    BadSetLen = 14,
    BadSetArgument = 15,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadMatchCode {
    BadType = 0,
    BadLen = 1,
    BadTag = 2,
    BadDlAddrMask = 3,
    BadNwAddrMask = 4,
    BadWildcards = 5,
    BadField = 6,
    BadValue = 7,
    BadMask = 8,
    BadPrereq = 9,
    DupField = 10,
    EPerm = 11,
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupModFailedCode {
    GroupExists = 0,
    InvalidGroup = 1,
    WeightUnsupported = 2,
    OutOfGroups = 3,
    OutOfBuckets = 4,
    ChainingUnsupported = 5,
    WatchUnsupported = 6,
    Loop = 7,
    UnknownGroup = 8,
}

/// Error message (either direction). Types and codes stay numeric so foreign
/// errors survive a round trip; the constructors cover what the hypervisor
/// emits itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMsg {
    pub err_type: u16,
    pub code: u16,
    pub data: Vec<u8>,
}

impl ErrorMsg {
    pub fn new(err_type: ErrorType, code: u16, data: Vec<u8>) -> ErrorMsg {
        ErrorMsg {
            err_type: err_type as u16,
            code,
            data,
        }
    }

    pub fn bad_request(code: BadRequestCode, data: Vec<u8>) -> ErrorMsg {
        ErrorMsg::new(ErrorType::BadRequest, code as u16, data)
    }

    pub fn bad_instruction(code: BadInstructionCode, data: Vec<u8>) -> ErrorMsg {
        ErrorMsg::new(ErrorType::BadInstruction, code as u16, data)
    }

    pub fn bad_action(code: BadActionCode, data: Vec<u8>) -> ErrorMsg {
        ErrorMsg::new(ErrorType::BadAction, code as u16, data)
    }

    pub fn bad_match(code: BadMatchCode, data: Vec<u8>) -> ErrorMsg {
        ErrorMsg::new(ErrorType::BadMatch, code as u16, data)
    }

    pub fn group_mod_failed(code: GroupModFailedCode, data: Vec<u8>) -> ErrorMsg {
        ErrorMsg::new(ErrorType::GroupModFailed, code as u16, data)
    }
}

impl fmt::Display for ErrorMsg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "type({}) code({})", self.err_type, self.code)
    }
}

/// Abstractions of OpenFlow 1.3 messages mapping to message codes.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello,
    Error(ErrorMsg),
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    FeaturesReq,
    FeaturesReply(SwitchFeatures),
    GetConfigReq,
    GetConfigReply(SwitchConfig),
    SetConfig(SwitchConfig),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PortStatus(PortStatus),
    PacketOut(PacketOut),
    FlowMod(FlowMod),
    GroupMod(GroupMod),
    MeterMod(MeterMod),
    MultipartReq(MultipartReq),
    MultipartReply(MultipartResp),
    BarrierRequest,
    BarrierReply,
    /// A message type the hypervisor cannot handle; the body is kept so the
    /// owning session can log or answer it with an error.
    Unsupported { code: crate::openflow::MsgCode },
}
