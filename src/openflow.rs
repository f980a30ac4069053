use std::fmt::{Display, Error, Formatter};

/// OpenFlow 1.3 message type codes, used by headers to identify the meaning
/// of the rest of a message.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MsgCode {
    Hello = 0,
    Error = 1,
    EchoReq = 2,
    EchoResp = 3,
    Experimenter = 4,
    FeaturesReq = 5,
    FeaturesResp = 6,
    GetConfigReq = 7,
    GetConfigResp = 8,
    SetConfig = 9,
    PacketIn = 10,
    FlowRemoved = 11,
    PortStatus = 12,
    PacketOut = 13,
    FlowMod = 14,
    GroupMod = 15,
    PortMod = 16,
    TableMod = 17,
    MultipartReq = 18,
    MultipartResp = 19,
    BarrierReq = 20,
    BarrierResp = 21,
    QueueGetConfigReq = 22,
    QueueGetConfigResp = 23,
    RoleReq = 24,
    RoleResp = 25,
    GetAsyncReq = 26,
    GetAsyncResp = 27,
    SetAsync = 28,
    MeterMod = 29,
}

impl MsgCode {
    pub fn of_u8(code: u8) -> Option<MsgCode> {
        let code = match code {
            0 => MsgCode::Hello,
            1 => MsgCode::Error,
            2 => MsgCode::EchoReq,
            3 => MsgCode::EchoResp,
            4 => MsgCode::Experimenter,
            5 => MsgCode::FeaturesReq,
            6 => MsgCode::FeaturesResp,
            7 => MsgCode::GetConfigReq,
            8 => MsgCode::GetConfigResp,
            9 => MsgCode::SetConfig,
            10 => MsgCode::PacketIn,
            11 => MsgCode::FlowRemoved,
            12 => MsgCode::PortStatus,
            13 => MsgCode::PacketOut,
            14 => MsgCode::FlowMod,
            15 => MsgCode::GroupMod,
            16 => MsgCode::PortMod,
            17 => MsgCode::TableMod,
            18 => MsgCode::MultipartReq,
            19 => MsgCode::MultipartResp,
            20 => MsgCode::BarrierReq,
            21 => MsgCode::BarrierResp,
            22 => MsgCode::QueueGetConfigReq,
            23 => MsgCode::QueueGetConfigResp,
            24 => MsgCode::RoleReq,
            25 => MsgCode::RoleResp,
            26 => MsgCode::GetAsyncReq,
            27 => MsgCode::GetAsyncResp,
            28 => MsgCode::SetAsync,
            29 => MsgCode::MeterMod,
            _ => return None,
        };
        Some(code)
    }
}

impl Display for MsgCode {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        let text = match self {
            MsgCode::Hello => "Hello",
            MsgCode::Error => "Error",
            MsgCode::EchoReq => "EchoReq",
            MsgCode::EchoResp => "EchoResp",
            MsgCode::Experimenter => "Experimenter",
            MsgCode::FeaturesReq => "FeaturesReq",
            MsgCode::FeaturesResp => "FeaturesResp",
            MsgCode::GetConfigReq => "GetConfigReq",
            MsgCode::GetConfigResp => "GetConfigResp",
            MsgCode::SetConfig => "SetConfig",
            MsgCode::PacketIn => "PacketIn",
            MsgCode::FlowRemoved => "FlowRemoved",
            MsgCode::PortStatus => "PortStatus",
            MsgCode::PacketOut => "PacketOut",
            MsgCode::FlowMod => "FlowMod",
            MsgCode::GroupMod => "GroupMod",
            MsgCode::PortMod => "PortMod",
            MsgCode::TableMod => "TableMod",
            MsgCode::MultipartReq => "MultipartReq",
            MsgCode::MultipartResp => "MultipartResp",
            MsgCode::BarrierReq => "BarrierReq",
            MsgCode::BarrierResp => "BarrierResp",
            MsgCode::QueueGetConfigReq => "QueueGetConfigReq",
            MsgCode::QueueGetConfigResp => "QueueGetConfigResp",
            MsgCode::RoleReq => "RoleReq",
            MsgCode::RoleResp => "RoleResp",
            MsgCode::GetAsyncReq => "GetAsyncReq",
            MsgCode::GetAsyncResp => "GetAsyncResp",
            MsgCode::SetAsync => "SetAsync",
            MsgCode::MeterMod => "MeterMod",
        };
        f.write_str(text)
    }
}
