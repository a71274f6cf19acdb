//! Typed control-channel messages: the wire vocabulary shared by the client
//! and the server (spec §3/§4.1).
//!
//! Every message is a plain JSON-serializable struct; [`Message`] is the
//! closed enum of all known kinds and [`MessageType`] is its one-byte wire
//! discriminant. See [`codec`] for the `[type:1][length:8][json]` framing
//! and [`dispatcher`]/[`transporter`] for how messages flow once decoded.

pub mod codec;
pub mod dispatcher;
pub mod transporter;

pub use codec::{read_message, write_message};
pub use dispatcher::{AsyncHandler, Dispatcher, Handler, SyncHandler};
pub use transporter::MessageTransporter;

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One-byte wire tag identifying a message's concrete type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Login = 0,
    LoginResp = 1,
    NewProxy = 2,
    NewProxyResp = 3,
    CloseProxy = 4,
    NewWorkConn = 5,
    ReqWorkConn = 6,
    StartWorkConn = 7,
    NewVisitorConn = 8,
    NewVisitorConnResp = 9,
    Ping = 10,
    Pong = 11,
    UdpPacket = 12,
    NatHoleVisitor = 13,
    NatHoleClient = 14,
    NatHoleResp = 15,
    NatHoleSid = 16,
    NatHoleReport = 17,
    GetProxyBandwidthLimitResp = 18,
}

impl MessageType {
    fn from_tag(tag: u8) -> Result<Self> {
        use MessageType::*;
        Ok(match tag {
            0 => Login,
            1 => LoginResp,
            2 => NewProxy,
            3 => NewProxyResp,
            4 => CloseProxy,
            5 => NewWorkConn,
            6 => ReqWorkConn,
            7 => StartWorkConn,
            8 => NewVisitorConn,
            9 => NewVisitorConnResp,
            10 => Ping,
            11 => Pong,
            12 => UdpPacket,
            13 => NatHoleVisitor,
            14 => NatHoleClient,
            15 => NatHoleResp,
            16 => NatHoleSid,
            17 => NatHoleReport,
            18 => GetProxyBandwidthLimitResp,
            other => return Err(Error::protocol(format!("unknown message tag {other}"))),
        })
    }
}

/// Closed set of control-channel messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    NewWorkConn(NewWorkConn),
    ReqWorkConn(ReqWorkConn),
    StartWorkConn(StartWorkConn),
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
    Ping(Ping),
    Pong(Pong),
    UdpPacket(UdpPacket),
    NatHoleVisitor(NatHoleVisitor),
    NatHoleClient(NatHoleClient),
    NatHoleResp(NatHoleResp),
    NatHoleSid(NatHoleSid),
    NatHoleReport(NatHoleReport),
    GetProxyBandwidthLimitResp(GetProxyBandwidthLimitResp),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Login(_) => MessageType::Login,
            Message::LoginResp(_) => MessageType::LoginResp,
            Message::NewProxy(_) => MessageType::NewProxy,
            Message::NewProxyResp(_) => MessageType::NewProxyResp,
            Message::CloseProxy(_) => MessageType::CloseProxy,
            Message::NewWorkConn(_) => MessageType::NewWorkConn,
            Message::ReqWorkConn(_) => MessageType::ReqWorkConn,
            Message::StartWorkConn(_) => MessageType::StartWorkConn,
            Message::NewVisitorConn(_) => MessageType::NewVisitorConn,
            Message::NewVisitorConnResp(_) => MessageType::NewVisitorConnResp,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::UdpPacket(_) => MessageType::UdpPacket,
            Message::NatHoleVisitor(_) => MessageType::NatHoleVisitor,
            Message::NatHoleClient(_) => MessageType::NatHoleClient,
            Message::NatHoleResp(_) => MessageType::NatHoleResp,
            Message::NatHoleSid(_) => MessageType::NatHoleSid,
            Message::NatHoleReport(_) => MessageType::NatHoleReport,
            Message::GetProxyBandwidthLimitResp(_) => MessageType::GetProxyBandwidthLimitResp,
        }
    }

    /// Encode just the JSON body (without the type/length wire prefix).
    fn encode_payload(&self) -> Result<Vec<u8>> {
        let body = match self {
            Message::Login(m) => serde_json::to_vec(m),
            Message::LoginResp(m) => serde_json::to_vec(m),
            Message::NewProxy(m) => serde_json::to_vec(m),
            Message::NewProxyResp(m) => serde_json::to_vec(m),
            Message::CloseProxy(m) => serde_json::to_vec(m),
            Message::NewWorkConn(m) => serde_json::to_vec(m),
            Message::ReqWorkConn(m) => serde_json::to_vec(m),
            Message::StartWorkConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConn(m) => serde_json::to_vec(m),
            Message::NewVisitorConnResp(m) => serde_json::to_vec(m),
            Message::Ping(m) => serde_json::to_vec(m),
            Message::Pong(m) => serde_json::to_vec(m),
            Message::UdpPacket(m) => serde_json::to_vec(m),
            Message::NatHoleVisitor(m) => serde_json::to_vec(m),
            Message::NatHoleClient(m) => serde_json::to_vec(m),
            Message::NatHoleResp(m) => serde_json::to_vec(m),
            Message::NatHoleSid(m) => serde_json::to_vec(m),
            Message::NatHoleReport(m) => serde_json::to_vec(m),
            Message::GetProxyBandwidthLimitResp(m) => serde_json::to_vec(m),
        }?;
        Ok(body)
    }

    /// Decode a JSON body known to carry the given tag into its concrete
    /// variant. An unknown tag fails the connection (spec §4.1).
    fn decode(tag: u8, body: &[u8]) -> Result<Self> {
        Ok(match MessageType::from_tag(tag)? {
            MessageType::Login => Message::Login(serde_json::from_slice(body)?),
            MessageType::LoginResp => Message::LoginResp(serde_json::from_slice(body)?),
            MessageType::NewProxy => Message::NewProxy(serde_json::from_slice(body)?),
            MessageType::NewProxyResp => Message::NewProxyResp(serde_json::from_slice(body)?),
            MessageType::CloseProxy => Message::CloseProxy(serde_json::from_slice(body)?),
            MessageType::NewWorkConn => Message::NewWorkConn(serde_json::from_slice(body)?),
            MessageType::ReqWorkConn => Message::ReqWorkConn(serde_json::from_slice(body)?),
            MessageType::StartWorkConn => Message::StartWorkConn(serde_json::from_slice(body)?),
            MessageType::NewVisitorConn => Message::NewVisitorConn(serde_json::from_slice(body)?),
            MessageType::NewVisitorConnResp => {
                Message::NewVisitorConnResp(serde_json::from_slice(body)?)
            }
            MessageType::Ping => Message::Ping(serde_json::from_slice(body)?),
            MessageType::Pong => Message::Pong(serde_json::from_slice(body)?),
            MessageType::UdpPacket => Message::UdpPacket(serde_json::from_slice(body)?),
            MessageType::NatHoleVisitor => Message::NatHoleVisitor(serde_json::from_slice(body)?),
            MessageType::NatHoleClient => Message::NatHoleClient(serde_json::from_slice(body)?),
            MessageType::NatHoleResp => Message::NatHoleResp(serde_json::from_slice(body)?),
            MessageType::NatHoleSid => Message::NatHoleSid(serde_json::from_slice(body)?),
            MessageType::NatHoleReport => Message::NatHoleReport(serde_json::from_slice(body)?),
            MessageType::GetProxyBandwidthLimitResp => {
                Message::GetProxyBandwidthLimitResp(serde_json::from_slice(body)?)
            }
        })
    }
}

macro_rules! impl_from_message {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Message {
            fn from(v: $ty) -> Message {
                Message::$variant(v)
            }
        }
    };
}

impl_from_message!(Login, Login);
impl_from_message!(LoginResp, LoginResp);
impl_from_message!(NewProxy, NewProxy);
impl_from_message!(NewProxyResp, NewProxyResp);
impl_from_message!(CloseProxy, CloseProxy);
impl_from_message!(NewWorkConn, NewWorkConn);
impl_from_message!(ReqWorkConn, ReqWorkConn);
impl_from_message!(StartWorkConn, StartWorkConn);
impl_from_message!(NewVisitorConn, NewVisitorConn);
impl_from_message!(NewVisitorConnResp, NewVisitorConnResp);
impl_from_message!(Ping, Ping);
impl_from_message!(Pong, Pong);
impl_from_message!(UdpPacket, UdpPacket);
impl_from_message!(NatHoleVisitor, NatHoleVisitor);
impl_from_message!(NatHoleClient, NatHoleClient);
impl_from_message!(NatHoleResp, NatHoleResp);
impl_from_message!(NatHoleSid, NatHoleSid);
impl_from_message!(NatHoleReport, NatHoleReport);
impl_from_message!(GetProxyBandwidthLimitResp, GetProxyBandwidthLimitResp);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Login {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub pool_count: usize,
    #[serde(default)]
    pub metas: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoginResp {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub error: String,
}

/// A flat request to register one proxy. Only the fields relevant to
/// `proxy_type` are populated by either side; unused fields are left at
/// their default, matching frp's own single-struct-per-message design.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: String,

    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub bandwidth_limit: String,
    #[serde(default)]
    pub bandwidth_limit_mode: String,
    #[serde(default)]
    pub proxy_protocol_version: String,

    #[serde(default)]
    pub metadatas: HashMap<String, String>,

    // TCP / UDP
    #[serde(default)]
    pub remote_port: u16,

    // HTTP / HTTPS / TCPMUX
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub http_user: String,
    #[serde(default)]
    pub http_password: String,
    #[serde(default)]
    pub host_header_rewrite: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub multiplexer: String,
    #[serde(default)]
    pub route_by_http_user: String,

    // STCP / SUDP / XTCP
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub allow_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewProxyResp {
    pub proxy_name: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseProxy {
    pub proxy_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewWorkConn {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReqWorkConn {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StartWorkConn {
    pub proxy_name: String,
    #[serde(default)]
    pub src_addr: String,
    #[serde(default)]
    pub dst_addr: String,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewVisitorConn {
    pub proxy_name: String,
    #[serde(default)]
    pub sign_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewVisitorConnResp {
    pub proxy_name: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Ping {
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Pong {
    #[serde(default)]
    pub error: String,
}

/// One UDP datagram, framed inside a TCP work connection (spec §4.6 UDP).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UdpPacket {
    /// Raw payload, base64-encoded by serde_json's default `Vec<u8>` rules.
    pub content: Vec<u8>,
    pub local_addr: String,
    pub remote_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatHoleVisitor {
    pub transaction_id: String,
    pub proxy_name: String,
    #[serde(default)]
    pub pre_check: bool,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub sign_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub mapped_addrs: Vec<String>,
    #[serde(default)]
    pub assisted_addrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatHoleClient {
    pub transaction_id: String,
    pub proxy_name: String,
    #[serde(default)]
    pub sign_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PortsRange {
    pub from: u16,
    pub to: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DetectBehavior {
    /// "sender" or "receiver" — see [`crate::nathole::DetectRole`].
    pub role: String,
    #[serde(default)]
    pub ttl: i32,
    #[serde(default)]
    pub listen_random_ports: i32,
    #[serde(default)]
    pub send_random_ports: i32,
    #[serde(default)]
    pub candidate_ports: Vec<PortsRange>,
    #[serde(default)]
    pub candidate_addrs: Vec<String>,
    #[serde(default)]
    pub assisted_addrs: Vec<String>,
    #[serde(default)]
    pub send_delay_ms: i64,
    #[serde(default)]
    pub read_timeout_ms: i64,
    #[serde(default)]
    pub sid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatHoleResp {
    pub transaction_id: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub candidate_addrs: Vec<String>,
    #[serde(default)]
    pub assisted_addrs: Vec<String>,
    #[serde(default)]
    pub detect_behavior: DetectBehavior,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatHoleSid {
    pub transaction_id: String,
    pub sid: String,
    #[serde(default)]
    pub response: bool,
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatHoleReport {
    pub sid: String,
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GetProxyBandwidthLimitResp {
    pub proxy_name: String,
    #[serde(default)]
    pub in_bound: i64,
    #[serde(default)]
    pub out_bound: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(m: Message) {
        let payload = m.encode_payload().unwrap();
        let tag = m.msg_type() as u8;
        let decoded = Message::decode(tag, &payload).unwrap();
        assert_eq!(m.msg_type() as u8, decoded.msg_type() as u8);
    }

    #[test]
    fn codec_is_bijective_for_every_kind() {
        roundtrip(Login::default().into());
        roundtrip(LoginResp::default().into());
        roundtrip(NewProxy {
            proxy_name: "t1".into(),
            proxy_type: "tcp".into(),
            remote_port: 6000,
            ..Default::default()
        }.into());
        roundtrip(NewProxyResp::default().into());
        roundtrip(CloseProxy { proxy_name: "t1".into() }.into());
        roundtrip(NewWorkConn::default().into());
        roundtrip(ReqWorkConn::default().into());
        roundtrip(StartWorkConn::default().into());
        roundtrip(NewVisitorConn::default().into());
        roundtrip(NewVisitorConnResp::default().into());
        roundtrip(Ping::default().into());
        roundtrip(Pong::default().into());
        roundtrip(UdpPacket {
            content: vec![0xAA, 0xBB],
            local_addr: "127.0.0.1:53".into(),
            remote_addr: "1.2.3.4:9999".into(),
        }.into());
        roundtrip(NatHoleVisitor::default().into());
        roundtrip(NatHoleClient::default().into());
        roundtrip(NatHoleResp::default().into());
        roundtrip(NatHoleSid::default().into());
        roundtrip(NatHoleReport::default().into());
        roundtrip(GetProxyBandwidthLimitResp::default().into());
    }

    #[test]
    fn unknown_tag_fails_the_connection() {
        let err = Message::decode(200, b"{}").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
