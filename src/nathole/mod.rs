//! NAT hole punching (spec §4.8): STUN-based classification, coordinated
//! detect-message exchange across five server-chosen modes, and handover
//! of the resulting UDP flow to a multiplexed tunnel session.
//!
//! Grounded on `examples/original_source/pkg/nathole/nathole.go`
//! (`PreCheck`/`Prepare`/`ExchangeInfo`/`MakeHole`/`waitDetectMessage`) and
//! `examples/original_source/client/visitor/xtcp.go` (`TunnelSession`,
//! `openTunnel`). The STUN client, NAT classifier, and the per-mode
//! `DetectBehavior` executor are implemented directly against RFC 5389
//! since no STUN crate appears in the retrieved example pack.

pub mod controller;
pub mod executor;
pub mod stun;
pub mod tunnel;

pub use controller::NatHoleController;
pub use executor::{make_hole, wait_detect_message};
pub use tunnel::{QuicTunnelSession, TunnelSession, YamuxOverUdpTunnelSession};

use crate::msg::{DetectBehavior, PortsRange};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// Public IP, or a NAT that preserves the local port / maps
    /// predictably — a primer packet from the peer is enough to open it.
    Easy,
    /// Maps each outgoing flow to an unpredictable or non-reusable
    /// external port — needs port-spraying to find.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectRole {
    Sender,
    Receiver,
}

impl DetectRole {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectRole::Sender => "sender",
            DetectRole::Receiver => "receiver",
        }
    }
}

/// Output of STUN discovery + classification (spec §4.8 step 2).
#[derive(Debug, Clone)]
pub struct PrepareResult {
    pub addrs: Vec<SocketAddr>,
    /// Other local IPs sharing the same local UDP port, offered as
    /// candidates in case the peer is on the same LAN.
    pub assisted_addrs: Vec<SocketAddr>,
    pub nat_type: NatType,
    /// True if consecutive probes' mapped external ports increase by a
    /// fixed delta (so the peer can guess the next one).
    pub port_regular: bool,
    pub local_port: u16,
}

/// Detection mode chosen by the server from the two sides' [`PrepareResult`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectMode {
    /// EasyNAT×EasyNAT, or either side public.
    Mode0,
    /// HardNAT×EasyNAT, port changes regular.
    Mode1,
    /// HardNAT×EasyNAT, port changes irregular.
    Mode2,
    /// HardNAT×HardNAT, both regular.
    Mode3,
    /// HardNAT×HardNAT, one side regular.
    Mode4,
}

impl DetectMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DetectMode::Mode0 => 0,
            DetectMode::Mode1 => 1,
            DetectMode::Mode2 => 2,
            DetectMode::Mode3 => 3,
            DetectMode::Mode4 => 4,
        }
    }
}

/// Picks a detection mode from both peers' NAT classifications (spec
/// §4.8 "Detection modes").
pub fn choose_mode(visitor: &PrepareResult, client: &PrepareResult) -> DetectMode {
    use NatType::*;
    match (visitor.nat_type, client.nat_type) {
        (Easy, Easy) => DetectMode::Mode0,
        (Hard, Easy) | (Easy, Hard) => {
            let regular = if visitor.nat_type == Hard {
                visitor.port_regular
            } else {
                client.port_regular
            };
            if regular {
                DetectMode::Mode1
            } else {
                DetectMode::Mode2
            }
        }
        (Hard, Hard) => {
            if visitor.port_regular && client.port_regular {
                DetectMode::Mode3
            } else {
                DetectMode::Mode4
            }
        }
    }
}

fn candidate_ports_around(base: u16, spread: u16) -> Vec<PortsRange> {
    let from = base.saturating_sub(spread);
    let to = base.saturating_add(spread);
    vec![PortsRange { from, to }]
}

/// Builds the [`DetectBehavior`] a given endpoint should execute, per the
/// chosen mode. `self_result`/`peer_result` are from that endpoint's own
/// point of view (its own Prepare output, and the value the server
/// forwarded from the other side).
pub fn build_behavior(
    mode: DetectMode,
    role: DetectRole,
    self_result: &PrepareResult,
    peer_result: &PrepareResult,
    sid: String,
) -> DetectBehavior {
    let candidate_addrs = peer_result.addrs.iter().map(|a| a.to_string()).collect();
    let assisted_addrs = peer_result
        .assisted_addrs
        .iter()
        .map(|a| a.to_string())
        .collect();

    let (ttl, listen_random_ports, send_random_ports, candidate_ports, send_delay_ms) = match mode
    {
        DetectMode::Mode0 => match role {
            DetectRole::Receiver => (3, 0, 0, Vec::new(), 0),
            DetectRole::Sender => (64, 0, 0, Vec::new(), 100),
        },
        DetectMode::Mode1 => match role {
            DetectRole::Sender => (64, 0, 10, candidate_ports_around(peer_result.local_port, 10), 0),
            DetectRole::Receiver => (64, 0, 0, Vec::new(), 100),
        },
        DetectMode::Mode2 => match role {
            DetectRole::Receiver => (64, 5, 0, Vec::new(), 0),
            DetectRole::Sender => (64, 0, 64, Vec::new(), 100),
        },
        DetectMode::Mode3 | DetectMode::Mode4 => (
            64,
            if mode == DetectMode::Mode4 && role == DetectRole::Receiver {
                20
            } else {
                0
            },
            0,
            candidate_ports_around(peer_result.local_port, 20),
            50,
        ),
    };

    DetectBehavior {
        role: role.as_str().to_string(),
        ttl,
        listen_random_ports,
        send_random_ports,
        candidate_ports,
        candidate_addrs,
        assisted_addrs,
        send_delay_ms,
        read_timeout_ms: 5_000,
        sid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(nat: NatType, regular: bool) -> PrepareResult {
        PrepareResult {
            addrs: vec!["1.2.3.4:1000".parse().unwrap(), "1.2.3.4:1001".parse().unwrap()],
            assisted_addrs: vec![],
            nat_type: nat,
            port_regular: regular,
            local_port: 1000,
        }
    }

    #[test]
    fn easy_easy_is_mode0() {
        let a = result(NatType::Easy, true);
        let b = result(NatType::Easy, true);
        assert_eq!(choose_mode(&a, &b), DetectMode::Mode0);
    }

    #[test]
    fn hard_hard_irregular_is_mode4() {
        let a = result(NatType::Hard, true);
        let b = result(NatType::Hard, false);
        assert_eq!(choose_mode(&a, &b), DetectMode::Mode4);
    }

    #[test]
    fn hard_easy_regular_is_mode1() {
        let a = result(NatType::Hard, true);
        let b = result(NatType::Easy, false);
        assert_eq!(choose_mode(&a, &b), DetectMode::Mode1);
    }
}
