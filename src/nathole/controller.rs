//! Server-side coordination of the nat hole punch handshake: pairs a
//! visitor's `NatHoleVisitor`/`NatHoleClient` exchange by `proxy_name`,
//! then computes and hands back each side's [`DetectBehavior`].
//! Grounded on `examples/original_source/pkg/nathole/nathole.go`'s
//! `Controller` and `examples/original_source/server/control.go`'s
//! nat-hole message forwarding handlers.

use super::{build_behavior, choose_mode, DetectRole, NatType, PrepareResult};
use crate::msg::DetectBehavior;
use crate::{Error, Result};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Reconstructs a [`PrepareResult`] from the `mapped_addrs`/
/// `assisted_addrs` a `NatHoleVisitor`/`NatHoleClient` message carried —
/// the server never runs STUN itself, so it classifies the NAT type from
/// the two addresses the endpoint already collected, the same comparison
/// [`super::executor::prepare`] does locally.
pub fn prepare_result_from_addrs(mapped_addrs: &[String], assisted_addrs: &[String]) -> Result<PrepareResult> {
    let addrs: Vec<SocketAddr> = mapped_addrs
        .iter()
        .filter_map(|a| a.parse().ok())
        .collect();
    if addrs.len() < 2 {
        return Err(Error::nathole("nat hole request carried fewer than two mapped addresses"));
    }
    let assisted = assisted_addrs.iter().filter_map(|a| a.parse().ok()).collect();

    let first = addrs[0];
    let second = addrs[1];
    let nat_type = if first.port() == second.port() {
        NatType::Easy
    } else {
        NatType::Hard
    };
    let port_regular = second.port() as i32 - first.port() as i32 == 1 || first == second;

    Ok(PrepareResult {
        addrs,
        assisted_addrs: assisted,
        nat_type,
        port_regular,
        local_port: first.port(),
    })
}

struct PendingExchange {
    proxy_name: String,
    client: Option<PrepareResult>,
    visitor: Option<PrepareResult>,
}

/// Tracks in-flight `ExchangeInfo` rounds keyed by proxy name (only one
/// hole-punch negotiation per XTCP proxy is in flight at a time).
#[derive(Clone, Default)]
pub struct NatHoleController {
    pending: Arc<DashMap<String, PendingExchange>>,
}

impl NatHoleController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_transaction_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Registers the client side's (proxy owner's) `PrepareResult` for
    /// `proxy_name`. If the visitor's side already arrived, this returns
    /// both sides' `DetectBehavior`.
    pub fn submit_client(
        &self,
        proxy_name: &str,
        transaction_id: &str,
        result: PrepareResult,
    ) -> Option<(DetectBehavior, DetectBehavior)> {
        self.submit(proxy_name, transaction_id, result, true)
    }

    pub fn submit_visitor(
        &self,
        proxy_name: &str,
        transaction_id: &str,
        result: PrepareResult,
    ) -> Option<(DetectBehavior, DetectBehavior)> {
        self.submit(proxy_name, transaction_id, result, false)
    }

    fn submit(
        &self,
        proxy_name: &str,
        transaction_id: &str,
        result: PrepareResult,
        is_client: bool,
    ) -> Option<(DetectBehavior, DetectBehavior)> {
        let mut entry = self
            .pending
            .entry(proxy_name.to_string())
            .or_insert_with(|| PendingExchange {
                proxy_name: proxy_name.to_string(),
                client: None,
                visitor: None,
            });

        if is_client {
            entry.client = Some(result);
        } else {
            entry.visitor = Some(result);
        }

        if entry.client.is_none() || entry.visitor.is_none() {
            return None;
        }

        let client = entry.client.clone().unwrap();
        let visitor = entry.visitor.clone().unwrap();
        let _ = &entry.proxy_name;
        drop(entry);
        self.pending.remove(proxy_name);

        let mode = choose_mode(&visitor, &client);
        let sid = transaction_id.to_string();
        let client_behavior = build_behavior(mode, DetectRole::Sender, &client, &visitor, sid.clone());
        let visitor_behavior = build_behavior(mode, DetectRole::Receiver, &visitor, &client, sid);

        Some((client_behavior, visitor_behavior))
    }

    pub fn abandon(&self, proxy_name: &str) {
        self.pending.remove(proxy_name);
    }
}

/// Confirms the peer named by `proxy_name` is logged in and its XTCP
/// proxy is ready to accept a hole-punch request (spec §4.8 step 1).
/// Concrete reachability is established by the caller already holding
/// the client's `Control`; this just centralizes the "is anyone actually
/// listening" check so `ExchangeInfo` doesn't start a round with nobody
/// to pair against.
pub fn pre_check(proxy_registered: bool) -> Result<()> {
    if proxy_registered {
        Ok(())
    } else {
        Err(Error::nathole("no such xtcp proxy registered for hole punch"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nathole::NatType;

    fn result() -> PrepareResult {
        PrepareResult {
            addrs: vec!["1.2.3.4:1000".parse().unwrap(), "1.2.3.4:1001".parse().unwrap()],
            assisted_addrs: vec![],
            nat_type: NatType::Easy,
            port_regular: true,
            local_port: 1000,
        }
    }

    #[test]
    fn exchange_completes_once_both_sides_submit() {
        let controller = NatHoleController::new();
        assert!(controller.submit_client("p1", "tx1", result()).is_none());
        let out = controller.submit_visitor("p1", "tx1", result());
        assert!(out.is_some());
        let (client_behavior, visitor_behavior) = out.unwrap();
        assert_eq!(client_behavior.role, "sender");
        assert_eq!(visitor_behavior.role, "receiver");
    }

    #[test]
    fn pre_check_rejects_unregistered_proxy() {
        assert!(pre_check(false).is_err());
        assert!(pre_check(true).is_ok());
    }
}
