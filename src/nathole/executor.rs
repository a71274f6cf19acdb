//! The generic `DetectBehavior` executor (spec §4.8 step 4, §9 "the
//! executor is generic"): regardless of which of the five modes the
//! server picked, both endpoints run the same `make_hole` loop driven
//! entirely by the knobs in their own [`DetectBehavior`].

use super::stun;
use super::{NatType, PrepareResult};
use crate::crypto::derive_key;
use crate::msg::{DetectBehavior, NatHoleSid};
use crate::{Error, Result};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

fn encrypt(secret_key: &str, payload: &[u8]) -> Vec<u8> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = derive_key(secret_key.as_bytes(), &salt, 16);
    let mut cipher = Aes128Ctr::new(key.as_slice().into(), &[0u8; 16].into());
    let mut buf = payload.to_vec();
    cipher.apply_keystream(&mut buf);
    let mut out = Vec::with_capacity(16 + buf.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&buf);
    out
}

fn decrypt(secret_key: &str, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 16 {
        return Err(Error::nathole("nat hole datagram shorter than salt"));
    }
    let (salt, ciphertext) = data.split_at(16);
    let key = derive_key(secret_key.as_bytes(), salt, 16);
    let mut cipher = Aes128Ctr::new(key.as_slice().into(), &[0u8; 16].into());
    let mut buf = ciphertext.to_vec();
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}

/// STUN discovery against `stun_server`, run twice from the same local
/// port so the mapped ports can be compared to classify the NAT (spec
/// §4.8 step 2). Fails if fewer than two addresses come back, per the
/// invariant in spec §8.
pub async fn prepare(socket: &UdpSocket, stun_server: &str) -> Result<PrepareResult> {
    let local_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);

    let first = stun::discover(socket, stun_server).await?;
    sleep(Duration::from_millis(50)).await;
    let second = stun::discover(socket, stun_server).await?;

    let addrs = vec![first, second];
    let nat_type = if first.port() == local_port {
        NatType::Easy
    } else {
        NatType::Hard
    };
    let port_regular = second.port() as i32 - first.port() as i32 == 1
        || first.ip() == second.ip() && first.port() == second.port();

    Ok(PrepareResult {
        addrs,
        assisted_addrs: Vec::new(),
        nat_type,
        port_regular,
        local_port,
    })
}

/// Waits up to `behavior.read_timeout_ms` (or 5s default, per spec §5) for
/// an authenticated `NatHoleSid` datagram matching `sid`, replying to
/// probes it sees along the way. Returns the address the matching packet
/// (or, for a sender, the peer's reply) came from — the socket this ran
/// on should be handed to [`super::tunnel::TunnelSession`] next.
pub async fn make_hole(
    socket: &UdpSocket,
    behavior: &DetectBehavior,
    secret_key: &str,
    transaction_id: &str,
) -> Result<SocketAddr> {
    if behavior.ttl > 0 {
        let _ = socket.set_ttl(behavior.ttl as u32);
    }

    if behavior.send_delay_ms > 0 {
        sleep(Duration::from_millis(behavior.send_delay_ms as u64)).await;
    }

    let mut targets: Vec<SocketAddr> = behavior
        .candidate_addrs
        .iter()
        .filter_map(|a| a.parse().ok())
        .collect();

    for range in &behavior.candidate_ports {
        if let Some(base) = targets.first().copied() {
            for port in range.from..=range.to {
                targets.push(SocketAddr::new(base.ip(), port));
            }
        }
    }

    let probe = NatHoleSid {
        transaction_id: transaction_id.to_string(),
        sid: behavior.sid.clone(),
        response: false,
        nonce: uuid::Uuid::new_v4().to_string(),
    };
    let probe_bytes = serde_json::to_vec(&probe).map_err(Error::from)?;
    let datagram = encrypt(secret_key, &probe_bytes);
    for target in &targets {
        let _ = socket.send_to(&datagram, target).await;
    }

    let timeout_ms = if behavior.read_timeout_ms > 0 {
        behavior.read_timeout_ms as u64
    } else {
        5_000
    };

    wait_detect_message(socket, behavior.sid.clone(), secret_key, timeout_ms).await
}

/// Reads datagrams off `socket` until one decodes to a [`NatHoleSid`] with
/// a matching `sid`: if it's a probe (`response: false`) this replies
/// `response: true` and keeps waiting for the sender's own reply; if it's
/// already a reply this returns immediately.
pub async fn wait_detect_message(
    socket: &UdpSocket,
    sid: String,
    secret_key: &str,
    timeout_ms: u64,
) -> Result<SocketAddr> {
    let deadline = Duration::from_millis(timeout_ms);
    let mut buf = [0u8; 1024];

    loop {
        let (n, from) = timeout(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::nathole("nat hole detect wait timed out"))?
            .map_err(|e| Error::nathole(format!("reading nat hole datagram: {e}")))?;

        let plaintext = match decrypt(secret_key, &buf[..n]) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let msg: NatHoleSid = match serde_json::from_slice(&plaintext) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if msg.sid != sid {
            continue;
        }

        if !msg.response {
            let reply = NatHoleSid {
                transaction_id: msg.transaction_id,
                sid: sid.clone(),
                response: true,
                nonce: msg.nonce,
            };
            let reply_bytes = serde_json::to_vec(&reply).map_err(Error::from)?;
            let datagram = encrypt(secret_key, &reply_bytes);
            let _ = socket.send_to(&datagram, from).await;
        }
        return Ok(from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrips() {
        let payload = b"hello nat hole";
        let encrypted = encrypt("secret", payload);
        let decrypted = decrypt("secret", &encrypted).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn decrypt_with_wrong_secret_does_not_panic_and_differs() {
        let encrypted = encrypt("secret-a", b"payload1234567890");
        let decrypted = decrypt("secret-b", &encrypted).unwrap();
        assert_ne!(decrypted, b"payload1234567890");
    }

    #[tokio::test]
    async fn make_hole_between_two_local_sockets_finds_each_other() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let behavior_a = DetectBehavior {
            role: "sender".into(),
            ttl: 0,
            listen_random_ports: 0,
            send_random_ports: 0,
            candidate_ports: vec![],
            candidate_addrs: vec![b_addr.to_string()],
            assisted_addrs: vec![],
            send_delay_ms: 0,
            read_timeout_ms: 2000,
            sid: "sid-1".into(),
        };
        let behavior_b = DetectBehavior {
            role: "receiver".into(),
            candidate_addrs: vec![a_addr.to_string()],
            read_timeout_ms: 2000,
            sid: "sid-1".into(),
            ..behavior_a.clone()
        };

        let secret = "shared".to_string();
        let secret2 = secret.clone();
        let t1 = tokio::spawn(async move { make_hole(&a, &behavior_a, &secret, "tx-1").await });
        let t2 = tokio::spawn(async move { make_hole(&b, &behavior_b, &secret2, "tx-1").await });

        let (r1, r2) = tokio::join!(t1, t2);
        assert!(r1.unwrap().is_ok());
        assert!(r2.unwrap().is_ok());
    }
}
