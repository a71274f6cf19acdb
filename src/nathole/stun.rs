//! Minimal STUN (RFC 5389) binding request/response, just enough to learn
//! our server-reflexive address. No STUN crate appears in the example
//! pack, so this talks the wire protocol directly rather than fabricate a
//! dependency.

use crate::{Error, Result};
use rand::RngCore;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112A442;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;
const MAPPED_ADDRESS: u16 = 0x0001;

fn build_binding_request(tx_id: &[u8; 12]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes()); // length, no attributes
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(tx_id);
    buf
}

fn parse_binding_response(buf: &[u8], tx_id: &[u8; 12]) -> Result<SocketAddr> {
    if buf.len() < 20 {
        return Err(Error::nathole("STUN response shorter than header"));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(Error::nathole(format!(
            "unexpected STUN message type 0x{msg_type:04x}"
        )));
    }
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if &buf[8..20] != tx_id {
        return Err(Error::nathole("STUN transaction id mismatch"));
    }

    let mut offset = 20;
    let end = (20 + msg_len).min(buf.len());
    let mut xor_mapped = None;
    let mut mapped = None;

    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > buf.len() {
            break;
        }
        let value = &buf[value_start..value_end];

        if attr_type == XOR_MAPPED_ADDRESS && value.len() >= 8 {
            let family = value[1];
            let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
            if family == 0x01 {
                let mut ip_bytes = [0u8; 4];
                ip_bytes.copy_from_slice(&value[4..8]);
                let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
                for i in 0..4 {
                    ip_bytes[i] ^= cookie_bytes[i];
                }
                xor_mapped = Some(SocketAddr::from((ip_bytes, port)));
            }
        } else if attr_type == MAPPED_ADDRESS && value.len() >= 8 {
            let family = value[1];
            let port = u16::from_be_bytes([value[2], value[3]]);
            if family == 0x01 {
                let ip_bytes = [value[4], value[5], value[6], value[7]];
                mapped = Some(SocketAddr::from((ip_bytes, port)));
            }
        }

        // attributes are padded to a 4-byte boundary
        offset = value_end + ((4 - (attr_len % 4)) % 4);
    }

    xor_mapped
        .or(mapped)
        .ok_or_else(|| Error::nathole("STUN response had no mapped address attribute"))
}

/// Sends one binding request from `socket` to `stun_server` and returns
/// the server-reflexive address it reports.
pub async fn discover(socket: &UdpSocket, stun_server: &str) -> Result<SocketAddr> {
    let mut tx_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut tx_id);
    let request = build_binding_request(&tx_id);

    socket
        .send_to(&request, stun_server)
        .await
        .map_err(|e| Error::nathole(format!("sending STUN request to {stun_server}: {e}")))?;

    let mut buf = [0u8; 512];
    let n = timeout(Duration::from_secs(3), socket.recv(&mut buf))
        .await
        .map_err(|_| Error::nathole("STUN request timed out"))?
        .map_err(|e| Error::nathole(format!("reading STUN response: {e}")))?;

    parse_binding_response(&buf[..n], &tx_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_xor_mapped_address_response() {
        let tx_id = [1u8; 12];
        let mut resp = Vec::new();
        resp.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        resp.extend_from_slice(&12u16.to_be_bytes());
        resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(&tx_id);
        // XOR-MAPPED-ADDRESS attribute: family IPv4, port 6000, ip 203.0.113.9
        resp.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
        resp.extend_from_slice(&8u16.to_be_bytes());
        resp.push(0);
        resp.push(0x01);
        let xport = 6000u16 ^ (MAGIC_COOKIE >> 16) as u16;
        resp.extend_from_slice(&xport.to_be_bytes());
        let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
        let ip = [203u8, 0, 113, 9];
        let mut xip = [0u8; 4];
        for i in 0..4 {
            xip[i] = ip[i] ^ cookie_bytes[i];
        }
        resp.extend_from_slice(&xip);

        let addr = parse_binding_response(&resp, &tx_id).unwrap();
        assert_eq!(addr.port(), 6000);
        assert_eq!(addr.ip().to_string(), "203.0.113.9");
    }

    #[test]
    fn rejects_mismatched_transaction_id() {
        let tx_id = [1u8; 12];
        let mut resp = Vec::new();
        resp.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        resp.extend_from_slice(&0u16.to_be_bytes());
        resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(&[2u8; 12]);
        assert!(parse_binding_response(&resp, &tx_id).is_err());
    }
}
