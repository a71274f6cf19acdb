//! Wire framing: `[type:1][length:8 big-endian][json payload]`.

use super::Message;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this are rejected outright; guards against a corrupted or
/// malicious length prefix forcing a huge allocation.
const MAX_FRAME_LEN: u64 = 10 * 1024 * 1024;

pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<()> {
    let payload = msg.encode_payload()?;
    w.write_u8(msg.msg_type() as u8).await?;
    w.write_u64(payload.len() as u64).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message> {
    let tag = r.read_u8().await?;
    let len = r.read_u64().await?;
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!(
            "frame length {len} exceeds max {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Message::decode(tag, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Ping;
    use tokio::io::duplex;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let (mut a, mut b) = duplex(1024);
        let msg: Message = Ping {
            privilege_key: "abc".into(),
            timestamp: 1700000000,
        }
        .into();
        write_message(&mut a, &msg).await.unwrap();
        let decoded = read_message(&mut b).await.unwrap();
        match decoded {
            Message::Ping(p) => {
                assert_eq!(p.privilege_key, "abc");
                assert_eq!(p.timestamp, 1700000000);
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_u8(0).await.unwrap();
        a.write_u64(u64::MAX).await.unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
