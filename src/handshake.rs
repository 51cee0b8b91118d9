//! Per-connection key exchange, server side.
//!
//! Single-use: the client opens with its RSA-2048 public key in PEM, the
//! server answers with a fresh symmetric key wrapped under RSA-OAEP(SHA-256),
//! and every later frame on the connection is sealed with that key. A
//! rehandshake requires a new TCP connection.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time;
use rsa::traits::PublicKeyParts;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::codec::RecordCipher;
use crate::crypto::{self, CryptoError, Fernet};
use crate::frame::{FrameError, SentinelCodec};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for the client key")]
    Timeout,
    #[error("peer closed during handshake")]
    ClosedEarly,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Runs the server side of the exchange and returns the connection cipher.
pub async fn server_handshake(
    reader: &mut FramedRead<OwnedReadHalf, SentinelCodec>,
    writer: &mut FramedWrite<OwnedWriteHalf, SentinelCodec>,
    deadline: Duration,
) -> Result<RecordCipher, HandshakeError> {
    let frame = time::timeout(deadline, reader.next())
        .await
        .map_err(|_| HandshakeError::Timeout)?
        .ok_or(HandshakeError::ClosedEarly)??;

    let pem = std::str::from_utf8(&frame)
        .map_err(|_| CryptoError::PublicKey("key frame is not utf-8".into()))?;
    let public = crypto::parse_client_public_key(pem)?;
    debug!(modulus_bits = public.size() * 8, "client key accepted");

    let key = Fernet::generate_key();
    let cipher = Fernet::new(&key)?;
    let wrapped = crypto::wrap_session_key(&public, key.as_bytes())?;
    writer.send(Bytes::from(wrapped)).await?;

    Ok(RecordCipher::new(cipher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{Oaep, RsaPrivateKey};
    use sha2::Sha256;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn both_sides_derive_the_same_cipher() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, write) = socket.into_split();
            let mut reader = FramedRead::new(read, SentinelCodec::new());
            let mut writer = FramedWrite::new(write, SentinelCodec::new());
            server_handshake(&mut reader, &mut writer, Duration::from_secs(5))
                .await
                .unwrap()
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let (read, write) = socket.into_split();
        let mut reader = FramedRead::new(read, SentinelCodec::new());
        let mut writer = FramedWrite::new(write, SentinelCodec::new());

        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        writer.send(Bytes::from(pem.into_bytes())).await.unwrap();

        let wrapped = reader.next().await.unwrap().unwrap();
        let key_bytes = private.decrypt(Oaep::new::<Sha256>(), &wrapped).unwrap();
        let key = String::from_utf8(key_bytes).unwrap();
        assert_eq!(key.len(), 44);
        let client_cipher = RecordCipher::new(Fernet::new(&key).unwrap());

        let server_cipher = server.await.unwrap();
        let frame = server_cipher
            .seal(&crate::records::ServerRecord::HeartbeatAck)
            .unwrap();
        let opened: crate::records::ServerRecord = client_cipher.open(&frame).unwrap();
        assert_eq!(opened, crate::records::ServerRecord::HeartbeatAck);
    }

    #[tokio::test]
    async fn garbage_key_frame_fails_the_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, write) = socket.into_split();
            let mut reader = FramedRead::new(read, SentinelCodec::new());
            let mut writer = FramedWrite::new(write, SentinelCodec::new());
            server_handshake(&mut reader, &mut writer, Duration::from_secs(5)).await
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let (_read, write) = socket.into_split();
        let mut writer = FramedWrite::new(write, SentinelCodec::new());
        writer
            .send(Bytes::from_static(b"definitely not a pem key"))
            .await
            .unwrap();

        assert!(matches!(
            server.await.unwrap(),
            Err(HandshakeError::Crypto(_))
        ));
    }
}
