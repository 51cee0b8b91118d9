//! End-to-end helpers shared by the integration tests: a broker spawned on
//! an ephemeral port and a minimal client that speaks the real wire protocol
//! (RSA handshake included).

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::RecordCipher;
use crate::config::ServerConfig;
use crate::crypto::Fernet;
use crate::frame::SentinelCodec;
use crate::records::{AuthStatus, ClientRecord, ServerRecord};
use crate::server::Server;
use crate::store::SqliteStore;

/// Spawns a broker with an in-memory store on an ephemeral port.
pub async fn spawn_server(
    mut config: ServerConfig,
) -> Result<(Arc<Server>, Arc<SqliteStore>, SocketAddr), Box<dyn Error>> {
    config.bind_addr = "127.0.0.1:0".parse()?;
    let store = Arc::new(SqliteStore::open_in_memory_with_ttl(config.session_ttl())?);
    let server = Server::new(config, store.clone(), store.clone());
    let listener = server.bind().await?;
    let addr = listener.local_addr()?;
    tokio::spawn(Arc::clone(&server).run(listener));
    Ok((server, store, addr))
}

/// One test client on its own TCP connection.
pub struct TestPeer {
    reader: FramedRead<OwnedReadHalf, SentinelCodec>,
    writer: FramedWrite<OwnedWriteHalf, SentinelCodec>,
    cipher: RecordCipher,
    pub session_token: Option<String>,
}

impl TestPeer {
    /// Connects and completes the key exchange with a fresh RSA-2048 pair.
    pub async fn connect(addr: SocketAddr) -> Result<Self, Box<dyn Error>> {
        let socket = TcpStream::connect(addr).await?;
        let (read, write) = socket.into_split();
        let mut reader = FramedRead::new(read, SentinelCodec::new());
        let mut writer = FramedWrite::new(write, SentinelCodec::new());

        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)?;
        let pem = private
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)?;
        writer.send(Bytes::from(pem.into_bytes())).await?;

        let wrapped = reader
            .next()
            .await
            .ok_or("server closed during handshake")??;
        let key = String::from_utf8(private.decrypt(Oaep::new::<Sha256>(), &wrapped)?)?;
        let cipher = RecordCipher::new(Fernet::new(&key)?);

        Ok(Self {
            reader,
            writer,
            cipher,
            session_token: None,
        })
    }

    /// Connect, register, and log in as one step.
    pub async fn join(
        addr: SocketAddr,
        username: &str,
        password: &str,
    ) -> Result<Self, Box<dyn Error>> {
        let mut peer = Self::connect(addr).await?;
        peer.register(username, password).await?;
        let reply = peer.login(username, password).await?;
        match reply {
            ServerRecord::AuthResponse {
                status: AuthStatus::Success,
                ..
            } => Ok(peer),
            other => Err(format!("login rejected: {other:?}").into()),
        }
    }

    pub async fn send(&mut self, record: &ClientRecord) -> Result<(), Box<dyn Error>> {
        let frame = self.cipher.seal(record)?;
        self.writer.send(frame).await?;
        Ok(())
    }

    /// Writes an arbitrary payload as one frame, bypassing the cipher.
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), Box<dyn Error>> {
        self.writer.send(Bytes::copy_from_slice(payload)).await?;
        Ok(())
    }

    /// Next record, failing after two seconds of silence.
    pub async fn recv(&mut self) -> Result<ServerRecord, Box<dyn Error>> {
        self.recv_within(Duration::from_secs(2)).await
    }

    pub async fn recv_within(&mut self, limit: Duration) -> Result<ServerRecord, Box<dyn Error>> {
        let frame = time::timeout(limit, self.reader.next())
            .await
            .map_err(|_| "timed out waiting for a record")?
            .ok_or("connection closed")??;
        Ok(self.cipher.open(&frame)?)
    }

    /// Skips records until `accept` matches one; statuses pushed both
    /// synchronously and asynchronously make exact sequences unreliable.
    pub async fn recv_matching(
        &mut self,
        limit: Duration,
        accept: impl Fn(&ServerRecord) -> bool,
    ) -> Result<ServerRecord, Box<dyn Error>> {
        let deadline = time::Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            if remaining.is_zero() {
                return Err("no matching record before the deadline".into());
            }
            let record = self.recv_within(remaining).await?;
            if accept(&record) {
                return Ok(record);
            }
        }
    }

    pub async fn register(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<ServerRecord, Box<dyn Error>> {
        self.send(&ClientRecord::Register {
            username: username.into(),
            password: password.into(),
            email: None,
        })
        .await?;
        self.recv().await
    }

    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<ServerRecord, Box<dyn Error>> {
        self.send(&ClientRecord::Login {
            username: username.into(),
            password: password.into(),
            p2p_port: Some(40000),
            external_ip: Some("127.0.0.1".into()),
        })
        .await?;
        let reply = self.recv().await?;
        if let ServerRecord::AuthResponse {
            session_token: Some(token),
            ..
        } = &reply
        {
            self.session_token = Some(token.clone());
        }
        Ok(reply)
    }

    /// Session token from the last successful login.
    pub fn token(&self) -> String {
        self.session_token.clone().unwrap_or_default()
    }
}
