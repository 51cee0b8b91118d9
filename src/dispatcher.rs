//! Per-connection request loop.
//!
//! One task per connection: read a frame, decode, authorize, route by record
//! tag, write exactly one reply — except `ice_candidate`, which replies
//! nothing. Side-effect records (forwarded messages and call signaling) go
//! out through the *target's* connection inside the handlers. Decode and
//! handler failures reply `error` and keep the loop alive; only transport
//! failures and connection-close signals end it.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, PeerLink};
use crate::frame::SentinelCodec;
use crate::handshake::server_handshake;
use crate::presence::PresenceEntry;
use crate::records::{AuthStatus, ClientRecord, ServerRecord};
use crate::server::Server;

/// Account a connection is bound to after a successful login.
struct AuthedUser {
    username: String,
    user_id: i64,
}

impl Server {
    pub(crate) async fn drive_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let (read, write) = socket.into_split();
        let mut reader = FramedRead::new(
            read,
            SentinelCodec::with_max_len(self.config.max_frame_len),
        );
        let mut writer = FramedWrite::new(
            write,
            SentinelCodec::with_max_len(self.config.max_frame_len),
        );

        let cipher =
            match server_handshake(&mut reader, &mut writer, self.config.handshake_timeout()).await
            {
                Ok(cipher) => cipher,
                Err(err) => {
                    info!(%peer, error = %err, "handshake failed");
                    return;
                }
            };

        let cancel = CancellationToken::new();
        let handle = Arc::new(ConnectionHandle::new(
            peer,
            cipher.clone(),
            writer,
            cancel.clone(),
        ));
        info!(%peer, conn = %handle.id(), "connection established");

        let mut authed: Option<AuthedUser> = None;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = reader.next() => frame,
            };
            let frame = match frame {
                None => break,
                Some(Err(err)) => {
                    info!(%peer, error = %err, "read failed");
                    break;
                }
                Some(Ok(frame)) => frame,
            };

            let record: ClientRecord = match cipher.open(&frame) {
                Ok(record) => record,
                Err(err) => {
                    debug!(%peer, error = %err, "undecodable frame");
                    if handle
                        .deliver(ServerRecord::error("malformed record"))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };
            debug!(%peer, tag = record.tag(), "request");

            // every tag outside {register, login} carries a token that must
            // resolve to the account this connection is bound to
            if let Some(token) = record.session_token() {
                let authorized = match (&authed, self.users.validate_session(token)) {
                    (Some(user), Ok(Some(account))) => account == user.user_id,
                    (_, Err(err)) => {
                        warn!(%peer, error = %err, "session lookup failed");
                        false
                    }
                    _ => false,
                };
                if !authorized {
                    if handle.deliver(ServerRecord::not_authorized()).await.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let reply = match record {
                ClientRecord::Register {
                    username,
                    password,
                    email,
                } => Some(self.handle_register(&username, &password, email.as_deref())),
                ClientRecord::Login {
                    username,
                    password,
                    p2p_port,
                    external_ip,
                } => {
                    let (reply, bound) = self
                        .handle_login(&handle, peer, &username, &password, p2p_port, external_ip)
                        .await;
                    if let Some(bound) = bound {
                        // switching accounts releases the old binding but
                        // keeps this socket alive
                        if let Some(old) = authed.take() {
                            if old.username != bound.username {
                                self.rebind_exit(&old.username, handle.id()).await;
                            }
                        }
                        authed = Some(bound);
                    }
                    Some(reply)
                }
                ClientRecord::Logout { session_token } => {
                    if let Err(err) = self.users.revoke_session(&session_token) {
                        warn!(%peer, error = %err, "session revoke failed");
                    }
                    let _ = handle
                        .deliver(ServerRecord::AuthResponse {
                            status: AuthStatus::Success,
                            message: "logged out".into(),
                            session_token: None,
                        })
                        .await;
                    break;
                }
                ClientRecord::GetUserList { .. } => {
                    let viewer = authed.as_ref().map(|u| u.username.as_str()).unwrap_or("");
                    Some(ServerRecord::UserListUpdate {
                        users: self.presence.roster_excluding(viewer),
                    })
                }
                ClientRecord::ClientInfo {
                    p2p_port,
                    external_ip,
                    ..
                } => {
                    let user = authed.as_ref().map(|u| u.username.as_str()).unwrap_or("");
                    let external_ip = if external_ip.is_empty() {
                        peer.ip().to_string()
                    } else {
                        external_ip
                    };
                    self.presence.update_reach(user, p2p_port, external_ip);
                    Some(ServerRecord::ClientInfoAck {
                        status: AuthStatus::Success,
                    })
                }
                ClientRecord::Heartbeat { .. } => {
                    if let Some(user) = &authed {
                        self.presence.touch(&user.username);
                        self.calls.touch_user(&user.username);
                    }
                    Some(ServerRecord::HeartbeatAck)
                }
                ClientRecord::P2pMessage {
                    to,
                    message,
                    message_id,
                    timestamp,
                    ..
                } => {
                    let sender = authed.as_ref().map(|u| u.username.as_str()).unwrap_or("");
                    Some(
                        self.relay_message(
                            sender,
                            handle.as_ref(),
                            to,
                            message,
                            message_id,
                            timestamp,
                        )
                        .await,
                    )
                }
                ClientRecord::CallRequest {
                    to,
                    call_type,
                    call_id,
                    ..
                } => {
                    let caller = authed.as_ref().map(|u| u.username.as_str()).unwrap_or("");
                    Some(
                        self.handle_call_request(caller, to, call_type, call_id)
                            .await,
                    )
                }
                ClientRecord::CallAnswer {
                    call_id,
                    answer,
                    call_port,
                    ..
                } => {
                    let responder = authed.as_ref().map(|u| u.username.as_str()).unwrap_or("");
                    Some(
                        self.handle_call_answer(responder, call_id, &answer, call_port)
                            .await,
                    )
                }
                ClientRecord::CallEnd { call_id, .. } => {
                    let participant = authed.as_ref().map(|u| u.username.as_str()).unwrap_or("");
                    Some(self.handle_call_end(participant, call_id).await)
                }
                ClientRecord::IceCandidate {
                    call_id,
                    candidate,
                    target_user,
                    ..
                } => {
                    let sender = authed.as_ref().map(|u| u.username.as_str()).unwrap_or("");
                    self.handle_ice_candidate(sender, call_id, candidate, target_user)
                        .await;
                    None
                }
            };

            if let Some(reply) = reply {
                if handle.deliver(reply).await.is_err() {
                    info!(%peer, "write failed");
                    break;
                }
            }
        }

        cancel.cancel();
        if let Some(user) = authed {
            self.dispatcher_exit(&user.username, handle.id()).await;
        }
        info!(%peer, "connection closed");
    }

    fn handle_register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> ServerRecord {
        if username.is_empty() || password.is_empty() {
            return auth_error("username and password required");
        }
        match self.users.create(username, password, email) {
            Ok(crate::store::RegisterOutcome::Created) => {
                info!(user = %username, "registered");
                ServerRecord::AuthResponse {
                    status: AuthStatus::Success,
                    message: "registration successful".into(),
                    session_token: None,
                }
            }
            Ok(crate::store::RegisterOutcome::NameTaken) => auth_error("user already exists"),
            Err(err) => {
                warn!(user = %username, error = %err, "register failed");
                auth_error("registration failed")
            }
        }
    }

    async fn handle_login(
        &self,
        handle: &Arc<ConnectionHandle>,
        peer: SocketAddr,
        username: &str,
        password: &str,
        p2p_port: Option<u16>,
        external_ip: Option<String>,
    ) -> (ServerRecord, Option<AuthedUser>) {
        let user_id = match self.users.verify_password(username, password) {
            Ok(Some(id)) => id,
            Ok(None) => return (auth_error("invalid username or password"), None),
            Err(err) => {
                warn!(user = %username, error = %err, "login lookup failed");
                return (auth_error("login failed"), None);
            }
        };
        let token = match self.users.issue_session(user_id) {
            Ok(token) => token,
            Err(err) => {
                warn!(user = %username, error = %err, "session issue failed");
                return (auth_error("login failed"), None);
            }
        };

        let external_ip = external_ip
            .filter(|ip| !ip.is_empty())
            .unwrap_or_else(|| peer.ip().to_string());
        let entry = PresenceEntry::new(
            username.to_string(),
            user_id,
            handle.clone() as Arc<dyn PeerLink>,
            p2p_port.unwrap_or(0),
            external_ip,
        );
        if let Some(prior) = self.presence.insert(entry) {
            // a re-login on the same connection merely refreshes the entry;
            // a different connection displaces the old one entirely
            if prior.link.id() != handle.id() {
                info!(user = %username, "displacing previous connection");
                self.teardown_entry(prior).await;
            }
        }
        info!(user = %username, online = self.presence.len(), "logged in");

        (
            ServerRecord::AuthResponse {
                status: AuthStatus::Success,
                message: "login successful".into(),
                session_token: Some(token),
            },
            Some(AuthedUser {
                username: username.to_string(),
                user_id,
            }),
        )
    }
}

fn auth_error(message: &str) -> ServerRecord {
    ServerRecord::AuthResponse {
        status: AuthStatus::Error,
        message: message.to_string(),
        session_token: None,
    }
}
