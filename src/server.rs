//! Broker server: listener, shared state, sweepers, and teardown.
//!
//! One `Server` value owns the account store, the presence registry, and the
//! call table; dispatchers and sweepers receive an `Arc` of it on spawn.
//! Lock order everywhere: presence before calls, a connection's write mutex
//! last, and never a registry lock across a network write.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time;
use tracing::{info, warn};
use uuid::Uuid;

use crate::calls::{CallState, CallTable, ClosedCall};
use crate::config::ServerConfig;
use crate::presence::{Presence, PresenceEntry};
use crate::records::ServerRecord;
use crate::store::{CallClose, Journal, UserStore};

pub struct Server {
    pub(crate) config: ServerConfig,
    pub(crate) users: Arc<dyn UserStore>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) presence: Presence,
    pub(crate) calls: CallTable,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        users: Arc<dyn UserStore>,
        journal: Arc<dyn Journal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            users,
            journal,
            presence: Presence::new(),
            calls: CallTable::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn calls(&self) -> &CallTable {
        &self.calls
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.config.bind_addr).await
    }

    /// Accepts connections forever, one dispatcher task per connection.
    /// Admission is unbounded; the sweepers reclaim whatever idles out.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "broker listening");
        tokio::spawn(Arc::clone(&self).idle_sweeper());
        tokio::spawn(Arc::clone(&self).call_sweeper());

        loop {
            let (socket, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.drive_connection(socket, peer).await;
            });
        }
    }

    /// Evicts a user whatever connection currently owns the name.
    pub(crate) async fn evict(&self, username: &str) {
        if let Some(entry) = self.presence.remove(username) {
            self.teardown_entry(entry).await;
        }
    }

    /// Teardown on dispatcher exit, guarded by connection identity so an old
    /// dispatcher cannot tear down the connection that displaced it.
    pub(crate) async fn dispatcher_exit(&self, username: &str, conn_id: Uuid) {
        if let Some(entry) = self.presence.remove_if(username, conn_id) {
            self.teardown_entry(entry).await;
        }
    }

    /// Releases a connection's binding to `username` without closing the
    /// socket, for a connection that re-authenticates as another account.
    pub(crate) async fn rebind_exit(&self, username: &str, conn_id: Uuid) {
        if self.presence.remove_if(username, conn_id).is_some() {
            let closed = self.close_user_calls(username).await;
            info!(user = %username, calls_closed = closed, "binding released");
        }
    }

    /// Finishes a disconnect for an entry already removed from presence:
    /// ends the user's calls, notifies the peers, and closes the socket.
    pub(crate) async fn teardown_entry(&self, entry: PresenceEntry) {
        let username = entry.username.clone();
        let closed = self.close_user_calls(&username).await;
        entry.link.close();
        info!(user = %username, calls_closed = closed, "user disconnected");
    }

    async fn close_user_calls(&self, username: &str) -> usize {
        let closed = self.calls.teardown_user(username);
        for call in &closed {
            self.journal_disconnect(username, call);
            let other = call.other_party(username).to_string();
            self.forward(
                &other,
                ServerRecord::CallEnded {
                    from: username.to_string(),
                    call_id: call.call_id.clone(),
                    reason: Some("user_disconnected".into()),
                },
            )
            .await;
        }
        closed.len()
    }

    fn journal_disconnect(&self, username: &str, call: &ClosedCall) {
        // a ringing call abandoned by its own caller was never offered
        let close = if call.state == CallState::Ringing && call.caller == username {
            CallClose::Aborted
        } else {
            CallClose::EndedAbruptly
        };
        if let Err(err) = self.journal.call_closed(&call.call_id, close, call.duration) {
            warn!(call_id = %call.call_id, error = %err, "journal update failed");
        }
    }

    async fn idle_sweeper(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.idle_sweep_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for username in self.presence.idle_users(self.config.idle_max()) {
                info!(user = %username, "evicting idle connection");
                self.evict(&username).await;
            }
        }
    }

    async fn call_sweeper(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.call_sweep_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stuck = self
                .calls
                .sweep(self.config.ringing_max(), self.config.active_max());
            for call in stuck {
                warn!(call_id = %call.call_id, state = ?call.state, "sweeping stuck call");
                if let Err(err) =
                    self.journal
                        .call_closed(&call.call_id, CallClose::Timeout, call.duration)
                {
                    warn!(call_id = %call.call_id, error = %err, "journal update failed");
                }
                for participant in [&call.caller, &call.callee] {
                    self.forward(
                        participant,
                        ServerRecord::CallEnded {
                            from: "system".into(),
                            call_id: call.call_id.clone(),
                            reason: Some("timeout".into()),
                        },
                    )
                    .await;
                }
            }
        }
    }
}
