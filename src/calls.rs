//! Call table and signaling state machine.
//!
//! ```text
//! (none) --call_request--> ringing --accept--> active --call_end--> (none)
//!                            |  \--reject/caller-disconnect/sweep--> (none)
//!                            \--sweep > ringing bound--> (none)
//!          active --participant disconnect / sweep > active bound--> (none)
//! ```
//!
//! The table holds only non-terminal calls; terminated calls survive in the
//! journal alone. At any moment at most one ringing-or-active call references
//! a given username as either side. State transitions are pure and return
//! outcome values; all network writes happen in the handlers after the table
//! lock is released.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::records::{
    AnswerStatus, CallKind, CallStatus, EndStatus, ServerRecord, unix_now,
};
use crate::server::Server;
use crate::store::CallClose;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Active,
}

/// One non-terminal call.
#[derive(Debug, Clone)]
pub struct Call {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub kind: CallKind,
    pub state: CallState,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub answered_at: Option<Instant>,
    pub last_activity: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Caller or callee already participates in a call, or the id collides.
    Busy,
    Started,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AnswerOutcome {
    NotFound,
    NotCallee,
    Accepted { caller: String },
    Rejected { caller: String },
}

#[derive(Debug, PartialEq, Eq)]
pub enum EndOutcome {
    AlreadyEnded,
    NotParticipant,
    Ended { other: String, duration: u64 },
}

/// A call removed outside the normal answer/end flow (disconnect or sweep).
#[derive(Debug)]
pub struct ClosedCall {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub state: CallState,
    /// Seconds since the call started; `None` for calls that never rang out.
    pub duration: Option<u64>,
}

impl ClosedCall {
    fn from_call(call: Call) -> Self {
        let duration = matches!(call.state, CallState::Active)
            .then(|| call.started_at.elapsed().as_secs());
        Self {
            call_id: call.call_id,
            caller: call.caller,
            callee: call.callee,
            state: call.state,
            duration,
        }
    }

    pub fn other_party(&self, user: &str) -> &str {
        if self.caller == user {
            &self.callee
        } else {
            &self.caller
        }
    }
}

#[derive(Default)]
pub struct CallTable {
    calls: Mutex<HashMap<String, Call>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn participates(calls: &HashMap<String, Call>, user: &str) -> bool {
        calls.values().any(|c| c.caller == user || c.callee == user)
    }

    pub fn is_busy(&self, user: &str) -> bool {
        Self::participates(&self.calls.lock(), user)
    }

    /// Inserts a ringing call, enforcing single-call-per-user exclusivity.
    pub fn begin(&self, caller: &str, callee: &str, kind: CallKind, call_id: &str) -> BeginOutcome {
        let mut calls = self.calls.lock();
        if calls.contains_key(call_id)
            || Self::participates(&calls, caller)
            || Self::participates(&calls, callee)
        {
            return BeginOutcome::Busy;
        }
        let now = Instant::now();
        calls.insert(
            call_id.to_string(),
            Call {
                call_id: call_id.to_string(),
                caller: caller.to_string(),
                callee: callee.to_string(),
                kind,
                state: CallState::Ringing,
                started_at: now,
                started_wall: Utc::now(),
                answered_at: None,
                last_activity: now,
            },
        );
        BeginOutcome::Started
    }

    /// Applies the callee's decision. Accept transitions ringing → active;
    /// reject removes the call.
    pub fn answer(&self, call_id: &str, responder: &str, accept: bool) -> AnswerOutcome {
        let mut calls = self.calls.lock();
        match calls.get_mut(call_id) {
            None => AnswerOutcome::NotFound,
            Some(call) if call.callee != responder => AnswerOutcome::NotCallee,
            Some(call) if accept => {
                let now = Instant::now();
                call.state = CallState::Active;
                call.answered_at.get_or_insert(now);
                call.last_activity = now;
                AnswerOutcome::Accepted {
                    caller: call.caller.clone(),
                }
            }
            Some(_) => match calls.remove(call_id) {
                Some(call) => AnswerOutcome::Rejected {
                    caller: call.caller,
                },
                None => AnswerOutcome::NotFound,
            },
        }
    }

    /// Removes the call on behalf of a participant hanging up.
    pub fn end(&self, call_id: &str, participant: &str) -> EndOutcome {
        let mut calls = self.calls.lock();
        match calls.get(call_id) {
            None => EndOutcome::AlreadyEnded,
            Some(call) if call.caller != participant && call.callee != participant => {
                EndOutcome::NotParticipant
            }
            Some(_) => match calls.remove(call_id) {
                Some(call) => {
                    let other = if call.caller == participant {
                        call.callee
                    } else {
                        call.caller
                    };
                    EndOutcome::Ended {
                        other,
                        duration: call.started_at.elapsed().as_secs(),
                    }
                }
                None => EndOutcome::AlreadyEnded,
            },
        }
    }

    /// Whether `sender` participates in the call; gates candidate relaying.
    pub fn allows_candidate(&self, call_id: &str, sender: &str) -> bool {
        self.calls
            .lock()
            .get(call_id)
            .is_some_and(|c| c.caller == sender || c.callee == sender)
    }

    /// Refreshes activity on every call the user participates in.
    pub fn touch_user(&self, user: &str) {
        let now = Instant::now();
        for call in self.calls.lock().values_mut() {
            if call.caller == user || call.callee == user {
                call.last_activity = now;
            }
        }
    }

    /// Removes every call referencing a disconnected user.
    pub fn teardown_user(&self, user: &str) -> Vec<ClosedCall> {
        let mut calls = self.calls.lock();
        let ids: Vec<String> = calls
            .values()
            .filter(|c| c.caller == user || c.callee == user)
            .map(|c| c.call_id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| calls.remove(&id))
            .map(ClosedCall::from_call)
            .collect()
    }

    /// Removes calls stuck past their state's age bound.
    pub fn sweep(&self, ringing_max: Duration, active_max: Duration) -> Vec<ClosedCall> {
        let mut calls = self.calls.lock();
        let stuck: Vec<String> = calls
            .values()
            .filter(|c| match c.state {
                CallState::Ringing => c.started_at.elapsed() > ringing_max,
                CallState::Active => c.last_activity.elapsed() > active_max,
            })
            .map(|c| c.call_id.clone())
            .collect();
        stuck
            .into_iter()
            .filter_map(|id| calls.remove(&id))
            .map(ClosedCall::from_call)
            .collect()
    }

    pub fn get(&self, call_id: &str) -> Option<Call> {
        self.calls.lock().get(call_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

impl Server {
    pub(crate) async fn handle_call_request(
        &self,
        caller: &str,
        to: String,
        call_type: CallKind,
        call_id: String,
    ) -> ServerRecord {
        // busy wins over offline so a caller cannot probe presence while
        // the callee is on another call
        if self.calls.is_busy(caller) || self.calls.is_busy(&to) {
            return call_response(CallStatus::UserBusy, call_id, "participant busy");
        }
        let Some(target) = self.presence.link_of(&to) else {
            return call_response(CallStatus::UserOffline, call_id, "callee offline");
        };
        if self.calls.begin(caller, &to, call_type, &call_id) == BeginOutcome::Busy {
            return call_response(CallStatus::UserBusy, call_id, "participant busy");
        }
        if let Err(err) = self
            .journal
            .call_started(&call_id, caller, &to, call_type)
        {
            warn!(%call_id, error = %err, "journal insert failed");
        }

        let notice = ServerRecord::CallRequest {
            from: caller.to_string(),
            call_type,
            call_id: call_id.clone(),
            timestamp: unix_now(),
        };
        if let Err(err) = target.deliver(notice).await {
            // callee link is broken: retract the call and drop the peer
            debug!(callee = %to, error = %err, "call notice undeliverable");
            self.calls.end(&call_id, caller);
            if let Err(err) = self.journal.call_closed(&call_id, CallClose::Aborted, None) {
                warn!(%call_id, error = %err, "journal update failed");
            }
            self.evict(&to).await;
            return call_response(CallStatus::Failed, call_id, "callee unreachable");
        }
        call_response(CallStatus::Ringing, call_id, "ringing")
    }

    pub(crate) async fn handle_call_answer(
        &self,
        responder: &str,
        call_id: String,
        answer: &str,
        call_port: Option<u16>,
    ) -> ServerRecord {
        let accept = match answer {
            "accept" => true,
            "reject" => false,
            other => {
                return ServerRecord::error(format!("unsupported answer: {other}"));
            }
        };
        match self.calls.answer(&call_id, responder, accept) {
            AnswerOutcome::NotFound => ServerRecord::CallAnswerResponse {
                status: AnswerStatus::CallNotFound,
                call_id,
            },
            AnswerOutcome::NotCallee => ServerRecord::error("not the callee of this call"),
            AnswerOutcome::Accepted { caller } => {
                if let Err(err) = self.journal.call_accepted(&call_id) {
                    warn!(%call_id, error = %err, "journal update failed");
                }
                self.forward(
                    &caller,
                    ServerRecord::CallAccepted {
                        from: responder.to_string(),
                        call_id: call_id.clone(),
                        call_port,
                    },
                )
                .await;
                ServerRecord::CallAnswerResponse {
                    status: AnswerStatus::Accepted,
                    call_id,
                }
            }
            AnswerOutcome::Rejected { caller } => {
                if let Err(err) = self.journal.call_closed(&call_id, CallClose::Rejected, None) {
                    warn!(%call_id, error = %err, "journal update failed");
                }
                self.forward(
                    &caller,
                    ServerRecord::CallRejected {
                        from: responder.to_string(),
                        call_id: call_id.clone(),
                    },
                )
                .await;
                ServerRecord::CallAnswerResponse {
                    status: AnswerStatus::Rejected,
                    call_id,
                }
            }
        }
    }

    pub(crate) async fn handle_call_end(
        &self,
        participant: &str,
        call_id: String,
    ) -> ServerRecord {
        match self.calls.end(&call_id, participant) {
            EndOutcome::AlreadyEnded => ServerRecord::CallEndResponse {
                status: EndStatus::AlreadyEnded,
                call_id,
                duration: None,
            },
            EndOutcome::NotParticipant => ServerRecord::error("not a participant of this call"),
            EndOutcome::Ended { other, duration } => {
                if let Err(err) =
                    self.journal
                        .call_closed(&call_id, CallClose::Ended, Some(duration))
                {
                    warn!(%call_id, error = %err, "journal update failed");
                }
                self.forward(
                    &other,
                    ServerRecord::CallEnded {
                        from: participant.to_string(),
                        call_id: call_id.clone(),
                        reason: None,
                    },
                )
                .await;
                ServerRecord::CallEndResponse {
                    status: EndStatus::Ended,
                    call_id,
                    duration: Some(duration),
                }
            }
        }
    }

    /// Pass-through relaying of a NAT-traversal candidate. Unknown call ids
    /// and non-participant senders are dropped without reply or mutation.
    pub(crate) async fn handle_ice_candidate(
        &self,
        sender: &str,
        call_id: String,
        candidate: String,
        target_user: String,
    ) {
        if !self.calls.allows_candidate(&call_id, sender) {
            debug!(%call_id, %sender, "dropping candidate outside any call");
            return;
        }
        self.calls.touch_user(sender);
        self.forward(
            &target_user,
            ServerRecord::IceCandidate {
                call_id,
                candidate,
                from_user: sender.to_string(),
            },
        )
        .await;
    }

    /// Best-effort push through a user's presence link, if any.
    pub(crate) async fn forward(&self, username: &str, record: ServerRecord) {
        if let Some(link) = self.presence.link_of(username) {
            if let Err(err) = link.deliver(record).await {
                debug!(user = %username, error = %err, "forward failed");
            }
        }
    }
}

fn call_response(status: CallStatus, call_id: String, message: &str) -> ServerRecord {
    ServerRecord::CallResponse {
        status,
        call_id,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_ringing(call_id: &str) -> CallTable {
        let table = CallTable::new();
        assert_eq!(
            table.begin("alice", "bob", CallKind::Audio, call_id),
            BeginOutcome::Started
        );
        table
    }

    #[test]
    fn one_call_per_user_as_either_side() {
        let table = table_with_ringing("c1");
        assert_eq!(
            table.begin("alice", "carol", CallKind::Audio, "c2"),
            BeginOutcome::Busy
        );
        assert_eq!(
            table.begin("carol", "bob", CallKind::Video, "c3"),
            BeginOutcome::Busy
        );
        assert_eq!(
            table.begin("carol", "dave", CallKind::Video, "c4"),
            BeginOutcome::Started
        );
    }

    #[test]
    fn duplicate_call_id_is_a_conflict() {
        let table = table_with_ringing("c1");
        table.teardown_user("alice");
        table.begin("carol", "dave", CallKind::Audio, "c1");
        assert_eq!(
            table.begin("erin", "frank", CallKind::Audio, "c1"),
            BeginOutcome::Busy
        );
    }

    #[test]
    fn accept_transitions_to_active() {
        let table = table_with_ringing("c1");
        let outcome = table.answer("c1", "bob", true);
        assert_eq!(
            outcome,
            AnswerOutcome::Accepted {
                caller: "alice".into()
            }
        );
        let call = table.get("c1").unwrap();
        assert_eq!(call.state, CallState::Active);
        assert!(call.answered_at.is_some());
    }

    #[test]
    fn reject_removes_the_call() {
        let table = table_with_ringing("c1");
        assert_eq!(
            table.answer("c1", "bob", false),
            AnswerOutcome::Rejected {
                caller: "alice".into()
            }
        );
        assert!(table.is_empty());
        // both parties are callable again
        assert_eq!(
            table.begin("bob", "alice", CallKind::Video, "c2"),
            BeginOutcome::Started
        );
    }

    #[test]
    fn only_the_callee_may_answer() {
        let table = table_with_ringing("c1");
        assert_eq!(table.answer("c1", "alice", true), AnswerOutcome::NotCallee);
        assert_eq!(table.answer("c1", "mallory", true), AnswerOutcome::NotCallee);
        assert_eq!(table.answer("nope", "bob", true), AnswerOutcome::NotFound);
    }

    #[test]
    fn end_is_idempotent() {
        let table = table_with_ringing("c1");
        table.answer("c1", "bob", true);
        assert!(matches!(
            table.end("c1", "alice"),
            EndOutcome::Ended { ref other, .. } if other == "bob"
        ));
        assert_eq!(table.end("c1", "alice"), EndOutcome::AlreadyEnded);
        assert_eq!(table.end("c1", "bob"), EndOutcome::AlreadyEnded);
    }

    #[test]
    fn outsiders_cannot_end_a_call() {
        let table = table_with_ringing("c1");
        assert_eq!(table.end("c1", "mallory"), EndOutcome::NotParticipant);
        assert!(!table.is_empty());
    }

    #[test]
    fn candidate_gate_requires_participation() {
        let table = table_with_ringing("c1");
        assert!(table.allows_candidate("c1", "alice"));
        assert!(table.allows_candidate("c1", "bob"));
        assert!(!table.allows_candidate("c1", "mallory"));
        assert!(!table.allows_candidate("unknown", "alice"));
    }

    #[test]
    fn teardown_closes_all_of_a_users_calls() {
        let table = table_with_ringing("c1");
        table.answer("c1", "bob", true);
        let closed = table.teardown_user("bob");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].state, CallState::Active);
        assert_eq!(closed[0].other_party("bob"), "alice");
        assert!(closed[0].duration.is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn sweep_times_out_ringing_and_idle_active_calls() {
        let ringing = table_with_ringing("c1");
        assert!(ringing
            .sweep(Duration::from_secs(120), Duration::from_secs(300))
            .is_empty());
        let swept = ringing.sweep(Duration::ZERO, Duration::from_secs(300));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].duration, None);

        let active = table_with_ringing("c2");
        active.answer("c2", "bob", true);
        assert!(active
            .sweep(Duration::ZERO, Duration::from_secs(300))
            .is_empty());
        let swept = active.sweep(Duration::ZERO, Duration::ZERO);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].state, CallState::Active);
    }

    #[test]
    fn heartbeat_touch_defers_the_active_sweep() {
        let table = table_with_ringing("c1");
        table.answer("c1", "bob", true);
        std::thread::sleep(Duration::from_millis(20));
        table.touch_user("bob");
        assert!(table
            .sweep(Duration::from_secs(120), Duration::from_millis(15))
            .is_empty());
    }
}
