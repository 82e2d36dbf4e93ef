//! Shared call log.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bridgehead_core::{BridgeState, EventId, IntentError, RoomId, SessionId, UserId};
use bridgehead_server::StateSink;

/// One observable call into a test double.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// `ChildOverride::init`
    Init,
    /// `ChildOverride::start`
    Start,
    /// `ChildOverride::stop`
    Stop,
    /// `Crypto::init`
    CryptoInit,
    /// `Crypto::start`
    CryptoStart,
    /// `Crypto::stop`
    CryptoStop,
    /// `Crypto::handle_member_event`
    MemberTracked {
        /// Room of the member event
        room_id: RoomId,
        /// Member
        user_id: UserId,
    },
    /// `Crypto::request_session`
    SessionRequested {
        /// Requested session
        session_id: SessionId,
    },
    /// `Portal::receive_matrix_event`
    Received {
        /// Portal room
        room_id: RoomId,
        /// Sender
        sender: UserId,
        /// Event type
        event_type: String,
        /// Event body, if any
        body: Option<String>,
    },
    /// `DisappearingPortal::schedule_disappearing`
    Disappearing {
        /// Portal room
        room_id: RoomId,
    },
    /// `MembershipHandlingPortal::handle_matrix_leave`
    Leave {
        /// Portal room
        room_id: RoomId,
        /// User who left
        user_id: UserId,
    },
    /// `MembershipHandlingPortal::handle_matrix_kick`
    Kick {
        /// Portal room
        room_id: RoomId,
        /// Kicker
        sender: UserId,
        /// Kicked ghost
        ghost: UserId,
    },
    /// `MembershipHandlingPortal::handle_matrix_invite`
    Invite {
        /// Portal room
        room_id: RoomId,
        /// Inviter
        sender: UserId,
        /// Invited ghost
        ghost: UserId,
    },
    /// `ReadReceiptHandlingPortal::handle_matrix_read_receipt`
    ReadReceipt {
        /// Portal room
        room_id: RoomId,
        /// Reader
        user_id: UserId,
        /// Last read event
        event_id: EventId,
        /// Receipt time (ms)
        ts: i64,
    },
    /// `TypingPortal::handle_matrix_typing`
    Typing {
        /// Portal room
        room_id: RoomId,
        /// Users typing
        user_ids: Vec<UserId>,
    },
    /// `MetaHandlingPortal::handle_matrix_meta`
    Meta {
        /// Portal room
        room_id: RoomId,
        /// Sender
        sender: UserId,
        /// Event type
        event_type: String,
    },
    /// `ChildOverride::create_private_portal`
    PrivatePortal {
        /// New portal room
        room_id: RoomId,
        /// Local user
        user_id: UserId,
        /// Ghost on the other side
        ghost: UserId,
    },
    /// `CommandProcessor::handle`
    Command {
        /// Room the command was sent in
        room_id: RoomId,
        /// Sender
        user_id: UserId,
        /// Command text
        message: String,
    },
}

/// Append-only log shared by every test double of one test.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Record>>>);

impl Recorder {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&self, record: Record) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }

    /// Snapshot of the log.
    pub fn records(&self) -> Vec<Record> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Snapshot without the records `skip` matches.
    pub fn records_without(&self, skip: impl Fn(&Record) -> bool) -> Vec<Record> {
        self.records().into_iter().filter(|r| !skip(r)).collect()
    }
}

/// [`StateSink`] that keeps every pushed snapshot.
#[derive(Debug, Default)]
pub struct RecordingSink {
    states: Mutex<Vec<BridgeState>>,
}

impl RecordingSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushed snapshots, oldest first.
    pub fn states(&self) -> Vec<BridgeState> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl StateSink for RecordingSink {
    async fn push(&self, state: &BridgeState) -> Result<(), IntentError> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).push(state.clone());
        Ok(())
    }
}
