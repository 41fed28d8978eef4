//! Per-visitor session state: identity, experimental assignment, transcript,
//! and engagement counters.
//!
//! ## Design
//! - SessionStore: Arc<Mutex<HashMap<String, Session>>> — shared across all
//!   connections, held only in process memory (a restart forgets every
//!   session; the event log is the durable record)
//! - Sessions are keyed by an opaque sid issued on first contact; the page
//!   keeps the sid in sessionStorage and passes it on every call
//! - The transcript is an append-only Vec replayed in insertion order on
//!   every render
//! - `turn_active` enforces one outstanding chat turn per session
//!
//! ## Session lifecycle
//! 1. Page bootstrap calls `get_or_create` with no sid → new sid, new
//!    participant id, condition and card version drawn once
//! 2. Every later call with the same sid returns the same identity
//! 3. Chat turns append messages and bump counters under the store lock
//! 4. The session dies with the process; event records outlive it

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::StudyError;
use crate::experiment::{CardVersion, Condition, LinkState};

/// Shared session store: sid → Session.
pub type SessionStore = Arc<Mutex<HashMap<String, Session>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One role-tagged chat message. Ordinal position is implicit in the
/// transcript sequence; messages are never reordered or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Per-visitor state for one browser session.
pub struct Session {
    pub participant_id: String,
    /// Assigned once at creation; `None` only before `assign_once` runs.
    pub condition: Option<Condition>,
    pub card_version: Option<CardVersion>,
    pub messages: Vec<Message>,
    pub chat_rounds: u32,
    pub link_state: LinkState,
    pub link_shown_count: u32,
    pub link_click_count: u32,
    pub link_clicked: bool,
    pub entry_time_ms: u64,
    /// Set while a chat turn is streaming; a second concurrent turn for the
    /// same session is rejected.
    pub turn_active: bool,
}

impl Session {
    pub fn new() -> Self {
        Session {
            participant_id: uuid::Uuid::new_v4().to_string(),
            condition: None,
            card_version: None,
            messages: Vec::new(),
            chat_rounds: 0,
            link_state: LinkState::NotShown,
            link_shown_count: 0,
            link_click_count: 0,
            link_clicked: false,
            entry_time_ms: now_ms(),
            turn_active: false,
        }
    }

    /// Number of assistant replies committed to the transcript so far.
    pub fn assistant_replies(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    }

    pub fn condition_label(&self) -> String {
        self.condition.map(|c| c.to_string()).unwrap_or_default()
    }

    pub fn card_version_label(&self) -> String {
        self.card_version.map(|v| v.to_string()).unwrap_or_default()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Constructor helpers
// ---------------------------------------------------------------------------

/// Create a new empty SessionStore.
pub fn new_session_store() -> SessionStore {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// Look up an existing session, or mint a fresh one when `sid` is absent or
/// unknown (the process may have restarted since the page stored its sid).
///
/// Returns the effective sid. Repeated calls with the returned sid are
/// idempotent: they resolve to the same session identity and never re-draw
/// the experimental assignment.
pub fn get_or_create(store: &SessionStore, sid: Option<&str>) -> Result<String, StudyError> {
    let mut guard = store
        .lock()
        .map_err(|_| StudyError::Store("lock poisoned".to_string()))?;

    if let Some(sid) = sid {
        if guard.contains_key(sid) {
            return Ok(sid.to_string());
        }
    }

    let sid = uuid::Uuid::new_v4().to_string();
    let mut session = Session::new();
    crate::experiment::assign_once(&mut session, &mut rand::thread_rng());
    guard.insert(sid.clone(), session);
    Ok(sid)
}

/// Run `f` against the named session under the store lock.
///
/// A missing session fails closed: stateful routes never silently recreate
/// state mid-conversation.
pub fn with_session<T>(
    store: &SessionStore,
    sid: &str,
    f: impl FnOnce(&mut Session) -> T,
) -> Result<T, StudyError> {
    let mut guard = store
        .lock()
        .map_err(|_| StudyError::Store("lock poisoned".to_string()))?;
    let session = guard
        .get_mut(sid)
        .ok_or_else(|| StudyError::SessionNotFound(sid.to_string()))?;
    Ok(f(session))
}

/// Append one message to the session transcript. O(1) amortized; insertion
/// order is the render order.
pub fn append_message(
    store: &SessionStore,
    sid: &str,
    role: Role,
    content: &str,
) -> Result<(), StudyError> {
    with_session(store, sid, |s| {
        s.messages.push(Message {
            role,
            content: content.to_string(),
        });
    })
}

/// Clone the ordered transcript for replay.
pub fn transcript(store: &SessionStore, sid: &str) -> Result<Vec<Message>, StudyError> {
    with_session(store, sid, |s| s.messages.clone())
}

/// Claim the session for a chat turn. Fails with `TurnInProgress` while a
/// previous turn is still streaming.
pub fn begin_turn(store: &SessionStore, sid: &str) -> Result<(), StudyError> {
    with_session(store, sid, |s| {
        if s.turn_active {
            Err(StudyError::TurnInProgress(sid.to_string()))
        } else {
            s.turn_active = true;
            Ok(())
        }
    })?
}

/// Release the turn claim. Safe to call on any exit path.
pub fn end_turn(store: &SessionStore, sid: &str) {
    let _ = with_session(store, sid, |s| {
        s.turn_active = false;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_has_uuid_participant_id() {
        let s = Session::new();
        assert_eq!(s.participant_id.len(), 36);
        assert!(uuid::Uuid::parse_str(&s.participant_id).is_ok());
    }

    #[test]
    fn test_new_session_counters_zero() {
        let s = Session::new();
        assert_eq!(s.chat_rounds, 0);
        assert_eq!(s.link_shown_count, 0);
        assert_eq!(s.link_click_count, 0);
        assert!(!s.link_clicked);
        assert!(!s.turn_active);
    }

    #[test]
    fn test_new_session_unassigned() {
        let s = Session::new();
        assert!(s.condition.is_none());
        assert!(s.card_version.is_none());
        assert_eq!(s.link_state, LinkState::NotShown);
    }

    #[test]
    fn test_participant_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..100).map(|_| Session::new().participant_id).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_get_or_create_without_sid_creates() {
        let store = new_session_store();
        let sid = get_or_create(&store, None).expect("create");
        assert!(store.lock().unwrap().contains_key(&sid));
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = new_session_store();
        let sid = get_or_create(&store, None).expect("create");
        let pid = with_session(&store, &sid, |s| s.participant_id.clone()).expect("pid");
        let again = get_or_create(&store, Some(&sid)).expect("reuse");
        assert_eq!(again, sid);
        let pid2 = with_session(&store, &sid, |s| s.participant_id.clone()).expect("pid");
        assert_eq!(pid, pid2);
    }

    #[test]
    fn test_get_or_create_unknown_sid_mints_fresh() {
        let store = new_session_store();
        let sid = get_or_create(&store, Some("stale-from-before-restart")).expect("create");
        assert_ne!(sid, "stale-from-before-restart");
        assert!(store.lock().unwrap().contains_key(&sid));
    }

    #[test]
    fn test_get_or_create_assigns_condition() {
        let store = new_session_store();
        let sid = get_or_create(&store, None).expect("create");
        with_session(&store, &sid, |s| {
            assert!(s.condition.is_some());
            assert!(s.card_version.is_some());
        })
        .expect("session");
    }

    #[test]
    fn test_append_preserves_order() {
        let store = new_session_store();
        let sid = get_or_create(&store, None).expect("create");
        append_message(&store, &sid, Role::User, "one").expect("append");
        append_message(&store, &sid, Role::Assistant, "two").expect("append");
        append_message(&store, &sid, Role::User, "three").expect("append");
        let t = transcript(&store, &sid).expect("transcript");
        let contents: Vec<&str> = t.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_transcript_replay_is_stable() {
        let store = new_session_store();
        let sid = get_or_create(&store, None).expect("create");
        append_message(&store, &sid, Role::User, "hello").expect("append");
        let a = transcript(&store, &sid).expect("transcript");
        let b = transcript(&store, &sid).expect("transcript");
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].content, b[0].content);
    }

    #[test]
    fn test_append_unknown_sid_fails_closed() {
        let store = new_session_store();
        let err = append_message(&store, "nope", Role::User, "x").unwrap_err();
        assert!(matches!(err, StudyError::SessionNotFound(_)));
    }

    #[test]
    fn test_assistant_replies_counts_only_assistant() {
        let mut s = Session::new();
        s.messages.push(Message { role: Role::User, content: "a".to_string() });
        s.messages.push(Message { role: Role::Assistant, content: "b".to_string() });
        s.messages.push(Message { role: Role::User, content: "c".to_string() });
        assert_eq!(s.assistant_replies(), 1);
    }

    #[test]
    fn test_begin_turn_rejects_second_turn() {
        let store = new_session_store();
        let sid = get_or_create(&store, None).expect("create");
        begin_turn(&store, &sid).expect("first turn");
        let err = begin_turn(&store, &sid).unwrap_err();
        assert!(matches!(err, StudyError::TurnInProgress(_)));
    }

    #[test]
    fn test_end_turn_releases_claim() {
        let store = new_session_store();
        let sid = get_or_create(&store, None).expect("create");
        begin_turn(&store, &sid).expect("first turn");
        end_turn(&store, &sid);
        begin_turn(&store, &sid).expect("second turn after release");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).expect("ser"), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).expect("ser"),
            "\"assistant\""
        );
    }

    #[test]
    fn test_now_ms_is_reasonable() {
        // After 2023-11-01
        assert!(now_ms() > 1_700_000_000_000);
    }
}
