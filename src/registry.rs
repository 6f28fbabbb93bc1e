//! Session Registry
//! Mission: One authoritative table of live sessions and match subscriber
//! sets, with per-match lock granularity.
//!
//! Sessions and matches are rows in keyed tables; subscriber sets hold
//! session ids, never session objects, so a session and its match can
//! never form a reference cycle. All cross-table operations take at most
//! one lock at a time.

use crate::auth::Identity;
use crate::models::{MatchContext, Recommendation, WsServerEvent};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// One live connection's state.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub identity: Identity,
    pub connected_at: DateTime<Utc>,
    /// At most one match at a time; joining a new match replaces this.
    pub match_ctx: Option<MatchContext>,
    /// What this session last received, for significance diffing.
    pub last_recommendation: Option<Recommendation>,
}

#[derive(Debug, Default)]
struct MatchEntry {
    subscribers: HashSet<Uuid>,
}

/// Registry of live sessions and per-match subscriber sets.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>,
    /// Outbound channels, separate from session rows so delivery never
    /// contends with session-state mutation.
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<WsServerEvent>>>,
    matches: RwLock<HashMap<String, Arc<Mutex<MatchEntry>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            matches: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session row for an already-validated identity.
    pub fn register(
        &self,
        identity: Identity,
        outbound: mpsc::UnboundedSender<WsServerEvent>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let session = Session {
            id,
            identity,
            connected_at: Utc::now(),
            match_ctx: None,
            last_recommendation: None,
        };

        self.sessions.write().insert(id, Arc::new(Mutex::new(session)));
        self.senders.write().insert(id, outbound);
        debug!(session = %id, "session registered");
        id
    }

    /// Remove a session entirely, including its subscriber-set membership.
    /// Safe to call more than once (disconnect races).
    pub fn unregister(&self, session_id: Uuid) {
        let Some(session) = self.sessions.write().remove(&session_id) else {
            return;
        };
        self.senders.write().remove(&session_id);

        let left_match = session.lock().match_ctx.as_ref().map(|c| c.match_id.clone());
        if let Some(match_id) = left_match {
            self.remove_subscriber(&match_id, session_id);
        }
        debug!(session = %session_id, "session unregistered");
    }

    /// Point a session at a new match, implicitly leaving any previous one.
    /// Returns false if the session no longer exists.
    pub fn join_match(&self, session_id: Uuid, ctx: MatchContext) -> bool {
        let Some(session) = self.session_arc(session_id) else {
            return false;
        };

        let new_match = ctx.match_id.clone();
        let old_match = {
            let mut session = session.lock();
            let old = session.match_ctx.take().map(|c| c.match_id);
            session.match_ctx = Some(ctx);
            // A fresh context starts a fresh diff history.
            session.last_recommendation = None;
            old
        };

        if let Some(old) = old_match {
            if old != new_match {
                self.remove_subscriber(&old, session_id);
            }
        }

        self.matches
            .write()
            .entry(new_match)
            .or_default()
            .lock()
            .subscribers
            .insert(session_id);
        true
    }

    /// Detach a session from its current match. Idempotent.
    pub fn leave_match(&self, session_id: Uuid) -> Option<String> {
        let session = self.session_arc(session_id)?;
        let left = {
            let mut session = session.lock();
            session.match_ctx.take().map(|c| c.match_id)
        };

        if let Some(ref match_id) = left {
            self.remove_subscriber(match_id, session_id);
        }
        left
    }

    /// Consistent snapshot of a match's subscribers.
    pub fn subscribers_of(&self, match_id: &str) -> Vec<Uuid> {
        let entry = self.matches.read().get(match_id).cloned();
        match entry {
            Some(entry) => entry.lock().subscribers.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Match ids with at least one watcher, for the background poller.
    pub fn watched_matches(&self) -> Vec<String> {
        self.matches.read().keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Deliver an event to one session. Returns false if it is gone or its
    /// receiver side has been dropped.
    pub fn send_to(&self, session_id: Uuid, event: WsServerEvent) -> bool {
        let sender = self.senders.read().get(&session_id).cloned();
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Run a closure against a session row, if it still exists.
    pub fn with_session<T>(
        &self,
        session_id: Uuid,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Option<T> {
        let session = self.session_arc(session_id)?;
        let mut session = session.lock();
        Some(f(&mut session))
    }

    /// The context the poller recomputes from: the oldest subscriber's
    /// character/role/roster with every subscriber's detected items merged
    /// in. Enemy intel is match-wide, so the union is the best-known state.
    pub fn poll_context(&self, match_id: &str) -> Option<MatchContext> {
        let mut canonical: Option<MatchContext> = None;
        let mut all_items: HashMap<String, Vec<String>> = HashMap::new();

        for session_id in self.subscribers_of(match_id) {
            let ctx = self.with_session(session_id, |s| s.match_ctx.clone()).flatten();
            let Some(ctx) = ctx else {
                // Subscriber-set entry without a context: a leave is mid-flight.
                warn!(session = %session_id, match_id, "subscriber without match context");
                continue;
            };

            for (enemy, items) in &ctx.detected_items {
                all_items.insert(enemy.clone(), items.clone());
            }

            match &canonical {
                Some(existing) if existing.joined_at <= ctx.joined_at => {}
                _ => canonical = Some(ctx),
            }
        }

        let mut ctx = canonical?;
        ctx.detected_items = all_items;
        Some(ctx)
    }

    fn session_arc(&self, session_id: Uuid) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(&session_id).cloned()
    }

    fn remove_subscriber(&self, match_id: &str, session_id: Uuid) {
        let entry = self.matches.read().get(match_id).cloned();
        let Some(entry) = entry else {
            return;
        };

        let now_empty = {
            let mut entry = entry.lock();
            entry.subscribers.remove(&session_id);
            entry.subscribers.is_empty()
        };

        if now_empty {
            // Re-check under the table lock; a join may have raced in.
            let mut matches = self.matches.write();
            if let Some(entry) = matches.get(match_id) {
                if entry.lock().subscribers.is_empty() {
                    matches.remove(match_id);
                }
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
