//! Cooperative cancellation.
//!
//! The flag lives in the store so any process can set it. The pipeline only
//! observes it at checkpoints; in-flight calls are never aborted.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::store::{ConversationStore, NewTurn, StoreError, Turn, TurnKind};

use super::driver::Stage;

/// Content of the synthetic notice turn.
pub const NOTICE_TEXT: &str = "Response generation stopped by user.";
/// Appended to partial output persisted after a user stop.
pub const STOPPED_MARKER: &str = "\n\n[Response stopped by user]";
/// Appended to partial output persisted after a mid-stream failure.
pub const INTERRUPTED_MARKER: &str = "\n\n[Response interrupted]";

/// Per-turn cancellation token passed through every stage.
pub struct CancellationGate<'a> {
    store: &'a dyn ConversationStore,
    turn_id: &'a str,
    /// Cancellation is permanent; once seen, skip the store.
    latched: AtomicBool,
}

impl<'a> CancellationGate<'a> {
    pub fn new(store: &'a dyn ConversationStore, turn_id: &'a str) -> Self {
        Self {
            store,
            turn_id,
            latched: AtomicBool::new(false),
        }
    }

    /// Re-read the persisted flag at a checkpoint.
    pub async fn is_cancelled(&self, at: Stage) -> Result<bool, StoreError> {
        if self.latched.load(Ordering::Acquire) {
            return Ok(true);
        }
        let cancelled = self.store.is_cancelled(self.turn_id).await?;
        if cancelled {
            self.latched.store(true, Ordering::Release);
            info!(turn_id = self.turn_id, stage = at.as_str(), "cancellation observed");
        } else {
            debug!(turn_id = self.turn_id, stage = at.as_str(), "checkpoint passed");
        }
        Ok(cancelled)
    }
}

/// Return the turn's cancellation notice, creating it if absent. Calling this
/// any number of times leaves exactly one notice.
pub async fn ensure_cancellation_notice(
    store: &dyn ConversationStore,
    turn: &Turn,
) -> Result<Turn, StoreError> {
    if let Some(existing) = store.find_cancellation_notice(&turn.id).await? {
        return Ok(existing);
    }
    let notice = NewTurn::assistant_reply(&turn.session_id, &turn.id, NOTICE_TEXT, TurnKind::Cancelled);
    match store.append_turn(notice).await {
        Ok(created) => Ok(created),
        // Lost the race to a concurrent writer; theirs is the one notice.
        Err(StoreError::Conflict(_)) => store
            .find_cancellation_notice(&turn.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("cancellation notice for {}", turn.id))),
        Err(err) => Err(err),
    }
}

/// Persist partial answer text with a trailing marker as a truncated turn.
pub async fn persist_partial(
    store: &dyn ConversationStore,
    turn: &Turn,
    partial: &str,
    marker: &str,
) -> Result<Turn, StoreError> {
    let content = format!("{partial}{marker}");
    store
        .append_turn(NewTurn::assistant_reply(
            &turn.session_id,
            &turn.id,
            content,
            TurnKind::Truncated,
        ))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteConversationStore;

    #[tokio::test]
    async fn notice_creation_is_idempotent() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let turn = store.append_turn(NewTurn::user("s", "q")).await.unwrap();
        store.mark_cancelled(&turn.id, "stop").await.unwrap();

        let first = ensure_cancellation_notice(&store, &turn).await.unwrap();
        let second = ensure_cancellation_notice(&store, &turn).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.content, NOTICE_TEXT);
        assert_eq!(first.kind, TurnKind::Cancelled);
        assert_eq!(first.reply_to.as_deref(), Some(turn.id.as_str()));

        let notices = store
            .turns_for_session("s")
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TurnKind::Cancelled)
            .count();
        assert_eq!(notices, 1);
    }

    #[tokio::test]
    async fn concurrent_notice_creation_leaves_one() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let turn = store.append_turn(NewTurn::user("s", "q")).await.unwrap();

        let (a, b) = tokio::join!(
            ensure_cancellation_notice(&store, &turn),
            ensure_cancellation_notice(&store, &turn)
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
    }

    #[tokio::test]
    async fn gate_latches_once_cancelled() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let turn = store.append_turn(NewTurn::user("s", "q")).await.unwrap();
        let gate = CancellationGate::new(&store, &turn.id);

        assert!(!gate.is_cancelled(Stage::Expanding).await.unwrap());
        store.mark_cancelled(&turn.id, "stop").await.unwrap();
        assert!(gate.is_cancelled(Stage::Searching).await.unwrap());
        assert!(gate.is_cancelled(Stage::Synthesizing).await.unwrap());
    }

    #[tokio::test]
    async fn partial_text_keeps_marker() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let turn = store.append_turn(NewTurn::user("s", "q")).await.unwrap();
        let saved = persist_partial(&store, &turn, "Half an ans", STOPPED_MARKER)
            .await
            .unwrap();
        assert_eq!(saved.content, "Half an ans\n\n[Response stopped by user]");
        assert_eq!(saved.kind, TurnKind::Truncated);
    }
}
