use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

const TOKEN_TTL: Duration = Duration::from_secs(600);

/// A mutating statement parked until the caller confirms it.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub connection: String,
    pub query: String,
    created_at: Instant,
}

/// One-shot confirmation tokens for gated writes. A token is consumed on
/// first use and silently expires after ten minutes.
#[derive(Default)]
pub struct ConfirmationStore {
    pending: Mutex<HashMap<String, PendingWrite>>,
}

impl ConfirmationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, connection: String, query: String) -> String {
        let token = Uuid::new_v4().to_string();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|_, write| write.created_at.elapsed() < TOKEN_TTL);
        pending.insert(
            token.clone(),
            PendingWrite {
                connection,
                query,
                created_at: Instant::now(),
            },
        );
        token
    }

    /// Consume a token. Expired and unknown tokens are indistinguishable.
    pub fn take(&self, token: &str) -> Option<PendingWrite> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let write = pending.remove(token)?;
        if write.created_at.elapsed() >= TOKEN_TTL {
            return None;
        }
        Some(write)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_one_shot() {
        let store = ConfirmationStore::new();
        let token = store.park("prod".into(), "DELETE FROM users".into());

        let write = store.take(&token).expect("first use succeeds");
        assert_eq!(write.connection, "prod");
        assert_eq!(write.query, "DELETE FROM users");

        assert!(store.take(&token).is_none(), "second use fails");
        assert!(store.take("unknown").is_none());
    }
}
