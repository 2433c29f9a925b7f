//! Per-user session API. Every operation verifies the session belongs to
//! this user before touching its messages.

use crate::error::MaisonError;
use crate::store::{Message, Metadata, Role, Session};
use crate::{db_call, SharedStore};

#[derive(Clone)]
pub struct SessionService {
    store: SharedStore,
    user_id: String,
}

impl SessionService {
    pub fn new(store: SharedStore, user_id: String) -> Self {
        Self { store, user_id }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Resolve an existing owned session or create a new one.
    /// Returns the session and whether it was just created.
    pub async fn ensure_session(
        &self,
        session_id: Option<i64>,
    ) -> Result<(Session, bool), MaisonError> {
        let user = self.user_id.clone();
        match session_id {
            Some(id) => {
                let found =
                    db_call(&self.store, move |s| s.find_session(id, &user)).await??;
                found
                    .map(|s| (s, false))
                    .ok_or(MaisonError::SessionNotFound(id))
            }
            None => {
                let created = db_call(&self.store, move |s| s.insert_session(&user)).await??;
                Ok((created, true))
            }
        }
    }

    pub async fn save_message(
        &self,
        session_id: i64,
        role: Role,
        content: &str,
        metadata: Option<Metadata>,
    ) -> Result<Message, MaisonError> {
        let user = self.user_id.clone();
        let content = content.to_string();
        db_call(&self.store, move |s| {
            s.find_session(session_id, &user)?
                .ok_or(MaisonError::SessionNotFound(session_id))?;
            s.append_message(session_id, role, &content, metadata)
        })
        .await?
    }

    /// Recent messages, newest first. `same_session` restricts to the given
    /// session; otherwise all of this user's sessions are spanned.
    pub async fn list_recent(
        &self,
        session_id: i64,
        limit: usize,
        same_session: bool,
    ) -> Result<Vec<Message>, MaisonError> {
        let user = self.user_id.clone();
        db_call(&self.store, move |s| {
            s.find_session(session_id, &user)?
                .ok_or(MaisonError::SessionNotFound(session_id))?;
            if same_session {
                s.list_messages_by_session(session_id, limit)
            } else {
                s.list_messages_across_user_sessions(&user, limit)
            }
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::Arc;

    fn service(user: &str) -> (SessionService, SharedStore) {
        let store: SharedStore = Arc::new(Store::open(":memory:", 4).unwrap());
        (SessionService::new(store.clone(), user.into()), store)
    }

    #[tokio::test]
    async fn ensure_creates_when_absent() {
        let (svc, _) = service("alice");
        let (session, created) = svc.ensure_session(None).await.unwrap();
        assert!(created);
        assert_eq!(session.user_id, "alice");

        let (again, created) = svc.ensure_session(Some(session.id)).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, session.id);
    }

    #[tokio::test]
    async fn ensure_rejects_foreign_session() {
        let (alice, store) = service("alice");
        let (s, _) = alice.ensure_session(None).await.unwrap();

        let bob = SessionService::new(store, "bob".into());
        let err = bob.ensure_session(Some(s.id)).await.unwrap_err();
        assert!(matches!(err, MaisonError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn save_rejects_foreign_session() {
        let (alice, store) = service("alice");
        let (s, _) = alice.ensure_session(None).await.unwrap();

        let bob = SessionService::new(store, "bob".into());
        let err = bob.save_message(s.id, Role::User, "sneaky", None).await.unwrap_err();
        assert!(matches!(err, MaisonError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn list_recent_same_and_cross_session() {
        let (svc, _) = service("alice");
        let (s1, _) = svc.ensure_session(None).await.unwrap();
        let (s2, _) = svc.ensure_session(None).await.unwrap();
        svc.save_message(s1.id, Role::User, "in s1", None).await.unwrap();
        svc.save_message(s2.id, Role::User, "in s2", None).await.unwrap();

        let same = svc.list_recent(s1.id, 10, true).await.unwrap();
        assert_eq!(same.len(), 1);
        assert_eq!(same[0].content, "in s1");

        let all = svc.list_recent(s1.id, 10, false).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
