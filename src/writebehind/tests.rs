//! Write-Behind Pipeline Tests
//!
//! Exercises batching and the two consumer loops against the in-memory
//! existence store. The HTTP callback path needs a listening endpoint and
//! is covered by integration tests with a running cluster.

use std::sync::Arc;
use std::time::Duration;

use super::pipeline;
use super::store::{ExistenceStore, InMemoryExistenceStore};
use crate::session::types::{SessionDeletion, SessionId};

#[tokio::test]
async fn existence_events_reach_the_store() {
    let store = Arc::new(InMemoryExistenceStore::new());
    let handle = pipeline::spawn(store.clone(), None);

    let ids: Vec<SessionId> = (0..3).map(|_| SessionId::new()).collect();
    for id in &ids {
        handle.record_existence(*id);
    }

    // The window is one second; poll rather than assume scheduling.
    for _ in 0..40 {
        if store.len() == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for id in &ids {
        assert!(store.exists(*id).await.unwrap(), "missing {}", id);
    }
}

#[tokio::test]
async fn deletions_remove_tracked_sessions() {
    let store = Arc::new(InMemoryExistenceStore::new());
    let id = SessionId::new();
    store.create_sessions(&[id]).await.unwrap();

    let handle = pipeline::spawn(store.clone(), None);
    handle.record_deletion(SessionDeletion {
        session_id: id,
        reason: "explicit".to_string(),
    });

    for _ in 0..40 {
        if !store.exists(id).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(!store.exists(id).await.unwrap());
}

#[tokio::test]
async fn deleting_unknown_sessions_is_harmless() {
    let store = InMemoryExistenceStore::new();

    store
        .delete_sessions(&[SessionDeletion {
            session_id: SessionId::new(),
            reason: "expired".to_string(),
        }])
        .await
        .unwrap();

    assert!(store.is_empty());
}

#[tokio::test]
async fn create_is_idempotent() {
    let store = InMemoryExistenceStore::new();
    let id = SessionId::new();

    store.create_sessions(&[id]).await.unwrap();
    store.create_sessions(&[id]).await.unwrap();

    assert_eq!(store.len(), 1);
    assert!(store.exists(id).await.unwrap());
}
