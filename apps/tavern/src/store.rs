use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Operators count as active for this long after their last heartbeat.
const ACTIVE_USER_WINDOW_SECS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: i64,
    pub beacon_id: i64,
    pub quest_creator_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRecord {
    pub id: i64,
    pub task_id: i64,
    pub beacon_id: i64,
    pub owner_id: Option<i64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub active_users: Vec<i64>,
}

impl PortalRecord {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(i64),
    #[error("portal {0} not found")]
    PortalNotFound(i64),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Entity store the Portal lifecycle reads and writes. It is the single
/// authority on whether a Portal is open.
#[async_trait]
pub trait PortalStore: Send + Sync {
    async fn load_task(&self, task_id: i64) -> Result<TaskRecord, StoreError>;
    async fn create_portal(&self, task: &TaskRecord) -> Result<PortalRecord, StoreError>;
    async fn load_portal(&self, portal_id: i64) -> Result<PortalRecord, StoreError>;
    async fn close_portal(
        &self,
        portal_id: i64,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Heartbeat from an operator frontend watching the Portal.
    async fn touch_active_user(
        &self,
        portal_id: i64,
        user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

struct PortalEntry {
    record: PortalRecord,
    heartbeats: HashMap<i64, DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryPortalStore {
    tasks: tokio::sync::Mutex<HashMap<i64, TaskRecord>>,
    portals: tokio::sync::Mutex<HashMap<i64, PortalEntry>>,
    next_portal_id: AtomicI64,
    accept_unknown_tasks: bool,
}

impl InMemoryPortalStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store that synthesizes a task record for any unknown id, for running
    /// the server without an entity database behind it.
    pub fn accepting_unknown_tasks() -> Arc<Self> {
        Arc::new(Self {
            accept_unknown_tasks: true,
            ..Self::default()
        })
    }

    pub async fn insert_task(&self, task: TaskRecord) {
        self.tasks.lock().await.insert(task.id, task);
    }

    pub async fn portals(&self) -> Vec<PortalRecord> {
        let portals = self.portals.lock().await;
        let mut records: Vec<PortalRecord> =
            portals.values().map(|entry| entry.record.clone()).collect();
        records.sort_by_key(|record| record.id);
        records
    }
}

#[async_trait]
impl PortalStore for InMemoryPortalStore {
    async fn load_task(&self, task_id: i64) -> Result<TaskRecord, StoreError> {
        if let Some(task) = self.tasks.lock().await.get(&task_id) {
            return Ok(task.clone());
        }
        if self.accept_unknown_tasks {
            debug!(task_id, "synthesizing task record");
            return Ok(TaskRecord {
                id: task_id,
                beacon_id: 0,
                quest_creator_id: None,
            });
        }
        Err(StoreError::TaskNotFound(task_id))
    }

    async fn create_portal(&self, task: &TaskRecord) -> Result<PortalRecord, StoreError> {
        let id = self.next_portal_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = PortalRecord {
            id,
            task_id: task.id,
            beacon_id: task.beacon_id,
            owner_id: task.quest_creator_id,
            closed_at: None,
            active_users: Vec::new(),
        };
        self.portals.lock().await.insert(
            id,
            PortalEntry {
                record: record.clone(),
                heartbeats: HashMap::new(),
            },
        );
        Ok(record)
    }

    async fn load_portal(&self, portal_id: i64) -> Result<PortalRecord, StoreError> {
        let portals = self.portals.lock().await;
        let entry = portals
            .get(&portal_id)
            .ok_or(StoreError::PortalNotFound(portal_id))?;
        let cutoff = Utc::now() - Duration::seconds(ACTIVE_USER_WINDOW_SECS);
        let mut record = entry.record.clone();
        record.active_users = entry
            .heartbeats
            .iter()
            .filter(|(_, seen)| **seen >= cutoff)
            .map(|(user, _)| *user)
            .collect();
        record.active_users.sort_unstable();
        Ok(record)
    }

    async fn close_portal(
        &self,
        portal_id: i64,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut portals = self.portals.lock().await;
        let entry = portals
            .get_mut(&portal_id)
            .ok_or(StoreError::PortalNotFound(portal_id))?;
        entry.record.closed_at.get_or_insert(closed_at);
        Ok(())
    }

    async fn touch_active_user(
        &self,
        portal_id: i64,
        user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut portals = self.portals.lock().await;
        let entry = portals
            .get_mut(&portal_id)
            .ok_or(StoreError::PortalNotFound(portal_id))?;
        entry.heartbeats.insert(user_id, at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn portal_lifecycle_round_trip() {
        let store = InMemoryPortalStore::new();
        store
            .insert_task(TaskRecord {
                id: 11,
                beacon_id: 4,
                quest_creator_id: Some(2),
            })
            .await;

        let task = store.load_task(11).await.unwrap();
        let portal = store.create_portal(&task).await.unwrap();
        assert_eq!(portal.beacon_id, 4);
        assert_eq!(portal.owner_id, Some(2));
        assert!(!store.load_portal(portal.id).await.unwrap().is_closed());

        let closed_at = Utc::now();
        store.close_portal(portal.id, closed_at).await.unwrap();
        // Closing again keeps the first timestamp.
        store
            .close_portal(portal.id, closed_at + Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(
            store.load_portal(portal.id).await.unwrap().closed_at,
            Some(closed_at)
        );
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = InMemoryPortalStore::new();
        assert!(matches!(
            store.load_task(99).await,
            Err(StoreError::TaskNotFound(99))
        ));
        assert!(matches!(
            store.load_portal(5).await,
            Err(StoreError::PortalNotFound(5))
        ));

        let lenient = InMemoryPortalStore::accepting_unknown_tasks();
        assert_eq!(lenient.load_task(99).await.unwrap().id, 99);
    }

    #[tokio::test]
    async fn active_users_expire() {
        let store = InMemoryPortalStore::new();
        let task = TaskRecord {
            id: 1,
            beacon_id: 1,
            quest_creator_id: None,
        };
        let portal = store.create_portal(&task).await.unwrap();
        let now = Utc::now();
        store.touch_active_user(portal.id, 7, now).await.unwrap();
        store
            .touch_active_user(portal.id, 8, now - Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(store.load_portal(portal.id).await.unwrap().active_users, vec![7]);
    }
}
