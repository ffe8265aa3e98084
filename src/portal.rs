//! Portal Coordinator: the in-memory `(team, channel) -> Portal` map, each
//! entry backed by a bounded channel and a single worker task that is the
//! only party permitted to mutate that portal's state. Serializes
//! Slack<->Matrix operations per portal while leaving different portals free
//! to run in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::{DatabaseManager, Portal, RoomType};
use crate::ids;
use crate::matrix::MatrixAppservice;
use crate::resolver::ChatInfo;

const PORTAL_QUEUE_BUFFER: usize = 64;

type PortalTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The per-portal handle: a worker-owned task queue plus the finer locks
/// §4.3 calls out by name.
pub struct PortalHandle {
    pub portal_id: String,
    sender: mpsc::Sender<PortalTask>,
    /// Covers the whole of a room's initial setup; taken before checking
    /// whether the Matrix room already exists.
    pub room_creation_lock: Arc<AsyncMutex<()>>,
    /// Acquired by the Matrix interface while encrypting an outgoing event.
    pub encryption_lock: Arc<AsyncMutex<()>>,
}

impl PortalHandle {
    fn spawn(portal_id: String) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::channel::<PortalTask>(PORTAL_QUEUE_BUFFER);

        let worker_id = portal_id.clone();
        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                task.await;
            }
            debug!("portal worker for {} exiting: channel closed", worker_id);
        });

        Arc::new(Self {
            portal_id,
            sender,
            room_creation_lock: Arc::new(AsyncMutex::new(())),
            encryption_lock: Arc::new(AsyncMutex::new(())),
        })
    }

    /// Enqueues a unit of portal-local work. Blocks the caller when the
    /// channel is full (bounded, by design — backpressure over drops).
    pub async fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender
            .send(Box::pin(task))
            .await
            .map_err(|_| anyhow!("portal worker for {} has shut down", self.portal_id))
    }
}

pub struct PortalCoordinator {
    db: Arc<DatabaseManager>,
    matrix: Arc<MatrixAppservice>,
    config: Arc<Config>,
    handles: SyncMutex<HashMap<String, Arc<PortalHandle>>>,
    by_room: SyncMutex<HashMap<String, String>>,
}

impl PortalCoordinator {
    pub fn new(db: Arc<DatabaseManager>, matrix: Arc<MatrixAppservice>, config: Arc<Config>) -> Self {
        Self {
            db,
            matrix,
            config,
            handles: SyncMutex::new(HashMap::new()),
            by_room: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn handle_for(&self, portal_id: &str) -> Arc<PortalHandle> {
        self.handles
            .lock()
            .entry(portal_id.to_string())
            .or_insert_with(|| PortalHandle::spawn(portal_id.to_string()))
            .clone()
    }

    pub fn portal_id_for_room(&self, matrix_room_id: &str) -> Option<String> {
        self.by_room.lock().get(matrix_room_id).cloned()
    }

    /// Drops the room's cache entry, e.g. after the bridge leaves an
    /// encrypted room it can't support. Does not touch the Portal row.
    pub fn forget_room(&self, matrix_room_id: &str) {
        self.by_room.lock().remove(matrix_room_id);
    }

    /// Loads or creates the Portal row, without touching Matrix. Used by
    /// the pipeline to decide `CreatePortal` handling before a room exists.
    pub async fn get_or_init_portal(
        &self,
        team_id: &str,
        channel_id: &str,
        room_type: RoomType,
        receiver: &str,
    ) -> Result<Portal> {
        let portal_id = ids::make_portal_id(team_id, channel_id);

        if let Some(existing) = self.db.portal_store().get_portal(&portal_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let portal = Portal {
            portal_id: portal_id.clone(),
            team_id: team_id.to_string(),
            channel_id: channel_id.to_string(),
            matrix_room_id: None,
            room_type,
            receiver: receiver.to_string(),
            name: None,
            topic: None,
            more_to_backfill: true,
            created_at: now,
            updated_at: now,
        };
        self.db.portal_store().upsert_portal(&portal).await?;
        Ok(portal)
    }

    /// Room creation procedure (§4.3 steps 1-6). No-ops if the portal
    /// already has a Matrix room. `owner_matrix_user_id` is invited once
    /// the room exists; ghost participants are synced by the caller
    /// (Resolver owns ghost identity, not the coordinator).
    pub async fn ensure_room(
        &self,
        portal: &Portal,
        chat_info: &ChatInfo,
        owner_matrix_user_id: &str,
    ) -> Result<Portal> {
        let handle = self.handle_for(&portal.portal_id);
        let _room_guard = handle.room_creation_lock.lock().await;

        // Re-check under the lock: a concurrent caller may have just created it.
        let mut portal = self
            .db
            .portal_store()
            .get_portal(&portal.portal_id)
            .await?
            .unwrap_or_else(|| portal.clone());

        if portal.matrix_room_id.is_some() {
            return Ok(portal);
        }

        let (name, topic) = self.derive_name_topic(portal.room_type, chat_info);

        let room_id = self
            .matrix
            .create_room(&portal.channel_id, name.as_deref().unwrap_or(&portal.channel_id), Some(&topic))
            .await
            .with_context(|| format!("failed to create room for portal {}", portal.portal_id))?;

        if self.config.bridge.encryption {
            if let Err(e) = self.matrix.set_room_encryption(&room_id).await {
                warn!("failed to enable encryption for room {}: {}", room_id, e);
            }
        }

        if let Err(e) = self.matrix.send_dummy_event(&room_id).await {
            warn!("failed to anchor portal_created event in {}: {}", room_id, e);
        }

        if let Err(e) = self
            .matrix
            .set_bridge_info(&room_id, &portal.team_id, &portal.channel_id)
            .await
        {
            warn!("failed to set bridge info on room {}: {}", room_id, e);
        }

        self.matrix
            .invite_user_to_room(&room_id, owner_matrix_user_id)
            .await
            .with_context(|| format!("failed to invite {} to {}", owner_matrix_user_id, room_id))?;

        portal.matrix_room_id = Some(room_id.clone());
        portal.name = name;
        portal.topic = Some(topic);
        portal.updated_at = Utc::now();
        self.db.portal_store().upsert_portal(&portal).await?;

        self.by_room.lock().insert(room_id, portal.portal_id.clone());

        Ok(portal)
    }

    /// DM portals take the other user's ghost name; GroupDMs use the
    /// already-joined, self-excluded ghost name list from the resolver;
    /// channel names/topics are templated from config.
    fn derive_name_topic(&self, room_type: RoomType, chat_info: &ChatInfo) -> (Option<String>, String) {
        match room_type {
            RoomType::Dm | RoomType::GroupDm => (chat_info.name.clone(), String::new()),
            RoomType::Channel => {
                let name = chat_info.name.clone().map(|n| {
                    crate::utils::formatting::apply_pattern_string(
                        &self.config.channel.name_pattern,
                        &[("name", &n)],
                    )
                });
                (name, chat_info.topic.clone())
            }
            RoomType::Space => (chat_info.name.clone(), String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex as AsyncStdMutex;
    use tokio::time::{Duration, sleep};

    use super::*;

    #[tokio::test]
    async fn portal_worker_processes_tasks_in_order() {
        let handle = PortalHandle::spawn("T1-C1".to_string());
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(AsyncStdMutex::new(Vec::new()));

        let c1 = counter.clone();
        let o1 = order.clone();
        handle
            .enqueue(async move {
                sleep(Duration::from_millis(30)).await;
                let v = c1.fetch_add(1, Ordering::SeqCst);
                o1.lock().await.push(v);
            })
            .await
            .unwrap();

        let c2 = counter.clone();
        let o2 = order.clone();
        handle
            .enqueue(async move {
                let v = c2.fetch_add(1, Ordering::SeqCst);
                o2.lock().await.push(v);
            })
            .await
            .unwrap();

        sleep(Duration::from_millis(100)).await;

        assert_eq!(*order.lock().await, vec![0, 1]);
    }
}
