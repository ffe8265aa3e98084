//! The live-session registry: `login_id -> (Session, team_id)`. The only
//! place that knows which logins are currently connected, so the event
//! dispatcher and the backfill engine can both resolve a Web API handle
//! without reaching into `BridgeCore`'s state directly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;

use crate::backfill::SessionLookup;
use crate::session::{Session, SlackWebApi};

struct SessionEntry {
    session: Session,
    team_id: String,
}

pub struct SessionRegistry {
    entries: SyncMutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            entries: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, login_id: String, session: Session, team_id: String) {
        self.entries.lock().insert(login_id, SessionEntry { session, team_id });
    }

    pub fn remove(&self, login_id: &str) {
        self.entries.lock().remove(login_id);
    }

    pub fn team_id_of(&self, login_id: &str) -> Option<String> {
        self.entries.lock().get(login_id).map(|e| e.team_id.clone())
    }

    pub fn get_web_api(&self, login_id: &str) -> Option<Arc<dyn SlackWebApi>> {
        self.entries
            .lock()
            .get(login_id)
            .map(|e| Arc::new(e.session.clone()) as Arc<dyn SlackWebApi>)
    }

    /// Any connected login belonging to `team_id`, for outbound sends on
    /// shared-channel portals that have no single owning login.
    pub fn any_login_for_team(&self, team_id: &str) -> Option<String> {
        self.entries
            .lock()
            .iter()
            .find(|(_, e)| e.team_id == team_id)
            .map(|(login_id, _)| login_id.clone())
    }

    pub fn is_connected(&self, login_id: &str) -> bool {
        self.entries.lock().contains_key(login_id)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionLookup for SessionRegistry {
    async fn web_api_for(&self, login_id: &str) -> Option<Arc<dyn SlackWebApi>> {
        self.get_web_api(login_id)
    }
}
