//! Process-wide table of shell sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::state::{resolve_working_dir, SessionId, SessionSnapshot, ShellSession};
use super::{lock, SessionError};
use crate::config::ShellSettings;
use crate::event_bus::EventBus;
use crate::paths::validate_path_component;

/// Owns every session created through the tools.
///
/// Sessions are never dropped implicitly: a stopped or exited session stays
/// in the table so its status and log remain queryable.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<ShellSession>>>,
    settings: ShellSettings,
    events: Arc<EventBus>,
}

impl SessionRegistry {
    pub fn new(settings: ShellSettings, events: Arc<EventBus>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &ShellSettings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Return the session for `session_id`, creating it if needed.
    ///
    /// An existing session is returned as is, dead or alive. Without an id a
    /// fresh one is generated.
    pub fn ensure(
        &self,
        session_id: Option<&str>,
        working_dir: Option<&str>,
    ) -> Result<Arc<ShellSession>, SessionError> {
        let id = parse_id(session_id)?;
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get(&id) {
            return Ok(Arc::clone(session));
        }

        let session = self.create(id.clone(), working_dir)?;
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    /// Like [`SessionRegistry::ensure`], but a session whose process has
    /// ended is respawned in place.
    pub fn start(
        &self,
        session_id: Option<&str>,
        working_dir: Option<&str>,
    ) -> Result<Arc<ShellSession>, SessionError> {
        let id = parse_id(session_id)?;
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get(&id) {
            if !session.is_alive() {
                let dir = match working_dir.filter(|d| !d.trim().is_empty()) {
                    Some(dir) => Some(resolve_working_dir(Some(dir))?),
                    None => None,
                };
                log::info!("Respawning shell session {}", id);
                session.respawn(dir, &self.settings)?;
            }
            return Ok(Arc::clone(session));
        }

        let session = self.create(id.clone(), working_dir)?;
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    fn create(
        &self,
        id: SessionId,
        working_dir: Option<&str>,
    ) -> Result<Arc<ShellSession>, SessionError> {
        let dir = resolve_working_dir(working_dir)?;
        ShellSession::spawn(id, dir, &self.settings, Arc::clone(&self.events))
    }

    pub fn lookup(&self, session_id: &str) -> Option<Arc<ShellSession>> {
        lock(&self.sessions)
            .get(&SessionId(session_id.to_string()))
            .cloned()
    }

    /// All sessions, ordered by id.
    pub fn list(&self) -> Vec<Arc<ShellSession>> {
        let mut sessions: Vec<_> = lock(&self.sessions).values().cloned().collect();
        sessions.sort_by(|a, b| a.id().as_str().cmp(b.id().as_str()));
        sessions
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.list().iter().map(|s| s.snapshot()).collect()
    }

    /// Stop every live session.
    pub fn stop_all(&self) {
        for session in self.list() {
            if session.is_alive() {
                session.stop(self.settings.stop_grace);
            }
        }
    }
}

fn parse_id(session_id: Option<&str>) -> Result<SessionId, SessionError> {
    match session_id {
        Some(id) => {
            validate_path_component(id).map_err(SessionError::InvalidId)?;
            Ok(SessionId(id.to_string()))
        }
        None => Ok(SessionId::new()),
    }
}
