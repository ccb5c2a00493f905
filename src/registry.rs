/// Session registry: one executor per session id, capped in size.
///
/// Lookups and inserts go through a single mutex, so two connections racing
/// to create the same session always end up sharing one executor.
use crate::classify::OutputClassifier;
use crate::executor::{ExecutorSettings, SessionExecutor, TerminalObserver};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum RegistryError {
    /// The registry is at capacity and the id is not already present.
    SessionLimit { max: usize },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::SessionLimit { max } => {
                write!(f, "session limit reached ({max})")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

pub struct SessionRegistry {
    max_sessions: usize,
    settings: ExecutorSettings,
    classifier: Arc<OutputClassifier>,
    observer: Arc<dyn TerminalObserver>,
    sessions: Mutex<HashMap<String, Arc<SessionExecutor>>>,
}

impl SessionRegistry {
    pub fn new(
        max_sessions: usize,
        settings: ExecutorSettings,
        classifier: Arc<OutputClassifier>,
        observer: Arc<dyn TerminalObserver>,
    ) -> Self {
        Self {
            max_sessions,
            settings,
            classifier,
            observer,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the executor for a session, creating it if absent.
    pub fn get_or_create(&self, session_id: &str) -> Result<Arc<SessionExecutor>, RegistryError> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(session_id) {
            return Ok(Arc::clone(existing));
        }
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::SessionLimit {
                max: self.max_sessions,
            });
        }
        let executor = Arc::new(SessionExecutor::new(
            session_id,
            self.settings.clone(),
            Arc::clone(&self.classifier),
            Arc::clone(&self.observer),
        ));
        sessions.insert(session_id.to_string(), Arc::clone(&executor));
        tracing::debug!(session_id, total = sessions.len(), "session created");
        Ok(executor)
    }

    /// Fetch an existing session without creating one.
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionExecutor>> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(Arc::clone)
    }

    /// Drop a session, cancelling any in-flight execution. Returns whether
    /// the session existed.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(session_id);
        match removed {
            Some(executor) => {
                executor.cancel();
                tracing::debug!(session_id, "session removed");
                true
            }
            None => false,
        }
    }

    /// Ids of sessions with an execution currently in flight.
    pub fn list_active(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        let mut active: Vec<String> = sessions
            .iter()
            .filter(|(_, executor)| executor.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();
        active
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Cancel every in-flight execution. Used on server shutdown; the
    /// supervisors finish teardown on their own tasks.
    pub fn shutdown(&self) {
        let executors: Vec<Arc<SessionExecutor>> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.values().map(Arc::clone).collect()
        };
        for executor in executors {
            executor.cancel();
        }
    }
}
