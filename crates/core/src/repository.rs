//! Entity storage
//!
//! The study core reads and writes its entities through [`Repository`]. The
//! in-memory implementation keeps creation order, which resumption relies on.

use crate::errors::{Result, StudyError};
use crate::participant::Participant;
use crate::study_session::StudySession;
use crate::task_session::{ActionRecord, TaskSession};
use indexmap::IndexMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A storable entity with a string key
pub trait Entity: Clone {
    const KIND: &'static str;

    fn key(&self) -> String;
}

impl Entity for Participant {
    const KIND: &'static str = "Participant";

    fn key(&self) -> String {
        self.access_code.clone()
    }
}

impl Entity for StudySession {
    const KIND: &'static str = "StudySession";

    fn key(&self) -> String {
        self.session_id.clone()
    }
}

impl Entity for TaskSession {
    const KIND: &'static str = "TaskSession";

    fn key(&self) -> String {
        self.session_id.clone()
    }
}

impl Entity for ActionRecord {
    const KIND: &'static str = "ActionRecord";

    fn key(&self) -> String {
        format!("{}#{}", self.task_session_id, self.sequence)
    }
}

/// Generic repository over one entity type
pub trait Repository<E: Entity> {
    fn get(&self, key: &str) -> Result<E>;

    /// Insert a new entity; an existing key is an invalid state
    fn create(&self, entity: E) -> Result<()>;

    /// Replace an existing entity; a missing key is not found
    fn update(&self, entity: E) -> Result<()>;

    /// Entities matching `predicate`, in creation order
    fn query(&self, predicate: &dyn Fn(&E) -> bool) -> Result<Vec<E>>;
}

/// Mutex-guarded map keeping insertion order
#[derive(Debug)]
pub struct InMemoryRepository<E> {
    entries: Mutex<IndexMap<String, E>>,
}

impl<E> Default for InMemoryRepository<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
        }
    }
}

impl<E: Entity> InMemoryRepository<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, IndexMap<String, E>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl<E: Entity> Repository<E> for InMemoryRepository<E> {
    fn get(&self, key: &str) -> Result<E> {
        self.entries()
            .get(key)
            .cloned()
            .ok_or_else(|| StudyError::not_found(E::KIND, key))
    }

    fn create(&self, entity: E) -> Result<()> {
        let key = entity.key();
        let mut entries = self.entries();
        if entries.contains_key(&key) {
            return Err(StudyError::invalid_state(
                E::KIND,
                "existing",
                format!("create {}", key),
            ));
        }
        entries.insert(key, entity);
        Ok(())
    }

    fn update(&self, entity: E) -> Result<()> {
        let key = entity.key();
        match self.entries().get_mut(&key) {
            Some(slot) => {
                *slot = entity;
                Ok(())
            }
            None => Err(StudyError::not_found(E::KIND, key)),
        }
    }

    fn query(&self, predicate: &dyn Fn(&E) -> bool) -> Result<Vec<E>> {
        Ok(self
            .entries()
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect())
    }
}

/// One repository per entity type
pub trait Store {
    type Participants: Repository<Participant>;
    type StudySessions: Repository<StudySession>;
    type TaskSessions: Repository<TaskSession>;
    type Actions: Repository<ActionRecord>;

    fn participants(&self) -> &Self::Participants;
    fn study_sessions(&self) -> &Self::StudySessions;
    fn task_sessions(&self) -> &Self::TaskSessions;
    fn actions(&self) -> &Self::Actions;
}

/// [`Store`] backed by in-memory repositories
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub participants: InMemoryRepository<Participant>,
    pub study_sessions: InMemoryRepository<StudySession>,
    pub task_sessions: InMemoryRepository<TaskSession>,
    pub actions: InMemoryRepository<ActionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    type Participants = InMemoryRepository<Participant>;
    type StudySessions = InMemoryRepository<StudySession>;
    type TaskSessions = InMemoryRepository<TaskSession>;
    type Actions = InMemoryRepository<ActionRecord>;

    fn participants(&self) -> &Self::Participants {
        &self.participants
    }

    fn study_sessions(&self) -> &Self::StudySessions {
        &self.study_sessions
    }

    fn task_sessions(&self) -> &Self::TaskSessions {
        &self.task_sessions
    }

    fn actions(&self) -> &Self::Actions {
        &self.actions
    }
}
