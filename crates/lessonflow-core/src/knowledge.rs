// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Knowledge sessions: real-time assessments shared between sessions.
//!
//! A knowledge session is hosted by one course session, the only one that
//! runs the assessment engine. Team sessions can be joined by other course
//! sessions, which receive the host's assessments and are told when the
//! host's session ends.
//!
//! ```text
//!               ┌──────────── registry ────────────┐
//!   host 10 ───►│ team "Alpha" (roles lead, gunner)│
//!               │   joined: 11 (gunner), 12 (-)    │◄─── join / assign
//!               └──────────────────────────────────┘
//!                    │ forward_assessment / end_session
//!                    ▼
//!           observers of 11 and 12
//! ```
//!
//! The registry is one per process and is handed to every session.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::listeners::{ListenerId, ListenerSet, StateListener};

/// Whether the host plays live or replays a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Live session.
    Active,
    /// Replay of a recorded session; the host needs no role.
    Playback,
}

/// Individual or team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeSessionKind {
    /// A single learner.
    Individual,
    /// Several learners in team roles.
    Team,
}

/// A course session taking part in a knowledge session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMember {
    /// Course session id.
    pub session_id: i64,
    /// Learner name.
    pub username: String,
    /// Assigned team role.
    pub role: Option<String>,
}

impl SessionMember {
    /// A member without a role.
    pub fn new(session_id: i64, username: impl Into<String>) -> Self {
        Self {
            session_id,
            username: username.into(),
            role: None,
        }
    }
}

/// Snapshot of a knowledge session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeSession {
    /// Display name.
    pub name: String,
    /// Individual or team.
    pub kind: KnowledgeSessionKind,
    /// Live or playback.
    pub session_type: SessionType,
    /// Course the session belongs to.
    pub course_id: String,
    /// Experiment, if any.
    pub experiment_id: Option<String>,
    /// The hosting course session.
    pub host: SessionMember,
    /// Joined course sessions by session id.
    pub joined: BTreeMap<i64, SessionMember>,
    /// Roles of the team.
    pub roles: Vec<String>,
    /// Maximum number of joined members.
    pub max_members: usize,
    /// Whether the host started the assessment.
    pub running: bool,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

impl KnowledgeSession {
    /// Whether no more members can join.
    pub fn is_full(&self) -> bool {
        self.kind == KnowledgeSessionKind::Team && self.joined.len() >= self.max_members
    }

    /// Member by course session id, host included.
    pub fn member(&self, session_id: i64) -> Option<&SessionMember> {
        if self.host.session_id == session_id {
            Some(&self.host)
        } else {
            self.joined.get(&session_id)
        }
    }

    fn member_mut(&mut self, session_id: i64) -> Option<&mut SessionMember> {
        if self.host.session_id == session_id {
            Some(&mut self.host)
        } else {
            self.joined.get_mut(&session_id)
        }
    }

    fn assignments(&self) -> HashMap<i64, String> {
        std::iter::once(&self.host)
            .chain(self.joined.values())
            .filter_map(|m| m.role.clone().map(|role| (m.session_id, role)))
            .collect()
    }
}

/// Which sessions [`KnowledgeSessionRegistry::knowledge_sessions`] returns.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeSessionFilter {
    /// Include team sessions that are full.
    pub full_team_sessions: bool,
    /// Include individual sessions.
    pub individual_sessions: bool,
    /// Include sessions already running.
    pub running_sessions: bool,
    /// Only these courses; empty means any.
    pub course_ids: Vec<String>,
}

impl Default for KnowledgeSessionFilter {
    fn default() -> Self {
        Self {
            full_team_sessions: true,
            individual_sessions: true,
            running_sessions: true,
            course_ids: Vec::new(),
        }
    }
}

/// Result of hosting a team session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleAssignment {
    /// The previous team's assignments are applied again.
    Reused,
    /// Roles must be assigned before the session can start.
    LobbyRequired,
}

/// Change broadcast to registry listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A knowledge session was created.
    Created {
        /// Host session id.
        host_session_id: i64,
    },
    /// Membership, roles, name or running state changed.
    Updated {
        /// Host session id.
        host_session_id: i64,
    },
    /// A knowledge session ended.
    Ended {
        /// Host session id.
        host_session_id: i64,
    },
}

/// Listener for registry changes.
pub type KnowledgeSessionListener = dyn StateListener<RegistryEvent>;

/// Receives what the host of a joined knowledge session produces.
pub trait KnowledgeSessionObserver: Send + Sync {
    /// An assessment from the host's engine.
    fn assessment(&self, host_session_id: i64, payload: &Value);

    /// The host's knowledge session ended.
    fn host_session_ended(&self, host_session_id: i64);
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The session already hosts a knowledge session.
    #[error("session {0} is already associated with another knowledge session")]
    AlreadyHosting(i64),

    /// No team session hosted by this session.
    #[error("session {0} is not the host of a team knowledge session")]
    HostNotFound(i64),

    /// The host already started.
    #[error("unable to join '{0}' because it has already been started by the host")]
    AlreadyRunning(String),

    /// The joiner has no course.
    #[error("unable to join because the joiner's course is invalid")]
    InvalidCourse,

    /// The joiner runs a different course.
    #[error("unable to join because the host course '{host}' does not match '{joiner}'")]
    CourseMismatch {
        /// Host course.
        host: String,
        /// Joiner course.
        joiner: String,
    },

    /// The session has not joined.
    #[error("session {session_id} is not a member of the session hosted by {host_session_id}")]
    NotAMember {
        /// Session that is not a member.
        session_id: i64,
        /// Host session id.
        host_session_id: i64,
    },

    /// The role is the host's.
    #[error("unable to select role '{0}' because it is already assigned to the host")]
    RoleHeldByHost(String),

    /// The role belongs to another joiner.
    #[error("unable to select role '{role}' because it is already assigned to '{username}'")]
    RoleHeldBy {
        /// Contested role.
        role: String,
        /// Holder.
        username: String,
    },

    /// The session cannot start yet.
    #[error("{0}")]
    NotReady(String),
}

#[derive(Default)]
struct RegistryInner {
    hosted: BTreeMap<i64, KnowledgeSession>,
    member_to_host: HashMap<i64, i64>,
    observers: HashMap<i64, Arc<dyn KnowledgeSessionObserver>>,
    /// Assignments of the last team each host ran, reused by its next team.
    prior_assignments: HashMap<i64, HashMap<i64, String>>,
    /// Assignments waiting for their joiner to come back.
    pending_assignments: HashMap<i64, HashMap<i64, String>>,
}

/// Process-wide knowledge session registry.
#[derive(Default)]
pub struct KnowledgeSessionRegistry {
    inner: Mutex<RegistryInner>,
    listeners: ListenerSet<RegistryEvent>,
    changed: Notify,
}

impl std::fmt::Debug for KnowledgeSessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("KnowledgeSessionRegistry")
            .field("hosted", &inner.hosted.len())
            .field("members", &inner.member_to_host.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl KnowledgeSessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn broadcast(&self, event: RegistryEvent) {
        self.changed.notify_waiters();
        self.listeners.notify(&event);
    }

    /// Register a listener for registry changes.
    pub fn add_listener(&self, listener: Arc<KnowledgeSessionListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    /// Remove a listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Host an individual knowledge session.
    pub fn add_individual_session(
        &self,
        host: SessionMember,
        name: impl Into<String>,
        course_id: impl Into<String>,
        experiment_id: Option<String>,
    ) -> Result<KnowledgeSession, RegistryError> {
        let host_session_id = host.session_id;
        let session = KnowledgeSession {
            name: name.into(),
            kind: KnowledgeSessionKind::Individual,
            session_type: SessionType::Active,
            course_id: course_id.into(),
            experiment_id,
            roles: host.role.iter().cloned().collect(),
            host,
            joined: BTreeMap::new(),
            max_members: 0,
            running: false,
            created_at: Utc::now(),
        };

        {
            let mut inner = self.lock();
            if inner.hosted.contains_key(&host_session_id) {
                return Err(RegistryError::AlreadyHosting(host_session_id));
            }
            inner.hosted.insert(host_session_id, session.clone());
        }

        info!(host_session_id, "Hosting individual knowledge session");
        self.broadcast(RegistryEvent::Created { host_session_id });
        Ok(session)
    }

    /// Host a team knowledge session.
    ///
    /// If every role the host's previous team used still exists, those
    /// assignments are applied again (joiners get theirs when they rejoin).
    /// Otherwise roles must be assigned in the lobby before starting.
    #[allow(clippy::too_many_arguments)]
    pub fn host_team_session(
        &self,
        host: SessionMember,
        name: impl Into<String>,
        course_id: impl Into<String>,
        experiment_id: Option<String>,
        roles: Vec<String>,
        max_members: usize,
        session_type: SessionType,
    ) -> Result<RoleAssignment, RegistryError> {
        let host_session_id = host.session_id;
        let name = name.into();

        let assignment = {
            let mut inner = self.lock();
            if inner.hosted.contains_key(&host_session_id) {
                return Err(RegistryError::AlreadyHosting(host_session_id));
            }

            let mut host = host;
            let reusable = inner
                .prior_assignments
                .get(&host_session_id)
                .filter(|prior| !prior.is_empty() && prior.values().all(|r| roles.contains(r)))
                .cloned();

            let assignment = match reusable {
                Some(mut prior) => {
                    host.role = prior.remove(&host_session_id);
                    inner.pending_assignments.insert(host_session_id, prior);
                    RoleAssignment::Reused
                }
                None => {
                    inner.pending_assignments.remove(&host_session_id);
                    RoleAssignment::LobbyRequired
                }
            };

            inner.hosted.insert(
                host_session_id,
                KnowledgeSession {
                    name: name.clone(),
                    kind: KnowledgeSessionKind::Team,
                    session_type,
                    course_id: course_id.into(),
                    experiment_id,
                    host,
                    joined: BTreeMap::new(),
                    roles,
                    max_members,
                    running: false,
                    created_at: Utc::now(),
                },
            );
            assignment
        };

        info!(host_session_id, session = %name, ?assignment, "Hosting team knowledge session");
        self.broadcast(RegistryEvent::Created { host_session_id });
        Ok(assignment)
    }

    /// Join a team session.
    pub fn join_team_session(
        &self,
        host_session_id: i64,
        joiner: SessionMember,
        course_id: &str,
        observer: Arc<dyn KnowledgeSessionObserver>,
    ) -> Result<(), RegistryError> {
        {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let session = inner
                .hosted
                .get_mut(&host_session_id)
                .filter(|s| s.kind == KnowledgeSessionKind::Team)
                .ok_or(RegistryError::HostNotFound(host_session_id))?;

            if session.running {
                return Err(RegistryError::AlreadyRunning(session.name.clone()));
            }
            if course_id.is_empty() {
                return Err(RegistryError::InvalidCourse);
            }
            if course_id != session.course_id {
                return Err(RegistryError::CourseMismatch {
                    host: session.course_id.clone(),
                    joiner: course_id.to_string(),
                });
            }

            let mut joiner = joiner;
            if let Some(role) = inner
                .pending_assignments
                .get_mut(&host_session_id)
                .and_then(|pending| pending.remove(&joiner.session_id))
            {
                debug!(session_id = joiner.session_id, role = %role, "Restoring previous role");
                joiner.role = Some(role);
            }

            let joiner_id = joiner.session_id;
            session.joined.insert(joiner_id, joiner);
            inner.member_to_host.insert(joiner_id, host_session_id);
            inner.observers.insert(joiner_id, observer);
        }

        self.broadcast(RegistryEvent::Updated { host_session_id });
        Ok(())
    }

    /// Leave a team session. Returns whether the session was a member.
    pub fn leave_team_session(&self, host_session_id: i64, session_id: i64) -> bool {
        let left = {
            let mut inner = self.lock();
            let removed = inner
                .hosted
                .get_mut(&host_session_id)
                .and_then(|s| s.joined.remove(&session_id))
                .is_some();
            if removed {
                inner.member_to_host.remove(&session_id);
                inner.observers.remove(&session_id);
            }
            removed
        };

        if left {
            self.broadcast(RegistryEvent::Updated { host_session_id });
        }
        left
    }

    /// Give a member (host or joiner) a team role.
    ///
    /// A role already held by that member is released first.
    pub fn assign_team_member(
        &self,
        host_session_id: i64,
        session_id: i64,
        role: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let role = role.into();
        {
            let mut inner = self.lock();
            let session = inner
                .hosted
                .get_mut(&host_session_id)
                .filter(|s| s.kind == KnowledgeSessionKind::Team)
                .ok_or(RegistryError::HostNotFound(host_session_id))?;

            if session.member(session_id).is_none() {
                return Err(RegistryError::NotAMember {
                    session_id,
                    host_session_id,
                });
            }
            if session_id != host_session_id && session.host.role.as_deref() == Some(role.as_str()) {
                return Err(RegistryError::RoleHeldByHost(role));
            }
            if let Some(holder) = session
                .joined
                .values()
                .find(|m| m.session_id != session_id && m.role.as_deref() == Some(role.as_str()))
            {
                return Err(RegistryError::RoleHeldBy {
                    role,
                    username: holder.username.clone(),
                });
            }

            if let Some(member) = session.member_mut(session_id) {
                if let Some(previous) = member.role.replace(role.clone()) {
                    debug!(session_id, previous = %previous, "Released previous role");
                }
            }
        }

        debug!(host_session_id, session_id, role = %role, "Assigned team role");
        self.broadcast(RegistryEvent::Updated { host_session_id });
        Ok(())
    }

    /// Remove a member's role. Non-members have nothing to release.
    pub fn unassign_team_member(
        &self,
        host_session_id: i64,
        session_id: i64,
    ) -> Result<(), RegistryError> {
        let changed = {
            let mut inner = self.lock();
            let session = inner
                .hosted
                .get_mut(&host_session_id)
                .filter(|s| s.kind == KnowledgeSessionKind::Team)
                .ok_or(RegistryError::HostNotFound(host_session_id))?;
            session
                .member_mut(session_id)
                .and_then(|m| m.role.take())
                .is_some()
        };

        if changed {
            self.broadcast(RegistryEvent::Updated { host_session_id });
        }
        Ok(())
    }

    /// Rename a team session.
    pub fn change_session_name(&self, host_session_id: i64, name: impl Into<String>) -> bool {
        let renamed = {
            let mut inner = self.lock();
            match inner
                .hosted
                .get_mut(&host_session_id)
                .filter(|s| s.kind == KnowledgeSessionKind::Team)
            {
                Some(session) => {
                    session.name = name.into();
                    true
                }
                None => false,
            }
        };

        if renamed {
            self.broadcast(RegistryEvent::Updated { host_session_id });
        }
        renamed
    }

    /// Snapshot of the sessions matching `filter`, by host session id.
    pub fn knowledge_sessions(&self, filter: &KnowledgeSessionFilter) -> Vec<KnowledgeSession> {
        let inner = self.lock();
        inner
            .hosted
            .values()
            .filter(|s| match s.kind {
                KnowledgeSessionKind::Team => filter.full_team_sessions || !s.is_full(),
                KnowledgeSessionKind::Individual => filter.individual_sessions,
            })
            .filter(|s| filter.running_sessions || !s.running)
            .filter(|s| filter.course_ids.is_empty() || filter.course_ids.contains(&s.course_id))
            .cloned()
            .collect()
    }

    /// The session hosted by `host_session_id`.
    pub fn get(&self, host_session_id: i64) -> Option<KnowledgeSession> {
        self.lock().hosted.get(&host_session_id).cloned()
    }

    /// Whether `session_id` hosts a team session.
    pub fn is_host_of(&self, session_id: i64) -> bool {
        self.lock()
            .hosted
            .get(&session_id)
            .is_some_and(|s| s.kind == KnowledgeSessionKind::Team)
    }

    /// Host of the team session `session_id` joined.
    pub fn is_member_of(&self, session_id: i64) -> Option<i64> {
        self.lock().member_to_host.get(&session_id).copied()
    }

    /// Role of `session_id`, as host or joiner.
    pub fn team_member_for(&self, session_id: i64) -> Option<String> {
        let inner = self.lock();
        let host_session_id = inner
            .member_to_host
            .get(&session_id)
            .copied()
            .unwrap_or(session_id);
        inner
            .hosted
            .get(&host_session_id)
            .and_then(|s| s.member(session_id))
            .and_then(|m| m.role.clone())
    }

    /// Check that a team session can start: the host has a role (unless
    /// replaying) and every joiner has one.
    pub fn validate_for_start(&self, host_session_id: i64) -> Result<(), RegistryError> {
        let inner = self.lock();
        let Some(session) = inner
            .hosted
            .get(&host_session_id)
            .filter(|s| s.kind == KnowledgeSessionKind::Team)
        else {
            return Err(RegistryError::NotReady(format!(
                "Failed to find a registered knowledge session with the session id {} among {} currently registered knowledge session(s).",
                host_session_id,
                inner.hosted.len()
            )));
        };

        if session.session_type != SessionType::Playback && session.host.role.is_none() {
            return Err(RegistryError::NotReady(format!(
                "The session's host user '{}' has not been assigned to a team member position.",
                session.host.username
            )));
        }
        if let Some(member) = session.joined.values().find(|m| m.role.is_none()) {
            return Err(RegistryError::NotReady(format!(
                "The joined member '{}' has not been assigned to a team member position.",
                member.username
            )));
        }
        Ok(())
    }

    /// Members whose reused roles are held for them until they rejoin.
    pub fn awaiting_rejoin(&self, host_session_id: i64) -> usize {
        self.lock()
            .pending_assignments
            .get(&host_session_id)
            .map_or(0, |pending| pending.len())
    }

    /// Wait until [`validate_for_start`](Self::validate_for_start) passes
    /// and every member with a reused role has rejoined.
    ///
    /// Returns `false` if `cancel` fires or the session disappears first.
    pub async fn wait_until_ready(&self, host_session_id: i64, cancel: &CancellationToken) -> bool {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            // Register interest before checking, so no change is missed.
            changed.as_mut().enable();

            match self.validate_for_start(host_session_id) {
                Ok(()) => {
                    let missing = self.awaiting_rejoin(host_session_id);
                    if missing == 0 {
                        return true;
                    }
                    debug!(host_session_id, missing, "Waiting for team members to rejoin");
                }
                Err(_) if self.get(host_session_id).is_none() => return false,
                Err(reason) => debug!(host_session_id, %reason, "Waiting for team roles"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut changed => {}
            }
        }
    }

    /// Wait until `host_session_id` hosts a team session that can be joined.
    ///
    /// Returns `false` if `cancel` fires first.
    pub async fn wait_for_team_session(&self, host_session_id: i64, cancel: &CancellationToken) -> bool {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let joinable = self
                .lock()
                .hosted
                .get(&host_session_id)
                .is_some_and(|s| s.kind == KnowledgeSessionKind::Team && !s.running);
            if joinable {
                return true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut changed => {}
            }
        }
    }

    /// Mark a session as running. Team sessions must pass validation.
    pub fn start_session(&self, host_session_id: i64) -> Result<(), RegistryError> {
        if self.is_host_of(host_session_id) {
            self.validate_for_start(host_session_id)?;
        }
        {
            let mut inner = self.lock();
            let session = inner
                .hosted
                .get_mut(&host_session_id)
                .ok_or(RegistryError::HostNotFound(host_session_id))?;
            session.running = true;
        }
        self.broadcast(RegistryEvent::Updated { host_session_id });
        Ok(())
    }

    /// Forward an assessment from the host to every joiner. Returns the
    /// number of joiners reached.
    pub fn forward_assessment(&self, host_session_id: i64, payload: &Value) -> usize {
        let observers = self.joiner_observers(host_session_id);
        for observer in &observers {
            observer.assessment(host_session_id, payload);
        }
        observers.len()
    }

    fn joiner_observers(&self, host_session_id: i64) -> Vec<Arc<dyn KnowledgeSessionObserver>> {
        let inner = self.lock();
        inner
            .hosted
            .get(&host_session_id)
            .map(|s| {
                s.joined
                    .keys()
                    .filter_map(|id| inner.observers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// End the session hosted by `host_session_id`.
    ///
    /// Every joiner is told before this returns, so neither side advances
    /// past the lesson before the other knows it ended. Returns the number
    /// of joiners notified.
    pub fn end_session(&self, host_session_id: i64) -> usize {
        let observers = {
            let mut inner = self.lock();
            let Some(session) = inner.hosted.remove(&host_session_id) else {
                return 0;
            };

            if session.kind == KnowledgeSessionKind::Team {
                let assignments = session.assignments();
                if !assignments.is_empty() {
                    inner.prior_assignments.insert(host_session_id, assignments);
                }
            }
            inner.pending_assignments.remove(&host_session_id);

            let mut observers = Vec::with_capacity(session.joined.len());
            for joiner_id in session.joined.keys() {
                inner.member_to_host.remove(joiner_id);
                if let Some(observer) = inner.observers.remove(joiner_id) {
                    observers.push(observer);
                }
            }
            observers
        };

        for observer in &observers {
            observer.host_session_ended(host_session_id);
        }

        info!(host_session_id, joiners = observers.len(), "Knowledge session ended");
        self.broadcast(RegistryEvent::Ended { host_session_id });
        observers.len()
    }

    /// Remove every trace of a course session: leave any team it joined and
    /// end any session it hosts.
    pub fn cleanup_session(&self, session_id: i64) {
        if let Some(host_session_id) = self.is_member_of(session_id) {
            if !self.leave_team_session(host_session_id, session_id) {
                warn!(session_id, host_session_id, "Stale team membership");
            }
        }
        self.end_session(session_id);
    }
}
