//! Session state for the signed-in teacher.
//!
//! Identity is proven by the external provider; this module only decides
//! whether that identity belongs to an active teacher. The state lives in an
//! [`AppContext`] owned by the caller.

use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, PgStore};
use crate::error::{AttendanceError, Result};
use crate::models::Teacher;
use crate::retry::with_retry;

#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Loading,
    Authenticated(Teacher),
    Unauthenticated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    /// Result of looking up the provider identity among active teachers.
    Resolved(Option<Teacher>),
    SignedOut,
}

impl AuthState {
    pub fn apply(self, event: AuthEvent) -> Result<AuthState> {
        match (self, event) {
            (AuthState::Loading, AuthEvent::Resolved(Some(teacher))) => {
                Ok(AuthState::Authenticated(teacher))
            }
            (AuthState::Loading, AuthEvent::Resolved(None)) => Ok(AuthState::Unauthenticated),
            (AuthState::Authenticated(_), AuthEvent::SignedOut)
            | (AuthState::Unauthenticated, AuthEvent::SignedOut) => Ok(AuthState::Unauthenticated),
            (state, event) => Err(AttendanceError::Validation(format!(
                "invalid session transition from {state:?} on {event:?}"
            ))),
        }
    }

    pub fn teacher(&self) -> Option<&Teacher> {
        match self {
            AuthState::Authenticated(teacher) => Some(teacher),
            _ => None,
        }
    }
}

pub struct AppContext {
    pub config: Config,
    pub store: PgStore,
    auth: AuthState,
}

impl AppContext {
    pub fn new(config: Config, store: PgStore) -> Self {
        Self {
            config,
            store,
            auth: AuthState::Loading,
        }
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    fn transition(&mut self, event: AuthEvent) -> Result<()> {
        self.auth = self.auth.clone().apply(event)?;
        Ok(())
    }

    /// Resolves the provider identity. An identity without an active
    /// teacher is signed out and denied.
    pub async fn sign_in(&mut self, email: &str) -> Result<&Teacher> {
        let pool = self.store.pool();
        let teacher = with_retry(
            &self.config.retry,
            "fetch teacher",
            AttendanceError::is_transient,
            move || db::find_active_teacher_by_email(pool, email),
        )
        .await?;
        self.resolve(teacher, email)
    }

    pub async fn dev_bypass_sign_in(&mut self) -> Result<&Teacher> {
        if !self.config.dev_bypass_allowed() {
            return Err(AttendanceError::Validation(
                "development login bypass is disabled".to_string(),
            ));
        }
        let teacher = db::first_active_teacher(self.store.pool()).await?;
        warn!("signing in through the development bypass");
        self.resolve(teacher, "dev-bypass")
    }

    fn resolve(&mut self, teacher: Option<Teacher>, identity: &str) -> Result<&Teacher> {
        let denied = teacher.is_none();
        self.transition(AuthEvent::Resolved(teacher))?;
        if denied {
            warn!(%identity, "no active teacher for identity, signing out");
            self.sign_out()?;
            return Err(AttendanceError::AccessDenied);
        }
        let teacher = self.require_teacher()?;
        info!(teacher = %teacher.email, "signed in");
        Ok(teacher)
    }

    pub fn sign_out(&mut self) -> Result<()> {
        self.transition(AuthEvent::SignedOut)
    }

    pub fn require_teacher(&self) -> Result<&Teacher> {
        self.auth.teacher().ok_or(AttendanceError::NotSignedIn)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn teacher() -> Teacher {
        Teacher {
            id: Uuid::new_v4(),
            name: "Ana Souza".to_string(),
            email: "ana.souza@igreja.org".to_string(),
            is_active: true,
        }
    }

    #[test]
    fn loading_resolves_to_authenticated() {
        let t = teacher();
        let state = AuthState::Loading
            .apply(AuthEvent::Resolved(Some(t.clone())))
            .unwrap();
        assert_eq!(state.teacher(), Some(&t));
    }

    #[test]
    fn loading_without_teacher_is_unauthenticated() {
        let state = AuthState::Loading.apply(AuthEvent::Resolved(None)).unwrap();
        assert_eq!(state, AuthState::Unauthenticated);
    }

    #[test]
    fn sign_out_always_lands_unauthenticated() {
        let state = AuthState::Authenticated(teacher())
            .apply(AuthEvent::SignedOut)
            .unwrap();
        assert_eq!(state, AuthState::Unauthenticated);
        let state = state.apply(AuthEvent::SignedOut).unwrap();
        assert_eq!(state, AuthState::Unauthenticated);
    }

    #[test]
    fn resolving_twice_is_rejected() {
        let state = AuthState::Authenticated(teacher());
        assert!(state.apply(AuthEvent::Resolved(None)).is_err());
        assert!(AuthState::Unauthenticated
            .apply(AuthEvent::Resolved(Some(teacher())))
            .is_err());
    }

    #[test]
    fn loading_cannot_sign_out() {
        assert!(AuthState::Loading.apply(AuthEvent::SignedOut).is_err());
    }
}
