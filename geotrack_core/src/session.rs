//! Explicit session state.

use crate::model::{User, UserId};
use std::time::Duration;

/// The authenticated user for the lifetime of one dashboard session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    user: User,

    /// Context time at session start
    started_at: Duration,
}

impl Session {
    pub fn new(user: User, started_at: Duration) -> Self {
        Self { user, started_at }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn user_id(&self) -> UserId {
        self.user.user_id
    }

    pub fn started_at(&self) -> Duration {
        self.started_at
    }

    /// Replaces the user record after a reload.
    ///
    /// The identity never changes within a session.
    pub fn set_user(&mut self, user: User) -> bool {
        if user.user_id != self.user.user_id {
            return false;
        }
        self.user = user;
        true
    }
}
