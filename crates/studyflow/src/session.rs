//! Authenticated user of the running application.

use std::sync::RwLock;

use crate::entity::UserId;

/// Holds the signed-in user, if any.
#[derive(Default)]
pub struct Session {
    user: RwLock<Option<UserId>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user: UserId) -> Self {
        Self {
            user: RwLock::new(Some(user)),
        }
    }

    pub fn sign_in(&self, user: UserId) {
        log::info!("Signed in as {}", user);
        match self.user.write() {
            Ok(mut guard) => *guard = Some(user),
            Err(poisoned) => *poisoned.into_inner() = Some(user),
        }
    }

    pub fn sign_out(&self) {
        match self.user.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn current_user(&self) -> Option<UserId> {
        match self.user.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_user().is_some()
    }
}
