//! Who is editing.
//!
//! The identity is resolved once when the application starts (or after
//! sign-in) into a [`SessionContext`], passed to whatever needs it, and
//! cleared on sign-out. Nothing reads identity from ambient state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
}

impl Identity {
    pub fn new(id: Uuid, email: &str) -> Self {
        Self {
            id,
            email: normalize_email(email),
        }
    }
}

/// Emails compare case-insensitively and without surrounding blanks.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

pub trait IdentityProvider: Send + Sync {
    /// `None` when nobody is signed in.
    fn current_identity(&self) -> Option<Identity>;
}

/// Provider with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Option<Identity>);

impl IdentityProvider for StaticIdentity {
    fn current_identity(&self) -> Option<Identity> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    identity: Option<Identity>,
}

impl SessionContext {
    pub fn resolve(provider: &dyn IdentityProvider) -> Self {
        let identity = provider.current_identity();
        match &identity {
            Some(who) => log::info!("Signed in as {}", who.email),
            None => log::debug!("No identity, continuing anonymously"),
        }
        Self { identity }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn sign_out(&mut self) {
        if let Some(who) = self.identity.take() {
            log::info!("Signed out {}", who.email);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_and_sign_out() {
        let who = Identity::new(Uuid::new_v4(), "Ada@Example.com ");
        let mut ctx = SessionContext::resolve(&StaticIdentity(Some(who.clone())));
        assert_eq!(ctx.identity(), Some(&who));
        assert_eq!(who.email, "ada@example.com");

        ctx.sign_out();
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx, SessionContext::anonymous());
    }

    #[test]
    fn test_anonymous_provider() {
        let ctx = SessionContext::resolve(&StaticIdentity::default());
        assert!(ctx.identity().is_none());
    }
}
