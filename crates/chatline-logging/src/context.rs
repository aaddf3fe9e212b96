//! Session context for log entries
//!
//! Thread-local storage for the identity of the signed-in user, so spans
//! opened while a guard is alive carry `user_id` and `session_id`.

use std::cell::RefCell;

use uuid::Uuid;

/// Session context data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContextData {
    /// The signed-in user
    pub user_id: String,
    /// Unique id for this login session
    pub session_id: Uuid,
}

thread_local! {
    static SESSION_CONTEXT: RefCell<Option<SessionContextData>> = const { RefCell::new(None) };
}

/// RAII guard for session context
///
/// Sets the session context for the current thread and restores the previous
/// one (if any) when dropped.
///
/// ```ignore
/// use chatline_logging::SessionContextGuard;
///
/// let _guard = SessionContextGuard::new("alice");
/// let span = SessionContextGuard::span();
/// let _entered = span.enter();
/// tracing::info!("opening channel");
/// ```
pub struct SessionContextGuard {
    previous: Option<SessionContextData>,
}

impl SessionContextGuard {
    /// Start a new session for `user_id`
    pub fn new(user_id: impl Into<String>) -> Self {
        Self::with_session_id(user_id, Uuid::new_v4())
    }

    /// Start a session with a known id, e.g. one restored from disk
    pub fn with_session_id(user_id: impl Into<String>, session_id: Uuid) -> Self {
        let next = SessionContextData {
            user_id: user_id.into(),
            session_id,
        };
        let previous = SESSION_CONTEXT.with(|ctx| ctx.borrow_mut().replace(next));
        Self { previous }
    }

    /// Get the current session context (if any)
    pub fn current() -> Option<SessionContextData> {
        SESSION_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    /// Get the current user id (if set)
    pub fn current_user_id() -> Option<String> {
        Self::current().map(|ctx| ctx.user_id)
    }

    /// Get the current session id (if set)
    pub fn current_session_id() -> Option<Uuid> {
        Self::current().map(|ctx| ctx.session_id)
    }

    /// An `info` span recording the current session, or a disabled span
    /// when no session is set
    pub fn span() -> tracing::Span {
        match Self::current() {
            Some(ctx) => tracing::info_span!(
                "session",
                user_id = %ctx.user_id,
                session_id = %ctx.session_id
            ),
            None => tracing::Span::none(),
        }
    }
}

impl Drop for SessionContextGuard {
    fn drop(&mut self) {
        SESSION_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_context_guard() {
        assert!(SessionContextGuard::current().is_none());

        {
            let _guard = SessionContextGuard::new("alice");
            let ctx = SessionContextGuard::current().unwrap();
            assert_eq!(ctx.user_id, "alice");
        }

        assert!(SessionContextGuard::current().is_none());
    }

    #[test]
    fn test_nested_contexts_restore() {
        {
            let _alice = SessionContextGuard::new("alice");
            let alice_session = SessionContextGuard::current_session_id();

            {
                let _bob = SessionContextGuard::new("bob");
                assert_eq!(SessionContextGuard::current_user_id().as_deref(), Some("bob"));
                assert_ne!(SessionContextGuard::current_session_id(), alice_session);
            }

            assert_eq!(SessionContextGuard::current_user_id().as_deref(), Some("alice"));
            assert_eq!(SessionContextGuard::current_session_id(), alice_session);
        }

        assert!(SessionContextGuard::current_user_id().is_none());
    }

    #[test]
    fn test_with_session_id() {
        let session_id = Uuid::new_v4();
        let _guard = SessionContextGuard::with_session_id("carol", session_id);
        assert_eq!(SessionContextGuard::current_session_id(), Some(session_id));
    }

    #[test]
    fn test_span_without_session_is_disabled() {
        assert!(SessionContextGuard::span().is_none());
    }
}
