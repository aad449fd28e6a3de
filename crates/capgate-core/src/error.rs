//! Shared error type across capgate crates.

use thiserror::Error;

/// Stable error codes, one per failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Gated method called on a frozen object.
    Frozen,
    /// Gated method called while a lock key is held, or a lock/unlock was refused.
    Locked,
    /// Gated member accessed by a non-friend caller.
    Friend,
    /// State-changing operation attempted on a view.
    View,
    /// Malformed decoration spec, detected at decoration time.
    Configuration,
    /// Hook left unimplemented by a policy.
    NotImplemented,
    /// Argument bag does not fit the callable.
    Argument,
    /// Unknown member name.
    NoSuchMember,
    /// View whose underlying instance has been dropped.
    Detached,
    /// Internal invariant broken.
    Internal,
}

impl ErrorKind {
    /// String representation used in logs and metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Frozen => "FROZEN",
            ErrorKind::Locked => "LOCKED",
            ErrorKind::Friend => "FRIEND",
            ErrorKind::View => "VIEW",
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::NotImplemented => "NOT_IMPLEMENTED",
            ErrorKind::Argument => "ARGUMENT",
            ErrorKind::NoSuchMember => "NO_SUCH_MEMBER",
            ErrorKind::Detached => "DETACHED",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// True for the access violations raised by policies and views.
    pub fn is_violation(self) -> bool {
        matches!(
            self,
            ErrorKind::Frozen | ErrorKind::Locked | ErrorKind::Friend | ErrorKind::View
        )
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, CapError>;

/// Unified error type used by core and engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapError {
    #[error("{0}")]
    Frozen(String),
    #[error("{0}")]
    Locked(String),
    #[error("{0}")]
    Friend(String),
    #[error("{0}")]
    View(String),
    #[error("invalid decoration: {0}")]
    Configuration(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("bad arguments: {0}")]
    Argument(String),
    #[error("no such member: {0}")]
    NoSuchMember(String),
    #[error("detached view: {0}")]
    Detached(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl CapError {
    /// Build an error of `kind` carrying `msg`.
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match kind {
            ErrorKind::Frozen => CapError::Frozen(msg),
            ErrorKind::Locked => CapError::Locked(msg),
            ErrorKind::Friend => CapError::Friend(msg),
            ErrorKind::View => CapError::View(msg),
            ErrorKind::Configuration => CapError::Configuration(msg),
            ErrorKind::NotImplemented => CapError::NotImplemented(msg),
            ErrorKind::Argument => CapError::Argument(msg),
            ErrorKind::NoSuchMember => CapError::NoSuchMember(msg),
            ErrorKind::Detached => CapError::Detached(msg),
            ErrorKind::Internal => CapError::Internal(msg),
        }
    }

    /// "`{method}` method is not implemented."
    pub fn not_implemented(method: &str) -> Self {
        CapError::NotImplemented(format!("`{method}` method is not implemented."))
    }

    /// Map the error to its stable code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CapError::Frozen(_) => ErrorKind::Frozen,
            CapError::Locked(_) => ErrorKind::Locked,
            CapError::Friend(_) => ErrorKind::Friend,
            CapError::View(_) => ErrorKind::View,
            CapError::Configuration(_) => ErrorKind::Configuration,
            CapError::NotImplemented(_) => ErrorKind::NotImplemented,
            CapError::Argument(_) => ErrorKind::Argument,
            CapError::NoSuchMember(_) => ErrorKind::NoSuchMember,
            CapError::Detached(_) => ErrorKind::Detached,
            CapError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_constructor() {
        for kind in [ErrorKind::Frozen, ErrorKind::Locked, ErrorKind::View, ErrorKind::Internal] {
            assert_eq!(CapError::new(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn violation_kinds() {
        assert!(ErrorKind::Friend.is_violation());
        assert!(!ErrorKind::Configuration.is_violation());
        assert_eq!(CapError::not_implemented("Policy::construct").to_string(),
            "`Policy::construct` method is not implemented.");
    }
}
