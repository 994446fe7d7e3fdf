//! Workspace isolation primitives.
//!
//! Every read, write and delete in Verso is implicitly scoped to the caller's
//! workspace. The scope is resolved upstream (authentication) and handed to the
//! store as a [`WorkspaceScope`]; the store never makes authorization decisions.
//!
//! # Example
//!
//! ```rust
//! use verso_core::workspace::{WorkspaceId, WorkspaceScope};
//!
//! let scope = WorkspaceScope::new(WorkspaceId::new("acme-research").unwrap(), "alice");
//! assert_eq!(scope.workspace_id().as_str(), "acme-research");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Maximum length of a workspace identifier.
pub const MAX_WORKSPACE_ID_LEN: usize = 64;

/// A unique identifier for a workspace.
///
/// Workspace IDs must be:
/// - Non-empty and at most 64 characters
/// - Free of whitespace and of the `*` character, which is reserved by storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Creates a new workspace ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace ID is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Creates a workspace ID without validation.
    ///
    /// Intended for IDs that have already been validated (e.g., decoded from storage).
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the workspace ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "workspace ID cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_WORKSPACE_ID_LEN {
            return Err(Error::InvalidId {
                message: format!(
                    "workspace ID '{id}' is too long (maximum {MAX_WORKSPACE_ID_LEN} characters)"
                ),
            });
        }

        if id.chars().any(|c| c == '*' || c.is_whitespace()) {
            return Err(Error::InvalidId {
                message: format!(
                    "workspace ID '{id}' contains invalid characters (whitespace and '*' are not allowed)"
                ),
            });
        }

        Ok(())
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for WorkspaceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The already-resolved workspace and caller identity an operation runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceScope {
    workspace_id: WorkspaceId,
    user_name: String,
}

impl WorkspaceScope {
    /// Creates a scope for the given workspace and caller.
    #[must_use]
    pub fn new(workspace_id: WorkspaceId, user_name: impl Into<String>) -> Self {
        Self {
            workspace_id,
            user_name: user_name.into(),
        }
    }

    /// Returns the workspace every operation is scoped to.
    #[must_use]
    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    /// Returns the caller identity recorded as `created_by` / `last_updated_by`.
    #[must_use]
    pub fn user_name(&self) -> &str {
        &self.user_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_workspace_ids() {
        assert!(WorkspaceId::new("acme-research").is_ok());
        assert!(WorkspaceId::new("0190c1a2-ws").is_ok());
        assert!(WorkspaceId::new("default").is_ok());
    }

    #[test]
    fn invalid_workspace_ids() {
        assert!(WorkspaceId::new("").is_err());
        assert!(WorkspaceId::new("has space").is_err());
        assert!(WorkspaceId::new("****").is_err());
        assert!(WorkspaceId::new("a".repeat(MAX_WORKSPACE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn scope_exposes_identity() {
        let scope = WorkspaceScope::new(WorkspaceId::new("ws-1").unwrap(), "bob");
        assert_eq!(scope.workspace_id().as_str(), "ws-1");
        assert_eq!(scope.user_name(), "bob");
    }
}
