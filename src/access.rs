//! Who may read or write a document.
//!
//! Every document has one owner token, handed out when the document is
//! created. The owner can mint invite tokens (shared as links) that grant
//! collaborator or read-only access, and revoke them again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::AccessError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Collaborator,
    Viewer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    Share,
}

impl Permission {
    fn name(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Share => "share",
        }
    }
}

impl Role {
    pub fn allows(&self, permission: Permission) -> bool {
        match (self, permission) {
            (Role::Owner, _) => true,
            (Role::Collaborator, Permission::Read | Permission::Write) => true,
            (Role::Viewer, Permission::Read) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Grant {
    pub document_id: String,
    pub role: Role,
    /// Display name recorded as last editor on saves made with this token.
    pub label: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Grant {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Utc::now())
    }
}

#[derive(Default)]
pub struct AccessControl {
    grants: RwLock<HashMap<String, Grant>>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_owner(&self, document_id: &str, label: &str) -> String {
        self.insert(Grant {
            document_id: document_id.to_string(),
            role: Role::Owner,
            label: label.to_string(),
            expires_at: None,
        })
    }

    /// Mints an invite token for `document_id`. Only the owner may invite,
    /// and an invite can never grant ownership.
    pub fn invite(
        &self,
        owner_token: Option<&str>,
        document_id: &str,
        role: Role,
        label: &str,
        ttl: Option<Duration>,
    ) -> Result<String, AccessError> {
        self.check(owner_token, document_id, Permission::Share)?;
        if role == Role::Owner {
            return Err(AccessError::Denied("owner"));
        }
        Ok(self.insert(Grant {
            document_id: document_id.to_string(),
            role,
            label: label.to_string(),
            expires_at: ttl.map(|ttl| Utc::now() + ttl),
        }))
    }

    pub fn revoke(&self, owner_token: Option<&str>, document_id: &str, token: &str) -> Result<bool, AccessError> {
        self.check(owner_token, document_id, Permission::Share)?;
        let mut grants = self.grants.write().map_err(|_| AccessError::Unauthenticated)?;
        match grants.get(token) {
            Some(grant) if grant.document_id == document_id && grant.role != Role::Owner => {
                grants.remove(token);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Returns the grant behind `token` if it covers `permission` on
    /// `document_id`.
    pub fn check(&self, token: Option<&str>, document_id: &str, permission: Permission) -> Result<Grant, AccessError> {
        let token = token.ok_or(AccessError::Unauthenticated)?;
        let grants = self.grants.read().map_err(|_| AccessError::Unauthenticated)?;
        let grant = grants
            .get(token)
            .filter(|grant| grant.is_live())
            .ok_or(AccessError::Unauthenticated)?;
        if grant.document_id != document_id || !grant.role.allows(permission) {
            return Err(AccessError::Denied(permission.name()));
        }
        Ok(grant.clone())
    }

    fn insert(&self, grant: Grant) -> String {
        let token = Uuid::new_v4().to_string();
        if let Ok(mut grants) = self.grants.write() {
            grants.retain(|_, g| g.is_live());
            grants.insert(token.clone(), grant);
        }
        token
    }
}
