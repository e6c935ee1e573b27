// src/access/mod.rs

//! Access control: principal → effective access level on a conversation
//! group. The principal is an explicit value on every trust-boundary call;
//! there is no ambient security context.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::AccessLevel;
use crate::store::Datastore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Full access to every group.
    Admin,
    /// Read-only access to every group, without materialized memberships.
    Auditor,
    /// Read-only indexing paths, usable with an API-key-only principal.
    Indexer,
}

/// The authenticated caller, as populated by the transport layer from OIDC
/// bearer tokens or API-key headers.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub roles: HashSet<Role>,
    pub api_key_present: bool,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    /// API-key principal with no user identity, as used by indexer workers.
    pub fn api_key(roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            user_id: None,
            client_id: None,
            roles: roles.into_iter().collect(),
            api_key_present: true,
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn require_user(&self) -> CoreResult<&str> {
        self.user_id
            .as_deref()
            .ok_or_else(|| CoreError::forbidden("a user principal is required"))
    }

    pub fn require_client(&self) -> CoreResult<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| CoreError::invalid_argument("a client id is required"))
    }
}

/// Resolves effective access and enforces required levels.
pub struct AccessControl {
    store: Arc<dyn Datastore>,
}

impl AccessControl {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    /// The principal's effective level on the group, or None.
    /// Does not check that the group exists; `ensure_access` does.
    pub async fn effective_access(
        &self,
        principal: &Principal,
        group_id: Uuid,
    ) -> CoreResult<Option<AccessLevel>> {
        if principal.has_role(Role::Admin) {
            return Ok(Some(AccessLevel::Owner));
        }

        let membership = match principal.user_id.as_deref() {
            Some(user_id) => self
                .store
                .get_membership(group_id, user_id)
                .await?
                .map(|m| m.access_level),
            None => None,
        };

        if principal.has_role(Role::Auditor) {
            // Auditors read every group; a real membership can only raise that.
            return Ok(Some(membership.unwrap_or(AccessLevel::Reader).max(AccessLevel::Reader)));
        }
        Ok(membership)
    }

    /// Fails NOT_FOUND when the group is missing *or* the principal has no
    /// access at all; the two are indistinguishable by design, so callers
    /// cannot probe for existence. FORBIDDEN only reveals an access level
    /// that is present but too low.
    pub async fn ensure_access(
        &self,
        principal: &Principal,
        group_id: Uuid,
        required: AccessLevel,
    ) -> CoreResult<AccessLevel> {
        self.store.get_group(group_id).await?;

        match self.effective_access(principal, group_id).await? {
            None => Err(CoreError::not_found(format!("conversation group {group_id}"))),
            Some(level) if level >= required => Ok(level),
            Some(_) => Err(CoreError::forbidden(format!(
                "requires {} access",
                required.as_str()
            ))),
        }
    }

    /// Indexing paths accept either a user with the indexer role or an
    /// API-key-only principal carrying it.
    pub fn ensure_indexer(&self, principal: &Principal) -> CoreResult<()> {
        if principal.has_role(Role::Indexer) {
            return Ok(());
        }
        Err(CoreError::forbidden("requires the indexer role"))
    }

    /// Groups the user can touch, bounded; used by external-vector search.
    pub async fn accessible_group_ids(
        &self,
        user_id: &str,
        limit: usize,
        order_by_recent: bool,
    ) -> CoreResult<Vec<Uuid>> {
        self.store
            .list_group_ids_for_user(user_id, limit, order_by_recent)
            .await
    }
}
