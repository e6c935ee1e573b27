// src/sharing/mod.rs

//! Sharing & ownership: memberships on the conversation group and the
//! single-pending ownership-transfer state machine. Sharing on any branch
//! is visible from every branch because memberships live on the group.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::access::{AccessControl, Principal};
use crate::error::{CoreError, CoreResult};
use crate::model::{AccessLevel, ConversationMembership, OwnershipTransfer};
use crate::store::Datastore;

pub struct SharingService {
    store: Arc<dyn Datastore>,
    access: Arc<AccessControl>,
}

impl SharingService {
    pub fn new(store: Arc<dyn Datastore>, access: Arc<AccessControl>) -> Self {
        Self { store, access }
    }

    pub async fn list_memberships(
        &self,
        principal: &Principal,
        group_id: Uuid,
    ) -> CoreResult<Vec<ConversationMembership>> {
        self.access
            .ensure_access(principal, group_id, AccessLevel::Reader)
            .await?;
        self.store.list_memberships(group_id).await
    }

    /// Grant or change a user's access. OWNER cannot be granted here
    /// (ownership only moves through the transfer flow) and the current
    /// owner cannot be demoted by a share.
    pub async fn share(
        &self,
        principal: &Principal,
        group_id: Uuid,
        target_user_id: &str,
        level: AccessLevel,
    ) -> CoreResult<ConversationMembership> {
        self.access
            .ensure_access(principal, group_id, AccessLevel::Manager)
            .await?;

        if level == AccessLevel::Owner {
            return Err(CoreError::invalid_argument(
                "ownership is assigned via transfer, not share",
            ));
        }
        if let Some(existing) = self.store.get_membership(group_id, target_user_id).await? {
            if existing.access_level == AccessLevel::Owner {
                return Err(CoreError::conflict(
                    "the owner's access is changed via ownership transfer",
                ));
            }
        }

        let membership = self
            .store
            .upsert_membership(group_id, target_user_id, level)
            .await?;
        info!(
            "shared group {} with {} at {}",
            group_id,
            target_user_id,
            level.as_str()
        );
        Ok(membership)
    }

    /// Remove a user's access. Refuses to remove the sole OWNER.
    pub async fn unshare(
        &self,
        principal: &Principal,
        group_id: Uuid,
        target_user_id: &str,
    ) -> CoreResult<()> {
        self.access
            .ensure_access(principal, group_id, AccessLevel::Manager)
            .await?;

        if let Some(existing) = self.store.get_membership(group_id, target_user_id).await? {
            if existing.access_level == AccessLevel::Owner {
                return Err(CoreError::conflict(
                    "cannot remove the group owner; transfer ownership first",
                ));
            }
        }
        self.store.remove_membership(group_id, target_user_id).await
    }

    /// OWNER only; at most one pending transfer per group (second attempt
    /// fails CONFLICT at the datastore).
    pub async fn create_transfer(
        &self,
        principal: &Principal,
        group_id: Uuid,
        to_user_id: &str,
    ) -> CoreResult<OwnershipTransfer> {
        self.access
            .ensure_access(principal, group_id, AccessLevel::Owner)
            .await?;
        let from_user_id = principal.require_user()?;
        if from_user_id == to_user_id {
            return Err(CoreError::invalid_argument(
                "cannot transfer ownership to the current owner",
            ));
        }

        let transfer = self
            .store
            .create_transfer(group_id, from_user_id, to_user_id)
            .await?;
        info!(
            "ownership transfer {} pending: {} -> {} on group {}",
            transfer.id, from_user_id, to_user_id, group_id
        );
        Ok(transfer)
    }

    pub async fn get_transfer(
        &self,
        principal: &Principal,
        transfer_id: Uuid,
    ) -> CoreResult<OwnershipTransfer> {
        let transfer = self.store.get_transfer(transfer_id).await?;
        self.ensure_party(principal, &transfer)?;
        Ok(transfer)
    }

    /// Recipient only: demote old owner to MANAGER, promote recipient to
    /// OWNER, drop the transfer row, atomically.
    pub async fn accept_transfer(
        &self,
        principal: &Principal,
        transfer_id: Uuid,
    ) -> CoreResult<()> {
        let transfer = self.store.get_transfer(transfer_id).await?;
        let user_id = principal.require_user()?;
        if user_id != transfer.to_user_id {
            return Err(CoreError::forbidden(
                "only the transfer recipient may accept it",
            ));
        }
        self.store.accept_transfer(transfer_id).await?;
        info!(
            "ownership of group {} moved to {}",
            transfer.conversation_group_id, transfer.to_user_id
        );
        Ok(())
    }

    /// Sender cancels or recipient declines; both just delete the row.
    pub async fn delete_transfer(
        &self,
        principal: &Principal,
        transfer_id: Uuid,
    ) -> CoreResult<()> {
        let transfer = self.store.get_transfer(transfer_id).await?;
        self.ensure_party(principal, &transfer)?;
        self.store.delete_transfer(transfer_id).await
    }

    /// Transfer endpoints require sender- or recipient-identity.
    fn ensure_party(
        &self,
        principal: &Principal,
        transfer: &OwnershipTransfer,
    ) -> CoreResult<()> {
        let user_id = principal.require_user()?;
        if user_id == transfer.from_user_id || user_id == transfer.to_user_id {
            return Ok(());
        }
        Err(CoreError::not_found(format!(
            "ownership transfer {}",
            transfer.id
        )))
    }
}
