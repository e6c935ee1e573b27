// tests/sharing_transfer.rs
// Sharing rules and the ownership-transfer state machine

mod common;

use memory_service::access::Principal;
use memory_service::error::CoreError;
use memory_service::model::AccessLevel;

use common::{env_over, sqlite_store};

#[tokio::test]
async fn ownership_transfer_acceptance_swaps_roles() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");
    let bob = Principal::user("bob");

    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    let group = conversation.conversation_group_id;

    env.sharing
        .share(&alice, group, "bob", AccessLevel::Manager)
        .await
        .unwrap();

    let transfer = env
        .sharing
        .create_transfer(&alice, group, "bob")
        .await
        .unwrap();

    // A second pending transfer on the same group conflicts.
    let err = env
        .sharing
        .create_transfer(&alice, group, "charlie")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // Only the recipient may accept.
    let err = env
        .sharing
        .accept_transfer(&alice, transfer.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));

    env.sharing.accept_transfer(&bob, transfer.id).await.unwrap();

    let memberships = env.sharing.list_memberships(&bob, group).await.unwrap();
    let owners: Vec<&str> = memberships
        .iter()
        .filter(|m| m.access_level == AccessLevel::Owner)
        .map(|m| m.user_id.as_str())
        .collect();
    assert_eq!(owners, ["bob"]);
    let alice_membership = memberships
        .iter()
        .find(|m| m.user_id == "alice")
        .unwrap();
    assert_eq!(alice_membership.access_level, AccessLevel::Manager);

    // The transfer row is gone.
    assert!(matches!(
        env.sharing.get_transfer(&bob, transfer.id).await,
        Err(CoreError::NotFound(_))
    ));

    // With the row gone, a new transfer may be created by the new owner.
    env.sharing
        .create_transfer(&bob, group, "alice")
        .await
        .unwrap();
}

#[tokio::test]
async fn share_cannot_grant_or_touch_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");

    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    let group = conversation.conversation_group_id;

    let err = env
        .sharing
        .share(&alice, group, "bob", AccessLevel::Owner)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument(_)));

    // Demoting the current owner through share is refused.
    let err = env
        .sharing
        .share(&alice, group, "alice", AccessLevel::Reader)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // So is unsharing the sole owner.
    let err = env.sharing.unshare(&alice, group, "alice").await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn sharing_is_group_wide_and_manager_gated() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");
    let bob = Principal::user("bob");

    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    let group = conversation.conversation_group_id;

    env.sharing
        .share(&alice, group, "bob", AccessLevel::Writer)
        .await
        .unwrap();

    // A writer cannot share further.
    let err = env
        .sharing
        .share(&bob, group, "charlie", AccessLevel::Reader)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));

    // Upgrading an existing membership is a plain upsert.
    env.sharing
        .share(&alice, group, "bob", AccessLevel::Manager)
        .await
        .unwrap();
    env.sharing
        .share(&bob, group, "charlie", AccessLevel::Reader)
        .await
        .unwrap();

    env.sharing.unshare(&alice, group, "charlie").await.unwrap();
    let memberships = env.sharing.list_memberships(&alice, group).await.unwrap();
    assert!(memberships.iter().all(|m| m.user_id != "charlie"));
}

#[tokio::test]
async fn transfer_delete_requires_a_party() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_over(sqlite_store(&dir).await);
    let alice = Principal::user("alice");
    let bob = Principal::user("bob");
    let mallory = Principal::user("mallory");

    let conversation = env.engine.create_conversation(&alice, None).await.unwrap();
    let group = conversation.conversation_group_id;
    let transfer = env
        .sharing
        .create_transfer(&alice, group, "bob")
        .await
        .unwrap();

    // A stranger cannot even observe the transfer.
    assert!(matches!(
        env.sharing.delete_transfer(&mallory, transfer.id).await,
        Err(CoreError::NotFound(_))
    ));

    // The recipient may decline (delete).
    env.sharing.delete_transfer(&bob, transfer.id).await.unwrap();
    assert!(matches!(
        env.sharing.get_transfer(&alice, transfer.id).await,
        Err(CoreError::NotFound(_))
    ));
}
