// src/store/document/mod.rs

//! Document datastore adapter: named in-process collections of documents.
//!
//! Models the document-backend contract (`_id = "{group}:{user}"`
//! memberships, insert-if-absent bootstrap, locked find-and-update task
//! claims) with a single writer lock standing in for per-document
//! transactions. Also the hermetic backend for tests and dev mode.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{
    AccessLevel, Attachment, AttachmentStatus, Channel, Conversation, ConversationGroup,
    ConversationMembership, DekRecord, Entry, EpochFilter, NewEntry, OwnershipTransfer,
    SyncResult, Task, task_types,
};
use crate::store::codec::EntryCodec;
use crate::store::{
    AppendEntriesRequest, Datastore, FulltextHit, GroupEntriesQuery, ListEntriesQuery, NewTask,
    validate_append_request,
};

/// Stored form of an entry: the content payload stays sealed at rest.
#[derive(Debug, Clone)]
struct EntryDoc {
    id: Uuid,
    conversation_id: Uuid,
    conversation_group_id: Uuid,
    channel: Channel,
    client_id: Option<String>,
    epoch: Option<i64>,
    created_at: DateTime<Utc>,
    payload: String,
    indexed_content: Option<String>,
    indexed_at: Option<DateTime<Utc>>,
    attachment_refs: Vec<Uuid>,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct MembershipDoc {
    membership: ConversationMembership,
    deleted_at: Option<DateTime<Utc>>,
}

fn membership_key(group_id: Uuid, user_id: &str) -> String {
    format!("{group_id}:{user_id}")
}

#[derive(Default)]
struct Collections {
    groups: HashMap<Uuid, ConversationGroup>,
    conversations: HashMap<Uuid, Conversation>,
    memberships: HashMap<String, MembershipDoc>,
    entries: HashMap<Uuid, EntryDoc>,
    attachments: HashMap<Uuid, Attachment>,
    transfers: HashMap<Uuid, OwnershipTransfer>,
    tasks: HashMap<Uuid, Task>,
    deks: HashMap<String, DekRecord>,
    /// Strictly increasing assignment clock for entry `created_at`.
    last_entry_micros: i64,
}

impl Collections {
    fn next_entry_time(&mut self) -> CoreResult<DateTime<Utc>> {
        let now = Utc::now().timestamp_micros();
        let assigned = now.max(self.last_entry_micros + 1);
        self.last_entry_micros = assigned;
        DateTime::from_timestamp_micros(assigned)
            .ok_or_else(|| CoreError::internal("timestamp out of range"))
    }

    fn active_conversation(&self, id: Uuid) -> Option<&Conversation> {
        self.conversations
            .get(&id)
            .filter(|c| c.deleted_at.is_none())
    }

    fn active_membership(&self, group_id: Uuid, user_id: &str) -> Option<&ConversationMembership> {
        self.memberships
            .get(&membership_key(group_id, user_id))
            .filter(|doc| doc.deleted_at.is_none())
            .map(|doc| &doc.membership)
    }

    fn max_epoch(&self, conversation_id: Uuid, client_id: &str) -> Option<i64> {
        self.entries
            .values()
            .filter(|e| {
                e.deleted_at.is_none()
                    && e.conversation_id == conversation_id
                    && e.channel == Channel::Memory
                    && e.client_id.as_deref() == Some(client_id)
            })
            .filter_map(|e| e.epoch)
            .max()
    }
}

pub struct DocumentDatastore {
    codec: EntryCodec,
    collections: RwLock<Collections>,
}

impl DocumentDatastore {
    pub fn new(codec: EntryCodec) -> Self {
        Self {
            codec,
            collections: RwLock::new(Collections::default()),
        }
    }

    fn to_entry(&self, doc: &EntryDoc) -> CoreResult<Entry> {
        Ok(Entry {
            id: doc.id,
            conversation_id: doc.conversation_id,
            conversation_group_id: doc.conversation_group_id,
            channel: doc.channel,
            client_id: doc.client_id.clone(),
            epoch: doc.epoch,
            created_at: doc.created_at,
            content: self.codec.decode_content(&doc.payload)?,
            indexed_content: doc.indexed_content.clone(),
            indexed_at: doc.indexed_at,
            attachment_refs: doc.attachment_refs.clone(),
        })
    }

    fn collect_ordered(
        &self,
        mut docs: Vec<EntryDoc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        up_to: Option<(DateTime<Utc>, Uuid)>,
        limit: usize,
    ) -> CoreResult<Vec<Entry>> {
        docs.sort_by(|a, b| {
            (a.created_at, a.id.to_string()).cmp(&(b.created_at, b.id.to_string()))
        });
        let mut out = Vec::new();
        for doc in docs {
            let position = (doc.created_at, doc.id.to_string());
            if let Some((at, id)) = &after {
                if position <= (*at, id.to_string()) {
                    continue;
                }
            }
            if let Some((at, id)) = &up_to {
                if position > (*at, id.to_string()) {
                    continue;
                }
            }
            out.push(self.to_entry(&doc)?);
            if limit > 0 && out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

fn cursor_position(
    collections: &Collections,
    entry_id: Uuid,
    conversation_id: Option<Uuid>,
    group_id: Option<Uuid>,
    channel: Option<Channel>,
) -> Option<(DateTime<Utc>, Uuid)> {
    collections
        .entries
        .get(&entry_id)
        .filter(|doc| doc.deleted_at.is_none())
        .filter(|doc| conversation_id.is_none_or(|c| doc.conversation_id == c))
        .filter(|doc| group_id.is_none_or(|g| doc.conversation_group_id == g))
        .filter(|doc| channel.is_none_or(|ch| doc.channel == ch))
        .map(|doc| (doc.created_at, doc.id))
}

#[async_trait]
impl Datastore for DocumentDatastore {
    async fn create_root_conversation(
        &self,
        owner_user_id: &str,
        title: Option<String>,
    ) -> CoreResult<Conversation> {
        let mut collections = self.collections.write().await;
        let now = Utc::now();
        let group = ConversationGroup {
            id: Uuid::new_v4(),
            created_at: now,
            deleted_at: None,
        };
        let conversation = Conversation {
            id: Uuid::new_v4(),
            conversation_group_id: group.id,
            owner_user_id: owner_user_id.to_string(),
            title,
            forked_at_conversation_id: None,
            forked_at_entry_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let membership = ConversationMembership {
            conversation_group_id: group.id,
            user_id: owner_user_id.to_string(),
            access_level: AccessLevel::Owner,
            created_at: now,
        };

        collections.groups.insert(group.id, group.clone());
        collections
            .conversations
            .insert(conversation.id, conversation.clone());
        collections.memberships.insert(
            membership_key(group.id, owner_user_id),
            MembershipDoc {
                membership,
                deleted_at: None,
            },
        );
        Ok(conversation)
    }

    async fn get_group(&self, group_id: Uuid) -> CoreResult<ConversationGroup> {
        let collections = self.collections.read().await;
        collections
            .groups
            .get(&group_id)
            .filter(|g| g.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("conversation group {group_id}")))
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> CoreResult<Conversation> {
        let collections = self.collections.read().await;
        collections
            .active_conversation(conversation_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("conversation {conversation_id}")))
    }

    async fn list_conversations_in_group(
        &self,
        group_id: Uuid,
    ) -> CoreResult<Vec<Conversation>> {
        let collections = self.collections.read().await;
        let mut conversations: Vec<Conversation> = collections
            .conversations
            .values()
            .filter(|c| c.deleted_at.is_none() && c.conversation_group_id == group_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| {
            (a.created_at, a.id.to_string()).cmp(&(b.created_at, b.id.to_string()))
        });
        Ok(conversations)
    }

    async fn soft_delete_group(&self, group_id: Uuid) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        let now = Utc::now();

        let group = collections
            .groups
            .get_mut(&group_id)
            .filter(|g| g.deleted_at.is_none())
            .ok_or_else(|| CoreError::not_found(format!("conversation group {group_id}")))?;
        group.deleted_at = Some(now);

        for conversation in collections.conversations.values_mut() {
            if conversation.conversation_group_id == group_id
                && conversation.deleted_at.is_none()
            {
                conversation.deleted_at = Some(now);
            }
        }
        for entry in collections.entries.values_mut() {
            if entry.conversation_group_id == group_id && entry.deleted_at.is_none() {
                entry.deleted_at = Some(now);
            }
        }
        for doc in collections.memberships.values_mut() {
            if doc.membership.conversation_group_id == group_id && doc.deleted_at.is_none() {
                doc.deleted_at = Some(now);
            }
        }

        // Embeddings follow through the queued vector cleanup.
        let name = format!("{}:{}", task_types::VECTOR_STORE_DELETE, group_id);
        if !collections
            .tasks
            .values()
            .any(|t| t.task_name.as_deref() == Some(name.as_str()))
        {
            let task = Task {
                id: Uuid::new_v4(),
                task_name: Some(name),
                task_type: task_types::VECTOR_STORE_DELETE.to_string(),
                task_body: serde_json::json!({ "conversationGroupId": group_id }),
                retry_at: now,
                processing_at: None,
                last_error: None,
                retry_count: 0,
                created_at: now,
            };
            collections.tasks.insert(task.id, task);
        }
        Ok(())
    }

    async fn get_membership(
        &self,
        group_id: Uuid,
        user_id: &str,
    ) -> CoreResult<Option<ConversationMembership>> {
        let collections = self.collections.read().await;
        Ok(collections.active_membership(group_id, user_id).cloned())
    }

    async fn upsert_membership(
        &self,
        group_id: Uuid,
        user_id: &str,
        access_level: AccessLevel,
    ) -> CoreResult<ConversationMembership> {
        let mut collections = self.collections.write().await;
        let key = membership_key(group_id, user_id);
        let doc = collections
            .memberships
            .entry(key)
            .or_insert_with(|| MembershipDoc {
                membership: ConversationMembership {
                    conversation_group_id: group_id,
                    user_id: user_id.to_string(),
                    access_level,
                    created_at: Utc::now(),
                },
                deleted_at: None,
            });
        doc.membership.access_level = access_level;
        doc.deleted_at = None;
        Ok(doc.membership.clone())
    }

    async fn remove_membership(&self, group_id: Uuid, user_id: &str) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .memberships
            .get_mut(&membership_key(group_id, user_id))
            .filter(|doc| doc.deleted_at.is_none())
            .ok_or_else(|| {
                CoreError::not_found(format!("membership of {user_id} in group {group_id}"))
            })?;
        doc.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn list_memberships(
        &self,
        group_id: Uuid,
    ) -> CoreResult<Vec<ConversationMembership>> {
        let collections = self.collections.read().await;
        let mut memberships: Vec<ConversationMembership> = collections
            .memberships
            .values()
            .filter(|doc| {
                doc.deleted_at.is_none()
                    && doc.membership.conversation_group_id == group_id
            })
            .map(|doc| doc.membership.clone())
            .collect();
        memberships.sort_by(|a, b| {
            (a.created_at, a.user_id.clone()).cmp(&(b.created_at, b.user_id.clone()))
        });
        Ok(memberships)
    }

    async fn list_group_ids_for_user(
        &self,
        user_id: &str,
        limit: usize,
        order_by_recent: bool,
    ) -> CoreResult<Vec<Uuid>> {
        let collections = self.collections.read().await;
        let mut groups: Vec<(Uuid, DateTime<Utc>)> = collections
            .memberships
            .values()
            .filter(|doc| doc.deleted_at.is_none() && doc.membership.user_id == user_id)
            .filter(|doc| {
                collections
                    .groups
                    .get(&doc.membership.conversation_group_id)
                    .is_some_and(|g| g.deleted_at.is_none())
            })
            .map(|doc| {
                let group_id = doc.membership.conversation_group_id;
                let recency = collections
                    .conversations
                    .values()
                    .filter(|c| {
                        c.deleted_at.is_none() && c.conversation_group_id == group_id
                    })
                    .map(|c| c.updated_at)
                    .max()
                    .unwrap_or(doc.membership.created_at);
                (group_id, if order_by_recent { recency } else { doc.membership.created_at })
            })
            .collect();

        if order_by_recent {
            groups.sort_by(|a, b| b.1.cmp(&a.1));
        } else {
            groups.sort_by(|a, b| a.1.cmp(&b.1));
        }
        let ids = groups.into_iter().map(|(id, _)| id);
        Ok(if limit == 0 {
            ids.collect()
        } else {
            ids.take(limit).collect()
        })
    }

    async fn append_entries(&self, req: AppendEntriesRequest) -> CoreResult<Vec<Entry>> {
        validate_append_request(&req)?;
        let mut collections = self.collections.write().await;

        // Resolve or fork-create the target branch.
        let conversation = match collections.active_conversation(req.conversation_id) {
            Some(existing) => {
                if let Some(fork) = &req.fork {
                    let parent_matches = existing.forked_at_conversation_id
                        == Some(fork.forked_at_conversation_id)
                        && existing.forked_at_entry_id == Some(fork.forked_at_entry_id);
                    if !parent_matches {
                        return Err(CoreError::conflict(format!(
                            "conversation {} already exists with a different parent",
                            req.conversation_id
                        )));
                    }
                }
                existing.clone()
            }
            None => {
                let fork = req.fork.as_ref().ok_or_else(|| {
                    CoreError::not_found(format!("conversation {}", req.conversation_id))
                })?;
                let ancestor = collections
                    .active_conversation(fork.forked_at_conversation_id)
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::not_found(format!(
                            "ancestor conversation {}",
                            fork.forked_at_conversation_id
                        ))
                    })?;
                let anchor_ok = collections
                    .entries
                    .get(&fork.forked_at_entry_id)
                    .is_some_and(|e| {
                        e.deleted_at.is_none() && e.conversation_id == ancestor.id
                    });
                if !anchor_ok {
                    return Err(CoreError::not_found(format!(
                        "fork entry {} in conversation {}",
                        fork.forked_at_entry_id, ancestor.id
                    )));
                }
                let now = Utc::now();
                let branch = Conversation {
                    id: req.conversation_id,
                    conversation_group_id: ancestor.conversation_group_id,
                    owner_user_id: ancestor.owner_user_id.clone(),
                    title: None,
                    forked_at_conversation_id: Some(fork.forked_at_conversation_id),
                    forked_at_entry_id: Some(fork.forked_at_entry_id),
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                };
                collections.conversations.insert(branch.id, branch.clone());
                branch
            }
        };

        let is_memory = req
            .entries
            .first()
            .map(|e| e.channel == Channel::Memory)
            .unwrap_or(false);
        let epoch = if is_memory {
            let client_id = req
                .client_id
                .as_deref()
                .ok_or_else(|| CoreError::invalid_argument("MEMORY entries require a client id"))?;
            match req.epoch {
                Some(epoch) => {
                    let taken = collections.entries.values().any(|e| {
                        e.deleted_at.is_none()
                            && e.conversation_id == conversation.id
                            && e.channel == Channel::Memory
                            && e.client_id.as_deref() == Some(client_id)
                            && e.epoch == Some(epoch)
                    });
                    if taken {
                        return Err(CoreError::conflict(format!(
                            "epoch {epoch} already recorded for this conversation and client"
                        )));
                    }
                    Some(epoch)
                }
                None => Some(collections.max_epoch(conversation.id, client_id).unwrap_or(0) + 1),
            }
        } else {
            None
        };

        // All-or-nothing: validate the whole batch before the first mutation.
        let mut ids = Vec::with_capacity(req.entries.len());
        for new_entry in &req.entries {
            let id = new_entry.id.unwrap_or_else(Uuid::new_v4);
            if collections.entries.contains_key(&id) || ids.contains(&id) {
                return Err(CoreError::conflict(format!("entry {id} already exists")));
            }
            for attachment_id in &new_entry.attachment_refs {
                let present = collections
                    .attachments
                    .get(attachment_id)
                    .is_some_and(|a| a.deleted_at.is_none());
                if !present {
                    return Err(CoreError::not_found(format!("attachment {attachment_id}")));
                }
            }
            ids.push(id);
        }

        let mut saved = Vec::with_capacity(req.entries.len());
        for (new_entry, id) in req.entries.iter().zip(ids) {
            for attachment_id in &new_entry.attachment_refs {
                if let Some(attachment) = collections.attachments.get_mut(attachment_id) {
                    attachment.entry_id = Some(id);
                    attachment.expires_at = None;
                }
            }

            let created_at = collections.next_entry_time()?;
            let doc = EntryDoc {
                id,
                conversation_id: conversation.id,
                conversation_group_id: conversation.conversation_group_id,
                channel: new_entry.channel,
                client_id: if new_entry.channel == Channel::Memory {
                    req.client_id.clone()
                } else {
                    None
                },
                epoch: if new_entry.channel == Channel::Memory {
                    epoch
                } else {
                    None
                },
                created_at,
                payload: self.codec.encode_content(&new_entry.content)?,
                indexed_content: new_entry.indexed_content.clone(),
                indexed_at: None,
                attachment_refs: new_entry.attachment_refs.clone(),
                deleted_at: None,
            };
            saved.push(self.to_entry(&doc)?);
            collections.entries.insert(id, doc);
        }

        if let Some(conversation) = collections.conversations.get_mut(&conversation.id) {
            conversation.updated_at = Utc::now();
        }
        Ok(saved)
    }

    async fn sync_agent_entry(
        &self,
        conversation_id: Uuid,
        entry: NewEntry,
        client_id: Option<String>,
    ) -> CoreResult<SyncResult> {
        let id = entry.id.ok_or_else(|| {
            CoreError::invalid_argument("sync requires a client-supplied entry id")
        })?;

        {
            let collections = self.collections.read().await;
            if let Some(doc) = collections.entries.get(&id).filter(|d| d.deleted_at.is_none())
            {
                if doc.conversation_id != conversation_id {
                    return Err(CoreError::conflict(format!(
                        "entry {id} belongs to a different conversation"
                    )));
                }
                return Ok(SyncResult {
                    entry: self.to_entry(doc)?,
                    already_existed: true,
                });
            }
        }

        let mut entries = self
            .append_entries(AppendEntriesRequest {
                conversation_id,
                entries: vec![entry],
                client_id,
                epoch: None,
                fork: None,
            })
            .await?;
        Ok(SyncResult {
            entry: entries.remove(0),
            already_existed: false,
        })
    }

    async fn get_entry(&self, entry_id: Uuid) -> CoreResult<Entry> {
        let collections = self.collections.read().await;
        let doc = collections
            .entries
            .get(&entry_id)
            .filter(|d| d.deleted_at.is_none())
            .ok_or_else(|| CoreError::not_found(format!("entry {entry_id}")))?;
        self.to_entry(doc)
    }

    async fn list_entries(&self, query: ListEntriesQuery) -> CoreResult<Vec<Entry>> {
        if matches!(query.epoch, Some(EpochFilter::Latest)) && query.client_id.is_none() {
            return Err(CoreError::invalid_argument(
                "latest-epoch reads require a client id",
            ));
        }
        let collections = self.collections.read().await;

        let latest_epoch = match (&query.epoch, &query.client_id) {
            (Some(EpochFilter::Latest), Some(client_id)) => {
                collections.max_epoch(query.conversation_id, client_id)
            }
            _ => None,
        };

        let docs: Vec<EntryDoc> = collections
            .entries
            .values()
            .filter(|doc| doc.deleted_at.is_none())
            .filter(|doc| doc.conversation_id == query.conversation_id)
            .filter(|doc| query.channel.is_none_or(|c| doc.channel == c))
            .filter(|doc| {
                query
                    .client_id
                    .as_deref()
                    .is_none_or(|c| doc.client_id.as_deref() == Some(c))
            })
            .filter(|doc| match query.epoch {
                Some(EpochFilter::Latest) => doc.epoch == latest_epoch && latest_epoch.is_some(),
                Some(EpochFilter::Exact(epoch)) => doc.epoch == Some(epoch),
                Some(EpochFilter::All) | None => true,
            })
            .cloned()
            .collect();

        let after = query.after_entry_id.and_then(|id| {
            cursor_position(
                &collections,
                id,
                Some(query.conversation_id),
                None,
                query.channel,
            )
        });
        let up_to = query.up_to_entry_id.and_then(|id| {
            cursor_position(&collections, id, Some(query.conversation_id), None, None)
        });

        self.collect_ordered(docs, after, up_to, query.limit)
    }

    async fn list_by_conversation_group(
        &self,
        query: GroupEntriesQuery,
    ) -> CoreResult<Vec<Entry>> {
        let collections = self.collections.read().await;
        let docs: Vec<EntryDoc> = collections
            .entries
            .values()
            .filter(|doc| doc.deleted_at.is_none())
            .filter(|doc| doc.conversation_group_id == query.conversation_group_id)
            .filter(|doc| query.channel.is_none_or(|c| doc.channel == c))
            .filter(|doc| {
                query
                    .client_id
                    .as_deref()
                    .is_none_or(|c| doc.client_id.as_deref() == Some(c))
            })
            .cloned()
            .collect();

        let after = query.after_entry_id.and_then(|id| {
            cursor_position(
                &collections,
                id,
                None,
                Some(query.conversation_group_id),
                query.channel,
            )
        });

        self.collect_ordered(docs, after, None, query.limit)
    }

    async fn latest_memory_epoch(
        &self,
        conversation_id: Uuid,
        client_id: &str,
    ) -> CoreResult<Option<i64>> {
        let collections = self.collections.read().await;
        Ok(collections.max_epoch(conversation_id, client_id))
    }

    async fn set_indexed_content(&self, entry_id: Uuid, text: &str) -> CoreResult<bool> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .entries
            .get_mut(&entry_id)
            .filter(|d| d.deleted_at.is_none())
            .ok_or_else(|| CoreError::not_found(format!("entry {entry_id}")))?;
        if doc.indexed_content.is_some() {
            return Ok(false);
        }
        doc.indexed_content = Some(text.to_string());
        Ok(true)
    }

    async fn set_indexed_at(&self, entry_id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .entries
            .get_mut(&entry_id)
            .filter(|d| d.deleted_at.is_none())
            .ok_or_else(|| CoreError::not_found(format!("entry {entry_id}")))?;
        doc.indexed_at = Some(at);
        Ok(())
    }

    async fn fulltext_search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> CoreResult<Vec<FulltextHit>> {
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let collections = self.collections.read().await;
        let mut hits: Vec<FulltextHit> = collections
            .entries
            .values()
            .filter(|doc| doc.deleted_at.is_none())
            .filter(|doc| {
                collections
                    .active_membership(doc.conversation_group_id, user_id)
                    .is_some()
            })
            .filter_map(|doc| {
                let text = doc.indexed_content.as_deref()?.to_lowercase();
                let matched = tokens.iter().filter(|t| text.contains(t.as_str())).count();
                if matched == 0 {
                    return None;
                }
                Some(FulltextHit {
                    entry_id: doc.id,
                    conversation_id: doc.conversation_id,
                    conversation_group_id: doc.conversation_group_id,
                    score: matched as f64,
                    created_at: doc.created_at,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        if limit > 0 {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn create_attachment(&self, attachment: &Attachment) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        if collections.attachments.contains_key(&attachment.id) {
            return Err(CoreError::conflict(format!(
                "attachment {} already exists",
                attachment.id
            )));
        }
        collections
            .attachments
            .insert(attachment.id, attachment.clone());
        Ok(())
    }

    async fn get_attachment(&self, id: Uuid) -> CoreResult<Attachment> {
        let collections = self.collections.read().await;
        collections
            .attachments
            .get(&id)
            .filter(|a| a.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("attachment {id}")))
    }

    async fn finalize_attachment(
        &self,
        id: Uuid,
        status: AttachmentStatus,
        storage_key: Option<&str>,
        size: Option<i64>,
        sha256: Option<&str>,
    ) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        let attachment = collections
            .attachments
            .get_mut(&id)
            .filter(|a| a.deleted_at.is_none())
            .ok_or_else(|| CoreError::not_found(format!("attachment {id}")))?;
        attachment.status = status;
        if let Some(storage_key) = storage_key {
            attachment.storage_key = storage_key.to_string();
        }
        if let Some(size) = size {
            attachment.size = size;
        }
        if let Some(sha256) = sha256 {
            attachment.sha256 = sha256.to_string();
        }
        Ok(())
    }

    async fn soft_delete_attachment(&self, id: Uuid) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        let attachment = collections
            .attachments
            .get_mut(&id)
            .filter(|a| a.deleted_at.is_none())
            .ok_or_else(|| CoreError::not_found(format!("attachment {id}")))?;
        attachment.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn list_evictable_attachments(
        &self,
        now: DateTime<Utc>,
        tombstone_retention: std::time::Duration,
        limit: usize,
    ) -> CoreResult<Vec<Attachment>> {
        let retention_cutoff = now
            - Duration::microseconds(tombstone_retention.as_micros() as i64);
        let collections = self.collections.read().await;
        let mut evictable: Vec<Attachment> = collections
            .attachments
            .values()
            .filter(|a| match a.deleted_at {
                Some(deleted_at) => deleted_at < retention_cutoff,
                None => {
                    a.entry_id.is_none() && a.expires_at.is_some_and(|expires| expires < now)
                }
            })
            .cloned()
            .collect();
        evictable.sort_by_key(|a| a.created_at);
        if limit > 0 {
            evictable.truncate(limit);
        }
        Ok(evictable)
    }

    async fn hard_delete_attachment(&self, id: Uuid) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        collections.attachments.remove(&id);
        Ok(())
    }

    async fn create_transfer(
        &self,
        group_id: Uuid,
        from_user_id: &str,
        to_user_id: &str,
    ) -> CoreResult<OwnershipTransfer> {
        let mut collections = self.collections.write().await;
        if collections
            .transfers
            .values()
            .any(|t| t.conversation_group_id == group_id)
        {
            return Err(CoreError::conflict(format!(
                "pending transfer for group {group_id} already exists"
            )));
        }
        let now = Utc::now();
        let transfer = OwnershipTransfer {
            id: Uuid::new_v4(),
            conversation_group_id: group_id,
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        collections.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&self, id: Uuid) -> CoreResult<OwnershipTransfer> {
        let collections = self.collections.read().await;
        collections
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("ownership transfer {id}")))
    }

    async fn delete_transfer(&self, id: Uuid) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        collections
            .transfers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::not_found(format!("ownership transfer {id}")))
    }

    async fn accept_transfer(&self, id: Uuid) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        let transfer = collections
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("ownership transfer {id}")))?;
        let group_id = transfer.conversation_group_id;

        for doc in collections.memberships.values_mut() {
            if doc.membership.conversation_group_id == group_id
                && doc.deleted_at.is_none()
                && doc.membership.access_level == AccessLevel::Owner
            {
                doc.membership.access_level = AccessLevel::Manager;
            }
        }

        let key = membership_key(group_id, &transfer.to_user_id);
        let doc = collections
            .memberships
            .entry(key)
            .or_insert_with(|| MembershipDoc {
                membership: ConversationMembership {
                    conversation_group_id: group_id,
                    user_id: transfer.to_user_id.clone(),
                    access_level: AccessLevel::Owner,
                    created_at: Utc::now(),
                },
                deleted_at: None,
            });
        doc.membership.access_level = AccessLevel::Owner;
        doc.deleted_at = None;

        collections.transfers.remove(&id);
        Ok(())
    }

    async fn create_task(&self, task: NewTask) -> CoreResult<bool> {
        let mut collections = self.collections.write().await;
        if let Some(name) = &task.task_name {
            if collections
                .tasks
                .values()
                .any(|t| t.task_name.as_deref() == Some(name.as_str()))
            {
                return Ok(false);
            }
        }
        let stored = Task {
            id: Uuid::new_v4(),
            task_name: task.task_name,
            task_type: task.task_type,
            task_body: task.task_body,
            retry_at: task.retry_at,
            processing_at: None,
            last_error: None,
            retry_count: 0,
            created_at: Utc::now(),
        };
        collections.tasks.insert(stored.id, stored);
        Ok(true)
    }

    async fn find_task_by_name(&self, name: &str) -> CoreResult<Option<Task>> {
        let collections = self.collections.read().await;
        Ok(collections
            .tasks
            .values()
            .find(|t| t.task_name.as_deref() == Some(name))
            .cloned())
    }

    async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        batch: usize,
        stale_claim_timeout: std::time::Duration,
    ) -> CoreResult<Vec<Task>> {
        // Locked find-and-update: the write lock is the claim barrier.
        let mut collections = self.collections.write().await;
        let stale_cutoff = now - Duration::microseconds(stale_claim_timeout.as_micros() as i64);

        let mut eligible: Vec<Uuid> = collections
            .tasks
            .values()
            .filter(|t| {
                t.retry_at <= now
                    && t.processing_at.is_none_or(|claimed| claimed < stale_cutoff)
            })
            .map(|t| t.id)
            .collect();
        eligible.sort_by_key(|id| {
            collections
                .tasks
                .get(id)
                .map(|t| t.retry_at)
                .unwrap_or(now)
        });
        eligible.truncate(batch);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(task) = collections.tasks.get_mut(&id) {
                task.processing_at = Some(now);
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_task(&self, id: Uuid) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        collections.tasks.remove(&id);
        Ok(())
    }

    async fn fail_task(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut collections = self.collections.write().await;
        let task = collections
            .tasks
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("task {id}")))?;
        task.last_error = Some(error.to_string());
        task.retry_count += 1;
        task.retry_at = retry_at;
        task.processing_at = None;
        Ok(())
    }

    async fn get_dek_record(&self, provider: &str) -> CoreResult<Option<DekRecord>> {
        let collections = self.collections.read().await;
        Ok(collections.deks.get(provider).cloned())
    }

    async fn insert_dek_record_if_absent(&self, record: &DekRecord) -> CoreResult<DekRecord> {
        let mut collections = self.collections.write().await;
        Ok(collections
            .deks
            .entry(record.provider.clone())
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn update_dek_record(
        &self,
        record: &DekRecord,
        expected_revision: i64,
    ) -> CoreResult<bool> {
        let mut collections = self.collections.write().await;
        match collections.deks.get_mut(&record.provider) {
            Some(stored) if stored.revision == expected_revision => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
