//! In-memory internal store.
//!
//! Mutations are staged in a [`PendingTransaction`] and only become visible
//! on [`MemoryInternalStore::commit`], which applies them together with the
//! effects of the change tracking triggers: rows are marked for sequencing,
//! removals leave tombstones and contact channel changes mark their owner.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extdb_sync_internal_source::{
    plan_assignments, reserved_range, ChangeSource, FuseboxFlags, PendingRow, SequenceAssigner,
    SequencerPass, TenancyRecord, TenantDirectory,
};
use sync_core::{
    ChangeOp, ChangeRecord, ContactChannelProjection, MappingName, ProjectedRow, SequenceId,
    UserProjection, NO_SEQUENCE,
};
use uuid::Uuid;

use crate::fusebox::FuseboxStore;

/// Source columns of a `project_users` row.
#[derive(Debug, Clone, PartialEq)]
pub struct UserData {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub is_anonymous: bool,
    pub signed_up_at: DateTime<Utc>,
}

impl UserData {
    pub fn new(display_name: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.map(str::to_string),
            profile_image_url: None,
            is_anonymous: false,
            signed_up_at: Utc::now(),
        }
    }
}

/// Source columns of a `contact_channels` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel_type: String,
    pub value: String,
    pub is_primary: bool,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl ChannelData {
    pub fn primary_email(user_id: Uuid, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            channel_type: "email".to_string(),
            value: email.to_string(),
            is_primary: true,
            is_verified: true,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    UpsertUser(UserData),
    DeleteUser(Uuid),
    UpsertChannel(ChannelData),
    DeleteChannel(Uuid),
}

/// Mutations of one tenancy, invisible until committed.
#[derive(Debug)]
pub struct PendingTransaction {
    tenancy_id: Uuid,
    mutations: Vec<Mutation>,
}

impl PendingTransaction {
    pub fn upsert_user(&mut self, user: UserData) -> &mut Self {
        self.mutations.push(Mutation::UpsertUser(user));
        self
    }

    pub fn delete_user(&mut self, user_id: Uuid) -> &mut Self {
        self.mutations.push(Mutation::DeleteUser(user_id));
        self
    }

    pub fn upsert_channel(&mut self, channel: ChannelData) -> &mut Self {
        self.mutations.push(Mutation::UpsertChannel(channel));
        self
    }

    pub fn delete_channel(&mut self, channel_id: Uuid) -> &mut Self {
        self.mutations.push(Mutation::DeleteChannel(channel_id));
        self
    }
}

#[derive(Debug, Clone)]
struct Tracked<T> {
    data: T,
    sequence_id: Option<SequenceId>,
    should_update_sequence_id: bool,
    updated_at: DateTime<Utc>,
    /// Commit clock value of the last change, the selection order.
    touched: u64,
}

#[derive(Debug, Clone)]
struct Tombstone {
    id: Uuid,
    tenancy_id: Uuid,
    mapping: MappingName,
    entity_id: Uuid,
    deleted_at: DateTime<Utc>,
    sequence_id: Option<SequenceId>,
    should_update_sequence_id: bool,
}

#[derive(Default)]
struct State {
    tenancies: Vec<TenancyRecord>,
    users: HashMap<(Uuid, Uuid), Tracked<UserData>>,
    channels: HashMap<(Uuid, Uuid), Tracked<ChannelData>>,
    tombstones: Vec<Tombstone>,
    counters: HashMap<(Uuid, MappingName), SequenceId>,
    fusebox: FuseboxFlags,
    clock: u64,
}

impl State {
    fn mark_user(&mut self, tenancy_id: Uuid, user_id: Uuid, touched: u64) {
        if let Some(row) = self.users.get_mut(&(tenancy_id, user_id)) {
            row.should_update_sequence_id = true;
            row.touched = touched;
        }
    }

    fn tombstone(&mut self, tenancy_id: Uuid, mapping: MappingName, entity_id: Uuid) {
        self.tombstones.push(Tombstone {
            id: Uuid::new_v4(),
            tenancy_id,
            mapping,
            entity_id,
            deleted_at: Utc::now(),
            sequence_id: None,
            should_update_sequence_id: true,
        });
    }

    fn apply(&mut self, tenancy_id: Uuid, mutation: Mutation) {
        self.clock += 1;
        let touched = self.clock;
        let now = Utc::now();

        match mutation {
            Mutation::UpsertUser(user) => {
                let key = (tenancy_id, user.id);
                let sequence_id = self.users.get(&key).and_then(|r| r.sequence_id);
                self.users.insert(
                    key,
                    Tracked {
                        data: user,
                        sequence_id,
                        should_update_sequence_id: true,
                        updated_at: now,
                        touched,
                    },
                );
            }
            Mutation::DeleteUser(user_id) => {
                if self.users.remove(&(tenancy_id, user_id)).is_none() {
                    return;
                }
                self.tombstone(tenancy_id, MappingName::Users, user_id);
                let owned: Vec<Uuid> = self
                    .channels
                    .iter()
                    .filter(|((t, _), c)| *t == tenancy_id && c.data.user_id == user_id)
                    .map(|((_, id), _)| *id)
                    .collect();
                for channel_id in owned {
                    self.channels.remove(&(tenancy_id, channel_id));
                    self.tombstone(tenancy_id, MappingName::ContactChannels, channel_id);
                }
            }
            Mutation::UpsertChannel(channel) => {
                let key = (tenancy_id, channel.id);
                let previous = self.channels.get(&key).cloned();
                if let Some(prev) = &previous {
                    self.mark_user(tenancy_id, prev.data.user_id, touched);
                }
                self.mark_user(tenancy_id, channel.user_id, touched);
                self.channels.insert(
                    key,
                    Tracked {
                        data: channel,
                        sequence_id: previous.and_then(|p| p.sequence_id),
                        should_update_sequence_id: true,
                        updated_at: now,
                        touched,
                    },
                );
            }
            Mutation::DeleteChannel(channel_id) => {
                if let Some(prev) = self.channels.remove(&(tenancy_id, channel_id)) {
                    self.tombstone(tenancy_id, MappingName::ContactChannels, channel_id);
                    self.mark_user(tenancy_id, prev.data.user_id, touched);
                }
            }
        }
    }

    fn reserve(&mut self, tenancy_id: Uuid, mapping: MappingName, count: usize) -> Vec<SequenceId> {
        let counter = self.counters.entry((tenancy_id, mapping)).or_insert(0);
        *counter += count as SequenceId;
        reserved_range(*counter, count).collect()
    }

    fn primary_email(&self, tenancy_id: Uuid, user_id: Uuid) -> Option<&ChannelData> {
        self.channels
            .iter()
            .filter(|((t, _), c)| {
                *t == tenancy_id
                    && c.data.user_id == user_id
                    && c.data.channel_type == "email"
                    && c.data.is_primary
            })
            .map(|(_, c)| &c.data)
            .min_by_key(|c| (c.created_at, c.id))
    }
}

/// Internal store kept in process memory. Implements every internal-store
/// role of the engine.
#[derive(Default)]
pub struct MemoryInternalStore {
    state: Mutex<State>,
}

impl MemoryInternalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create_tenancy(&self, project_id: &str, external_databases: serde_json::Value) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().tenancies.push(TenancyRecord {
            id,
            project_id: project_id.to_string(),
            external_databases,
        });
        id
    }

    pub fn begin(&self, tenancy_id: Uuid) -> PendingTransaction {
        PendingTransaction {
            tenancy_id,
            mutations: Vec::new(),
        }
    }

    /// Apply a transaction's mutations atomically.
    pub fn commit(&self, tx: PendingTransaction) {
        let mut state = self.lock();
        for mutation in tx.mutations {
            state.apply(tx.tenancy_id, mutation);
        }
    }

    /// Commit a new user with a verified primary email.
    pub fn create_user(&self, tenancy_id: Uuid, email: &str, display_name: Option<&str>) -> Uuid {
        let user = UserData::new(display_name);
        let user_id = user.id;
        let mut tx = self.begin(tenancy_id);
        tx.upsert_user(user)
            .upsert_channel(ChannelData::primary_email(user_id, email));
        self.commit(tx);
        user_id
    }

    /// Committed source columns of a user.
    pub fn user(&self, tenancy_id: Uuid, user_id: Uuid) -> Option<UserData> {
        self.lock()
            .users
            .get(&(tenancy_id, user_id))
            .map(|r| r.data.clone())
    }

    /// Commit a display name change.
    pub fn set_display_name(&self, tenancy_id: Uuid, user_id: Uuid, display_name: &str) -> bool {
        let Some(mut user) = self.user(tenancy_id, user_id) else {
            return false;
        };
        user.display_name = Some(display_name.to_string());
        let mut tx = self.begin(tenancy_id);
        tx.upsert_user(user);
        self.commit(tx);
        true
    }

    /// Commit the removal of a user and its contact channels.
    pub fn delete_user(&self, tenancy_id: Uuid, user_id: Uuid) {
        let mut tx = self.begin(tenancy_id);
        tx.delete_user(user_id);
        self.commit(tx);
    }

    /// Tombstones of a tenancy still held, sequenced or not.
    pub fn tombstone_count(&self, tenancy_id: Uuid) -> usize {
        self.lock()
            .tombstones
            .iter()
            .filter(|t| t.tenancy_id == tenancy_id)
            .count()
    }

    /// Rows and tombstones waiting for a sequence number.
    pub fn pending_count(&self) -> usize {
        let state = self.lock();
        state.users.values().filter(|r| r.should_update_sequence_id).count()
            + state.channels.values().filter(|r| r.should_update_sequence_id).count()
            + state
                .tombstones
                .iter()
                .filter(|t| t.should_update_sequence_id)
                .count()
    }
}

#[async_trait]
impl SequenceAssigner for MemoryInternalStore {
    async fn assign_pending(&self, batch_size: usize) -> Result<SequencerPass> {
        let mut state = self.lock();
        let mut pass = SequencerPass::default();

        let mut users: Vec<(u64, PendingRow)> = state
            .users
            .iter()
            .filter(|(_, r)| r.should_update_sequence_id)
            .map(|((tenancy_id, id), r)| {
                (
                    r.touched,
                    PendingRow {
                        tenancy_id: *tenancy_id,
                        mapping: MappingName::Users,
                        key: *id,
                    },
                )
            })
            .collect();
        users.sort_by_key(|(touched, row)| (*touched, row.key));
        users.truncate(batch_size);
        for ((tenancy_id, mapping), keys) in plan_assignments(users.into_iter().map(|(_, r)| r)) {
            let numbers = state.reserve(tenancy_id, mapping, keys.len());
            for (key, number) in keys.iter().zip(numbers) {
                if let Some(row) = state.users.get_mut(&(tenancy_id, *key)) {
                    row.sequence_id = Some(number);
                    row.should_update_sequence_id = false;
                }
            }
            pass.record(tenancy_id, mapping, keys.len() as u64);
        }

        let mut channels: Vec<(u64, PendingRow)> = state
            .channels
            .iter()
            .filter(|(_, r)| r.should_update_sequence_id)
            .map(|((tenancy_id, id), r)| {
                (
                    r.touched,
                    PendingRow {
                        tenancy_id: *tenancy_id,
                        mapping: MappingName::ContactChannels,
                        key: *id,
                    },
                )
            })
            .collect();
        channels.sort_by_key(|(touched, row)| (*touched, row.key));
        channels.truncate(batch_size);
        for ((tenancy_id, mapping), keys) in plan_assignments(channels.into_iter().map(|(_, r)| r))
        {
            let numbers = state.reserve(tenancy_id, mapping, keys.len());
            for (key, number) in keys.iter().zip(numbers) {
                if let Some(row) = state.channels.get_mut(&(tenancy_id, *key)) {
                    row.sequence_id = Some(number);
                    row.should_update_sequence_id = false;
                }
            }
            pass.record(tenancy_id, mapping, keys.len() as u64);
        }

        let tombstones: Vec<PendingRow> = state
            .tombstones
            .iter()
            .filter(|t| t.should_update_sequence_id)
            .take(batch_size)
            .map(|t| PendingRow {
                tenancy_id: t.tenancy_id,
                mapping: t.mapping,
                key: t.id,
            })
            .collect();
        for ((tenancy_id, mapping), keys) in plan_assignments(tombstones) {
            let numbers = state.reserve(tenancy_id, mapping, keys.len());
            for (key, number) in keys.iter().zip(numbers) {
                if let Some(t) = state.tombstones.iter_mut().find(|t| t.id == *key) {
                    t.sequence_id = Some(number);
                    t.should_update_sequence_id = false;
                }
            }
            pass.record(tenancy_id, mapping, keys.len() as u64);
        }

        Ok(pass)
    }
}

#[async_trait]
impl ChangeSource for MemoryInternalStore {
    async fn fetch_changes(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let state = self.lock();
        let record = |entity_id, sequence_id, op, observed_at| ChangeRecord {
            tenancy_id,
            mapping,
            sequence_id,
            entity_id,
            op,
            observed_at,
        };

        let mut records: Vec<ChangeRecord> = match mapping {
            MappingName::Users => state
                .users
                .iter()
                .filter(|((t, _), _)| *t == tenancy_id)
                .filter_map(|((_, id), r)| {
                    r.sequence_id
                        .filter(|s| *s > after)
                        .map(|s| record(*id, s, ChangeOp::Upsert, r.updated_at))
                })
                .collect(),
            MappingName::ContactChannels => state
                .channels
                .iter()
                .filter(|((t, _), _)| *t == tenancy_id)
                .filter_map(|((_, id), r)| {
                    r.sequence_id
                        .filter(|s| *s > after)
                        .map(|s| record(*id, s, ChangeOp::Upsert, r.updated_at))
                })
                .collect(),
        };
        records.extend(
            state
                .tombstones
                .iter()
                .filter(|t| t.tenancy_id == tenancy_id && t.mapping == mapping)
                .filter_map(|t| {
                    t.sequence_id
                        .filter(|s| *s > after)
                        .map(|s| record(t.entity_id, s, ChangeOp::Delete, t.deleted_at))
                }),
        );

        records.sort_by_key(|r| r.sequence_id);
        records.truncate(limit);
        Ok(records)
    }

    async fn materialize(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
        entity_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ProjectedRow>> {
        let state = self.lock();
        let mut current = HashMap::with_capacity(entity_ids.len());

        for id in entity_ids {
            let row = match mapping {
                MappingName::Users => state.users.get(&(tenancy_id, *id)).map(|r| {
                    let email = state.primary_email(tenancy_id, *id);
                    ProjectedRow::User(UserProjection {
                        id: *id,
                        primary_email: email.map(|c| c.value.clone()),
                        primary_email_verified: email.map(|c| c.is_verified),
                        display_name: r.data.display_name.clone(),
                        profile_image_url: r.data.profile_image_url.clone(),
                        is_anonymous: r.data.is_anonymous,
                        signed_up_at: r.data.signed_up_at,
                        sequence_id: r.sequence_id.unwrap_or(NO_SEQUENCE),
                    })
                }),
                MappingName::ContactChannels => state.channels.get(&(tenancy_id, *id)).map(|r| {
                    ProjectedRow::ContactChannel(ContactChannelProjection {
                        id: *id,
                        user_id: r.data.user_id,
                        channel_type: r.data.channel_type.clone(),
                        value: r.data.value.clone(),
                        is_primary: r.data.is_primary,
                        is_verified: r.data.is_verified,
                        created_at: r.data.created_at,
                        sequence_id: r.sequence_id.unwrap_or(NO_SEQUENCE),
                    })
                }),
            };
            if let Some(row) = row {
                current.insert(*id, row);
            }
        }
        Ok(current)
    }

    async fn max_sequence_id(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
    ) -> Result<Option<SequenceId>> {
        Ok(self
            .lock()
            .counters
            .get(&(tenancy_id, mapping))
            .copied()
            .filter(|v| *v > 0))
    }

    async fn prune_tombstones(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
        up_to: SequenceId,
    ) -> Result<u64> {
        let mut state = self.lock();
        let before = state.tombstones.len();
        state.tombstones.retain(|t| {
            t.tenancy_id != tenancy_id
                || t.mapping != mapping
                || t.sequence_id.map_or(true, |s| s > up_to)
        });
        Ok((before - state.tombstones.len()) as u64)
    }
}

#[async_trait]
impl TenantDirectory for MemoryInternalStore {
    async fn list_tenancies(&self) -> Result<Vec<TenancyRecord>> {
        Ok(self.lock().tenancies.clone())
    }

    async fn get_tenancy(&self, tenancy_id: Uuid) -> Result<Option<TenancyRecord>> {
        Ok(self
            .lock()
            .tenancies
            .iter()
            .find(|t| t.id == tenancy_id)
            .cloned())
    }

    async fn replace_external_databases(
        &self,
        tenancy_id: Uuid,
        expected: &serde_json::Value,
        external_databases: serde_json::Value,
    ) -> Result<bool> {
        let mut state = self.lock();
        match state
            .tenancies
            .iter_mut()
            .find(|t| t.id == tenancy_id && &t.external_databases == expected)
        {
            Some(tenancy) => {
                tenancy.external_databases = external_databases;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl FuseboxStore for MemoryInternalStore {
    async fn read_flags(&self) -> Result<FuseboxFlags> {
        Ok(self.lock().fusebox)
    }

    async fn write_flags(&self, flags: FuseboxFlags) -> Result<FuseboxFlags> {
        let mut state = self.lock();
        state.fusebox = flags;
        Ok(state.fusebox)
    }
}
