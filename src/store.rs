//! Entity Store
//!
//! TigerStyle: Append-only typed maps, first writer wins.
//!
//! Top-level maps hold users, guilds and channels. Guild-scoped maps live
//! inside [`CachedGuild`] and are only written through this module. No lock
//! is ever held while waiting on a fetch; callers get `Arc` clones out.

use crate::entity::{
    CachedChannel, CachedGuild, CachedUser, ChildMap, GuildChannel, GuildConfig, GuildMember,
    GuildRole, Snowflake,
};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Insertion Result
// =============================================================================

/// Outcome of a first-writer-wins insert
#[derive(Debug)]
pub enum Inserted<T> {
    /// This value is now the entry
    New(Arc<T>),
    /// Another writer got there first; the offered value was discarded
    Existing(Arc<T>),
}

impl<T> Inserted<T> {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }

    pub fn entry(&self) -> &Arc<T> {
        match self {
            Self::New(entry) | Self::Existing(entry) => entry,
        }
    }

    pub fn into_entry(self) -> Arc<T> {
        match self {
            Self::New(entry) | Self::Existing(entry) => entry,
        }
    }
}

fn insert_first<T>(map: &ChildMap<T>, id: Snowflake, value: T) -> Inserted<T> {
    match map.write().entry(id) {
        Entry::Occupied(existing) => Inserted::Existing(Arc::clone(existing.get())),
        Entry::Vacant(slot) => Inserted::New(Arc::clone(slot.insert(Arc::new(value)))),
    }
}

// =============================================================================
// Entity Store
// =============================================================================

/// Every entity cached during this run
#[derive(Debug, Default)]
pub struct EntityStore {
    users: ChildMap<CachedUser>,
    guilds: ChildMap<CachedGuild>,
    channels: ChildMap<CachedChannel>,
    /// Configuration loaded from disk, applied when a guild is materialized
    saved_config: RwLock<HashMap<Snowflake, GuildConfig>>,
}

/// Thread-safe entity store
pub type SharedEntityStore = Arc<EntityStore>;

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store hydrated with configuration saved by a previous run
    pub fn with_saved_config(saved: HashMap<Snowflake, GuildConfig>) -> Self {
        Self {
            saved_config: RwLock::new(saved),
            ..Self::default()
        }
    }

    pub fn user(&self, user_id: Snowflake) -> Option<Arc<CachedUser>> {
        self.users.read().get(&user_id).cloned()
    }

    pub fn guild(&self, guild_id: Snowflake) -> Option<Arc<CachedGuild>> {
        self.guilds.read().get(&guild_id).cloned()
    }

    pub fn channel(&self, channel_id: Snowflake) -> Option<Arc<CachedChannel>> {
        self.channels.read().get(&channel_id).cloned()
    }

    pub fn guilds(&self) -> Vec<Arc<CachedGuild>> {
        self.guilds.read().values().cloned().collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.read().len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Whether `guild` is the entry currently stored under its id
    pub fn is_live_guild(&self, guild: &Arc<CachedGuild>) -> bool {
        self.guild(guild.id())
            .is_some_and(|live| Arc::ptr_eq(&live, guild))
    }

    /// Configuration saved for a guild that may not be cached yet
    pub fn saved_config(&self, guild_id: Snowflake) -> Option<GuildConfig> {
        self.saved_config.read().get(&guild_id).cloned()
    }

    /// Configuration for every known guild: live guilds first, then saved
    /// entries for guilds not resolved during this run.
    pub fn config_snapshot(&self) -> Vec<(Snowflake, GuildConfig)> {
        let mut merged = self.saved_config.read().clone();
        for guild in self.guilds() {
            merged.insert(guild.id(), guild.config());
        }

        let mut configs: Vec<_> = merged.into_iter().collect();
        configs.sort_by_key(|(id, _)| *id);
        configs
    }

    /// Drop a guild and everything it owns.
    ///
    /// Children are cleared even if a caller still holds the guild `Arc`, and
    /// the guild's configuration is kept for persistence.
    pub fn remove_guild(&self, guild_id: Snowflake) -> Option<Arc<CachedGuild>> {
        let removed = self.guilds.write().remove(&guild_id)?;

        removed.channels.write().clear();
        removed.roles.write().clear();
        removed.members.write().clear();
        self.saved_config.write().insert(guild_id, removed.config());

        tracing::info!(guild_id = %guild_id, "Removed guild and its cached children");
        Some(removed)
    }

    pub(crate) fn insert_user(&self, user: CachedUser) -> Inserted<CachedUser> {
        insert_first(&self.users, user.id(), user)
    }

    pub(crate) fn insert_guild(&self, guild: CachedGuild) -> Inserted<CachedGuild> {
        insert_first(&self.guilds, guild.id(), guild)
    }

    pub(crate) fn insert_channel(&self, channel: CachedChannel) -> Inserted<CachedChannel> {
        insert_first(&self.channels, channel.id(), channel)
    }

    pub(crate) fn insert_guild_channel(
        &self,
        guild: &Arc<CachedGuild>,
        channel: GuildChannel,
    ) -> Inserted<GuildChannel> {
        self.assert_live_owner(guild);
        insert_first(&guild.channels, channel.id(), channel)
    }

    pub(crate) fn insert_role(&self, guild: &Arc<CachedGuild>, role: GuildRole) -> Inserted<GuildRole> {
        self.assert_live_owner(guild);
        assert_eq!(role.guild_id(), guild.id(), "role must belong to the guild it is inserted into");
        insert_first(&guild.roles, role.id(), role)
    }

    pub(crate) fn insert_member(
        &self,
        guild: &Arc<CachedGuild>,
        member: GuildMember,
    ) -> Inserted<GuildMember> {
        self.assert_live_owner(guild);
        assert_eq!(
            member.guild_id(),
            guild.id(),
            "member must belong to the guild it is inserted into"
        );
        insert_first(&guild.members, member.user_id(), member)
    }

    fn assert_live_owner(&self, guild: &Arc<CachedGuild>) {
        assert!(
            self.is_live_guild(guild),
            "guild {} must be cached before its children",
            guild.id()
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
