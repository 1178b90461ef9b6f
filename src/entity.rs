//! Entities - Cached platform records
//!
//! TigerStyle: Ids are set once at construction, fields are private.
//!
//! Raw records (`Raw*`) are what the remote adapter decodes off the wire.
//! Cached entries wrap a raw record plus the denormalized fields the bot
//! reads. Child entries refer to their parents by id only; the accessors
//! that follow a back-reference re-resolve it through the [`EntityStore`],
//! so a removed guild can never be reached through a stale child.

use crate::store::EntityStore;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// Snowflake
// =============================================================================

/// Opaque 64-bit platform identifier. Zero is the wire's "unset" value and
/// is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snowflake(NonZeroU64);

impl Snowflake {
    /// Wrap a raw id; `None` for the zero sentinel.
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = InvalidSnowflake;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .ok()
            .and_then(Snowflake::new)
            .ok_or_else(|| InvalidSnowflake(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid snowflake: {0:?}")]
pub struct InvalidSnowflake(pub String);

/// Optional id field where the wire may send `0` for "unset".
fn zero_as_unset<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Snowflake>, D::Error> {
    Ok(Option::<u64>::deserialize(d)?.and_then(Snowflake::new))
}

// =============================================================================
// Entity Kind
// =============================================================================

/// Kinds of cached entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Guild,
    Channel,
    GuildChannel,
    Role,
    Member,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Guild => "guild",
            Self::Channel => "channel",
            Self::GuildChannel => "guild_channel",
            Self::Role => "role",
            Self::Member => "member",
        }
    }

    pub fn all() -> &'static [EntityKind] {
        &[
            Self::User,
            Self::Guild,
            Self::Channel,
            Self::GuildChannel,
            Self::Role,
            Self::Member,
        ]
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Raw Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUser {
    pub id: Snowflake,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawGuild {
    pub id: Snowflake,
    pub name: String,
    /// Channel the platform posts join notices to
    #[serde(default, deserialize_with = "zero_as_unset")]
    pub system_channel_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChannel {
    pub id: Snowflake,
    pub name: String,
    #[serde(default, deserialize_with = "zero_as_unset")]
    pub guild_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRole {
    pub id: Snowflake,
    pub guild_id: Snowflake,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMember {
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
}

// =============================================================================
// Guild Configuration
// =============================================================================

/// Administrator-set settings, persisted across restarts.
///
/// Holds ids rather than entries; they are re-resolved against the live
/// cache on use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildConfig {
    /// Reply to the verify button privately
    pub verify_ephemeral: bool,
    pub welcome_channel_id: Option<Snowflake>,
    pub verified_role_id: Option<Snowflake>,
    /// Role allowed to change this configuration
    pub operator_role_id: Option<Snowflake>,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            verify_ephemeral: true,
            welcome_channel_id: None,
            verified_role_id: None,
            operator_role_id: None,
        }
    }
}

// =============================================================================
// Cached Entries
// =============================================================================

/// A platform account
#[derive(Debug)]
pub struct CachedUser {
    id: Snowflake,
    username: String,
    display_name: String,
    raw: RawUser,
}

impl CachedUser {
    pub(crate) fn from_raw(raw: RawUser) -> Self {
        let display_name = raw
            .global_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| raw.username.clone());

        Self {
            id: raw.id,
            username: raw.username.clone(),
            display_name,
            raw,
        }
    }

    pub fn id(&self) -> Snowflake {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Global display name, falling back to the username
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn raw(&self) -> &RawUser {
        &self.raw
    }

    /// Platform mention markup
    pub fn mention(&self) -> String {
        format!("<@{}>", self.id)
    }
}

/// A channel as known at top level
#[derive(Debug)]
pub struct CachedChannel {
    id: Snowflake,
    name: String,
    raw: RawChannel,
}

impl CachedChannel {
    pub(crate) fn from_raw(raw: RawChannel) -> Self {
        Self {
            id: raw.id,
            name: raw.name.clone(),
            raw,
        }
    }

    pub fn id(&self) -> Snowflake {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guild the platform says this channel belongs to, if any
    pub fn guild_id(&self) -> Option<Snowflake> {
        self.raw.guild_id
    }

    pub fn raw(&self) -> &RawChannel {
        &self.raw
    }
}

/// A channel as seen from inside its guild
#[derive(Debug)]
pub struct GuildChannel {
    id: Snowflake,
    name: String,
    guild_id: Snowflake,
    raw: RawChannel,
}

impl GuildChannel {
    pub(crate) fn new(guild_id: Snowflake, channel: &CachedChannel) -> Self {
        Self {
            id: channel.id(),
            name: channel.name().to_string(),
            guild_id,
            raw: channel.raw().clone(),
        }
    }

    /// Platform record the entry was linked from
    pub fn raw(&self) -> &RawChannel {
        &self.raw
    }

    pub fn id(&self) -> Snowflake {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guild_id(&self) -> Snowflake {
        self.guild_id
    }

    /// Owning guild, if it is still cached
    pub fn guild(&self, store: &EntityStore) -> Option<Arc<CachedGuild>> {
        store.guild(self.guild_id)
    }

    /// The top-level record for the same channel
    pub fn channel(&self, store: &EntityStore) -> Option<Arc<CachedChannel>> {
        store.channel(self.id)
    }
}

/// A permission tag scoped to one guild
#[derive(Debug)]
pub struct GuildRole {
    id: Snowflake,
    name: String,
    guild_id: Snowflake,
    raw: RawRole,
}

impl GuildRole {
    pub(crate) fn from_raw(raw: RawRole) -> Self {
        Self {
            id: raw.id,
            name: raw.name.clone(),
            guild_id: raw.guild_id,
            raw,
        }
    }

    pub fn id(&self) -> Snowflake {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guild_id(&self) -> Snowflake {
        self.guild_id
    }

    pub fn raw(&self) -> &RawRole {
        &self.raw
    }

    pub fn guild(&self, store: &EntityStore) -> Option<Arc<CachedGuild>> {
        store.guild(self.guild_id)
    }
}

/// Membership of one user in one guild
#[derive(Debug)]
pub struct GuildMember {
    user_id: Snowflake,
    guild_id: Snowflake,
    nickname: Option<String>,
    /// Roles as fetched, plus grants the bot made since
    roles: RwLock<Vec<Snowflake>>,
    raw: RawMember,
}

impl GuildMember {
    pub(crate) fn from_raw(raw: RawMember) -> Self {
        Self {
            user_id: raw.user_id,
            guild_id: raw.guild_id,
            nickname: raw.nick.clone().filter(|nick| !nick.trim().is_empty()),
            roles: RwLock::new(raw.roles.clone()),
            raw,
        }
    }

    pub fn user_id(&self) -> Snowflake {
        self.user_id
    }

    pub fn guild_id(&self) -> Snowflake {
        self.guild_id
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn raw(&self) -> &RawMember {
        &self.raw
    }

    /// Whether the member holds `role_id`, counting grants made by the bot
    pub fn has_role(&self, role_id: Snowflake) -> bool {
        self.roles.read().contains(&role_id)
    }

    pub fn roles(&self) -> Vec<Snowflake> {
        self.roles.read().clone()
    }

    /// Record a grant the platform accepted
    pub(crate) fn note_role_granted(&self, role_id: Snowflake) {
        let mut roles = self.roles.write();
        if !roles.contains(&role_id) {
            roles.push(role_id);
        }
    }

    pub fn user(&self, store: &EntityStore) -> Option<Arc<CachedUser>> {
        store.user(self.user_id)
    }

    pub fn guild(&self, store: &EntityStore) -> Option<Arc<CachedGuild>> {
        store.guild(self.guild_id)
    }
}

/// Entry map owned by a guild
pub(crate) type ChildMap<T> = RwLock<HashMap<Snowflake, Arc<T>>>;

/// A guild and everything cached inside it
#[derive(Debug)]
pub struct CachedGuild {
    id: Snowflake,
    name: String,
    raw: RawGuild,
    config: RwLock<GuildConfig>,
    pub(crate) channels: ChildMap<GuildChannel>,
    pub(crate) roles: ChildMap<GuildRole>,
    pub(crate) members: ChildMap<GuildMember>,
}

impl CachedGuild {
    /// Build from the raw record and whatever configuration was saved for it.
    ///
    /// Without a saved welcome channel the platform's system channel is used.
    pub(crate) fn from_raw(raw: RawGuild, mut config: GuildConfig) -> Self {
        if config.welcome_channel_id.is_none() {
            config.welcome_channel_id = raw.system_channel_id;
        }

        Self {
            id: raw.id,
            name: raw.name.clone(),
            raw,
            config: RwLock::new(config),
            channels: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Snowflake {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> &RawGuild {
        &self.raw
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> GuildConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, update: impl FnOnce(&mut GuildConfig)) {
        update(&mut self.config.write());
    }

    /// Cached guild channel, no fetch
    pub fn channel(&self, channel_id: Snowflake) -> Option<Arc<GuildChannel>> {
        self.channels.read().get(&channel_id).cloned()
    }

    /// Cached role, no fetch
    pub fn role(&self, role_id: Snowflake) -> Option<Arc<GuildRole>> {
        self.roles.read().get(&role_id).cloned()
    }

    /// Cached member, no fetch
    pub fn member(&self, user_id: Snowflake) -> Option<Arc<GuildMember>> {
        self.members.read().get(&user_id).cloned()
    }

    /// Cached welcome channel, no fetch
    pub fn welcome_channel(&self) -> Option<Arc<GuildChannel>> {
        self.config().welcome_channel_id.and_then(|id| self.channel(id))
    }

    pub fn roles(&self) -> Vec<Arc<GuildRole>> {
        self.roles.read().values().cloned().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn role_count(&self) -> usize {
        self.roles.read().len()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
