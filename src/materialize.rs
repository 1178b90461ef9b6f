//! Relationship Materializer
//!
//! TigerStyle: Raw record in, wired cache entry out.
//!
//! These run inside fetch callbacks, on adapter threads. Each one builds the
//! entry, inserts it first-writer-wins, resolves whatever the entry points
//! at, and emits the added-event. A losing duplicate is discarded without an
//! event. Dependencies are resolved with ordinary (blocking) resolver calls,
//! so a guild's completion is not released until its welcome channel has
//! been resolved too.

use crate::entity::{
    CachedChannel, CachedGuild, CachedUser, GuildChannel, GuildMember, GuildRole, RawChannel,
    RawGuild, RawMember, RawRole, RawUser,
};
use crate::hooks::EntityEvent;
use crate::remote::{FetchError, FetchKey};
use crate::resolver::{FetchOutcome, ResolveError, Resolver};
use crate::store::Inserted;
use std::sync::Arc;

impl Resolver {
    pub(crate) fn materialize_user(
        &self,
        key: FetchKey,
        result: Result<RawUser, FetchError>,
    ) -> FetchOutcome {
        let raw = result?;
        debug_assert_eq!(key, FetchKey::User(raw.id), "platform answered with another user");

        match self.store().insert_user(CachedUser::from_raw(raw)) {
            Inserted::New(user) => {
                tracing::info!(
                    "Cached user    [{}] ({}) {}",
                    user.id(),
                    user.username(),
                    user.display_name()
                );
                self.hooks().dispatch(&EntityEvent::UserAdded(user));
            }
            Inserted::Existing(_) => self.discard_duplicate(key),
        }
        Ok(())
    }

    /// Inserts the guild, then resolves its welcome channel before returning.
    /// A welcome channel that cannot be resolved is logged; the guild stays
    /// cached.
    pub(crate) fn materialize_guild(
        &self,
        key: FetchKey,
        result: Result<RawGuild, FetchError>,
    ) -> FetchOutcome {
        let raw: RawGuild = result?;
        debug_assert_eq!(key, FetchKey::Guild(raw.id), "platform answered with another guild");

        let saved = self.store().saved_config(raw.id).unwrap_or_default();
        let guild = match self.store().insert_guild(CachedGuild::from_raw(raw, saved)) {
            Inserted::New(guild) => guild,
            Inserted::Existing(_) => {
                self.discard_duplicate(key);
                return Ok(());
            }
        };

        tracing::info!("Cached guild   [{}] {}", guild.id(), guild.name());

        if let Some(channel_id) = guild.config().welcome_channel_id {
            match self.try_resolve_guild_channel(&guild, channel_id) {
                Ok(channel) => {
                    tracing::info!("\twelcome_channel [{}] {}", channel.id(), channel.name());
                }
                Err(error) => {
                    tracing::warn!(
                        guild_id = %guild.id(),
                        channel_id = %channel_id,
                        error = %error,
                        "welcome channel could not be resolved"
                    );
                }
            }
        }

        self.hooks().dispatch(&EntityEvent::GuildAdded(guild));
        Ok(())
    }

    pub(crate) fn materialize_channel(
        &self,
        key: FetchKey,
        result: Result<RawChannel, FetchError>,
    ) -> FetchOutcome {
        let raw = result?;
        debug_assert_eq!(key, FetchKey::Channel(raw.id), "platform answered with another channel");

        match self.store().insert_channel(CachedChannel::from_raw(raw)) {
            Inserted::New(channel) => {
                tracing::info!("Cached channel [{}] {}", channel.id(), channel.name());
                self.hooks().dispatch(&EntityEvent::ChannelAdded(channel));
            }
            Inserted::Existing(_) => self.discard_duplicate(key),
        }
        Ok(())
    }

    /// Links an already cached top-level channel into its guild.
    pub(crate) fn materialize_guild_channel(
        &self,
        guild: &Arc<CachedGuild>,
        channel: &CachedChannel,
    ) -> Result<Arc<GuildChannel>, ResolveError> {
        let key = FetchKey::Channel(channel.id());

        if let Some(actual) = channel.guild_id() {
            if actual != guild.id() {
                return Err(ResolveError::WrongGuild {
                    key,
                    expected: guild.id(),
                    actual,
                });
            }
        }

        if !self.store().is_live_guild(guild) {
            return Err(ResolveError::Vanished {
                key: FetchKey::Guild(guild.id()),
            });
        }

        let inserted = self
            .store()
            .insert_guild_channel(guild, GuildChannel::new(guild.id(), channel));

        match inserted {
            Inserted::New(entry) => {
                tracing::debug!(
                    "Cached gchannel [{}] {} in guild [{}]",
                    entry.id(),
                    entry.name(),
                    guild.id()
                );
                self.hooks().dispatch(&EntityEvent::GuildChannelAdded {
                    guild: Arc::clone(guild),
                    channel: Arc::clone(&entry),
                });
                Ok(entry)
            }
            Inserted::Existing(entry) => {
                self.discard_duplicate(key);
                Ok(entry)
            }
        }
    }

    /// Both the guild and the user must resolve, or nothing is cached.
    pub(crate) fn materialize_member(
        &self,
        key: FetchKey,
        result: Result<RawMember, FetchError>,
    ) -> FetchOutcome {
        let raw = result?;
        debug_assert_eq!(
            key,
            FetchKey::Member {
                guild_id: raw.guild_id,
                user_id: raw.user_id
            },
            "platform answered with another member"
        );

        let guild = self.try_resolve_guild(raw.guild_id).map_err(|error| {
            tracing::warn!(key = %key, error = %error, "No guild to associate with user");
            ResolveError::MissingDependency {
                key,
                dependency: FetchKey::Guild(raw.guild_id),
            }
        })?;

        let user = self.try_resolve_user(raw.user_id).map_err(|error| {
            tracing::warn!(key = %key, error = %error, "No user to associate with guild");
            ResolveError::MissingDependency {
                key,
                dependency: FetchKey::User(raw.user_id),
            }
        })?;

        if !self.store().is_live_guild(&guild) {
            return Err(ResolveError::Vanished {
                key: FetchKey::Guild(guild.id()),
            });
        }

        match self.store().insert_member(&guild, GuildMember::from_raw(raw)) {
            Inserted::New(member) => {
                tracing::info!(
                    "Cached guser   [{}] {} [{}] {}",
                    user.id(),
                    member.nickname().unwrap_or(user.username()),
                    guild.id(),
                    guild.name()
                );
                self.hooks().dispatch(&EntityEvent::MemberAdded { guild, member });
            }
            Inserted::Existing(_) => self.discard_duplicate(key),
        }
        Ok(())
    }

    pub(crate) fn materialize_role(
        &self,
        guild: &Arc<CachedGuild>,
        key: FetchKey,
        result: Result<RawRole, FetchError>,
    ) -> FetchOutcome {
        let raw = result?;
        self.insert_role(guild, key, raw)?;
        Ok(())
    }

    /// Caches every listed role not cached yet; roles of other guilds are
    /// skipped.
    pub(crate) fn materialize_roles(
        &self,
        guild: &Arc<CachedGuild>,
        key: FetchKey,
        result: Result<Vec<RawRole>, FetchError>,
    ) -> FetchOutcome {
        let roles = result?;
        let listed = roles.len();
        let mut added = 0usize;

        for raw in roles {
            let role_key = FetchKey::Role {
                guild_id: guild.id(),
                role_id: raw.id,
            };
            match self.insert_role(guild, role_key, raw) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(ResolveError::Vanished { key }) => return Err(ResolveError::Vanished { key }),
                Err(error) => tracing::warn!(key = %key, error = %error, "skipping listed role"),
            }
        }

        tracing::debug!(guild_id = %guild.id(), listed, added, "Refreshed guild roles");
        Ok(())
    }

    /// Cache a role the bot just created, so the next lookup hits instead of
    /// fetching a record the platform may not have published yet.
    pub fn record_created_role(
        &self,
        guild: &Arc<CachedGuild>,
        raw: RawRole,
    ) -> Result<Arc<GuildRole>, ResolveError> {
        let key = FetchKey::Role {
            guild_id: guild.id(),
            role_id: raw.id,
        };
        let role_id = raw.id;
        self.insert_role(guild, key, raw)?;
        guild.role(role_id).ok_or(ResolveError::Vanished { key })
    }

    /// Returns whether the role was newly inserted.
    fn insert_role(
        &self,
        guild: &Arc<CachedGuild>,
        key: FetchKey,
        raw: RawRole,
    ) -> Result<bool, ResolveError> {
        if raw.guild_id != guild.id() {
            return Err(ResolveError::WrongGuild {
                key,
                expected: guild.id(),
                actual: raw.guild_id,
            });
        }

        if !self.store().is_live_guild(guild) {
            return Err(ResolveError::Vanished {
                key: FetchKey::Guild(guild.id()),
            });
        }

        match self.store().insert_role(guild, GuildRole::from_raw(raw)) {
            Inserted::New(role) => {
                tracing::debug!("Cached role    [{}] {} in guild [{}]", role.id(), role.name(), guild.id());
                self.hooks().dispatch(&EntityEvent::RoleAdded {
                    guild: Arc::clone(guild),
                    role,
                });
                Ok(true)
            }
            Inserted::Existing(_) => {
                self.discard_duplicate(key);
                Ok(false)
            }
        }
    }

    fn discard_duplicate(&self, key: FetchKey) {
        self.counters().record_duplicate();
        tracing::debug!(key = %key, "discarding duplicate fetch result, entry already cached");
    }
}
