//! Remote Fetch Adapter
//!
//! TigerStyle: The platform API as a narrow callback seam.
//!
//! Every fetch returns immediately. Its callback runs exactly once, later, on
//! a thread the adapter chooses, and never re-entrantly from inside the
//! `fetch_*` call itself. Callbacks may block (the materializer resolves
//! dependencies from inside them), so adapters must not run them on an
//! async executor thread.

use crate::entity::{RawChannel, RawGuild, RawMember, RawRole, RawUser, Snowflake};
use std::fmt;

/// Completion callback for one fetch
pub type FetchCallback<T> = Box<dyn FnOnce(Result<T, FetchError>) + Send + 'static>;

// =============================================================================
// Fetch Key
// =============================================================================

/// Identity of one remote request, used for coalescing and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKey {
    User(Snowflake),
    Guild(Snowflake),
    Channel(Snowflake),
    Member { guild_id: Snowflake, user_id: Snowflake },
    Role { guild_id: Snowflake, role_id: Snowflake },
    GuildRoles(Snowflake),
    CurrentUserGuilds,
}

impl FetchKey {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Guild(_) => "guild",
            Self::Channel(_) => "channel",
            Self::Member { .. } => "member",
            Self::Role { .. } => "role",
            Self::GuildRoles(_) => "guild_roles",
            Self::CurrentUserGuilds => "current_user_guilds",
        }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) | Self::Guild(id) | Self::Channel(id) | Self::GuildRoles(id) => {
                write!(f, "{} {}", self.kind(), id)
            }
            Self::Member { guild_id, user_id } => write!(f, "member {user_id} of guild {guild_id}"),
            Self::Role { guild_id, role_id } => write!(f, "role {role_id} of guild {guild_id}"),
            Self::CurrentUserGuilds => write!(f, "current user guilds"),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// How a remote fetch can fail
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("{key} does not exist")]
    NotFound { key: FetchKey },

    #[error("API error fetching {key}: {message}")]
    Api {
        key: FetchKey,
        message: String,
        /// Structured sub-reasons reported by the platform
        reasons: Vec<String>,
    },
}

impl FetchError {
    pub fn key(&self) -> FetchKey {
        match self {
            Self::NotFound { key } | Self::Api { key, .. } => *key,
        }
    }
}

// =============================================================================
// Adapter Trait
// =============================================================================

/// One asynchronous request per entity kind
pub trait RemoteFetch: Send + Sync {
    fn fetch_user(&self, user_id: Snowflake, on_complete: FetchCallback<RawUser>);

    fn fetch_guild(&self, guild_id: Snowflake, on_complete: FetchCallback<RawGuild>);

    fn fetch_channel(&self, channel_id: Snowflake, on_complete: FetchCallback<RawChannel>);

    fn fetch_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        on_complete: FetchCallback<RawMember>,
    );

    fn fetch_role(
        &self,
        guild_id: Snowflake,
        role_id: Snowflake,
        on_complete: FetchCallback<RawRole>,
    );

    /// Every role of a guild in one request
    fn fetch_roles(&self, guild_id: Snowflake, on_complete: FetchCallback<Vec<RawRole>>);

    /// Ids of every guild the bot account belongs to. The platform returns
    /// partial guild records here, so callers fetch each guild in full.
    fn fetch_current_user_guilds(&self, on_complete: FetchCallback<Vec<Snowflake>>);
}
