//! Gatekeeper - Guild Welcome & Verification Bot
//!
//! TigerStyle: A lazily populated entity cache over an asynchronous platform API.
//!
//! The platform only answers fetches through callbacks that arrive later on
//! some worker thread. The bot's logic wants plain synchronous lookups. The
//! pieces, leaves first:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  bot            ready / member join / verify click   │
//! ├──────────────────────────────────────────────────────┤
//! │  resolver       get-or-fetch per entity kind         │
//! │  materialize    insert, wire back-references, hooks  │
//! ├──────────────────────────────────────────────────────┤
//! │  store/entity   typed maps keyed by Snowflake        │
//! │  bridge         one async fetch -> one blocking wait │
//! ├──────────────────────────────────────────────────────┤
//! │  remote         callback fetch seam (sim: in-proc)   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Resolver calls block the calling thread. Never call them from an async
//! executor thread; use `tokio::task::spawn_blocking` or a plain thread.

pub mod bot;
pub mod bridge;
pub mod config;
pub mod entity;
pub mod hooks;
mod materialize;
pub mod persistence;
pub mod remote;
pub mod resolver;
pub mod sim;
pub mod store;

pub use bridge::{BridgeError, BridgeToken, ReleaseHandle};
pub use entity::{
    CachedChannel, CachedGuild, CachedUser, EntityKind, GuildChannel, GuildConfig, GuildMember,
    GuildRole, RawChannel, RawGuild, RawMember, RawRole, RawUser, Snowflake,
};
pub use hooks::{EntityEvent, EntityObserver, Hooks};
pub use remote::{FetchCallback, FetchError, FetchKey, RemoteFetch};
pub use resolver::{NameMatch, ResolveError, Resolver, ResolverStats, ResolverStatsSnapshot};
pub use store::{EntityStore, SharedEntityStore};

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Application name
pub const APP_NAME: &str = "gatekeeper";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default deadline for one bridged fetch
pub const FETCH_TIMEOUT_MS_DEFAULT: u64 = 10_000;

/// Name looked up when a guild has no verified role configured
pub const VERIFIED_ROLE_NAME_DEFAULT: &str = "Verified";

/// Custom id carried by the welcome message's button
pub const VERIFY_BUTTON_ID: &str = "verify_button";
