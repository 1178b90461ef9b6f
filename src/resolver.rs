//! Lazy Resolver
//!
//! TigerStyle: Get-or-fetch, synchronous to the caller.
//!
//! A hit returns the cached `Arc`. A miss claims the fetch key, issues one
//! remote fetch whose callback materializes the result into the store, then
//! blocks on the claim's bridge token and re-reads the map. The insert path
//! is the only place that wires cross-references, so the resolver never
//! hands out a value that is not in the store.
//!
//! Concurrent misses for the same key join the first miss's token when
//! [`ResolverConfig::coalesce_in_flight`] is set. Without it both fetches
//! run and the first completion wins the insert.
//!
//! Every call here may block for a full round trip (several, when a
//! dependency cascades). Do not call from an async executor thread.

use crate::bridge::{BridgeError, BridgeToken, ReleaseHandle};
use crate::config::ResolverConfig;
use crate::entity::{
    CachedChannel, CachedGuild, CachedUser, GuildChannel, GuildMember, GuildRole, Snowflake,
};
use crate::hooks::Hooks;
use crate::remote::{FetchError, FetchKey, RemoteFetch};
use crate::store::SharedEntityStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a fetch callback reports back through the bridge
pub(crate) type FetchOutcome = Result<(), ResolveError>;

// =============================================================================
// Errors
// =============================================================================

/// Why an entity could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("{key} does not exist")]
    NotFound { key: FetchKey },

    #[error("API error resolving {key}: {message}")]
    Api {
        key: FetchKey,
        message: String,
        reasons: Vec<String>,
    },

    #[error("timed out after {after:?} waiting for {key}")]
    TimedOut { key: FetchKey, after: Duration },

    #[error("fetch for {key} completed without a result")]
    Abandoned { key: FetchKey },

    #[error("cannot cache {key}: {dependency} could not be resolved")]
    MissingDependency { key: FetchKey, dependency: FetchKey },

    #[error("{key} belongs to guild {actual}, not guild {expected}")]
    WrongGuild {
        key: FetchKey,
        expected: Snowflake,
        actual: Snowflake,
    },

    #[error("{key} was removed before it could be read")]
    Vanished { key: FetchKey },
}

impl From<FetchError> for ResolveError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::NotFound { key } => Self::NotFound { key },
            FetchError::Api {
                key,
                message,
                reasons,
            } => Self::Api {
                key,
                message,
                reasons,
            },
        }
    }
}

impl ResolveError {
    pub(crate) fn from_bridge(key: FetchKey, error: BridgeError) -> Self {
        match error {
            BridgeError::TimedOut { after } => Self::TimedOut { key, after },
            BridgeError::Abandoned => Self::Abandoned { key },
        }
    }

    pub fn key(&self) -> FetchKey {
        match self {
            Self::NotFound { key }
            | Self::Api { key, .. }
            | Self::TimedOut { key, .. }
            | Self::Abandoned { key }
            | Self::MissingDependency { key, .. }
            | Self::WrongGuild { key, .. }
            | Self::Vanished { key } => *key,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Counters since construction
#[derive(Debug, Default)]
pub struct ResolverStats {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches_issued: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    duplicates_discarded: AtomicU64,
}

/// Point-in-time copy of [`ResolverStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolverStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fetches_issued: u64,
    pub coalesced: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub duplicates_discarded: u64,
}

impl ResolverStats {
    pub fn snapshot(&self) -> ResolverStatsSnapshot {
        ResolverStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches_issued: self.fetches_issued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            duplicates_discarded: self.duplicates_discarded.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        Self::bump(&self.duplicates_discarded);
    }
}

// =============================================================================
// Completion Guard
// =============================================================================

/// Owned by one fetch callback. Finishing or dropping it drops the in-flight
/// claim first and then releases the bridge, so a caller woken by the
/// release never sees its own stale claim.
pub(crate) struct Completion {
    claim: Option<(Resolver, FetchKey, BridgeToken<FetchOutcome>)>,
    handle: Option<ReleaseHandle<FetchOutcome>>,
}

impl Completion {
    pub(crate) fn finish(mut self, outcome: FetchOutcome) {
        self.drop_claim();
        if let Some(handle) = self.handle.take() {
            handle.complete(outcome);
        }
    }

    fn drop_claim(&mut self) {
        if let Some((resolver, key, token)) = self.claim.take() {
            resolver.release_claim(key, &token);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // Handle field drops after this, releasing waiters as abandoned.
        self.drop_claim();
    }
}

// =============================================================================
// Resolver
// =============================================================================

struct Shared {
    store: SharedEntityStore,
    remote: Arc<dyn RemoteFetch>,
    hooks: Arc<Hooks>,
    config: ResolverConfig,
    in_flight: Mutex<HashMap<FetchKey, BridgeToken<FetchOutcome>>>,
    stats: ResolverStats,
}

/// Name comparison for cached role lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMatch {
    Exact,
    IgnoreCase,
}

/// Synchronous, lazily populating view over the entity store. Cheap to clone.
#[derive(Clone)]
pub struct Resolver {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.shared.config)
            .field("stats", &self.shared.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl Resolver {
    pub fn new(
        store: SharedEntityStore,
        remote: Arc<dyn RemoteFetch>,
        config: ResolverConfig,
    ) -> Self {
        Self::with_hooks(store, remote, Arc::new(Hooks::new()), config)
    }

    pub fn with_hooks(
        store: SharedEntityStore,
        remote: Arc<dyn RemoteFetch>,
        hooks: Arc<Hooks>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                remote,
                hooks,
                config,
                in_flight: Mutex::new(HashMap::new()),
                stats: ResolverStats::default(),
            }),
        }
    }

    pub fn store(&self) -> &SharedEntityStore {
        &self.shared.store
    }

    pub fn hooks(&self) -> &Hooks {
        &self.shared.hooks
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> ResolverStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &ResolverStats {
        &self.shared.stats
    }

    pub(crate) fn remote(&self) -> &dyn RemoteFetch {
        self.shared.remote.as_ref()
    }

    /// Number of fetches currently claimed
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    // -------------------------------------------------------------------------
    // Top-level entities
    // -------------------------------------------------------------------------

    pub fn resolve_user(&self, user_id: Snowflake) -> Option<Arc<CachedUser>> {
        self.logged(self.try_resolve_user(user_id))
    }

    pub fn try_resolve_user(&self, user_id: Snowflake) -> Result<Arc<CachedUser>, ResolveError> {
        let key = FetchKey::User(user_id);
        self.get_or_fetch(
            key,
            || self.store().user(user_id),
            |completion| {
                let this = self.clone();
                self.remote().fetch_user(
                    user_id,
                    Box::new(move |result| completion.finish(this.materialize_user(key, result))),
                );
            },
        )
    }

    pub fn resolve_guild(&self, guild_id: Snowflake) -> Option<Arc<CachedGuild>> {
        self.logged(self.try_resolve_guild(guild_id))
    }

    pub fn try_resolve_guild(&self, guild_id: Snowflake) -> Result<Arc<CachedGuild>, ResolveError> {
        let key = FetchKey::Guild(guild_id);
        self.get_or_fetch(
            key,
            || self.store().guild(guild_id),
            |completion| {
                let this = self.clone();
                self.remote().fetch_guild(
                    guild_id,
                    Box::new(move |result| completion.finish(this.materialize_guild(key, result))),
                );
            },
        )
    }

    pub fn resolve_channel(&self, channel_id: Snowflake) -> Option<Arc<CachedChannel>> {
        self.logged(self.try_resolve_channel(channel_id))
    }

    pub fn try_resolve_channel(
        &self,
        channel_id: Snowflake,
    ) -> Result<Arc<CachedChannel>, ResolveError> {
        let key = FetchKey::Channel(channel_id);
        self.get_or_fetch(
            key,
            || self.store().channel(channel_id),
            |completion| {
                let this = self.clone();
                self.remote().fetch_channel(
                    channel_id,
                    Box::new(move |result| completion.finish(this.materialize_channel(key, result))),
                );
            },
        )
    }

    /// Every guild the bot belongs to, each fetched in full.
    ///
    /// Guilds are resolved one after another; a guild that fails is logged
    /// and left out.
    pub fn resolve_all_guilds(&self) -> Vec<Arc<CachedGuild>> {
        let ids = match self.fetch_current_user_guilds() {
            Ok(ids) => ids,
            Err(error) => {
                self.record_failure(&error);
                return Vec::new();
            }
        };

        tracing::info!("Handling {} guilds", ids.len());
        ids.into_iter()
            .filter_map(|guild_id| self.resolve_guild(guild_id))
            .collect()
    }

    fn fetch_current_user_guilds(&self) -> Result<Vec<Snowflake>, ResolveError> {
        let key = FetchKey::CurrentUserGuilds;
        let token = BridgeToken::<Result<Vec<Snowflake>, ResolveError>>::begin();
        let handle = token.release_handle();

        ResolverStats::bump(&self.shared.stats.fetches_issued);
        self.remote().fetch_current_user_guilds(Box::new(move |result| {
            handle.complete(result.map_err(ResolveError::from));
        }));

        match token.wait_timeout(self.config().fetch_timeout) {
            Ok(outcome) => outcome,
            Err(error) => Err(ResolveError::from_bridge(key, error)),
        }
    }

    // -------------------------------------------------------------------------
    // Guild-scoped entities
    // -------------------------------------------------------------------------

    pub fn resolve_guild_channel(
        &self,
        guild: &Arc<CachedGuild>,
        channel_id: Snowflake,
    ) -> Option<Arc<GuildChannel>> {
        self.logged(self.try_resolve_guild_channel(guild, channel_id))
    }

    /// The guild's view of a channel. A miss resolves the top-level channel
    /// (fetching it if needed) and links it into the guild.
    pub fn try_resolve_guild_channel(
        &self,
        guild: &Arc<CachedGuild>,
        channel_id: Snowflake,
    ) -> Result<Arc<GuildChannel>, ResolveError> {
        self.debug_assert_live(guild);

        if let Some(hit) = guild.channel(channel_id) {
            ResolverStats::bump(&self.shared.stats.hits);
            return Ok(hit);
        }
        ResolverStats::bump(&self.shared.stats.misses);

        let channel = self.try_resolve_channel(channel_id)?;
        self.materialize_guild_channel(guild, &channel)
    }

    /// The guild's configured welcome channel, resolved on demand
    pub fn resolve_welcome_channel(&self, guild: &Arc<CachedGuild>) -> Option<Arc<GuildChannel>> {
        let channel_id = guild.config().welcome_channel_id?;
        self.resolve_guild_channel(guild, channel_id)
    }

    pub fn resolve_member(
        &self,
        guild: &Arc<CachedGuild>,
        user_id: Snowflake,
    ) -> Option<Arc<GuildMember>> {
        self.logged(self.try_resolve_member(guild, user_id))
    }

    pub fn try_resolve_member(
        &self,
        guild: &Arc<CachedGuild>,
        user_id: Snowflake,
    ) -> Result<Arc<GuildMember>, ResolveError> {
        self.debug_assert_live(guild);

        let guild_id = guild.id();
        let key = FetchKey::Member { guild_id, user_id };
        self.get_or_fetch(
            key,
            || guild.member(user_id),
            |completion| {
                let this = self.clone();
                self.remote().fetch_member(
                    guild_id,
                    user_id,
                    Box::new(move |result| completion.finish(this.materialize_member(key, result))),
                );
            },
        )
    }

    pub fn resolve_role(
        &self,
        guild: &Arc<CachedGuild>,
        role_id: Snowflake,
    ) -> Option<Arc<GuildRole>> {
        self.logged(self.try_resolve_role(guild, role_id))
    }

    pub fn try_resolve_role(
        &self,
        guild: &Arc<CachedGuild>,
        role_id: Snowflake,
    ) -> Result<Arc<GuildRole>, ResolveError> {
        self.debug_assert_live(guild);

        let guild_id = guild.id();
        let key = FetchKey::Role { guild_id, role_id };
        self.get_or_fetch(
            key,
            || guild.role(role_id),
            |completion| {
                let this = self.clone();
                let owner = Arc::clone(guild);
                self.remote().fetch_role(
                    guild_id,
                    role_id,
                    Box::new(move |result| {
                        completion.finish(this.materialize_role(&owner, key, result))
                    }),
                );
            },
        )
    }

    /// Fetch every role of the guild and cache the ones not yet cached.
    /// Returns how many roles the guild has cached afterwards.
    pub fn refresh_roles(&self, guild: &Arc<CachedGuild>) -> Result<usize, ResolveError> {
        self.debug_assert_live(guild);

        let guild_id = guild.id();
        let key = FetchKey::GuildRoles(guild_id);
        let outcome = self.fetch_and_insert(key, |completion| {
            let this = self.clone();
            let owner = Arc::clone(guild);
            self.remote().fetch_roles(
                guild_id,
                Box::new(move |result| completion.finish(this.materialize_roles(&owner, key, result))),
            );
        });

        match outcome {
            Ok(()) => Ok(guild.role_count()),
            Err(error) => {
                self.record_failure(&error);
                Err(error)
            }
        }
    }

    /// Exact-name lookup over cached roles only. Never fetches.
    pub fn resolve_role_by_name(&self, guild: &Arc<CachedGuild>, name: &str) -> Option<Arc<GuildRole>> {
        self.find_role_by_name(guild, name, NameMatch::Exact)
    }

    /// Name lookup over cached roles only. Several matches resolve to the
    /// lowest id.
    pub fn find_role_by_name(
        &self,
        guild: &Arc<CachedGuild>,
        name: &str,
        matching: NameMatch,
    ) -> Option<Arc<GuildRole>> {
        let wanted = match matching {
            NameMatch::Exact => name.to_string(),
            NameMatch::IgnoreCase => name.to_lowercase(),
        };

        guild
            .roles()
            .into_iter()
            .filter(|role| match matching {
                NameMatch::Exact => role.name() == wanted,
                NameMatch::IgnoreCase => role.name().to_lowercase() == wanted,
            })
            .min_by_key(|role| role.id())
    }

    // -------------------------------------------------------------------------
    // Get-or-fetch machinery
    // -------------------------------------------------------------------------

    fn get_or_fetch<T>(
        &self,
        key: FetchKey,
        lookup: impl Fn() -> Option<Arc<T>>,
        issue: impl FnOnce(Completion),
    ) -> Result<Arc<T>, ResolveError> {
        if let Some(hit) = lookup() {
            ResolverStats::bump(&self.shared.stats.hits);
            return Ok(hit);
        }
        ResolverStats::bump(&self.shared.stats.misses);

        // Re-read either way: a racing fetch may have inserted even if ours failed.
        match self.fetch_and_insert(key, issue) {
            Ok(()) => lookup().ok_or(ResolveError::Vanished { key }),
            Err(error) => lookup().ok_or(error),
        }
    }

    /// Claim `key`, issue the fetch if this caller owns the claim, and wait
    /// for the callback to finish materializing.
    pub(crate) fn fetch_and_insert(
        &self,
        key: FetchKey,
        issue: impl FnOnce(Completion),
    ) -> FetchOutcome {
        let (token, completion) = self.claim(key);

        if let Some(completion) = completion {
            ResolverStats::bump(&self.shared.stats.fetches_issued);
            tracing::trace!(key = %key, "issuing fetch");
            issue(completion);
        }

        match token.wait_timeout(self.config().fetch_timeout) {
            Ok(outcome) => outcome,
            Err(error) => {
                if matches!(error, BridgeError::TimedOut { .. }) {
                    ResolverStats::bump(&self.shared.stats.timeouts);
                    self.release_claim(key, &token);
                }
                Err(ResolveError::from_bridge(key, error))
            }
        }
    }

    fn claim(&self, key: FetchKey) -> (BridgeToken<FetchOutcome>, Option<Completion>) {
        if !self.config().coalesce_in_flight {
            let token = BridgeToken::begin();
            let completion = Completion {
                claim: None,
                handle: Some(token.release_handle()),
            };
            return (token, Some(completion));
        }

        let mut in_flight = self.shared.in_flight.lock();
        if let Some(existing) = in_flight.get(&key) {
            if existing.is_pending() {
                ResolverStats::bump(&self.shared.stats.coalesced);
                tracing::trace!(key = %key, "joining in-flight fetch");
                return (existing.clone(), None);
            }
        }

        let token = BridgeToken::begin();
        in_flight.insert(key, token.clone());
        drop(in_flight);

        let completion = Completion {
            claim: Some((self.clone(), key, token.clone())),
            handle: Some(token.release_handle()),
        };
        (token, Some(completion))
    }

    fn release_claim(&self, key: FetchKey, token: &BridgeToken<FetchOutcome>) {
        let mut in_flight = self.shared.in_flight.lock();
        if in_flight.get(&key).is_some_and(|claimed| claimed.same_token(token)) {
            in_flight.remove(&key);
        }
    }

    fn logged<T>(&self, result: Result<Arc<T>, ResolveError>) -> Option<Arc<T>> {
        match result {
            Ok(entry) => Some(entry),
            Err(error) => {
                self.record_failure(&error);
                None
            }
        }
    }

    fn record_failure(&self, error: &ResolveError) {
        ResolverStats::bump(&self.shared.stats.failures);
        let key = error.key();

        match error {
            ResolveError::NotFound { .. } => {
                tracing::info!(kind = key.kind(), key = %key, "entity not found");
            }
            ResolveError::Api { message, reasons, .. } => {
                tracing::warn!(
                    kind = key.kind(),
                    key = %key,
                    message = %message,
                    reasons = ?reasons,
                    "API error while resolving entity"
                );
            }
            _ => {
                tracing::warn!(kind = key.kind(), key = %key, error = %error, "failed to resolve entity");
            }
        }
    }

    fn debug_assert_live(&self, guild: &Arc<CachedGuild>) {
        debug_assert!(
            self.store().is_live_guild(guild),
            "guild {} passed to a guild-scoped resolver is not the cached entry",
            guild.id()
        );
    }
}
