//! Resolver behavior against the simulated platform.
//!
//! Resolver calls block, so every test drives them from plain threads while
//! a multi-thread runtime serves the fetches.

use gatekeeper::config::ResolverConfig;
use gatekeeper::entity::{RawChannel, RawGuild, RawMember, RawRole, RawUser};
use gatekeeper::sim::{PlatformDirectory, SimConfig, SimulatedPlatform};
use gatekeeper::{
    EntityEvent, EntityKind, EntityStore, FetchCallback, FetchKey, Hooks, NameMatch, RemoteFetch,
    ResolveError, Resolver, Snowflake,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn id(raw: u64) -> Snowflake {
    Snowflake::new(raw).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn directory() -> PlatformDirectory {
    PlatformDirectory {
        users: vec![
            RawUser {
                id: id(5),
                username: "ada".to_string(),
                global_name: Some("Ada L.".to_string()),
            },
            RawUser {
                id: id(6),
                username: "grace".to_string(),
                global_name: None,
            },
        ],
        guilds: vec![
            RawGuild {
                id: id(100),
                name: "Lobby".to_string(),
                system_channel_id: Some(id(200)),
            },
            RawGuild {
                id: id(101),
                name: "Workshop".to_string(),
                system_channel_id: None,
            },
        ],
        channels: vec![RawChannel {
            id: id(200),
            name: "welcome".to_string(),
            guild_id: Some(id(100)),
        }],
        roles: vec![RawRole {
            id: id(7),
            guild_id: id(100),
            name: "Verified".to_string(),
        }],
        members: vec![
            RawMember {
                guild_id: id(100),
                user_id: id(5),
                nick: Some("ada".to_string()),
                roles: vec![],
            },
            // Membership whose account the platform no longer knows
            RawMember {
                guild_id: id(100),
                user_id: id(9),
                nick: None,
                roles: vec![],
            },
        ],
        bot_guilds: vec![id(100), id(101), id(404)],
    }
}

struct Env {
    _runtime: tokio::runtime::Runtime,
    sim: SimulatedPlatform,
    resolver: Resolver,
}

fn env_with(config: ResolverConfig, hooks: Arc<Hooks>) -> Env {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let sim = SimulatedPlatform::new(
        runtime.handle().clone(),
        directory(),
        SimConfig::with_seed(7)
            .with_latency(Duration::from_millis(1))
            .with_jitter(Duration::from_millis(3)),
    );
    let resolver = Resolver::with_hooks(
        Arc::new(EntityStore::new()),
        Arc::new(sim.clone()),
        hooks,
        config,
    );
    Env {
        _runtime: runtime,
        sim,
        resolver,
    }
}

fn env() -> Env {
    env_with(
        ResolverConfig::new().with_fetch_timeout(Duration::from_secs(5)),
        Arc::new(Hooks::new()),
    )
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached within 5s");
        thread::sleep(Duration::from_millis(2));
    }
}

// =============================================================================
// Hits and misses
// =============================================================================

#[test]
fn test_repeat_lookup_returns_same_entry() {
    let env = env();

    let first = env.resolver.resolve_user(id(5)).unwrap();
    let second = env.resolver.resolve_user(id(5)).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.display_name(), "Ada L.");
    assert_eq!(env.sim.fetch_count(FetchKey::User(id(5))), 1);

    let stats = env.resolver.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.fetches_issued, 1);
}

#[test]
fn test_guild_cascades_welcome_channel() {
    let env = env();

    let guild = env.resolver.resolve_guild(id(100)).unwrap();

    // Cached before the guild lookup returned
    let welcome = guild.welcome_channel().unwrap();
    assert_eq!(welcome.id(), id(200));
    assert_eq!(welcome.name(), "welcome");
    assert!(Arc::ptr_eq(&welcome.guild(env.resolver.store()).unwrap(), &guild));
    assert!(env.resolver.store().channel(id(200)).is_some());

    // Any later lookup of channel 200 is served from the cache
    let again = env.resolver.resolve_guild_channel(&guild, id(200)).unwrap();
    assert!(Arc::ptr_eq(&welcome, &again));
    assert!(env.resolver.resolve_channel(id(200)).is_some());
    assert!(env.resolver.resolve_welcome_channel(&guild).is_some());
    assert_eq!(env.sim.fetch_count(FetchKey::Channel(id(200))), 1);
}

#[test]
fn test_guild_without_welcome_channel() {
    let env = env();

    let guild = env.resolver.resolve_guild(id(101)).unwrap();
    assert!(guild.welcome_channel().is_none());
    assert!(env.resolver.resolve_welcome_channel(&guild).is_none());
    assert_eq!(env.sim.total_fetches(), 1);
}

#[test]
fn test_member_back_references() {
    let env = env();
    let store = env.resolver.store();

    let guild = env.resolver.resolve_guild(id(100)).unwrap();
    let member = env.resolver.resolve_member(&guild, id(5)).unwrap();

    assert_eq!(member.nickname(), Some("ada"));
    assert!(Arc::ptr_eq(&member.guild(store).unwrap(), &guild));
    assert!(Arc::ptr_eq(
        &member.user(store).unwrap(),
        &store.user(id(5)).unwrap()
    ));
    assert!(Arc::ptr_eq(&guild.member(id(5)).unwrap(), &member));
}

#[test]
fn test_member_without_user_is_not_cached() {
    let env = env();

    let guild = env.resolver.resolve_guild(id(100)).unwrap();
    let err = env.resolver.try_resolve_member(&guild, id(9)).unwrap_err();

    assert!(matches!(
        err,
        gatekeeper::ResolveError::MissingDependency {
            dependency: FetchKey::User(_),
            ..
        }
    ));
    assert!(guild.member(id(9)).is_none());
    assert_eq!(guild.member_count(), 0);
}

#[test]
fn test_resolve_all_guilds_skips_failures() {
    let env = env();

    let mut ids: Vec<_> = env
        .resolver
        .resolve_all_guilds()
        .iter()
        .map(|guild| guild.id())
        .collect();
    ids.sort();

    assert_eq!(ids, vec![id(100), id(101)]);
    assert_eq!(env.resolver.store().guild_count(), 2);
    assert_eq!(env.sim.fetch_count(FetchKey::CurrentUserGuilds), 1);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_misses_share_one_fetch() {
    let env = env();
    env.sim.close_gate();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let resolver = env.resolver.clone();
            thread::spawn(move || resolver.resolve_user(id(5)))
        })
        .collect();

    let resolver = env.resolver.clone();
    wait_until(move || resolver.stats().coalesced == 1);
    env.sim.open_gate();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();

    assert!(Arc::ptr_eq(&results[0], &results[1]));
    assert_eq!(env.sim.fetch_count(FetchKey::User(id(5))), 1);
    assert_eq!(env.resolver.in_flight_count(), 0);
}

#[test]
fn test_uncoalesced_race_first_writer_wins() {
    let hooks = Arc::new(Hooks::new());
    let added = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&added);
    hooks.register_fn(EntityKind::User, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let env = env_with(
        ResolverConfig::new()
            .with_fetch_timeout(Duration::from_secs(5))
            .with_coalescing(false),
        hooks,
    );
    env.sim.close_gate();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let resolver = env.resolver.clone();
            thread::spawn(move || resolver.resolve_user(id(6)))
        })
        .collect();

    let sim = env.sim.clone();
    wait_until(move || sim.fetch_count(FetchKey::User(id(6))) == 2);
    env.sim.open_gate();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();

    assert!(Arc::ptr_eq(&results[0], &results[1]));
    assert_eq!(env.resolver.store().user_count(), 1);
    assert_eq!(env.resolver.stats().duplicates_discarded, 1);
    assert_eq!(added.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_not_found_is_not_cached() {
    let env = env();

    assert!(env.resolver.resolve_user(id(8)).is_none());
    assert!(env.resolver.try_resolve_user(id(8)).unwrap_err().is_not_found());

    env.sim.insert_user(RawUser {
        id: id(8),
        username: "late".to_string(),
        global_name: None,
    });
    let user = env.resolver.resolve_user(id(8)).unwrap();

    assert_eq!(user.username(), "late");
    assert_eq!(env.sim.fetch_count(FetchKey::User(id(8))), 3);
    assert_eq!(env.resolver.stats().failures, 1);
}

#[test]
fn test_api_error_then_retry() {
    let env = env();
    env.sim.fail_next(FetchKey::Guild(id(100)), 1);

    let err = env.resolver.try_resolve_guild(id(100)).unwrap_err();
    assert!(matches!(err, gatekeeper::ResolveError::Api { .. }));
    assert!(env.resolver.store().guild(id(100)).is_none());

    assert!(env.resolver.resolve_guild(id(100)).is_some());
    assert_eq!(env.sim.fetch_count(FetchKey::Guild(id(100))), 2);
}

#[test]
fn test_welcome_channel_failure_keeps_guild() {
    let env = env();
    env.sim.remove_channel(id(200));

    let guild = env.resolver.resolve_guild(id(100)).unwrap();

    assert_eq!(guild.config().welcome_channel_id, Some(id(200)));
    assert!(guild.welcome_channel().is_none());
    assert_eq!(guild.channel_count(), 0);
}

#[test]
fn test_timeout_then_retry() {
    let env = env_with(
        ResolverConfig::new().with_fetch_timeout(Duration::from_millis(50)),
        Arc::new(Hooks::new()),
    );
    env.sim.close_gate();

    let err = env.resolver.try_resolve_user(id(5)).unwrap_err();
    assert!(matches!(err, gatekeeper::ResolveError::TimedOut { .. }));
    assert_eq!(env.resolver.stats().timeouts, 1);
    assert_eq!(env.resolver.in_flight_count(), 0);

    env.sim.open_gate();
    let user = env.resolver.resolve_user(id(5)).unwrap();
    assert_eq!(user.username(), "ada");
    assert_eq!(env.resolver.store().user_count(), 1);
}

// =============================================================================
// Roles
// =============================================================================

#[test]
fn test_role_lookup_by_name_never_fetches() {
    let env = env();
    let guild = env.resolver.resolve_guild(id(100)).unwrap();

    assert!(env.resolver.resolve_role_by_name(&guild, "Verified").is_none());
    assert_eq!(env.sim.fetch_count(FetchKey::GuildRoles(id(100))), 0);

    assert_eq!(env.resolver.refresh_roles(&guild).unwrap(), 1);
    let role = env.resolver.resolve_role_by_name(&guild, "Verified").unwrap();
    assert_eq!(role.id(), id(7));
    assert!(env
        .resolver
        .find_role_by_name(&guild, "verified", NameMatch::IgnoreCase)
        .is_some());
    assert!(env.resolver.resolve_role_by_name(&guild, "verified").is_none());

    // Already cached by the refresh
    let by_id = env.resolver.resolve_role(&guild, id(7)).unwrap();
    assert!(Arc::ptr_eq(&by_id, &role));
    assert_eq!(env.sim.fetch_count(FetchKey::Role { guild_id: id(100), role_id: id(7) }), 0);
}

// =============================================================================
// Hooks and removal
// =============================================================================

#[test]
fn test_hooks_fire_once_per_insert() {
    let hooks = Arc::new(Hooks::new());
    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    hooks.register_all(Arc::new(move |event: &EntityEvent| {
        sink.lock().push((event.kind(), event.id()));
    }));

    let env = env_with(
        ResolverConfig::new().with_fetch_timeout(Duration::from_secs(5)),
        hooks,
    );

    let guild = env.resolver.resolve_guild(id(100)).unwrap();
    env.resolver.resolve_guild(id(100)).unwrap();
    env.resolver.resolve_member(&guild, id(5)).unwrap();

    let mut seen = events.lock().clone();
    seen.sort_by_key(|(kind, id)| (kind.as_str(), *id));
    assert_eq!(
        seen,
        vec![
            (EntityKind::Channel, id(200)),
            (EntityKind::Guild, id(100)),
            (EntityKind::GuildChannel, id(200)),
            (EntityKind::Member, id(5)),
            (EntityKind::User, id(5)),
        ]
    );
}

#[test]
fn test_removed_guild_is_refetched() {
    let env = env();
    let store = env.resolver.store();

    let guild = env.resolver.resolve_guild(id(100)).unwrap();
    let member = env.resolver.resolve_member(&guild, id(5)).unwrap();

    store.remove_guild(id(100)).unwrap();
    assert!(member.guild(store).is_none());
    assert!(guild.welcome_channel().is_none());

    let fresh = env.resolver.resolve_guild(id(100)).unwrap();
    assert!(!Arc::ptr_eq(&fresh, &guild));
    assert!(fresh.welcome_channel().is_some());
    assert_eq!(env.sim.fetch_count(FetchKey::Guild(id(100))), 2);
    // The top-level channel survived, so linking it needed no fetch
    assert_eq!(env.sim.fetch_count(FetchKey::Channel(id(200))), 1);
}

// =============================================================================
// Mismatched records
// =============================================================================

/// Answers role requests from another guild's role list
struct CrossWiredRoles {
    inner: SimulatedPlatform,
    serve_from: Snowflake,
}

impl RemoteFetch for CrossWiredRoles {
    fn fetch_user(&self, user_id: Snowflake, on_complete: FetchCallback<RawUser>) {
        self.inner.fetch_user(user_id, on_complete);
    }

    fn fetch_guild(&self, guild_id: Snowflake, on_complete: FetchCallback<RawGuild>) {
        self.inner.fetch_guild(guild_id, on_complete);
    }

    fn fetch_channel(&self, channel_id: Snowflake, on_complete: FetchCallback<RawChannel>) {
        self.inner.fetch_channel(channel_id, on_complete);
    }

    fn fetch_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        on_complete: FetchCallback<RawMember>,
    ) {
        self.inner.fetch_member(guild_id, user_id, on_complete);
    }

    fn fetch_role(
        &self,
        _guild_id: Snowflake,
        role_id: Snowflake,
        on_complete: FetchCallback<RawRole>,
    ) {
        self.inner.fetch_role(self.serve_from, role_id, on_complete);
    }

    fn fetch_roles(&self, guild_id: Snowflake, on_complete: FetchCallback<Vec<RawRole>>) {
        self.inner.fetch_roles(guild_id, on_complete);
    }

    fn fetch_current_user_guilds(&self, on_complete: FetchCallback<Vec<Snowflake>>) {
        self.inner.fetch_current_user_guilds(on_complete);
    }
}

#[test]
fn test_role_of_other_guild_is_rejected() {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let sim = SimulatedPlatform::new(
        runtime.handle().clone(),
        directory(),
        SimConfig::default().with_latency(Duration::from_millis(1)),
    );
    sim.insert_role(RawRole {
        id: id(17),
        guild_id: id(101),
        name: "Workshop crew".to_string(),
    });
    let resolver = Resolver::new(
        Arc::new(EntityStore::new()),
        Arc::new(CrossWiredRoles {
            inner: sim,
            serve_from: id(101),
        }),
        ResolverConfig::new().with_fetch_timeout(Duration::from_secs(5)),
    );

    let guild = resolver.resolve_guild(id(100)).unwrap();
    let err = resolver.try_resolve_role(&guild, id(17)).unwrap_err();

    assert!(matches!(
        err,
        ResolveError::WrongGuild { expected, actual, .. } if expected == id(100) && actual == id(101)
    ));
    assert!(guild.role(id(17)).is_none());
    assert_eq!(resolver.in_flight_count(), 0);
}

#[test]
fn test_guild_removed_while_member_resolves() {
    // Removes the guild as soon as the member's user lands, which is after
    // the member record arrived but before it is linked.
    let hooks = Arc::new(Hooks::new());
    let target: Arc<parking_lot::Mutex<Option<Arc<EntityStore>>>> =
        Arc::new(parking_lot::Mutex::new(None));
    let remover = Arc::clone(&target);
    hooks.register_fn(EntityKind::User, move |_event: &EntityEvent| {
        if let Some(store) = remover.lock().as_ref() {
            store.remove_guild(id(100));
        }
    });

    let env = env_with(
        ResolverConfig::new().with_fetch_timeout(Duration::from_secs(5)),
        hooks,
    );
    let guild = env.resolver.resolve_guild(id(100)).unwrap();
    *target.lock() = Some(Arc::clone(env.resolver.store()));

    let err = env.resolver.try_resolve_member(&guild, id(5)).unwrap_err();

    assert!(matches!(err, ResolveError::Vanished { key } if key == FetchKey::Guild(id(100))));
    assert_eq!(guild.member_count(), 0);
    assert!(env.resolver.store().guild(id(100)).is_none());
    // The user itself was cached before the guild went away
    assert!(env.resolver.store().user(id(5)).is_some());
}
