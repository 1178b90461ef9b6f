//! Simulated Platform
//!
//! TigerStyle: Deterministic, controllable remote for the demo and for tests.
//!
//! An in-memory [`PlatformDirectory`] served through [`RemoteFetch`]. Every
//! fetch is counted synchronously, then a task on the given tokio runtime
//! sleeps for the configured latency, waits for the gate to open, and hands
//! the callback to the blocking pool. Callbacks are free to block on nested
//! resolver calls there.
//!
//! Fault injection:
//! - `api_error_rate` fails a seeded random share of fetches
//! - [`SimulatedPlatform::fail_next`] fails the next N fetches of one key
//! - [`SimulatedPlatform::close_gate`] holds every delivery until reopened

use crate::entity::{RawChannel, RawGuild, RawMember, RawRole, RawUser, Snowflake};
use crate::remote::{FetchCallback, FetchError, FetchKey, RemoteFetch};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Default one-way latency of a simulated fetch
pub const SIM_LATENCY_MS_DEFAULT: u64 = 5;

/// Default seed for jitter and fault injection
pub const SIM_SEED_DEFAULT: u64 = 42;

// =============================================================================
// Configuration
// =============================================================================

/// Latency and fault behavior of the simulated platform
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub latency: Duration,
    /// Upper bound of the random extra delay added to each fetch
    pub jitter: Duration,
    /// Probability in `[0, 1]` that a fetch fails with an API error
    pub api_error_rate: f64,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(SIM_LATENCY_MS_DEFAULT),
            jitter: Duration::ZERO,
            api_error_rate: 0.0,
            seed: SIM_SEED_DEFAULT,
        }
    }
}

impl SimConfig {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_api_error_rate(mut self, rate: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&rate),
            "api_error_rate must be within [0, 1], got {}",
            rate
        );
        self.api_error_rate = rate;
        self
    }
}

// =============================================================================
// Directory & Fixture
// =============================================================================

/// Everything the simulated platform knows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformDirectory {
    #[serde(default)]
    pub users: Vec<RawUser>,
    #[serde(default)]
    pub guilds: Vec<RawGuild>,
    #[serde(default)]
    pub channels: Vec<RawChannel>,
    #[serde(default)]
    pub roles: Vec<RawRole>,
    #[serde(default)]
    pub members: Vec<RawMember>,
    /// Guilds the bot account belongs to. Empty means every listed guild.
    #[serde(default)]
    pub bot_guilds: Vec<Snowflake>,
}

impl PlatformDirectory {
    pub fn user(&self, user_id: Snowflake) -> Option<&RawUser> {
        self.users.iter().find(|user| user.id == user_id)
    }

    pub fn guild(&self, guild_id: Snowflake) -> Option<&RawGuild> {
        self.guilds.iter().find(|guild| guild.id == guild_id)
    }

    pub fn channel(&self, channel_id: Snowflake) -> Option<&RawChannel> {
        self.channels.iter().find(|channel| channel.id == channel_id)
    }

    pub fn member(&self, guild_id: Snowflake, user_id: Snowflake) -> Option<&RawMember> {
        self.members
            .iter()
            .find(|member| member.guild_id == guild_id && member.user_id == user_id)
    }

    pub fn role(&self, guild_id: Snowflake, role_id: Snowflake) -> Option<&RawRole> {
        self.roles
            .iter()
            .find(|role| role.guild_id == guild_id && role.id == role_id)
    }

    /// Roles of a guild, `None` if the guild is unknown
    pub fn guild_roles(&self, guild_id: Snowflake) -> Option<Vec<RawRole>> {
        self.guild(guild_id)?;
        Some(
            self.roles
                .iter()
                .filter(|role| role.guild_id == guild_id)
                .cloned()
                .collect(),
        )
    }

    pub fn bot_guild_ids(&self) -> Vec<Snowflake> {
        if self.bot_guilds.is_empty() {
            self.guilds.iter().map(|guild| guild.id).collect()
        } else {
            self.bot_guilds.clone()
        }
    }
}

/// Gateway event replayed by the demo binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptedEvent {
    MemberJoin { guild_id: Snowflake, user_id: Snowflake },
    VerifyClick { guild_id: Snowflake, user_id: Snowflake },
}

/// A directory plus the events to replay against it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(flatten)]
    pub directory: PlatformDirectory,
    #[serde(default)]
    pub events: Vec<ScriptedEvent>,
}

impl Fixture {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FixtureError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| FixtureError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let fixture: Fixture =
            serde_json::from_str(&content).map_err(|source| FixtureError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        tracing::info!(
            path = %path.display(),
            users = fixture.directory.users.len(),
            guilds = fixture.directory.guilds.len(),
            events = fixture.events.len(),
            "Loaded platform fixture"
        );
        Ok(fixture)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("failed to read fixture {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse fixture {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Simulated Platform
// =============================================================================

struct PlatformState {
    runtime: Handle,
    config: SimConfig,
    directory: RwLock<PlatformDirectory>,
    rng: Mutex<StdRng>,
    forced_failures: Mutex<HashMap<FetchKey, u32>>,
    fetch_counts: Mutex<HashMap<FetchKey, u64>>,
    gate: watch::Sender<bool>,
}

/// In-process [`RemoteFetch`] implementation. Cheap to clone.
#[derive(Clone)]
pub struct SimulatedPlatform {
    state: Arc<PlatformState>,
}

impl std::fmt::Debug for SimulatedPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedPlatform")
            .field("config", &self.state.config)
            .field("gate_open", &self.is_gate_open())
            .finish_non_exhaustive()
    }
}

impl SimulatedPlatform {
    /// Serve `directory` from tasks spawned on `runtime`
    pub fn new(runtime: Handle, directory: PlatformDirectory, config: SimConfig) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(PlatformState {
                runtime,
                rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
                config,
                directory: RwLock::new(directory),
                forced_failures: Mutex::new(HashMap::new()),
                fetch_counts: Mutex::new(HashMap::new()),
                gate,
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.state.config
    }

    // -------------------------------------------------------------------------
    // Directory mutation
    // -------------------------------------------------------------------------

    /// Modify the directory; later deliveries see the change.
    pub fn update(&self, f: impl FnOnce(&mut PlatformDirectory)) {
        f(&mut self.state.directory.write());
    }

    pub fn insert_user(&self, user: RawUser) {
        self.update(|dir| {
            dir.users.retain(|u| u.id != user.id);
            dir.users.push(user);
        });
    }

    pub fn insert_channel(&self, channel: RawChannel) {
        self.update(|dir| {
            dir.channels.retain(|c| c.id != channel.id);
            dir.channels.push(channel);
        });
    }

    pub fn insert_role(&self, role: RawRole) {
        self.update(|dir| {
            dir.roles
                .retain(|r| !(r.id == role.id && r.guild_id == role.guild_id));
            dir.roles.push(role);
        });
    }

    pub fn remove_user(&self, user_id: Snowflake) {
        self.update(|dir| dir.users.retain(|u| u.id != user_id));
    }

    pub fn remove_channel(&self, channel_id: Snowflake) {
        self.update(|dir| dir.channels.retain(|c| c.id != channel_id));
    }

    // -------------------------------------------------------------------------
    // Fault control
    // -------------------------------------------------------------------------

    /// Fail the next `count` fetches of `key` with an API error
    pub fn fail_next(&self, key: FetchKey, count: u32) {
        assert!(count > 0, "fail_next count must be positive");
        *self.state.forced_failures.lock().entry(key).or_insert(0) += count;
    }

    /// Hold every delivery until [`Self::open_gate`]
    pub fn close_gate(&self) {
        self.state.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.state.gate.send_replace(true);
    }

    pub fn is_gate_open(&self) -> bool {
        *self.state.gate.borrow()
    }

    /// Fetches issued for `key` so far
    pub fn fetch_count(&self, key: FetchKey) -> u64 {
        self.state.fetch_counts.lock().get(&key).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u64 {
        self.state.fetch_counts.lock().values().sum()
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    fn dispatch<T, F>(&self, key: FetchKey, answer: F, on_complete: FetchCallback<T>)
    where
        T: Send + 'static,
        F: FnOnce(&PlatformDirectory) -> Option<T> + Send + 'static,
    {
        *self.state.fetch_counts.lock().entry(key).or_insert(0) += 1;

        let delay = self.next_delay();
        let inject_error = self.take_failure(key);
        let state = Arc::clone(&self.state);
        let mut gate = self.state.gate.subscribe();

        tracing::trace!(key = %key, delay_ms = delay.as_millis() as u64, inject_error, "sim fetch");

        self.state.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            loop {
                let open = *gate.borrow();
                if open || gate.changed().await.is_err() {
                    break;
                }
            }

            let delivery = tokio::task::spawn_blocking(move || {
                let result = if inject_error {
                    Err(FetchError::Api {
                        key,
                        message: "simulated API failure".to_string(),
                        reasons: vec!["injected by simulator".to_string()],
                    })
                } else {
                    let directory = state.directory.read();
                    answer(&directory).ok_or(FetchError::NotFound { key })
                };
                on_complete(result);
            });

            if delivery.await.is_err() {
                tracing::warn!(key = %key, "sim fetch callback panicked");
            }
        });
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.state.config.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            self.state.rng.lock().gen_range(0..=jitter_ms)
        };
        self.state.config.latency + Duration::from_millis(extra)
    }

    fn take_failure(&self, key: FetchKey) -> bool {
        let mut forced = self.state.forced_failures.lock();
        if let Some(remaining) = forced.get_mut(&key) {
            *remaining -= 1;
            if *remaining == 0 {
                forced.remove(&key);
            }
            return true;
        }
        drop(forced);

        let rate = self.state.config.api_error_rate;
        rate > 0.0 && self.state.rng.lock().gen_bool(rate)
    }
}

impl RemoteFetch for SimulatedPlatform {
    fn fetch_user(&self, user_id: Snowflake, on_complete: FetchCallback<RawUser>) {
        self.dispatch(
            FetchKey::User(user_id),
            move |dir| dir.user(user_id).cloned(),
            on_complete,
        );
    }

    fn fetch_guild(&self, guild_id: Snowflake, on_complete: FetchCallback<RawGuild>) {
        self.dispatch(
            FetchKey::Guild(guild_id),
            move |dir| dir.guild(guild_id).cloned(),
            on_complete,
        );
    }

    fn fetch_channel(&self, channel_id: Snowflake, on_complete: FetchCallback<RawChannel>) {
        self.dispatch(
            FetchKey::Channel(channel_id),
            move |dir| dir.channel(channel_id).cloned(),
            on_complete,
        );
    }

    fn fetch_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        on_complete: FetchCallback<RawMember>,
    ) {
        self.dispatch(
            FetchKey::Member { guild_id, user_id },
            move |dir| dir.member(guild_id, user_id).cloned(),
            on_complete,
        );
    }

    fn fetch_role(
        &self,
        guild_id: Snowflake,
        role_id: Snowflake,
        on_complete: FetchCallback<RawRole>,
    ) {
        self.dispatch(
            FetchKey::Role { guild_id, role_id },
            move |dir| dir.role(guild_id, role_id).cloned(),
            on_complete,
        );
    }

    fn fetch_roles(&self, guild_id: Snowflake, on_complete: FetchCallback<Vec<RawRole>>) {
        self.dispatch(
            FetchKey::GuildRoles(guild_id),
            move |dir| dir.guild_roles(guild_id),
            on_complete,
        );
    }

    fn fetch_current_user_guilds(&self, on_complete: FetchCallback<Vec<Snowflake>>) {
        self.dispatch(
            FetchKey::CurrentUserGuilds,
            |dir| Some(dir.bot_guild_ids()),
            on_complete,
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
