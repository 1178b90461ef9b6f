//! Gatekeeper - Welcome & Verify Flows
//!
//! TigerStyle: Gateway events in, outbox actions out, resolver in between.
//!
//! Handlers block on resolver lookups, so the binary runs them on the
//! blocking pool. Outgoing actions go through the [`Outbox`] seam.

use crate::entity::{CachedGuild, GuildConfig, GuildMember, RawRole, Snowflake};
use crate::persistence::ConfigStore;
use crate::resolver::{NameMatch, ResolveError, Resolver};
use crate::{VERIFIED_ROLE_NAME_DEFAULT, VERIFY_BUTTON_ID};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Message content that posts a welcome message into the current channel
pub const DEVTEST_COMMAND: &str = "devtest";

/// Label on the welcome message's button
pub const VERIFY_BUTTON_LABEL: &str = "Verify";

/// First id handed out by [`RecordingOutbox::create_role`]
const CREATED_ROLE_ID_BASE: u64 = 900_000_000;

// =============================================================================
// Outbox
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub custom_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub channel_id: Snowflake,
    pub content: String,
    pub button: Option<Button>,
}

impl OutgoingMessage {
    /// Greeting with the verify button attached
    pub fn welcome(channel_id: Snowflake, user_mention: &str) -> Self {
        Self {
            channel_id,
            content: format!("Welcome {user_mention}!\n\nClick the button to become verified!"),
            button: Some(Button {
                label: VERIFY_BUTTON_LABEL.to_string(),
                custom_id: VERIFY_BUTTON_ID.to_string(),
            }),
        }
    }
}

/// Interaction reply text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub content: String,
    /// Only the clicking user sees it
    pub ephemeral: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("platform rejected {action}: {message}")]
pub struct OutboxError {
    pub action: &'static str,
    pub message: String,
}

/// Platform writes the bot performs. Calls block until the platform answers.
pub trait Outbox: Send + Sync {
    fn send_message(&self, message: OutgoingMessage) -> Result<(), OutboxError>;

    fn add_member_role(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        role_id: Snowflake,
    ) -> Result<(), OutboxError>;

    /// Create a role and return its id
    fn create_role(&self, guild_id: Snowflake, name: &str) -> Result<Snowflake, OutboxError>;
}

/// One action accepted by a [`RecordingOutbox`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxAction {
    Message(OutgoingMessage),
    RoleGranted {
        guild_id: Snowflake,
        user_id: Snowflake,
        role_id: Snowflake,
    },
    RoleCreated {
        guild_id: Snowflake,
        role_id: Snowflake,
        name: String,
    },
}

/// Outbox that logs and records every action instead of sending it
#[derive(Debug)]
pub struct RecordingOutbox {
    actions: Mutex<Vec<OutboxAction>>,
    next_role_id: AtomicU64,
}

impl Default for RecordingOutbox {
    fn default() -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            next_role_id: AtomicU64::new(CREATED_ROLE_ID_BASE),
        }
    }
}

impl RecordingOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<OutboxAction> {
        self.actions.lock().clone()
    }

    pub fn messages(&self) -> Vec<OutgoingMessage> {
        self.actions
            .lock()
            .iter()
            .filter_map(|action| match action {
                OutboxAction::Message(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Outbox for RecordingOutbox {
    fn send_message(&self, message: OutgoingMessage) -> Result<(), OutboxError> {
        tracing::info!(channel_id = %message.channel_id, "{}", message.content);
        self.actions.lock().push(OutboxAction::Message(message));
        Ok(())
    }

    fn add_member_role(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        role_id: Snowflake,
    ) -> Result<(), OutboxError> {
        tracing::info!("Adding role {} to user {} in guild {}", role_id, user_id, guild_id);
        self.actions.lock().push(OutboxAction::RoleGranted {
            guild_id,
            user_id,
            role_id,
        });
        Ok(())
    }

    fn create_role(&self, guild_id: Snowflake, name: &str) -> Result<Snowflake, OutboxError> {
        let raw = self.next_role_id.fetch_add(1, Ordering::Relaxed);
        let role_id = Snowflake::new(raw).ok_or_else(|| OutboxError {
            action: "create role",
            message: "role id space exhausted".to_string(),
        })?;

        tracing::info!("Creating role \"{}\" in guild {}", name, guild_id);
        self.actions.lock().push(OutboxAction::RoleCreated {
            guild_id,
            role_id,
            name: name.to_string(),
        });
        Ok(role_id)
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Welcomed { channel_id: Snowflake },
    NoWelcomeChannel,
    UnknownGuild,
    UnknownMember,
    SendFailed(OutboxError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified { role_id: Snowflake, reply: Reply },
    AlreadyVerified { role_id: Snowflake, reply: Reply },
    UnknownGuild,
    UnknownMember,
    RoleUnavailable,
    GrantFailed(OutboxError),
    /// The button was not the verify button
    Ignored,
}

/// A change an operator can make to a guild's configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuildSetting {
    WelcomeChannel(Snowflake),
    VerifiedRole(Option<Snowflake>),
    OperatorRole(Option<Snowflake>),
    VerifyEphemeral(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigureError {
    #[error("user {actor_id} may not configure guild {guild_id}")]
    NotPermitted {
        guild_id: Snowflake,
        actor_id: Snowflake,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

// =============================================================================
// Gatekeeper
// =============================================================================

pub struct Gatekeeper {
    resolver: Resolver,
    outbox: Arc<dyn Outbox>,
    config_store: Option<ConfigStore>,
    verified_role_name: String,
}

impl std::fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("resolver", &self.resolver)
            .field("config_store", &self.config_store)
            .field("verified_role_name", &self.verified_role_name)
            .finish_non_exhaustive()
    }
}

impl Gatekeeper {
    pub fn new(resolver: Resolver, outbox: Arc<dyn Outbox>) -> Self {
        Self {
            resolver,
            outbox,
            config_store: None,
            verified_role_name: VERIFIED_ROLE_NAME_DEFAULT.to_string(),
        }
    }

    /// Save configuration after every successful [`Self::configure`]
    pub fn with_config_store(mut self, store: ConfigStore) -> Self {
        self.config_store = Some(store);
        self
    }

    pub fn with_verified_role_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.trim().is_empty(), "verified role name must not be blank");
        self.verified_role_name = name;
        self
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    // -------------------------------------------------------------------------
    // Gateway events
    // -------------------------------------------------------------------------

    /// Populate every guild the bot belongs to. Returns how many resolved.
    pub fn handle_ready(&self) -> usize {
        tracing::info!("Connected");
        let guilds = self.resolver.resolve_all_guilds();
        tracing::info!(
            guilds = guilds.len(),
            users = self.resolver.store().user_count(),
            channels = self.resolver.store().channel_count(),
            "Ready"
        );
        guilds.len()
    }

    pub fn handle_member_join(&self, guild_id: Snowflake, user_id: Snowflake) -> JoinOutcome {
        let Some(guild) = self.resolver.resolve_guild(guild_id) else {
            tracing::warn!(guild_id = %guild_id, "User added with no guild data associated");
            return JoinOutcome::UnknownGuild;
        };
        let Some(member) = self.resolver.resolve_member(&guild, user_id) else {
            tracing::warn!(guild_id = %guild_id, user_id = %user_id, "User added with no user data associated");
            return JoinOutcome::UnknownMember;
        };

        let Some(channel) = self.resolver.resolve_welcome_channel(&guild) else {
            tracing::info!(guild_id = %guild_id, "No verification channel");
            return JoinOutcome::NoWelcomeChannel;
        };

        let message = OutgoingMessage::welcome(channel.id(), &self.mention(&member));
        match self.outbox.send_message(message) {
            Ok(()) => JoinOutcome::Welcomed {
                channel_id: channel.id(),
            },
            Err(error) => {
                tracing::warn!(guild_id = %guild_id, error = %error, "welcome message failed");
                JoinOutcome::SendFailed(error)
            }
        }
    }

    /// Chat message in a guild channel. Returns whether it triggered anything.
    pub fn handle_message(&self, channel_id: Snowflake, author_id: Snowflake, content: &str) -> bool {
        tracing::debug!(channel_id = %channel_id, author_id = %author_id, "{}", content);
        if content.trim() != DEVTEST_COMMAND {
            return false;
        }

        let mention = self
            .resolver
            .resolve_user(author_id)
            .map_or_else(|| format!("<@{author_id}>"), |user| user.mention());
        if let Err(error) = self.outbox.send_message(OutgoingMessage::welcome(channel_id, &mention)) {
            tracing::warn!(channel_id = %channel_id, error = %error, "devtest message failed");
        }
        true
    }

    pub fn handle_button_click(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        custom_id: &str,
    ) -> VerifyOutcome {
        tracing::info!("Button clicked: {} by {}", custom_id, user_id);
        if custom_id != VERIFY_BUTTON_ID {
            return VerifyOutcome::Ignored;
        }
        self.handle_verify_click(guild_id, user_id)
    }

    /// Grant the guild's verified role to the clicking member, creating the
    /// role if the guild has none.
    pub fn handle_verify_click(&self, guild_id: Snowflake, user_id: Snowflake) -> VerifyOutcome {
        let Some(guild) = self.resolver.resolve_guild(guild_id) else {
            return VerifyOutcome::UnknownGuild;
        };
        let Some(member) = self.resolver.resolve_member(&guild, user_id) else {
            return VerifyOutcome::UnknownMember;
        };
        let Some(role_id) = self.verified_role(&guild) else {
            return VerifyOutcome::RoleUnavailable;
        };

        let mention = self.mention(&member);
        let ephemeral = guild.config().verify_ephemeral;

        if member.has_role(role_id) {
            return VerifyOutcome::AlreadyVerified {
                role_id,
                reply: Reply {
                    content: format!("You are already verified {mention}!"),
                    ephemeral,
                },
            };
        }

        if let Err(error) = self.outbox.add_member_role(guild_id, user_id, role_id) {
            tracing::warn!(guild_id = %guild_id, user_id = %user_id, error = %error, "role grant failed");
            return VerifyOutcome::GrantFailed(error);
        }
        member.note_role_granted(role_id);

        VerifyOutcome::Verified {
            role_id,
            reply: Reply {
                content: format!("You are now verified {mention}!"),
                ephemeral,
            },
        }
    }

    // -------------------------------------------------------------------------
    // Operator configuration
    // -------------------------------------------------------------------------

    /// Apply one setting on behalf of `actor_id`.
    ///
    /// The actor must hold the operator role. While no operator role is
    /// configured any member may configure the guild.
    pub fn configure(
        &self,
        guild_id: Snowflake,
        actor_id: Snowflake,
        setting: GuildSetting,
    ) -> Result<GuildConfig, ConfigureError> {
        let guild = self.resolver.try_resolve_guild(guild_id)?;
        let actor = self.resolver.try_resolve_member(&guild, actor_id)?;

        if let Some(operator_role) = guild.config().operator_role_id {
            if !actor.has_role(operator_role) {
                tracing::warn!(guild_id = %guild_id, actor_id = %actor_id, setting = ?setting, "configuration refused");
                return Err(ConfigureError::NotPermitted { guild_id, actor_id });
            }
        }

        match setting {
            GuildSetting::WelcomeChannel(channel_id) => {
                self.resolver.try_resolve_guild_channel(&guild, channel_id)?;
            }
            GuildSetting::VerifiedRole(Some(role_id)) | GuildSetting::OperatorRole(Some(role_id)) => {
                self.resolver.try_resolve_role(&guild, role_id)?;
            }
            GuildSetting::VerifiedRole(None)
            | GuildSetting::OperatorRole(None)
            | GuildSetting::VerifyEphemeral(_) => {}
        }

        guild.update_config(|config| match setting {
            GuildSetting::WelcomeChannel(channel_id) => config.welcome_channel_id = Some(channel_id),
            GuildSetting::VerifiedRole(role_id) => config.verified_role_id = role_id,
            GuildSetting::OperatorRole(role_id) => config.operator_role_id = role_id,
            GuildSetting::VerifyEphemeral(ephemeral) => config.verify_ephemeral = ephemeral,
        });
        tracing::info!(guild_id = %guild_id, actor_id = %actor_id, setting = ?setting, "Guild configuration updated");

        if let Some(store) = &self.config_store {
            if let Err(error) = store.save(self.resolver.store()) {
                tracing::error!(error = %error, "Failed to save guild configuration");
            }
        }

        Ok(guild.config())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn mention(&self, member: &GuildMember) -> String {
        member
            .user(self.resolver.store())
            .map_or_else(|| format!("<@{}>", member.user_id()), |user| user.mention())
    }

    /// Configured role if it still resolves, otherwise the role named
    /// `verified_role_name`, created when the guild has none.
    fn verified_role(&self, guild: &Arc<CachedGuild>) -> Option<Snowflake> {
        if let Some(role_id) = guild.config().verified_role_id {
            match self.resolver.resolve_role(guild, role_id) {
                Some(role) => return Some(role.id()),
                None => tracing::warn!(
                    guild_id = %guild.id(),
                    role_id = %role_id,
                    "configured verified role is gone, falling back to lookup by name"
                ),
            }
        }

        let name = self.verified_role_name.as_str();
        if let Some(role) = self.resolver.resolve_role_by_name(guild, name) {
            return Some(role.id());
        }

        // Not cached: it may exist on the platform under the same name.
        if self.resolver.refresh_roles(guild).is_ok() {
            if let Some(role) = self.resolver.find_role_by_name(guild, name, NameMatch::Exact) {
                return Some(role.id());
            }
        }

        match self.outbox.create_role(guild.id(), name) {
            Ok(role_id) => {
                guild.update_config(|config| config.verified_role_id = Some(role_id));
                let created = RawRole {
                    id: role_id,
                    guild_id: guild.id(),
                    name: name.to_string(),
                };
                if let Err(error) = self.resolver.record_created_role(guild, created) {
                    tracing::warn!(guild_id = %guild.id(), role_id = %role_id, error = %error, "created role not cached");
                }
                tracing::info!(guild_id = %guild.id(), role_id = %role_id, "Created verified role {}", name);
                Some(role_id)
            }
            Err(error) => {
                tracing::warn!(guild_id = %guild.id(), error = %error, "could not create verified role");
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::entity::{RawChannel, RawGuild, RawMember, RawUser};
    use crate::sim::{PlatformDirectory, SimConfig, SimulatedPlatform};
    use crate::store::EntityStore;
    use std::time::Duration;

    fn id(raw: u64) -> Snowflake {
        Snowflake::new(raw).unwrap()
    }

    struct Harness {
        _runtime: tokio::runtime::Runtime,
        outbox: Arc<RecordingOutbox>,
        bot: Gatekeeper,
    }

    fn harness(with_verified_role: bool) -> Harness {
        let mut directory = PlatformDirectory {
            users: vec![
                RawUser {
                    id: id(5),
                    username: "ada".to_string(),
                    global_name: None,
                },
                RawUser {
                    id: id(6),
                    username: "grace".to_string(),
                    global_name: None,
                },
            ],
            guilds: vec![RawGuild {
                id: id(100),
                name: "Lobby".to_string(),
                system_channel_id: Some(id(200)),
            }],
            channels: vec![
                RawChannel {
                    id: id(200),
                    name: "welcome".to_string(),
                    guild_id: Some(id(100)),
                },
                RawChannel {
                    id: id(201),
                    name: "elsewhere".to_string(),
                    guild_id: Some(id(101)),
                },
            ],
            members: vec![
                RawMember {
                    guild_id: id(100),
                    user_id: id(5),
                    nick: None,
                    roles: vec![],
                },
                RawMember {
                    guild_id: id(100),
                    user_id: id(6),
                    nick: None,
                    roles: vec![id(8)],
                },
            ],
            roles: vec![RawRole {
                id: id(8),
                guild_id: id(100),
                name: "Operator".to_string(),
            }],
            ..PlatformDirectory::default()
        };
        if with_verified_role {
            directory.roles.push(RawRole {
                id: id(7),
                guild_id: id(100),
                name: "Verified".to_string(),
            });
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let sim = SimulatedPlatform::new(
            runtime.handle().clone(),
            directory,
            SimConfig::default().with_latency(Duration::from_millis(1)),
        );
        let resolver = Resolver::new(
            Arc::new(EntityStore::new()),
            Arc::new(sim),
            ResolverConfig::new().with_fetch_timeout(Duration::from_secs(5)),
        );
        let outbox = Arc::new(RecordingOutbox::new());
        let bot = Gatekeeper::new(resolver, outbox.clone());

        Harness {
            _runtime: runtime,
            outbox,
            bot,
        }
    }

    #[test]
    fn test_member_join_sends_welcome() {
        let h = harness(true);

        let outcome = h.bot.handle_member_join(id(100), id(5));
        assert_eq!(outcome, JoinOutcome::Welcomed { channel_id: id(200) });

        let messages = h.outbox.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].channel_id, id(200));
        assert!(messages[0].content.starts_with("Welcome <@5>!"));
        assert_eq!(
            messages[0].button.as_ref().map(|b| b.custom_id.as_str()),
            Some(VERIFY_BUTTON_ID)
        );
    }

    #[test]
    fn test_member_join_unknown_member() {
        let h = harness(true);
        assert_eq!(h.bot.handle_member_join(id(100), id(99)), JoinOutcome::UnknownMember);
        assert_eq!(h.bot.handle_member_join(id(404), id(5)), JoinOutcome::UnknownGuild);
        assert!(h.outbox.messages().is_empty());
    }

    #[test]
    fn test_verify_grants_role_by_name() {
        let h = harness(true);

        let outcome = h.bot.handle_button_click(id(100), id(5), VERIFY_BUTTON_ID);
        let VerifyOutcome::Verified { role_id, reply } = outcome else {
            panic!("expected verified, got {outcome:?}");
        };
        assert_eq!(role_id, id(7));
        assert_eq!(reply.content, "You are now verified <@5>!");
        assert!(reply.ephemeral);
        assert!(h.outbox.actions().contains(&OutboxAction::RoleGranted {
            guild_id: id(100),
            user_id: id(5),
            role_id: id(7),
        }));
    }

    #[test]
    fn test_verify_creates_missing_role() {
        let h = harness(false);

        let outcome = h.bot.handle_verify_click(id(100), id(5));
        assert!(matches!(outcome, VerifyOutcome::Verified { .. }));
        assert!(h
            .outbox
            .actions()
            .iter()
            .any(|action| matches!(action, OutboxAction::RoleCreated { name, .. } if name == "Verified")));
    }

    #[test]
    fn test_created_role_is_reused() {
        let h = harness(false);

        let VerifyOutcome::Verified { role_id, .. } = h.bot.handle_verify_click(id(100), id(5)) else {
            panic!("first click should verify");
        };
        assert!(matches!(
            h.bot.handle_verify_click(id(100), id(5)),
            VerifyOutcome::AlreadyVerified { role_id: again, .. } if again == role_id
        ));
        assert!(matches!(
            h.bot.handle_verify_click(id(100), id(6)),
            VerifyOutcome::Verified { role_id: other, .. } if other == role_id
        ));

        let created = h
            .outbox
            .actions()
            .iter()
            .filter(|action| matches!(action, OutboxAction::RoleCreated { .. }))
            .count();
        assert_eq!(created, 1);

        let guild = h.bot.resolver().resolve_guild(id(100)).unwrap();
        assert_eq!(guild.config().verified_role_id, Some(role_id));
        assert_eq!(guild.role(role_id).map(|role| role.name().to_string()), Some("Verified".to_string()));
    }

    #[test]
    fn test_other_buttons_ignored() {
        let h = harness(true);
        assert_eq!(h.bot.handle_button_click(id(100), id(5), "other"), VerifyOutcome::Ignored);
        assert!(h.outbox.actions().is_empty());
    }

    #[test]
    fn test_devtest_posts_welcome_in_channel() {
        let h = harness(true);
        assert!(!h.bot.handle_message(id(201), id(5), "hello"));
        assert!(h.bot.handle_message(id(201), id(5), "devtest"));

        let messages = h.outbox.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].channel_id, id(201));
    }

    #[test]
    fn test_configure_requires_operator_role() {
        let h = harness(true);

        // No operator role yet: anyone may set it.
        let config = h
            .bot
            .configure(id(100), id(5), GuildSetting::OperatorRole(Some(id(8))))
            .unwrap();
        assert_eq!(config.operator_role_id, Some(id(8)));

        let refused = h.bot.configure(id(100), id(5), GuildSetting::VerifyEphemeral(false));
        assert_eq!(
            refused,
            Err(ConfigureError::NotPermitted {
                guild_id: id(100),
                actor_id: id(5)
            })
        );

        let config = h
            .bot
            .configure(id(100), id(6), GuildSetting::VerifyEphemeral(false))
            .unwrap();
        assert!(!config.verify_ephemeral);
    }

    #[test]
    fn test_configure_rejects_foreign_channel() {
        let h = harness(true);
        let result = h.bot.configure(id(100), id(5), GuildSetting::WelcomeChannel(id(201)));
        assert!(matches!(
            result,
            Err(ConfigureError::Resolve(ResolveError::WrongGuild { .. }))
        ));
    }
}
