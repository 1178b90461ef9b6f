//! Entity-added hooks
//!
//! TigerStyle: Observers registered per entity kind, observational only.
//!
//! The materializer emits one [`EntityEvent`] after each successful insert.
//! Observers cannot change what was cached and cannot fail the insert: a
//! panicking observer is logged and skipped.

use crate::entity::{
    CachedChannel, CachedGuild, CachedUser, EntityKind, GuildChannel, GuildMember, GuildRole,
    Snowflake,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

// =============================================================================
// Events
// =============================================================================

/// A freshly inserted entry
#[derive(Debug, Clone)]
pub enum EntityEvent {
    UserAdded(Arc<CachedUser>),
    GuildAdded(Arc<CachedGuild>),
    ChannelAdded(Arc<CachedChannel>),
    GuildChannelAdded {
        guild: Arc<CachedGuild>,
        channel: Arc<GuildChannel>,
    },
    RoleAdded {
        guild: Arc<CachedGuild>,
        role: Arc<GuildRole>,
    },
    MemberAdded {
        guild: Arc<CachedGuild>,
        member: Arc<GuildMember>,
    },
}

impl EntityEvent {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::UserAdded(_) => EntityKind::User,
            Self::GuildAdded(_) => EntityKind::Guild,
            Self::ChannelAdded(_) => EntityKind::Channel,
            Self::GuildChannelAdded { .. } => EntityKind::GuildChannel,
            Self::RoleAdded { .. } => EntityKind::Role,
            Self::MemberAdded { .. } => EntityKind::Member,
        }
    }

    /// Map key the entry was inserted under
    pub fn id(&self) -> Snowflake {
        match self {
            Self::UserAdded(user) => user.id(),
            Self::GuildAdded(guild) => guild.id(),
            Self::ChannelAdded(channel) => channel.id(),
            Self::GuildChannelAdded { channel, .. } => channel.id(),
            Self::RoleAdded { role, .. } => role.id(),
            Self::MemberAdded { member, .. } => member.user_id(),
        }
    }
}

// =============================================================================
// Observers
// =============================================================================

pub trait EntityObserver: Send + Sync {
    fn on_entity_added(&self, event: &EntityEvent);
}

impl<F> EntityObserver for F
where
    F: Fn(&EntityEvent) + Send + Sync,
{
    fn on_entity_added(&self, event: &EntityEvent) {
        self(event)
    }
}

/// Registration table keyed by entity kind
#[derive(Default)]
pub struct Hooks {
    observers: Mutex<HashMap<EntityKind, Vec<Arc<dyn EntityObserver>>>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<EntityKind, usize> = self
            .observers
            .lock()
            .iter()
            .map(|(kind, list)| (*kind, list.len()))
            .collect();
        f.debug_struct("Hooks").field("observers", &counts).finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: EntityKind, observer: Arc<dyn EntityObserver>) {
        self.observers.lock().entry(kind).or_default().push(observer);
    }

    pub fn register_fn<F>(&self, kind: EntityKind, observer: F)
    where
        F: Fn(&EntityEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(observer));
    }

    /// Register one observer for every kind
    pub fn register_all(&self, observer: Arc<dyn EntityObserver>) {
        for kind in EntityKind::all() {
            self.register(*kind, Arc::clone(&observer));
        }
    }

    pub fn observer_count(&self, kind: EntityKind) -> usize {
        self.observers.lock().get(&kind).map_or(0, Vec::len)
    }

    pub(crate) fn dispatch(&self, event: &EntityEvent) {
        // Clone out so observers may register more hooks without deadlocking.
        let observers = match self.observers.lock().get(&event.kind()) {
            Some(list) => list.clone(),
            None => return,
        };

        for observer in &observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_entity_added(event))).is_err() {
                tracing::warn!(
                    kind = %event.kind(),
                    id = %event.id(),
                    "entity hook panicked while handling event"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
