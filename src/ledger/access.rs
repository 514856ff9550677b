//! Who may write to a store's cashbooks.
//!
//! Store membership is managed elsewhere. The ledger only asks which role, if
//! any, a user has in a store.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The user on whose behalf an operation is performed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Actor {
    pub user_id: Uuid,
}

impl Actor {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreRole {
    Owner,
    Manager,
    Staff,
}

impl StoreRole {
    /// Every member of a store may record transactions in its cashbooks.
    pub fn can_write_transactions(&self) -> bool {
        match self {
            Self::Owner | Self::Manager | Self::Staff => true,
        }
    }
}

pub type DynStoreAccess = Arc<dyn StoreAccess + Send + Sync>;

#[async_trait]
pub trait StoreAccess {
    /// The role a user has in a store, or `None` if they are not a member.
    async fn role_for(&self, user_id: Uuid, store_id: Uuid) -> anyhow::Result<Option<StoreRole>>;
}

/// Grants every user the owner role in every store. Used by operator tooling.
pub struct Unrestricted;

#[async_trait]
impl StoreAccess for Unrestricted {
    async fn role_for(
        &self,
        _user_id: Uuid,
        _store_id: Uuid,
    ) -> anyhow::Result<Option<StoreRole>> {
        Ok(Some(StoreRole::Owner))
    }
}

/// A fixed membership table.
#[derive(Default)]
pub struct StaticStoreAccess {
    memberships: HashMap<(Uuid, Uuid), StoreRole>,
}

impl StaticStoreAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give a user a role in a store, replacing any role they had before.
    pub fn with_member(mut self, user_id: Uuid, store_id: Uuid, role: StoreRole) -> Self {
        self.memberships.insert((user_id, store_id), role);
        self
    }
}

#[async_trait]
impl StoreAccess for StaticStoreAccess {
    async fn role_for(&self, user_id: Uuid, store_id: Uuid) -> anyhow::Result<Option<StoreRole>> {
        Ok(self.memberships.get(&(user_id, store_id)).copied())
    }
}
