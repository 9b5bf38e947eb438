//! Read-only view of the marketplace's users and listings.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::engine::EngineError;
use crate::model::*;

/// Lookups the engine needs from the listing and account stores.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_property(&self, id: &str) -> Result<Option<PropertyRecord>, EngineError>;

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, EngineError>;

    /// Every admin, in a stable order (the first one receives the booking chat).
    async fn list_admins(&self) -> Result<Vec<UserRecord>, EngineError>;
}

#[derive(Debug, Default, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub properties: Vec<PropertyRecord>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, UserRecord>,
    properties: DashMap<PropertyId, PropertyRecord>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let dir = Self::new();
        for user in seed.users {
            dir.upsert_user(user);
        }
        for property in seed.properties {
            dir.upsert_property(property);
        }
        dir
    }

    /// Load users and properties from a JSON file shaped like [`DirectorySeed`].
    pub fn from_seed_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        let seed: DirectorySeed = serde_json::from_slice(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tracing::info!(
            users = seed.users.len(),
            properties = seed.properties.len(),
            "loaded directory seed from {}",
            path.display()
        );
        Ok(Self::from_seed(seed))
    }

    pub fn upsert_user(&self, user: UserRecord) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn upsert_property(&self, property: PropertyRecord) {
        self.properties.insert(property.id.clone(), property);
    }

    pub fn set_property_deleted(&self, id: &str, deleted: bool) {
        if let Some(mut p) = self.properties.get_mut(id) {
            p.deleted = deleted;
        }
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn get_property(&self, id: &str) -> Result<Option<PropertyRecord>, EngineError> {
        Ok(self.properties.get(id).map(|e| e.value().clone()))
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, EngineError> {
        Ok(self.users.get(id).map(|e| e.value().clone()))
    }

    async fn list_admins(&self) -> Result<Vec<UserRecord>, EngineError> {
        let mut admins: Vec<UserRecord> = self
            .users
            .iter()
            .filter(|e| e.value().role == Role::Admin)
            .map(|e| e.value().clone())
            .collect();
        admins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(admins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seed_parses_and_lists_admins_in_order() {
        let seed: DirectorySeed = serde_json::from_str(
            r#"{
                "users": [
                    {"id": "4", "role": "admin", "nome": "ImovelTop"},
                    {"id": "1", "role": "cliente", "phone": "+258841234567"},
                    {"id": "3", "role": "admin"}
                ],
                "properties": [{"id": "1", "vendedorId": "2"}]
            }"#,
        )
        .unwrap();
        let dir = InMemoryDirectory::from_seed(seed);

        let admins: Vec<String> = dir.list_admins().await.unwrap().into_iter().map(|u| u.id).collect();
        assert_eq!(admins, ["3", "4"]);
        assert_eq!(dir.get_user("1").await.unwrap().unwrap().role, Role::Cliente);
        assert_eq!(dir.get_property("1").await.unwrap().unwrap().vendedor_id, "2");
        assert!(dir.get_property("9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_delete_flag() {
        let dir = InMemoryDirectory::new();
        dir.upsert_property(PropertyRecord {
            id: "p1".into(),
            vendedor_id: "v1".into(),
            deleted: false,
        });
        dir.set_property_deleted("p1", true);
        assert!(dir.get_property("p1").await.unwrap().unwrap().deleted);
    }
}
