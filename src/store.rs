//! API access to the Stash custom resources and backend secrets
//!
//! [`ResourceStore`] is the seam between the scheduler, executor and status
//! reporter and the API server. Reads return `Ok(None)` for objects that do
//! not exist. Writes use `replace` so the resourceVersion carried by the
//! object acts as an optimistic-concurrency token: a stale write surfaces as
//! [`Error::Conflict`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::crd::{BackupConfiguration, BackupSession, Repository, RestoreSession, VolumeSnapshot};
use crate::{Error, Result};

/// Trait abstracting API operations on Stash resources
///
/// This trait allows mocking the API server in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a BackupConfiguration
    async fn get_backup_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupConfiguration>>;

    /// List BackupConfigurations in one namespace
    async fn list_backup_configurations(&self, namespace: &str)
        -> Result<Vec<BackupConfiguration>>;

    /// Replace a BackupConfiguration (spec and metadata)
    async fn replace_backup_configuration(
        &self,
        config: &BackupConfiguration,
    ) -> Result<BackupConfiguration>;

    /// Replace the status subresource of a BackupConfiguration
    async fn replace_backup_configuration_status(
        &self,
        config: &BackupConfiguration,
    ) -> Result<BackupConfiguration>;

    /// Fetch a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Fetch a Repository
    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Option<Repository>>;

    /// Create a Repository
    async fn create_repository(&self, repository: &Repository) -> Result<Repository>;

    /// Replace the status subresource of a Repository
    async fn replace_repository_status(&self, repository: &Repository) -> Result<Repository>;

    /// Fetch a BackupSession
    async fn get_backup_session(&self, namespace: &str, name: &str)
        -> Result<Option<BackupSession>>;

    /// Replace the status subresource of a BackupSession
    async fn replace_backup_session_status(&self, session: &BackupSession)
        -> Result<BackupSession>;

    /// Fetch a RestoreSession
    async fn get_restore_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RestoreSession>>;

    /// Replace the status subresource of a RestoreSession
    async fn replace_restore_session_status(
        &self,
        session: &RestoreSession,
    ) -> Result<RestoreSession>;

    /// Create a VolumeSnapshot
    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot>;

    /// Fetch a VolumeSnapshot
    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>>;
}

/// Real store backed by the API server
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Create a new store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or_else(|| Error::validation(format!("{} has no namespace", obj.name_any())))
}

async fn get<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn create<K>(api: Api<K>, obj: &K) -> Result<K>
where
    K: Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    api.create(&PostParams::default(), obj)
        .await
        .map_err(Error::from_write)
}

async fn replace<K>(api: Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    api.replace(&obj.name_any(), &PostParams::default(), obj)
        .await
        .map_err(Error::from_write)
}

async fn replace_status<K>(api: Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    let body = serde_json::to_vec(obj)?;
    api.replace_status(&obj.name_any(), &PostParams::default(), body)
        .await
        .map_err(Error::from_write)
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_backup_configuration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupConfiguration>> {
        get(self.api(namespace), name).await
    }

    async fn list_backup_configurations(
        &self,
        namespace: &str,
    ) -> Result<Vec<BackupConfiguration>> {
        let api: Api<BackupConfiguration> = self.api(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_backup_configuration(
        &self,
        config: &BackupConfiguration,
    ) -> Result<BackupConfiguration> {
        replace(self.api(&namespace_of(config)?), config).await
    }

    async fn replace_backup_configuration_status(
        &self,
        config: &BackupConfiguration,
    ) -> Result<BackupConfiguration> {
        replace_status(self.api(&namespace_of(config)?), config).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        get(self.api(namespace), name).await
    }

    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Option<Repository>> {
        get(self.api(namespace), name).await
    }

    async fn create_repository(&self, repository: &Repository) -> Result<Repository> {
        create(self.api(&namespace_of(repository)?), repository).await
    }

    async fn replace_repository_status(&self, repository: &Repository) -> Result<Repository> {
        replace_status(self.api(&namespace_of(repository)?), repository).await
    }

    async fn get_backup_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupSession>> {
        get(self.api(namespace), name).await
    }

    async fn replace_backup_session_status(
        &self,
        session: &BackupSession,
    ) -> Result<BackupSession> {
        replace_status(self.api(&namespace_of(session)?), session).await
    }

    async fn get_restore_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RestoreSession>> {
        get(self.api(namespace), name).await
    }

    async fn replace_restore_session_status(
        &self,
        session: &RestoreSession,
    ) -> Result<RestoreSession> {
        replace_status(self.api(&namespace_of(session)?), session).await
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        create(self.api(&namespace_of(snapshot)?), snapshot).await
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>> {
        get(self.api(namespace), name).await
    }
}

/// In-memory store with resourceVersion checks, for scenario tests
#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    type Key = (String, String);

    fn key<K: Resource>(obj: &K) -> Key {
        (obj.namespace().unwrap_or_default(), obj.name_any())
    }

    fn bump<K: Resource>(obj: &mut K, version: &mut u64) {
        *version += 1;
        obj.meta_mut().resource_version = Some(version.to_string());
    }

    /// Objects keyed by namespace/name. Every write bumps a global version
    /// and rejects objects whose resourceVersion is stale.
    #[derive(Default)]
    pub struct InMemoryStore {
        version: Mutex<u64>,
        configs: Mutex<HashMap<Key, BackupConfiguration>>,
        secrets: Mutex<HashMap<Key, Secret>>,
        repositories: Mutex<HashMap<Key, Repository>>,
        backup_sessions: Mutex<HashMap<Key, BackupSession>>,
        restore_sessions: Mutex<HashMap<Key, RestoreSession>>,
        snapshots: Mutex<HashMap<Key, VolumeSnapshot>>,
        /// Number of upcoming status writes to reject with a conflict
        pub injected_conflicts: Mutex<u32>,
    }

    impl InMemoryStore {
        /// Seed a BackupConfiguration
        pub fn put_config(&self, mut config: BackupConfiguration) {
            bump(&mut config, &mut self.version.lock().unwrap());
            self.configs.lock().unwrap().insert(key(&config), config);
        }

        /// Seed a Secret
        pub fn put_secret(&self, secret: Secret) {
            self.secrets.lock().unwrap().insert(key(&secret), secret);
        }

        /// Delete a Secret
        pub fn delete_secret(&self, namespace: &str, name: &str) {
            self.secrets
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
        }

        /// Seed a BackupSession
        pub fn put_backup_session(&self, mut session: BackupSession) {
            bump(&mut session, &mut self.version.lock().unwrap());
            self.backup_sessions
                .lock()
                .unwrap()
                .insert(key(&session), session);
        }

        /// Seed a RestoreSession
        pub fn put_restore_session(&self, mut session: RestoreSession) {
            bump(&mut session, &mut self.version.lock().unwrap());
            self.restore_sessions
                .lock()
                .unwrap()
                .insert(key(&session), session);
        }

        /// Seed a VolumeSnapshot, replacing any existing one
        pub fn put_volume_snapshot(&self, snapshot: VolumeSnapshot) {
            self.snapshots.lock().unwrap().insert(key(&snapshot), snapshot);
        }

        /// Current BackupConfiguration
        pub fn config(&self, namespace: &str, name: &str) -> Option<BackupConfiguration> {
            self.configs
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Current Repository
        pub fn repository(&self, namespace: &str, name: &str) -> Option<Repository> {
            self.repositories
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Current BackupSession
        pub fn backup_session(&self, namespace: &str, name: &str) -> Option<BackupSession> {
            self.backup_sessions
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Current RestoreSession
        pub fn restore_session(&self, namespace: &str, name: &str) -> Option<RestoreSession> {
            self.restore_sessions
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Every VolumeSnapshot created so far
        pub fn volume_snapshots(&self) -> Vec<VolumeSnapshot> {
            self.snapshots.lock().unwrap().values().cloned().collect()
        }

        fn take_conflict(&self) -> bool {
            let mut n = self.injected_conflicts.lock().unwrap();
            if *n > 0 {
                *n -= 1;
                true
            } else {
                false
            }
        }

        fn write<K: Resource + Clone>(
            &self,
            map: &Mutex<HashMap<Key, K>>,
            obj: &K,
            status_only: bool,
        ) -> Result<K> {
            if status_only && self.take_conflict() {
                return Err(Error::conflict("injected conflict"));
            }
            let mut map = map.lock().unwrap();
            let k = key(obj);
            let current = map
                .get(&k)
                .ok_or_else(|| Error::not_found("object", &k.0, &k.1))?;
            if current.meta().resource_version != obj.meta().resource_version {
                return Err(Error::conflict(format!("{}/{} is stale", k.0, k.1)));
            }
            let mut next = obj.clone();
            bump(&mut next, &mut self.version.lock().unwrap());
            map.insert(k, next.clone());
            Ok(next)
        }

        fn insert_new<K: Resource + Clone>(&self, map: &Mutex<HashMap<Key, K>>, obj: &K) -> Result<K> {
            let mut map = map.lock().unwrap();
            let k = key(obj);
            if map.contains_key(&k) {
                return Err(Error::conflict(format!("{}/{} already exists", k.0, k.1)));
            }
            let mut next = obj.clone();
            bump(&mut next, &mut self.version.lock().unwrap());
            map.insert(k, next.clone());
            Ok(next)
        }
    }

    fn lookup<K: Clone>(map: &Mutex<HashMap<Key, K>>, namespace: &str, name: &str) -> Option<K> {
        map.lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    #[async_trait]
    impl ResourceStore for InMemoryStore {
        async fn get_backup_configuration(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<BackupConfiguration>> {
            Ok(lookup(&self.configs, namespace, name))
        }

        async fn list_backup_configurations(
            &self,
            namespace: &str,
        ) -> Result<Vec<BackupConfiguration>> {
            Ok(self
                .configs
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.namespace().as_deref() == Some(namespace))
                .cloned()
                .collect())
        }

        async fn replace_backup_configuration(
            &self,
            config: &BackupConfiguration,
        ) -> Result<BackupConfiguration> {
            self.write(&self.configs, config, false)
        }

        async fn replace_backup_configuration_status(
            &self,
            config: &BackupConfiguration,
        ) -> Result<BackupConfiguration> {
            self.write(&self.configs, config, true)
        }

        async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
            Ok(lookup(&self.secrets, namespace, name))
        }

        async fn get_repository(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<Repository>> {
            Ok(lookup(&self.repositories, namespace, name))
        }

        async fn create_repository(&self, repository: &Repository) -> Result<Repository> {
            self.insert_new(&self.repositories, repository)
        }

        async fn replace_repository_status(&self, repository: &Repository) -> Result<Repository> {
            self.write(&self.repositories, repository, true)
        }

        async fn get_backup_session(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<BackupSession>> {
            Ok(lookup(&self.backup_sessions, namespace, name))
        }

        async fn replace_backup_session_status(
            &self,
            session: &BackupSession,
        ) -> Result<BackupSession> {
            self.write(&self.backup_sessions, session, true)
        }

        async fn get_restore_session(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<RestoreSession>> {
            Ok(lookup(&self.restore_sessions, namespace, name))
        }

        async fn replace_restore_session_status(
            &self,
            session: &RestoreSession,
        ) -> Result<RestoreSession> {
            self.write(&self.restore_sessions, session, true)
        }

        async fn create_volume_snapshot(
            &self,
            snapshot: &VolumeSnapshot,
        ) -> Result<VolumeSnapshot> {
            self.insert_new(&self.snapshots, snapshot)
        }

        async fn get_volume_snapshot(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<VolumeSnapshot>> {
            Ok(lookup(&self.snapshots, namespace, name))
        }
    }
}
