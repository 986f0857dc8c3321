//! Keeps the discovery ConfigMap of a role in sync with the group topology.
//!
//! The ConfigMap is only written if its decoded payload differs semantically from the desired
//! [`ClusterConfig`], which keeps repeated reconciles from producing write storms.
//!
//! The read-compare-write sequence is not transactional. Two concurrent reconciles of the same
//! role race with last-write-wins semantics.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::ConfigMap,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::{Resource, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::Display;
use tracing::{debug, info, instrument, warn};

use crate::{
    client::{self, Client},
    constants::CLUSTER_CONFIG_KEY,
    crd::{RoleBasedGroup, RoleSpec},
    semantic::compare_cluster_configs,
    topology::{self, ClusterConfig},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get discovery ConfigMap {name:?} in namespace {namespace:?}"))]
    GetConfigMap {
        source: client::Error,
        name: String,
        namespace: String,
    },

    #[snafu(display("failed to apply discovery ConfigMap {name:?} in namespace {namespace:?}"))]
    ApplyConfigMap {
        source: client::Error,
        name: String,
        namespace: String,
    },

    #[snafu(display("failed to serialize the cluster config of RoleBasedGroup {rbg:?}"))]
    SerializeClusterConfig {
        source: topology::Error,
        rbg: String,
    },

    #[snafu(display(
        "RoleBasedGroup {rbg:?} has no uid, cannot bind the discovery ConfigMap to it"
    ))]
    MissingOwnerUid { rbg: String },
}

/// Read and write access to discovery ConfigMaps.
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    /// Returns `Ok(None)` if the ConfigMap does not exist.
    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, client::Error>;

    /// Creates or fully replaces the ConfigMap (apply semantics).
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), client::Error>;
}

#[async_trait]
impl ConfigMapStore for Client {
    async fn get_config_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ConfigMap>, client::Error> {
        self.get_namespaced_opt(name, namespace).await
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), client::Error> {
        self.apply_patch(config_map).await.map(|_| ())
    }
}

/// What [`reconcile_discovery_config_map`] did (or would do) with the ConfigMap.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Decision {
    /// The ConfigMap did not exist and was created.
    Create,

    /// The stored payload was missing, malformed or semantically different and was replaced.
    Update,

    /// The stored payload already matches.
    Unchanged,
}

/// Ensures the discovery ConfigMap of `role` carries `cluster_config`.
#[instrument(
    skip_all,
    fields(rbg = %rbg.name_any(), role = %role.name)
)]
pub async fn reconcile_discovery_config_map(
    store: &impl ConfigMapStore,
    rbg: &RoleBasedGroup,
    role: &RoleSpec,
    cluster_config: &ClusterConfig,
) -> Result<Decision> {
    let name = rbg.workload_name(role);
    let namespace = rbg.namespace_or_default();

    let decision = decide(store, &name, &namespace, cluster_config).await?;
    match decision {
        Decision::Unchanged => {
            debug!(
                config_map.name = %name,
                "discovery ConfigMap is up to date, skipping apply"
            );
        }
        Decision::Create | Decision::Update => {
            let config_map = build_discovery_config_map(rbg, role, cluster_config)?;
            store
                .apply_config_map(&config_map)
                .await
                .context(ApplyConfigMapSnafu {
                    name: &name,
                    namespace: &namespace,
                })?;
            info!(config_map.name = %name, %decision, "applied discovery ConfigMap");
        }
    }

    Ok(decision)
}

/// Decides whether the ConfigMap `name` needs to be written.
///
/// A payload that can not be decoded is treated like a missing payload: it is logged and then
/// overwritten, a broken ConfigMap must never block convergence.
pub async fn decide(
    store: &impl ConfigMapStore,
    name: &str,
    namespace: &str,
    desired: &ClusterConfig,
) -> Result<Decision> {
    let Some(current) = store
        .get_config_map(name, namespace)
        .await
        .context(GetConfigMapSnafu { name, namespace })?
    else {
        return Ok(Decision::Create);
    };

    let stored = stored_cluster_config(&current);
    let comparison = compare_cluster_configs(stored.as_ref(), Some(desired));
    if comparison.is_equal() {
        Ok(Decision::Unchanged)
    } else {
        info!(config_map.name = %name, diff = %comparison, "cluster config changed");
        Ok(Decision::Update)
    }
}

/// Decodes the payload stored in `config_map`, if there is a valid one.
pub fn stored_cluster_config(config_map: &ConfigMap) -> Option<ClusterConfig> {
    let data = config_map
        .data
        .as_ref()?
        .get(CLUSTER_CONFIG_KEY)
        .filter(|data| !data.is_empty())?;

    match ClusterConfig::from_yaml(data) {
        Ok(cluster_config) => Some(cluster_config),
        Err(err) => {
            warn!(
                config_map.name = %config_map.name_any(),
                error = &err as &dyn std::error::Error,
                "failed to decode stored cluster config, treating it as absent"
            );
            None
        }
    }
}

/// Builds the desired discovery ConfigMap of `role`, controller-owned by `rbg`.
pub fn build_discovery_config_map(
    rbg: &RoleBasedGroup,
    role: &RoleSpec,
    cluster_config: &ClusterConfig,
) -> Result<ConfigMap> {
    let payload = cluster_config
        .to_yaml()
        .with_context(|_| SerializeClusterConfigSnafu {
            rbg: rbg.name_any(),
        })?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(rbg.workload_name(role)),
            namespace: Some(rbg.namespace_or_default()),
            owner_references: Some(vec![controller_reference(rbg)?]),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(CLUSTER_CONFIG_KEY.to_owned(), payload)])),
        ..ConfigMap::default()
    })
}

/// An owner reference which makes `rbg` the controller of the referencing object and blocks the
/// deletion of `rbg` until the object is garbage collected.
fn controller_reference(rbg: &RoleBasedGroup) -> Result<OwnerReference> {
    let owner_reference = rbg.controller_owner_ref(&()).context(MissingOwnerUidSnafu {
        rbg: rbg.name_any(),
    })?;

    Ok(OwnerReference {
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..owner_reference
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        crd::{RoleBasedGroupSpec, WorkloadKind, WorkloadSpec},
        topology::build_cluster_config,
    };

    /// An in-memory [`ConfigMapStore`] recording every applied ConfigMap.
    #[derive(Default)]
    pub struct FakeConfigMapStore {
        pub config_maps: Mutex<BTreeMap<(String, String), ConfigMap>>,
        pub applied: Mutex<Vec<ConfigMap>>,
    }

    impl FakeConfigMapStore {
        pub fn with(config_map: ConfigMap) -> Self {
            let store = Self::default();
            store.insert(config_map);
            store
        }

        fn insert(&self, config_map: ConfigMap) {
            let key = (
                config_map.namespace().unwrap_or_default(),
                config_map.name_any(),
            );
            self.config_maps
                .lock()
                .expect("lock poisoned")
                .insert(key, config_map);
        }

        pub fn applied(&self) -> Vec<ConfigMap> {
            self.applied.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl ConfigMapStore for FakeConfigMapStore {
        async fn get_config_map(
            &self,
            name: &str,
            namespace: &str,
        ) -> Result<Option<ConfigMap>, client::Error> {
            Ok(self
                .config_maps
                .lock()
                .expect("lock poisoned")
                .get(&(namespace.to_owned(), name.to_owned()))
                .cloned())
        }

        async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), client::Error> {
            self.applied
                .lock()
                .expect("lock poisoned")
                .push(config_map.clone());
            self.insert(config_map.clone());
            Ok(())
        }
    }

    /// A [`ConfigMapStore`] whose reads always fail.
    #[derive(Default)]
    pub struct FailingConfigMapStore {
        pub applied: Mutex<Vec<ConfigMap>>,
    }

    #[async_trait]
    impl ConfigMapStore for FailingConfigMapStore {
        async fn get_config_map(
            &self,
            _name: &str,
            _namespace: &str,
        ) -> Result<Option<ConfigMap>, client::Error> {
            Err(client::Error::MissingObjectKey {
                key: "metadata.name",
            })
        }

        async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), client::Error> {
            self.applied
                .lock()
                .expect("lock poisoned")
                .push(config_map.clone());
            Ok(())
        }
    }

    pub fn test_group() -> RoleBasedGroup {
        let mut rbg = RoleBasedGroup::new(
            "test-group",
            RoleBasedGroupSpec {
                roles: vec![RoleSpec {
                    name: "web".to_owned(),
                    replicas: Some(3),
                    workload: WorkloadSpec {
                        kind: Some(WorkloadKind::StatefulSet),
                    },
                    ..RoleSpec::default()
                }],
            },
        );
        rbg.metadata.namespace = Some("test-ns".to_owned());
        rbg.metadata.uid = Some("8b1d5e5c-7c59-4c3b-9d0f-2f9a3c1e1a11".to_owned());
        rbg
    }

    fn stored(data: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("test-group-web".to_owned()),
                namespace: Some("test-ns".to_owned()),
                ..ObjectMeta::default()
            },
            data: data
                .map(|data| BTreeMap::from([(CLUSTER_CONFIG_KEY.to_owned(), data.to_owned())])),
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn creates_missing_config_map() {
        let rbg = test_group();
        let role = &rbg.spec.roles[0];
        let store = FakeConfigMapStore::default();
        let cluster_config = build_cluster_config(&rbg);

        let decision = reconcile_discovery_config_map(&store, &rbg, role, &cluster_config)
            .await
            .expect("reconcile succeeds");
        assert_eq!(decision, Decision::Create);

        let applied = store.applied();
        assert_eq!(applied.len(), 1);

        let config_map = &applied[0];
        assert_eq!(config_map.metadata.name.as_deref(), Some("test-group-web"));
        assert_eq!(config_map.metadata.namespace.as_deref(), Some("test-ns"));

        let owner_references = config_map
            .metadata
            .owner_references
            .as_ref()
            .expect("owner reference set");
        assert_eq!(owner_references.len(), 1);
        assert_eq!(owner_references[0].kind, "RoleBasedGroup");
        assert_eq!(owner_references[0].api_version, "workloads.x-k8s.io/v1alpha1");
        assert_eq!(owner_references[0].name, "test-group");
        assert_eq!(owner_references[0].controller, Some(true));
        assert_eq!(owner_references[0].block_owner_deletion, Some(true));

        assert_eq!(stored_cluster_config(config_map), Some(cluster_config));
    }

    #[tokio::test]
    async fn second_reconcile_is_a_no_op() {
        let rbg = test_group();
        let role = &rbg.spec.roles[0];
        let store = FakeConfigMapStore::default();
        let cluster_config = build_cluster_config(&rbg);

        for expected in [Decision::Create, Decision::Unchanged, Decision::Unchanged] {
            let decision = reconcile_discovery_config_map(&store, &rbg, role, &cluster_config)
                .await
                .expect("reconcile succeeds");
            assert_eq!(decision, expected);
        }
        assert_eq!(store.applied().len(), 1);
    }

    #[tokio::test]
    async fn formatting_differences_are_not_changes() {
        let rbg = test_group();
        let cluster_config = build_cluster_config(&rbg);
        // Same content as the builder output, but flow style and a different key order
        let store = FakeConfigMapStore::with(stored(Some(
            "roles: [{startIndex: 0, replicas: 3, type: StatefulSet, name: web, \
                      service: test-group-web}]\n\
             group: {roleNames: [web], namespace: test-ns, name: test-group}\n",
        )));

        let decision = decide(&store, "test-group-web", "test-ns", &cluster_config)
            .await
            .expect("decide succeeds");
        assert_eq!(decision, Decision::Unchanged);
    }

    #[tokio::test]
    async fn changed_spec_updates_config_map() {
        let mut rbg = test_group();
        let store = FakeConfigMapStore::default();

        let initial = build_cluster_config(&rbg);
        reconcile_discovery_config_map(&store, &rbg, &rbg.spec.roles[0], &initial)
            .await
            .expect("reconcile succeeds");

        rbg.spec.roles[0].replicas = Some(5);
        let scaled = build_cluster_config(&rbg);
        let decision = reconcile_discovery_config_map(&store, &rbg, &rbg.spec.roles[0], &scaled)
            .await
            .expect("reconcile succeeds");

        assert_eq!(decision, Decision::Update);
        let applied = store.applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(stored_cluster_config(&applied[1]), Some(scaled));
    }

    #[tokio::test]
    async fn malformed_payload_is_overwritten() {
        let rbg = test_group();
        let role = &rbg.spec.roles[0];
        let store = FakeConfigMapStore::with(stored(Some("roles: [this is: not, valid")));
        let cluster_config = build_cluster_config(&rbg);

        let decision = reconcile_discovery_config_map(&store, &rbg, role, &cluster_config)
            .await
            .expect("a malformed payload must not fail the reconcile");

        assert_eq!(decision, Decision::Update);
        assert_eq!(store.applied().len(), 1);
    }

    #[tokio::test]
    async fn missing_payload_is_written() {
        let rbg = test_group();
        let cluster_config = build_cluster_config(&rbg);

        for config_map in [stored(None), stored(Some(""))] {
            let store = FakeConfigMapStore::with(config_map);
            let decision = decide(&store, "test-group-web", "test-ns", &cluster_config)
                .await
                .expect("decide succeeds");
            assert_eq!(decision, Decision::Update);
        }
    }

    #[test]
    fn owner_reference_requires_uid() {
        let mut rbg = test_group();
        rbg.metadata.uid = None;
        let cluster_config = build_cluster_config(&rbg);

        let result = build_discovery_config_map(&rbg, &rbg.spec.roles[0], &cluster_config);
        assert!(matches!(result, Err(Error::MissingOwnerUid { .. })));
    }

    #[tokio::test]
    async fn read_errors_propagate_without_write() {
        let rbg = test_group();
        let store = FailingConfigMapStore::default();
        let cluster_config = build_cluster_config(&rbg);

        let result =
            reconcile_discovery_config_map(&store, &rbg, &rbg.spec.roles[0], &cluster_config).await;

        assert!(matches!(
            result,
            Err(Error::GetConfigMap {
                source: client::Error::MissingObjectKey { .. },
                ref name,
                ref namespace,
            }) if name == "test-group-web" && namespace == "test-ns"
        ));
        assert!(store.applied.lock().expect("lock poisoned").is_empty());
    }
}
