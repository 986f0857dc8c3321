//! Mutates the pod template of a role so that its pods can discover the rest of the group.
//!
//! [`GroupInfoInjector::inject`] runs three steps in a fixed order:
//!
//! 1. [`inject_config`](GroupInfoInjector::inject_config) reconciles the discovery ConfigMap of
//!    the role and mounts it at [`CLUSTER_CONFIG_MOUNT_PATH`] into every container.
//! 2. [`inject_env`](GroupInfoInjector::inject_env) adds the group environment variables to every
//!    container.
//! 3. [`inject_sidecar`](GroupInfoInjector::inject_sidecar) merges the referenced runtime profiles.
//!
//! Containers contributed by runtime profiles are added last and therefore neither get the mount
//! nor the environment variables of the first two steps.
use async_trait::async_trait;
use indexmap::IndexMap;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, KeyToPath, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{
    client::Client,
    constants::{CLUSTER_CONFIG_KEY, CLUSTER_CONFIG_MOUNT_PATH, CLUSTER_CONFIG_VOLUME_NAME},
    crd::{RoleBasedGroup, RoleSpec},
    discovery::{self, ConfigMapStore, reconcile_discovery_config_map},
    env::{build_env_vars, inject_env_vars},
    sidecar::{self, RuntimeProfileStore, inject_sidecars},
    topology::build_cluster_config,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to reconcile the discovery ConfigMap of role {role:?}"))]
    ReconcileDiscoveryConfigMap {
        source: discovery::Error,
        role: String,
    },

    #[snafu(display("failed to inject runtime profiles into role {role:?}"))]
    InjectRuntimeProfiles { source: sidecar::Error, role: String },
}

#[async_trait]
pub trait GroupInfoInjector: Send + Sync {
    async fn inject_config(
        &self,
        pod_template: &mut PodTemplateSpec,
        rbg: &RoleBasedGroup,
        role: &RoleSpec,
    ) -> Result<()>;

    async fn inject_env(
        &self,
        pod_template: &mut PodTemplateSpec,
        rbg: &RoleBasedGroup,
        role: &RoleSpec,
    ) -> Result<()>;

    async fn inject_sidecar(
        &self,
        pod_template: &mut PodTemplateSpec,
        rbg: &RoleBasedGroup,
        role: &RoleSpec,
    ) -> Result<()>;

    /// Runs all injection steps. The template is left partially mutated if a step fails.
    ///
    /// Expects a freshly built pod template. Running it again on its own output also hands the
    /// discovery mount and the group env vars to the containers added by runtime profiles.
    async fn inject(
        &self,
        pod_template: &mut PodTemplateSpec,
        rbg: &RoleBasedGroup,
        role: &RoleSpec,
    ) -> Result<()> {
        self.inject_config(pod_template, rbg, role).await?;
        self.inject_env(pod_template, rbg, role).await?;
        self.inject_sidecar(pod_template, rbg, role).await
    }
}

/// The [`GroupInfoInjector`] backed by a [`ConfigMapStore`] and a [`RuntimeProfileStore`].
pub struct DefaultInjector<C, P> {
    config_maps: C,
    runtime_profiles: P,
}

impl<C, P> DefaultInjector<C, P> {
    pub fn new(config_maps: C, runtime_profiles: P) -> Self {
        Self {
            config_maps,
            runtime_profiles,
        }
    }
}

impl DefaultInjector<Client, Client> {
    pub fn from_client(client: Client) -> Self {
        Self::new(client.clone(), client)
    }
}

#[async_trait]
impl<C, P> GroupInfoInjector for DefaultInjector<C, P>
where
    C: ConfigMapStore,
    P: RuntimeProfileStore,
{
    #[instrument(skip_all, fields(rbg = %rbg.name_any(), role.name = %role.name))]
    async fn inject_config(
        &self,
        pod_template: &mut PodTemplateSpec,
        rbg: &RoleBasedGroup,
        role: &RoleSpec,
    ) -> Result<()> {
        let cluster_config = build_cluster_config(rbg);
        let decision =
            reconcile_discovery_config_map(&self.config_maps, rbg, role, &cluster_config)
                .await
                .context(ReconcileDiscoveryConfigMapSnafu { role: &role.name })?;
        debug!(%decision, "reconciled discovery ConfigMap");

        let pod_spec = pod_template.spec.get_or_insert_with(PodSpec::default);
        inject_cluster_config_volume(pod_spec, cluster_config_volume(rbg, role));
        inject_cluster_config_mounts(pod_spec);

        Ok(())
    }

    async fn inject_env(
        &self,
        pod_template: &mut PodTemplateSpec,
        rbg: &RoleBasedGroup,
        role: &RoleSpec,
    ) -> Result<()> {
        inject_env_vars(pod_template, &build_env_vars(rbg, role));
        Ok(())
    }

    async fn inject_sidecar(
        &self,
        pod_template: &mut PodTemplateSpec,
        _rbg: &RoleBasedGroup,
        role: &RoleSpec,
    ) -> Result<()> {
        inject_sidecars(&self.runtime_profiles, role, pod_template)
            .await
            .context(InjectRuntimeProfilesSnafu { role: &role.name })
    }
}

/// The volume projecting the discovery payload of `role` out of its ConfigMap.
pub fn cluster_config_volume(rbg: &RoleBasedGroup, role: &RoleSpec) -> Volume {
    Volume {
        name: CLUSTER_CONFIG_VOLUME_NAME.to_owned(),
        config_map: Some(ConfigMapVolumeSource {
            name: rbg.workload_name(role),
            items: Some(vec![KeyToPath {
                key: CLUSTER_CONFIG_KEY.to_owned(),
                path: CLUSTER_CONFIG_KEY.to_owned(),
                ..KeyToPath::default()
            }]),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    }
}

pub fn cluster_config_volume_mount() -> VolumeMount {
    VolumeMount {
        name: CLUSTER_CONFIG_VOLUME_NAME.to_owned(),
        mount_path: CLUSTER_CONFIG_MOUNT_PATH.to_owned(),
        read_only: Some(true),
        ..VolumeMount::default()
    }
}

/// Adds `volume` unless the pod already has a volume with the same name.
fn inject_cluster_config_volume(pod_spec: &mut PodSpec, volume: Volume) {
    let mut volumes: IndexMap<String, Volume> = pod_spec
        .volumes
        .take()
        .unwrap_or_default()
        .into_iter()
        .map(|volume| (volume.name.clone(), volume))
        .collect();
    volumes.entry(volume.name.clone()).or_insert(volume);

    pod_spec.volumes = Some(volumes.into_values().collect());
}

/// Adds the discovery mount to every container which does not mount the discovery volume at the
/// discovery path yet.
fn inject_cluster_config_mounts(pod_spec: &mut PodSpec) {
    let mount = cluster_config_volume_mount();

    for container in &mut pod_spec.containers {
        let mut volume_mounts: IndexMap<(String, String), VolumeMount> = container
            .volume_mounts
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|volume_mount| {
                let key = (volume_mount.name.clone(), volume_mount.mount_path.clone());
                (key, volume_mount)
            })
            .collect();
        volume_mounts
            .entry((mount.name.clone(), mount.mount_path.clone()))
            .or_insert_with(|| mount.clone());

        container.volume_mounts = Some(volume_mounts.into_values().collect());
    }
}
