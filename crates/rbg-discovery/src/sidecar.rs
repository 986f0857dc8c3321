//! Merges [`ClusterEngineRuntimeProfile`]s referenced by a role into its pod template.
//!
//! Every element is merged by name and an element already present in the pod template always
//! wins over the profile's copy, so injecting the same profiles again changes nothing.
use async_trait::async_trait;
use indexmap::IndexMap;
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Volume};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{
    client::{self, Client},
    crd::{ClusterEngineRuntimeProfile, ContainerOverride, RoleSpec},
    env::merge_container_env,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get ClusterEngineRuntimeProfile {name:?}"))]
    GetProfile { source: client::Error, name: String },

    #[snafu(display("ClusterEngineRuntimeProfile {name:?} referenced by role {role:?} not found"))]
    ProfileNotFound { name: String, role: String },
}

/// Read access to [`ClusterEngineRuntimeProfile`]s.
#[async_trait]
pub trait RuntimeProfileStore: Send + Sync {
    /// Returns `Ok(None)` if the profile does not exist.
    async fn get_runtime_profile(
        &self,
        name: &str,
    ) -> Result<Option<ClusterEngineRuntimeProfile>, client::Error>;
}

#[async_trait]
impl RuntimeProfileStore for Client {
    async fn get_runtime_profile(
        &self,
        name: &str,
    ) -> Result<Option<ClusterEngineRuntimeProfile>, client::Error> {
        self.get_cluster_opt(name).await
    }
}

/// Injects every runtime profile referenced by `role` into `pod_template`.
///
/// Profiles are resolved and merged in the order they are referenced. A role without references
/// leaves the template untouched.
#[instrument(skip_all, fields(role.name = %role.name))]
pub async fn inject_sidecars(
    store: &impl RuntimeProfileStore,
    role: &RoleSpec,
    pod_template: &mut PodTemplateSpec,
) -> Result<()> {
    for engine_runtime in &role.engine_runtimes {
        let name = &engine_runtime.profile_name;
        let profile = store
            .get_runtime_profile(name)
            .await
            .context(GetProfileSnafu { name })?
            .context(ProfileNotFoundSnafu {
                name,
                role: &role.name,
            })?;

        let pod_spec = pod_template.spec.get_or_insert_with(PodSpec::default);
        merge_profile(pod_spec, &profile);
        for container_override in &engine_runtime.containers {
            apply_container_override(&mut pod_spec.containers, container_override);
        }
        debug!(profile.name = %name, "injected runtime profile");
    }

    Ok(())
}

fn merge_profile(pod_spec: &mut PodSpec, profile: &ClusterEngineRuntimeProfile) {
    let spec = &profile.spec;

    merge_optional(&mut pod_spec.init_containers, &spec.init_containers, |c: &Container| {
        &c.name
    });
    if !spec.containers.is_empty() {
        pod_spec.containers = merge_by_name(
            std::mem::take(&mut pod_spec.containers),
            &spec.containers,
            |c| &c.name,
        );
    }
    merge_optional(&mut pod_spec.volumes, &spec.volumes, |v: &Volume| &v.name);
}

/// Like [`merge_by_name`], but keeps an unset list unset if there is nothing to add.
fn merge_optional<T: Clone>(
    existing: &mut Option<Vec<T>>,
    additions: &[T],
    name: impl Fn(&T) -> &String,
) {
    if additions.is_empty() {
        return;
    }
    let merged = merge_by_name(existing.take().unwrap_or_default(), additions, name);
    *existing = Some(merged);
}

/// Appends every element of `additions` whose name is not yet taken. The order of `existing` is
/// kept, new elements follow in their order.
fn merge_by_name<T: Clone>(
    existing: Vec<T>,
    additions: &[T],
    name: impl Fn(&T) -> &String,
) -> Vec<T> {
    let mut merged: IndexMap<String, T> = existing
        .into_iter()
        .map(|item| (name(&item).clone(), item))
        .collect();

    for item in additions {
        merged
            .entry(name(item).clone())
            .or_insert_with(|| item.clone());
    }

    merged.into_values().collect()
}

fn apply_container_override(containers: &mut [Container], container_override: &ContainerOverride) {
    let Some(container) = containers
        .iter_mut()
        .find(|container| container.name == container_override.name)
    else {
        debug!(
            container.name = %container_override.name,
            "no container to apply the override to"
        );
        return;
    };

    if !container_override.args.is_empty() {
        container.args = Some(container_override.args.clone());
    }
    if !container_override.env.is_empty() {
        merge_container_env(container, &container_override.env);
    }
}
