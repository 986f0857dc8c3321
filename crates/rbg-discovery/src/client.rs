use std::fmt::Debug;

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    Api, Resource, ResourceExt,
    api::{Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;

use crate::constants::DEFAULT_FIELD_MANAGER;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {kind} {name:?}"))]
    GetResource {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to apply patch to {kind} {name:?}"))]
    ApplyPatch {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("object is missing key {key:?}"))]
    MissingObjectKey { key: &'static str },
}

/// This `Client` can be used to access Kubernetes.
///
/// It wraps an underlying [`kube::Client`] and knows the field manager all server-side apply
/// patches are sent with.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    apply_patch_params: PatchParams,
}

impl Client {
    pub fn new(client: kube::Client, field_manager: Option<String>) -> Self {
        let field_manager = field_manager.unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_owned());
        Self {
            client,
            apply_patch_params: PatchParams::apply(&field_manager).force(),
        }
    }

    /// Returns a [`kube::Client`] that can be freely used.
    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    /// Retrieves a single namespaced object. A missing object is not an error but `None`.
    #[instrument(skip(self), fields(kind = %T::kind(&())))]
    pub async fn get_namespaced_opt<T>(&self, name: &str, namespace: &str) -> Result<Option<T>>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::<T>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .with_context(|_| GetResourceSnafu {
                kind: T::kind(&()).into_owned(),
                name,
            })
    }

    /// Retrieves a single cluster scoped object. A missing object is not an error but `None`.
    #[instrument(skip(self), fields(kind = %T::kind(&())))]
    pub async fn get_cluster_opt<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = ClusterResourceScope>,
    {
        Api::<T>::all(self.client.clone())
            .get_opt(name)
            .await
            .with_context(|_| GetResourceSnafu {
                kind: T::kind(&()).into_owned(),
                name,
            })
    }

    /// Patches a namespaced object using server-side apply.
    ///
    /// This will _create_ or _update_ the object and takes ownership of every field present in
    /// `resource`.
    #[instrument(skip_all, fields(kind = %T::kind(&()), name = %resource.name_any()))]
    pub async fn apply_patch<T>(&self, resource: &T) -> Result<T>
    where
        T: Clone
            + Debug
            + DeserializeOwned
            + Serialize
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let name = resource.meta().name.as_deref().context(MissingObjectKeySnafu {
            key: "metadata.name",
        })?;
        let namespace = resource
            .meta()
            .namespace
            .as_deref()
            .context(MissingObjectKeySnafu {
                key: "metadata.namespace",
            })?;

        Api::<T>::namespaced(self.client.clone(), namespace)
            .patch(name, &self.apply_patch_params, &Patch::Apply(resource))
            .await
            .with_context(|_| ApplyPatchSnafu {
                kind: T::kind(&()).into_owned(),
                name,
            })
    }
}
