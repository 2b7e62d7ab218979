//! Kubernetes Cluster Adapter
//!
//! Implements the `ClusterApi` port on top of `kube::Api`.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolume, PersistentVolumeClaim, Secret,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, instrument};

use crate::domain::ClusterApi;
use crate::error::{Error, Result};

/// `ClusterApi` backed by a live API server.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl std::fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterApi").finish()
    }
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from an explicit kubeconfig, or falls back to the
    /// in-cluster / default kubeconfig discovery.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Configuration(format!(
                        "failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::Configuration(format!("failed to get cluster config: {}", e))
                    })?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::Configuration(format!("failed to get cluster config: {}", e)))?,
        };

        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Maps a 404 to `ResourceNotFound`; everything else stays a kube error.
fn classify(kind: &'static str, name: &str) -> impl FnOnce(kube::Error) -> Error {
    let name = name.to_string();
    move |e| match e {
        kube::Error::Api(ref response) if response.code == 404 => Error::not_found(kind, name),
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.volumes()
            .get(name)
            .await
            .map_err(classify("PersistentVolume", name))
    }

    #[instrument(skip(self, volume), fields(volume = ?volume.metadata.name))]
    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        let name = volume
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::missing_field("PersistentVolume", "metadata.name"))?;
        self.volumes()
            .replace(name, &PostParams::default(), volume)
            .await
            .map_err(classify("PersistentVolume", name))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.volumes()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(classify("PersistentVolume", name))?;
        debug!(name = %name, "Requested PersistentVolume deletion");
        Ok(())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.claims(namespace)
            .get(name)
            .await
            .map_err(classify("PersistentVolumeClaim", &format!("{}/{}", namespace, name)))
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = claim
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::missing_field("PersistentVolumeClaim", "metadata.namespace"))?;
        self.claims(namespace)
            .create(&PostParams::default(), claim)
            .await
            .map_err(classify("Namespace", namespace))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.claims(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(classify("PersistentVolumeClaim", &format!("{}/{}", namespace, name)))?;
        debug!(namespace = %namespace, name = %name, "Requested PersistentVolumeClaim deletion");
        Ok(())
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let list = self.claims(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get(name).await.map_err(classify("Namespace", name))?;
        Ok(())
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.get(name).await.map_err(classify("StorageClass", name))
    }

    async fn get_config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = api
            .get(name)
            .await
            .map_err(classify("ConfigMap", &format!("{}/{}", namespace, name)))?;
        Ok(config_map.data.unwrap_or_default())
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get(name)
            .await
            .map_err(classify("Secret", &format!("{}/{}", namespace, name)))?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}
