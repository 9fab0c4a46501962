use std::path::Path;

use k8s_openapi::api::{
    authentication::v1::SelfSubjectReview,
    authorization::v1::{
        SelfSubjectAccessReview, SelfSubjectAccessReviewSpec, SubjectAccessReview,
        SubjectAccessReviewSpec,
    },
    certificates::v1::CertificateSigningRequest,
    core::v1::ConfigMap,
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Api, ResourceExt,
};

use super::ControlPlane;
use crate::{
    access::{AccessCheck, AccessDecision},
    args::ClusterArgs,
    error::{KuserError, KuserResult},
    permissions::PermissionScope,
    utils::resource::KuserResourceExt,
};

/// Control plane backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeControlPlane {
    client: kube::Client,
    cluster_url: String,
    ca_configmap_name: String,
    ca_configmap_key: String,
}

impl KubeControlPlane {
    /// Connect with credentials inferred from the environment
    /// (`KUBECONFIG`, `~/.kube/config` or the in-cluster service account).
    pub async fn connect(args: &ClusterArgs) -> KuserResult<Self> {
        tracing::info!("Connecting to Kubernetes");
        let config = kube::Config::infer().await?;
        let mut this = Self::from_config(config)?;
        this.ca_configmap_name.clone_from(&args.ca_configmap_name);
        this.ca_configmap_key.clone_from(&args.ca_configmap_key);
        tracing::info!(server = %this.cluster_url, "Connected to Kubernetes");
        Ok(this)
    }

    /// Connect as the identity stored in a kubeconfig file.
    pub async fn from_kubeconfig(path: &Path, args: &ClusterArgs) -> KuserResult<Self> {
        let mut this = Self::from_config(Self::load_kubeconfig(path).await?)?;
        this.ca_configmap_name.clone_from(&args.ca_configmap_name);
        this.ca_configmap_key.clone_from(&args.ca_configmap_key);
        Ok(this)
    }

    async fn load_kubeconfig(path: &Path) -> KuserResult<kube::Config> {
        tracing::info!(kubeconfig = %path.display(), "Connecting to Kubernetes");
        let kubeconfig = Kubeconfig::read_from(path)?;
        Ok(kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
    }

    fn from_config(config: kube::Config) -> KuserResult<Self> {
        let cluster_url = config.cluster_url.to_string();
        let client = kube::Client::try_from(config)?;
        Ok(Self {
            client,
            cluster_url: cluster_url.trim_end_matches('/').to_string(),
            ca_configmap_name: String::new(),
            ca_configmap_key: String::new(),
        })
    }

    fn csr_api(&self) -> Api<CertificateSigningRequest> {
        Api::all(self.client.clone())
    }
}

impl ControlPlane for KubeControlPlane {
    fn server_url(&self) -> String {
        self.cluster_url.clone()
    }

    async fn connect_as(&self, kubeconfig: &Path) -> KuserResult<Self> {
        Ok(Self {
            ca_configmap_name: self.ca_configmap_name.clone(),
            ca_configmap_key: self.ca_configmap_key.clone(),
            ..Self::from_config(Self::load_kubeconfig(kubeconfig).await?)?
        })
    }

    async fn authenticated_user(&self) -> KuserResult<String> {
        let review = Api::<SelfSubjectReview>::all(self.client.clone())
            .create(&PostParams::default(), &SelfSubjectReview::default())
            .await
            .map_err(|err| match err {
                // Refused connections, TLS failures and rejected credentials
                // all mean the kubeconfig doesn't work.
                kube::Error::Api(response) if response.code != 401 => {
                    KuserError::from(kube::Error::Api(response))
                }
                err => KuserError::Unauthenticated(err.to_string()),
            })?;
        review
            .status
            .and_then(|status| status.user_info)
            .and_then(|user| user.username)
            .ok_or_else(|| {
                KuserError::Unauthenticated(String::from(
                    "The API server didn't report who we are",
                ))
            })
    }

    async fn root_ca(&self) -> KuserResult<String> {
        let cm_api = Api::<ConfigMap>::namespaced(self.client.clone(), self.client.default_namespace());
        let cm_name = &self.ca_configmap_name;
        let Some(cert_config_map) = cm_api.get_opt(cm_name).await? else {
            return Err(KuserError::CannotGetRootCert(format!(
                "The ConfigMap {cm_name} doesn't exist.",
            )));
        };
        let Some(cert_cm_data) = &cert_config_map.data else {
            return Err(KuserError::CannotGetRootCert(format!(
                "The ConfigMap {cm_name} has no data.",
            )));
        };
        let key = &self.ca_configmap_key;
        let Some(kube_cert) = cert_cm_data.get(key) else {
            return Err(KuserError::CannotGetRootCert(format!(
                "The key {key} doesn't exist in the ConfigMap {cm_name}."
            )));
        };
        Ok(kube_cert.clone())
    }

    async fn create_csr(
        &self,
        csr: &CertificateSigningRequest,
    ) -> KuserResult<CertificateSigningRequest> {
        Ok(self.csr_api().create(&PostParams::default(), csr).await?)
    }

    async fn get_csr(&self, name: &str) -> KuserResult<Option<CertificateSigningRequest>> {
        Ok(self.csr_api().get_opt(name).await?)
    }

    async fn update_csr_approval(
        &self,
        csr: &CertificateSigningRequest,
    ) -> KuserResult<CertificateSigningRequest> {
        let patch = serde_json::json!({
            "status": {
                "conditions": csr.status.as_ref().and_then(|status| status.conditions.as_ref()),
            }
        });
        Ok(self
            .csr_api()
            .patch_approval(&csr.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn apply_role(&self, role: &Role) -> KuserResult<Role> {
        let namespace = role.namespace().unwrap_or_default();
        role.patch_or_create(Api::namespaced(self.client.clone(), &namespace))
            .await
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> KuserResult<ClusterRole> {
        role.patch_or_create(Api::all(self.client.clone())).await
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> KuserResult<RoleBinding> {
        let namespace = binding.namespace().unwrap_or_default();
        binding
            .patch_or_create(Api::namespaced(self.client.clone(), &namespace))
            .await
    }

    async fn apply_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> KuserResult<ClusterRoleBinding> {
        binding
            .patch_or_create(Api::all(self.client.clone()))
            .await
    }

    async fn permission_set_exists(
        &self,
        scope: &PermissionScope,
        name: &str,
    ) -> KuserResult<bool> {
        let meta = match scope {
            PermissionScope::Namespace(namespace) => {
                Api::<Role>::namespaced(self.client.clone(), namespace)
                    .get_metadata_opt(name)
                    .await?
                    .map(|meta| meta.metadata)
            }
            PermissionScope::Cluster => {
                Api::<ClusterRole>::all(self.client.clone())
                    .get_metadata_opt(name)
                    .await?
                    .map(|meta| meta.metadata)
            }
        };
        Ok(meta.is_some())
    }

    async fn review_access(
        &self,
        subject: Option<&str>,
        check: &AccessCheck,
    ) -> KuserResult<AccessDecision> {
        let attributes = Some(check.to_resource_attributes());
        let status = if let Some(subject) = subject {
            Api::<SubjectAccessReview>::all(self.client.clone())
                .create(
                    &PostParams::default(),
                    &SubjectAccessReview {
                        spec: SubjectAccessReviewSpec {
                            user: Some(subject.to_string()),
                            resource_attributes: attributes,
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                )
                .await?
                .status
        } else {
            Api::<SelfSubjectAccessReview>::all(self.client.clone())
                .create(
                    &PostParams::default(),
                    &SelfSubjectAccessReview {
                        spec: SelfSubjectAccessReviewSpec {
                            resource_attributes: attributes,
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                )
                .await?
                .status
        };
        Ok(AccessDecision::from_status(status.as_ref()))
    }
}
