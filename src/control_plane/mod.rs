//! Everything the provisioning pipeline needs from the cluster.
//!
//! [`kubernetes::KubeControlPlane`] talks to a real API server.
//! [`memory::MemoryControlPlane`] keeps everything in process, signs requests
//! with a throwaway CA and evaluates RBAC itself.

use std::path::Path;

use k8s_openapi::api::{
    certificates::v1::CertificateSigningRequest,
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
};

use crate::{
    access::{AccessCheck, AccessDecision},
    error::KuserResult,
    permissions::PermissionScope,
};

pub mod kubernetes;
pub mod memory;

#[allow(async_fn_in_trait)]
pub trait ControlPlane: Sized {
    /// Address of the API server clients should connect to.
    fn server_url(&self) -> String;

    /// Connect to the cluster described by `kubeconfig`, with its credentials.
    async fn connect_as(&self, kubeconfig: &Path) -> KuserResult<Self>;

    /// User name the API server authenticated the caller as.
    async fn authenticated_user(&self) -> KuserResult<String>;

    /// PEM bundle of the cluster certificate authority.
    async fn root_ca(&self) -> KuserResult<String>;

    async fn create_csr(
        &self,
        csr: &CertificateSigningRequest,
    ) -> KuserResult<CertificateSigningRequest>;

    async fn get_csr(&self, name: &str) -> KuserResult<Option<CertificateSigningRequest>>;

    /// Replace the conditions of a request through its approval subresource.
    async fn update_csr_approval(
        &self,
        csr: &CertificateSigningRequest,
    ) -> KuserResult<CertificateSigningRequest>;

    async fn apply_role(&self, role: &Role) -> KuserResult<Role>;

    async fn apply_cluster_role(&self, role: &ClusterRole) -> KuserResult<ClusterRole>;

    async fn apply_role_binding(&self, binding: &RoleBinding) -> KuserResult<RoleBinding>;

    async fn apply_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> KuserResult<ClusterRoleBinding>;

    async fn permission_set_exists(&self, scope: &PermissionScope, name: &str)
        -> KuserResult<bool>;

    /// Ask whether `subject` may perform `check`.
    /// `None` asks on behalf of the caller itself.
    async fn review_access(
        &self,
        subject: Option<&str>,
        check: &AccessCheck,
    ) -> KuserResult<AccessDecision>;
}
