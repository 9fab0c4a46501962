use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use kube::config::{AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext};
use openssl::x509::X509;

use crate::{
    control_plane::ControlPlane,
    error::{KuserError, KuserResult},
    identity::{write_secret, PrivateKey},
};

/// Everything needed to authenticate to the cluster as one identity.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub cluster_name: String,
    /// API server address.
    pub server: String,
    /// PEM bundle of the cluster CA.
    pub ca_data: String,
    pub subject: String,
    /// PEM client certificate.
    pub certificate: Vec<u8>,
    pub key: PrivateKey,
    /// Default namespace of the context.
    pub namespace: Option<String>,
}

fn require(field: &str, value: &str) -> KuserResult<()> {
    if value.trim().is_empty() {
        return Err(KuserError::Validation(format!(
            "Cannot build kubeconfig: {field} is missing"
        )));
    }
    Ok(())
}

impl AccessConfig {
    #[must_use]
    pub fn context_name(&self) -> String {
        format!("{}@{}", self.subject, self.cluster_name)
    }

    /// Check that the config can actually be used to authenticate.
    pub fn validate(&self) -> KuserResult<()> {
        require("cluster name", &self.cluster_name)?;
        require("server", &self.server)?;
        require("CA data", &self.ca_data)?;
        require("subject", &self.subject)?;
        if self.certificate.is_empty() {
            return Err(KuserError::Validation(String::from(
                "Cannot build kubeconfig: client certificate is missing",
            )));
        }
        let cert = X509::from_pem(&self.certificate).map_err(|err| {
            KuserError::Validation(format!("Client certificate is not valid PEM: {err}"))
        })?;
        if !cert.public_key()?.public_eq(self.key.pkey()) {
            return Err(KuserError::Validation(format!(
                "Client certificate of {} doesn't match its private key",
                self.subject
            )));
        }
        let cn = crate::identity::certificate_subject(&cert);
        if cn.as_deref() != Some(self.subject.as_str()) {
            return Err(KuserError::Validation(format!(
                "Client certificate was issued for {}, not {}",
                cn.as_deref().unwrap_or("<unknown>"),
                self.subject
            )));
        }
        let authorities = X509::stack_from_pem(self.ca_data.as_bytes()).map_err(|err| {
            KuserError::Validation(format!("CA data is not valid PEM: {err}"))
        })?;
        let mut trusted = false;
        for authority in &authorities {
            if cert.verify(&*authority.public_key()?)? {
                trusted = true;
                break;
            }
        }
        if !trusted {
            return Err(KuserError::Validation(format!(
                "Client certificate of {} is not signed by the cluster CA",
                self.subject
            )));
        }
        Ok(())
    }

    pub fn build_kubeconfig(&self) -> KuserResult<Kubeconfig> {
        self.validate()?;
        let private_key = String::from_utf8(self.key.to_pem()?)?;
        let mut kubeconfig = Kubeconfig {
            api_version: Some(String::from("v1")),
            kind: Some(String::from("Config")),
            ..Default::default()
        };
        kubeconfig.clusters.push(NamedCluster {
            name: self.cluster_name.clone(),
            cluster: Some(Cluster {
                server: Some(self.server.clone()),
                certificate_authority_data: Some(BASE64_STANDARD.encode(&self.ca_data)),
                ..Default::default()
            }),
        });
        kubeconfig.auth_infos.push(NamedAuthInfo {
            name: self.subject.clone(),
            auth_info: Some(AuthInfo {
                client_certificate_data: Some(BASE64_STANDARD.encode(&self.certificate)),
                client_key_data: Some(BASE64_STANDARD.encode(private_key).into()),
                ..Default::default()
            }),
        });
        kubeconfig.contexts.push(NamedContext {
            name: self.context_name(),
            context: Some(Context {
                cluster: self.cluster_name.clone(),
                user: self.subject.clone(),
                namespace: self.namespace.clone(),
                ..Default::default()
            }),
        });
        kubeconfig.current_context = Some(self.context_name());
        Ok(kubeconfig)
    }

    pub fn to_yaml(&self) -> KuserResult<String> {
        Ok(serde_yaml::to_string(&self.build_kubeconfig()?)?)
    }

    /// Write the kubeconfig. It holds the private key, so only the owner may read it.
    #[tracing::instrument(skip(self), fields(subject = %self.subject), err)]
    pub fn write(&self, path: &Path) -> KuserResult<String> {
        let yaml = self.to_yaml()?;
        write_secret(path, yaml.as_bytes())?;
        tracing::info!(path = %path.display(), "Kubeconfig written");
        Ok(yaml)
    }
}

/// Connect with the kubeconfig at `path` and make sure the cluster takes it
/// for `subject`. Returns a control plane acting as that identity.
#[tracing::instrument(skip(cp), fields(kubeconfig = %path.display()), err)]
pub async fn verify_usable<C: ControlPlane>(cp: &C, path: &Path, subject: &str) -> KuserResult<C> {
    let session = cp.connect_as(path).await?;
    let user = session.authenticated_user().await?;
    if user != subject {
        return Err(KuserError::Unauthenticated(format!(
            "The cluster took the kubeconfig for {user}, not {subject}"
        )));
    }
    tracing::info!("Kubeconfig accepted by the cluster");
    Ok(session)
}
