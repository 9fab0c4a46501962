//! End-to-end onboarding of a single user.
//!
//! Stages run strictly one after another. A failing stage stops the
//! pipeline and its error is tagged with the stage name. Running it again
//! reuses the saved key and request, so it picks up where it stopped.

use std::path::PathBuf;

use crate::{
    access::{verify_all, AccessCheck, AccessDecision},
    config_writer::{verify_usable, AccessConfig},
    control_plane::ControlPlane,
    error::{KuserResult, Stage, StageExt},
    identity::{write_public, Identity, IdentityFiles, DEFAULT_KEY_SIZE},
    permissions::{provision, Binding, PermissionSet},
    request::{approve, submit, SigningRequest, SubmitOutcome, DEFAULT_SIGNER_NAME, DEFAULT_USAGES},
    retriever::{fetch_certificate, PollPolicy},
};

#[derive(Debug, Clone)]
pub struct OnboardPlan {
    pub subject: String,
    pub groups: Vec<String>,
    pub key_size: u32,
    /// Generate a new key even if one was saved by an earlier run.
    pub force: bool,
    pub dir: PathBuf,
    pub signer_name: String,
    pub usages: Vec<String>,
    pub poll: PollPolicy,
    pub cluster_name: String,
    /// API server address. Defaults to the control plane's own.
    pub server: Option<String>,
    pub namespace: String,
    pub permission_set: Option<PermissionSet>,
}

impl OnboardPlan {
    #[must_use]
    pub fn new(subject: &str, dir: impl Into<PathBuf>) -> Self {
        Self {
            subject: subject.to_string(),
            groups: Vec::new(),
            key_size: DEFAULT_KEY_SIZE,
            force: false,
            dir: dir.into(),
            signer_name: String::from(DEFAULT_SIGNER_NAME),
            usages: DEFAULT_USAGES.map(String::from).to_vec(),
            poll: PollPolicy::default(),
            cluster_name: String::from("cluster"),
            server: None,
            namespace: String::from("default"),
            permission_set: None,
        }
    }

    /// Checks run at the end: every granted (verb, resource) pair,
    /// or `get pods` when nothing is granted.
    #[must_use]
    pub fn access_checks(&self) -> Vec<AccessCheck> {
        let Some(set) = &self.permission_set else {
            return vec![AccessCheck::new("get", "pods", Some(&self.namespace))];
        };
        let namespace = set.scope.namespace();
        let mut checks = Vec::new();
        for rule in &set.rules {
            for group in &rule.api_groups {
                for resource in &rule.resources {
                    for verb in &rule.verbs {
                        checks.push(AccessCheck::new(verb, resource, namespace).with_group(group));
                    }
                }
            }
        }
        checks
    }
}

#[derive(Debug)]
pub struct OnboardReport {
    pub files: IdentityFiles,
    pub submitted: SubmitOutcome,
    pub binding: Option<Binding>,
    pub access: Vec<(AccessCheck, AccessDecision)>,
}

fn create_identity(plan: &OnboardPlan, files: &IdentityFiles) -> KuserResult<Identity> {
    if !plan.force && files.exists() {
        tracing::info!(key = %files.key_path().display(), "Reusing saved identity");
        return files.load();
    }
    let identity = Identity::generate(&plan.subject, &plan.groups, plan.key_size)?;
    files.save(&identity, plan.force)?;
    Ok(identity)
}

#[tracing::instrument(skip_all, fields(subject = %plan.subject), err)]
pub async fn onboard<C: ControlPlane>(cp: &C, plan: &OnboardPlan) -> KuserResult<OnboardReport> {
    let files = IdentityFiles::new(&plan.dir, &plan.subject);
    let identity = create_identity(plan, &files).stage(Stage::CreateIdentity)?;

    let request = SigningRequest {
        name: plan.subject.clone(),
        request_pem: identity.request_pem()?,
        usages: plan.usages.clone(),
        signer_name: plan.signer_name.clone(),
        expiration_seconds: None,
    };
    let submitted = submit(cp, &request).await.stage(Stage::SubmitRequest)?;
    approve(cp, &request.name, None)
        .await
        .stage(Stage::ApproveRequest)?;

    let cert = fetch_certificate(cp, &request.name, &plan.poll)
        .await
        .stage(Stage::FetchCertificate)?;
    let cert_pem = cert.to_pem()?;
    write_public(&files.cert_path(), &cert_pem).stage(Stage::FetchCertificate)?;

    let ca_data = cp.root_ca().await.stage(Stage::WriteConfig)?;
    let config = AccessConfig {
        cluster_name: plan.cluster_name.clone(),
        server: plan.server.clone().unwrap_or_else(|| cp.server_url()),
        ca_data,
        subject: plan.subject.clone(),
        certificate: cert_pem,
        key: identity.key,
        namespace: Some(plan.namespace.clone()),
    };
    config
        .write(&files.kubeconfig_path())
        .stage(Stage::WriteConfig)?;
    let session = verify_usable(cp, &files.kubeconfig_path(), &plan.subject)
        .await
        .stage(Stage::WriteConfig)?;

    let binding = match &plan.permission_set {
        Some(set) => Some(
            provision(cp, set, &plan.subject)
                .await
                .stage(Stage::ProvisionPermissions)?,
        ),
        None => None,
    };

    let checks = plan.access_checks();
    let decisions = verify_all(&session, None, &checks)
        .await
        .stage(Stage::VerifyAccess)?;
    tracing::info!("User onboarded");
    Ok(OnboardReport {
        files,
        submitted,
        binding,
        access: checks.into_iter().zip(decisions).collect(),
    })
}
