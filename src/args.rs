use std::{path::PathBuf, time::Duration};

use crate::{
    access::AccessCheck,
    permissions::{PermissionScope, PermissionSet, Rule},
    request::{DEFAULT_SIGNER_NAME, DEFAULT_USAGES},
    retriever::PollPolicy,
};

#[derive(clap::Args, Debug, Clone)]
#[group(requires = "url", requires = "from_email")]
pub struct SMTPArgs {
    /// SMTP server host.
    /// This variable should specify smtp or smtps URL.
    #[clap(long = "smtp-url", env = "KUSER_SMTP_URL", required = false)]
    pub url: String,

    /// SMTP server port.
    #[clap(long = "smtp-port", env = "KUSER_SMTP_PORT", default_value = "587")]
    pub port: u16,

    /// SMTP username to authenticate with.
    #[clap(long = "smtp-user", env = "KUSER_SMTP_USER", default_value = "kuser")]
    pub user: String,

    /// SMTP password to authenticate with.
    #[clap(long = "smtp-password", env = "KUSER_SMTP_PASS", default_value = "kuser")]
    pub password: String,

    #[clap(long = "smtp-from-email", env = "KUSER_SMTP_FROM_EMAIL", required = false)]
    pub from_email: String,

    #[clap(
        long = "smtp-from-name",
        env = "KUSER_SMTP_FROM_NAME",
        default_value = "Kubernetes User Provisioner"
    )]
    pub from_name: String,
}

/// Settings shared by every command that talks to the cluster.
#[derive(clap::Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Name of the signer which should sign
    /// certificate signing requests.
    #[clap(
        long,
        global = true,
        env = "KUSER_SIGNER_NAME",
        default_value = DEFAULT_SIGNER_NAME
    )]
    pub signer_name: String,

    /// Kubernetes API server address written into generated kubeconfigs.
    /// Defaults to the address of the admin client.
    #[clap(long, global = true, env = "KUSER_KUBE_ADDR")]
    pub kube_addr: Option<String>,

    /// Name of the configmap which contains the kube root certificate authority.
    /// This certificate authority will be used to verify the kube api server.
    #[clap(
        long,
        global = true,
        env = "KUSER_CA_CM_NAME",
        default_value = "kube-root-ca.crt"
    )]
    pub ca_configmap_name: String,

    /// Key of the configmap which contains the kube root certificate authority data.
    #[clap(long, global = true, env = "KUSER_CA_CM_KEY", default_value = "ca.crt")]
    pub ca_configmap_key: String,

    /// Directory for keys, requests, certificates and kubeconfigs.
    #[clap(long, short = 'd', global = true, env = "KUSER_DIR", default_value = ".")]
    pub dir: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PollArgs {
    /// How long to wait for the certificate to be issued, in seconds.
    #[clap(long, env = "KUSER_TIMEOUT", default_value = "120")]
    pub timeout: u64,

    /// First poll interval in milliseconds. Doubles on every attempt.
    #[clap(long, env = "KUSER_POLL_INTERVAL", default_value = "500")]
    pub poll_interval: u64,

    /// Upper bound for the poll interval in milliseconds.
    #[clap(long, env = "KUSER_MAX_POLL_INTERVAL", default_value = "5000")]
    pub max_poll_interval: u64,
}

impl From<&PollArgs> for PollPolicy {
    fn from(args: &PollArgs) -> Self {
        Self {
            deadline: Duration::from_secs(args.timeout),
            initial_interval: Duration::from_millis(args.poll_interval),
            max_interval: Duration::from_millis(args.max_poll_interval),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct IdentityArgs {
    /// Subject name. Becomes the CN of the certificate and the Kubernetes user name.
    pub subject: String,

    /// RSA key size in bits.
    #[clap(long, default_value = "2048")]
    pub key_size: u32,

    /// Groups the user should belong to.
    #[clap(long = "group", short = 'g')]
    pub groups: Vec<String>,

    /// Overwrite existing key material.
    #[clap(long)]
    pub force: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Subject whose request should be submitted.
    pub subject: String,

    /// Name of the signing request resource. Defaults to the subject.
    #[clap(long)]
    pub request_name: Option<String>,

    /// Requested key usages.
    #[clap(long = "usage", default_values_t = DEFAULT_USAGES.map(String::from))]
    pub usages: Vec<String>,

    /// Requested certificate lifetime in seconds.
    #[clap(long)]
    pub expiration_seconds: Option<i32>,

    /// Approve the request right after submitting it.
    #[clap(long)]
    pub approve: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ApprovalArgs {
    /// Name of the signing request resource.
    pub request_name: String,

    /// Reason recorded on the approval condition.
    #[clap(long)]
    pub reason: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct FetchArgs {
    /// Subject whose certificate should be fetched.
    pub subject: String,

    /// Name of the signing request resource. Defaults to the subject.
    #[clap(long)]
    pub request_name: Option<String>,

    #[clap(flatten)]
    pub poll: PollArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct WriteConfigArgs {
    /// Subject to build the kubeconfig for.
    pub subject: String,

    /// Name of the cluster inside the kubeconfig.
    #[clap(long, default_value = "cluster")]
    pub cluster_name: String,

    /// Default namespace of the generated context.
    #[clap(long, short = 'n')]
    pub namespace: Option<String>,

    /// Print the kubeconfig to stdout instead of writing it next to the key.
    #[clap(long)]
    pub stdout: bool,

    /// Connect with the written kubeconfig and check that it authenticates
    /// as the subject.
    #[clap(long, conflicts_with = "stdout")]
    pub verify: bool,

    /// Send the kubeconfig to this e-mail address. Requires SMTP settings.
    #[clap(long)]
    pub mail_to: Option<String>,

    /// Full name of the recipient used in the e-mail.
    #[clap(long)]
    pub full_name: Option<String>,

    #[clap(flatten)]
    pub smtp: Option<SMTPArgs>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ScopeArgs {
    /// Namespace to scope the permission set to.
    #[clap(long, short = 'n', default_value = "default", conflicts_with = "cluster_wide")]
    pub namespace: String,

    /// Create a cluster-wide permission set instead of a namespaced one.
    #[clap(long)]
    pub cluster_wide: bool,
}

impl ScopeArgs {
    #[must_use]
    pub fn scope(&self) -> PermissionScope {
        if self.cluster_wide {
            PermissionScope::Cluster
        } else {
            PermissionScope::Namespace(self.namespace.clone())
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct PermissionArgs {
    /// Name of the permission set.
    pub name: String,

    #[clap(flatten)]
    pub scope: ScopeArgs,

    /// Resource types the rule applies to.
    #[clap(long = "resource", short = 'r', required = true, value_delimiter = ',')]
    pub resources: Vec<String>,

    /// Verbs the rule allows.
    #[clap(long = "verb", short = 'v', required = true, value_delimiter = ',')]
    pub verbs: Vec<String>,

    /// API groups of the resources. Empty string means the core group.
    /// By default every resource gets the group it is served from.
    #[clap(long = "api-group", value_delimiter = ',')]
    pub api_groups: Vec<String>,
}

impl PermissionArgs {
    #[must_use]
    pub fn permission_set(&self) -> PermissionSet {
        PermissionSet {
            name: self.name.clone(),
            scope: self.scope.scope(),
            rules: Rule::grouped(&self.resources, &self.verbs, &self.api_groups),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct BindArgs {
    /// Name of the permission set to bind.
    pub permission_set: String,

    /// Subject to grant the permission set to.
    pub subject: String,

    #[clap(flatten)]
    pub scope: ScopeArgs,

    /// Name of the binding. Defaults to `<permission-set>-<subject>`.
    #[clap(long)]
    pub binding_name: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Verb to check, e.g. `get`.
    pub verb: String,

    /// Resource to check, e.g. `pods`.
    pub resource: String,

    /// Namespace to check in. Pass an empty value for cluster-scoped checks.
    #[clap(long, short = 'n', default_value = "default")]
    pub namespace: String,

    /// API group of the resource.
    #[clap(long, default_value = "")]
    pub api_group: String,

    /// Check on behalf of this subject using the admin credentials.
    #[clap(long = "as", conflicts_with = "kubeconfig")]
    pub subject: Option<String>,

    /// Check as the identity stored in this kubeconfig.
    #[clap(long)]
    pub kubeconfig: Option<PathBuf>,
}

impl VerifyArgs {
    #[must_use]
    pub fn check(&self) -> AccessCheck {
        AccessCheck {
            verb: self.verb.clone(),
            resource: self.resource.clone(),
            namespace: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
            api_group: self.api_group.clone(),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct OnboardArgs {
    #[clap(flatten)]
    pub identity: IdentityArgs,

    #[clap(flatten)]
    pub poll: PollArgs,

    /// Name of the cluster inside the kubeconfig.
    #[clap(long, default_value = "cluster")]
    pub cluster_name: String,

    /// Namespace for the permission set, the binding and the kubeconfig context.
    #[clap(long, short = 'n', default_value = "default")]
    pub namespace: String,

    /// Name of the permission set to create and bind.
    #[clap(long)]
    pub permission_set: Option<String>,

    /// Resource types granted by the permission set.
    #[clap(long = "resource", short = 'r', value_delimiter = ',')]
    pub resources: Vec<String>,

    /// Verbs granted by the permission set.
    #[clap(long = "verb", short = 'v', value_delimiter = ',')]
    pub verbs: Vec<String>,

    /// API groups of the resources. Defaults to the group each resource is served from.
    #[clap(long = "api-group", value_delimiter = ',')]
    pub api_groups: Vec<String>,
}

impl OnboardArgs {
    /// Permission set requested on the command line, if any.
    #[must_use]
    pub fn permission_set(&self) -> Option<PermissionSet> {
        let name = self.permission_set.clone()?;
        Some(PermissionSet {
            name,
            scope: PermissionScope::Namespace(self.namespace.clone()),
            rules: Rule::grouped(&self.resources, &self.verbs, &self.api_groups),
        })
    }
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate a private key and a certificate request.
    CreateIdentity(IdentityArgs),
    /// Submit the certificate request to the cluster.
    SubmitRequest(SubmitArgs),
    /// Approve a pending signing request.
    ApproveRequest(ApprovalArgs),
    /// Deny a pending signing request.
    DenyRequest(ApprovalArgs),
    /// Wait for the certificate to be issued and save it.
    FetchCertificate(FetchArgs),
    /// Build a kubeconfig for the identity.
    WriteConfig(WriteConfigArgs),
    /// Create or update a permission set.
    CreatePermission(PermissionArgs),
    /// Bind a permission set to an identity.
    BindPermission(BindArgs),
    /// Check whether an identity may perform an action.
    VerifyAccess(VerifyArgs),
    /// Run the whole onboarding pipeline.
    Onboard(OnboardArgs),
}

#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "kuser", version, author, about)]
pub struct KuserArgs {
    #[clap(flatten)]
    pub cluster: ClusterArgs,

    #[clap(subcommand)]
    pub command: Command,
}
