use crate::{
    access::{verify_access, AccessDecision},
    args::{
        ApprovalArgs, BindArgs, ClusterArgs, Command, FetchArgs, IdentityArgs, OnboardArgs,
        SubmitArgs, VerifyArgs, WriteConfigArgs,
    },
    config_writer::{verify_usable, AccessConfig},
    control_plane::ControlPlane,
    error::{ErrorKind, KuserError, KuserResult},
    identity::{write_public, Identity, IdentityFiles},
    mail,
    permissions::{bind_permission, create_permission, Binding},
    pipeline::{onboard, OnboardPlan},
    request::{
        approve, deny, submit, ApprovalOutcome, DenialOutcome, SigningRequest, SubmitOutcome,
    },
    retriever::fetch_certificate,
};

/// Result of a command that didn't fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Nothing to do, the cluster already was in the requested state.
    Unchanged,
    /// An access check answered "no".
    AccessDenied,
}

impl Outcome {
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Done | Self::Unchanged => 0,
            Self::AccessDenied => ErrorKind::Forbidden.exit_code(),
        }
    }
}

/// Generate key material. Doesn't need the cluster.
pub fn create_identity(cluster: &ClusterArgs, args: &IdentityArgs) -> KuserResult<Outcome> {
    let identity = Identity::generate(&args.subject, &args.groups, args.key_size)?;
    let files = IdentityFiles::new(&cluster.dir, &args.subject);
    files.save(&identity, args.force)?;
    println!("{}", files.request_path().display());
    Ok(Outcome::Done)
}

async fn submit_request<C: ControlPlane>(
    cp: &C,
    cluster: &ClusterArgs,
    args: &SubmitArgs,
) -> KuserResult<Outcome> {
    let files = IdentityFiles::new(&cluster.dir, &args.subject);
    let request = SigningRequest {
        name: args
            .request_name
            .clone()
            .unwrap_or_else(|| args.subject.clone()),
        request_pem: files.load_request()?.to_pem()?,
        usages: args.usages.clone(),
        signer_name: cluster.signer_name.clone(),
        expiration_seconds: args.expiration_seconds,
    };
    let mut outcome = match submit(cp, &request).await? {
        SubmitOutcome::Created => Outcome::Done,
        SubmitOutcome::Unchanged => Outcome::Unchanged,
    };
    if args.approve && approve(cp, &request.name, None).await? == ApprovalOutcome::Approved {
        outcome = Outcome::Done;
    }
    Ok(outcome)
}

async fn approve_request<C: ControlPlane>(cp: &C, args: &ApprovalArgs) -> KuserResult<Outcome> {
    Ok(
        match approve(cp, &args.request_name, args.reason.as_deref()).await? {
            ApprovalOutcome::Approved => Outcome::Done,
            ApprovalOutcome::AlreadyApproved => Outcome::Unchanged,
        },
    )
}

async fn deny_request<C: ControlPlane>(cp: &C, args: &ApprovalArgs) -> KuserResult<Outcome> {
    Ok(
        match deny(cp, &args.request_name, args.reason.as_deref()).await? {
            DenialOutcome::Denied => Outcome::Done,
            DenialOutcome::AlreadyDenied => Outcome::Unchanged,
        },
    )
}

async fn fetch<C: ControlPlane>(
    cp: &C,
    cluster: &ClusterArgs,
    args: &FetchArgs,
) -> KuserResult<Outcome> {
    let name = args.request_name.as_deref().unwrap_or(&args.subject);
    let cert = fetch_certificate(cp, name, &(&args.poll).into()).await?;
    let files = IdentityFiles::new(&cluster.dir, &args.subject);
    write_public(&files.cert_path(), &cert.to_pem()?)?;
    println!("{}", files.cert_path().display());
    Ok(Outcome::Done)
}

async fn write_config<C: ControlPlane>(
    cp: &C,
    cluster: &ClusterArgs,
    args: &WriteConfigArgs,
) -> KuserResult<Outcome> {
    let files = IdentityFiles::new(&cluster.dir, &args.subject);
    let config = AccessConfig {
        cluster_name: args.cluster_name.clone(),
        server: cluster
            .kube_addr
            .clone()
            .unwrap_or_else(|| cp.server_url()),
        ca_data: cp.root_ca().await?,
        subject: args.subject.clone(),
        certificate: files.load_cert()?,
        key: files.load_key()?,
        namespace: args.namespace.clone(),
    };
    let kubeconfig = if args.stdout {
        let yaml = config.to_yaml()?;
        println!("{yaml}");
        yaml
    } else {
        let path = files.kubeconfig_path();
        let yaml = config.write(&path)?;
        if args.verify {
            verify_usable(cp, &path, &args.subject).await?;
            tracing::info!("Kubeconfig authenticates as {}", args.subject);
        }
        println!("{}", path.display());
        yaml
    };
    if let Some(to) = &args.mail_to {
        let Some(smtp) = &args.smtp else {
            return Err(KuserError::Validation(String::from(
                "Sending the kubeconfig requires SMTP settings",
            )));
        };
        mail::send_kubeconfig(smtp, to, args.full_name.clone(), &args.subject, kubeconfig)
            .await?;
    }
    Ok(Outcome::Done)
}

async fn bind<C: ControlPlane>(cp: &C, args: &BindArgs) -> KuserResult<Outcome> {
    let binding = Binding::new(
        &args.permission_set,
        &args.subject,
        args.scope.scope(),
        args.binding_name.clone(),
    );
    bind_permission(cp, &binding).await?;
    Ok(Outcome::Done)
}

async fn verify<C: ControlPlane>(cp: &C, args: &VerifyArgs) -> KuserResult<Outcome> {
    match verify_access(cp, args.subject.as_deref(), &args.check()).await? {
        AccessDecision::Allowed => {
            println!("yes");
            Ok(Outcome::Done)
        }
        AccessDecision::Denied { .. } => {
            println!("no");
            Ok(Outcome::AccessDenied)
        }
    }
}

async fn onboard_user<C: ControlPlane>(
    cp: &C,
    cluster: &ClusterArgs,
    args: &OnboardArgs,
) -> KuserResult<Outcome> {
    let plan = OnboardPlan {
        groups: args.identity.groups.clone(),
        key_size: args.identity.key_size,
        force: args.identity.force,
        signer_name: cluster.signer_name.clone(),
        poll: (&args.poll).into(),
        cluster_name: args.cluster_name.clone(),
        server: cluster.kube_addr.clone(),
        namespace: args.namespace.clone(),
        permission_set: args.permission_set(),
        ..OnboardPlan::new(&args.identity.subject, &cluster.dir)
    };
    let report = onboard(cp, &plan).await?;
    println!("{}", report.files.kubeconfig_path().display());
    let mut outcome = Outcome::Done;
    for (check, decision) in &report.access {
        let answer = if decision.is_allowed() { "yes" } else { "no" };
        println!(
            "{} {} {}: {answer}",
            check.verb,
            check.resource,
            check.namespace.as_deref().unwrap_or("<cluster>")
        );
        // Without a permission set nothing was granted, so "no" is expected.
        if !decision.is_allowed() && plan.permission_set.is_some() {
            outcome = Outcome::AccessDenied;
        }
    }
    Ok(outcome)
}

/// Run a command against `cp`.
pub async fn run<C: ControlPlane>(
    cp: &C,
    cluster: &ClusterArgs,
    command: &Command,
) -> KuserResult<Outcome> {
    match command {
        Command::CreateIdentity(args) => create_identity(cluster, args),
        Command::SubmitRequest(args) => submit_request(cp, cluster, args).await,
        Command::ApproveRequest(args) => approve_request(cp, args).await,
        Command::DenyRequest(args) => deny_request(cp, args).await,
        Command::FetchCertificate(args) => fetch(cp, cluster, args).await,
        Command::WriteConfig(args) => write_config(cp, cluster, args).await,
        Command::CreatePermission(args) => {
            create_permission(cp, &args.permission_set()).await?;
            Ok(Outcome::Done)
        }
        Command::BindPermission(args) => bind(cp, args).await,
        Command::VerifyAccess(args) => verify(cp, args).await,
        Command::Onboard(args) => onboard_user(cp, cluster, args).await,
    }
}
