use k8s_openapi::{
    api::certificates::v1::{
        CertificateSigningRequest, CertificateSigningRequestCondition,
        CertificateSigningRequestSpec, CertificateSigningRequestStatus,
    },
    apimachinery::pkg::apis::meta::v1::Time,
    ByteString,
};
use kube::api::ObjectMeta;
use openssl::x509::X509Req;

use crate::{
    control_plane::ControlPlane,
    error::{KuserError, KuserResult},
    identity::{request_subject, validate_subject},
    utils::meta::ObjectMetaKuserExt,
};

pub const DEFAULT_SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";
pub const DEFAULT_USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];

const APPROVED: &str = "Approved";
const DENIED: &str = "Denied";
const FAILED: &str = "Failed";

/// Lifecycle of a signing request.
///
/// `Pending -> Approved -> Issued` or `Pending -> Denied`.
/// `Issued` and `Denied` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningRequestState {
    Pending,
    Approved,
    Issued,
    Denied,
}

impl SigningRequestState {
    #[must_use]
    pub fn of(csr: &CertificateSigningRequest) -> Self {
        let Some(status) = &csr.status else {
            return Self::Pending;
        };
        let conditions = status.conditions.as_deref().unwrap_or_default();
        let has = |type_: &str| {
            conditions
                .iter()
                .any(|condition| condition.type_ == type_ && condition.status != "False")
        };
        // A signer failure is as final as a denial.
        if has(DENIED) || has(FAILED) {
            return Self::Denied;
        }
        if !has(APPROVED) {
            return Self::Pending;
        }
        match &status.certificate {
            Some(cert) if !cert.0.is_empty() => Self::Issued,
            _ => Self::Approved,
        }
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved | Self::Denied) | (Self::Approved, Self::Issued)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Issued | Self::Denied)
    }
}

/// Reason recorded on the denial (or failure) condition.
#[must_use]
pub fn denial_reason(csr: &CertificateSigningRequest) -> String {
    csr.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|condition| condition.type_ == DENIED || condition.type_ == FAILED)
        })
        .and_then(|condition| condition.message.clone().or_else(|| condition.reason.clone()))
        .unwrap_or_else(|| String::from("no reason given"))
}

/// A request to be submitted as a `CertificateSigningRequest`.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub name: String,
    pub request_pem: Vec<u8>,
    pub usages: Vec<String>,
    pub signer_name: String,
    pub expiration_seconds: Option<i32>,
}

impl SigningRequest {
    /// Client-auth request for the default signer.
    #[must_use]
    pub fn new(name: &str, request_pem: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            request_pem,
            usages: DEFAULT_USAGES.map(String::from).to_vec(),
            signer_name: String::from(DEFAULT_SIGNER_NAME),
            expiration_seconds: None,
        }
    }

    /// Subject the embedded request was made for.
    pub fn subject(&self) -> KuserResult<String> {
        let request = X509Req::from_pem(&self.request_pem).map_err(|err| {
            KuserError::Validation(format!(
                "Signing request {} doesn't contain a valid PEM request: {err}",
                self.name
            ))
        })?;
        request_subject(&request).ok_or_else(|| {
            KuserError::Validation(format!(
                "Signing request {} has no common name",
                self.name
            ))
        })
    }

    pub fn validate(&self) -> KuserResult<()> {
        validate_subject(&self.name)?;
        if self.usages.is_empty() {
            return Err(KuserError::Validation(String::from(
                "At least one key usage is required",
            )));
        }
        if self.signer_name.is_empty() {
            return Err(KuserError::Validation(String::from(
                "Signer name cannot be empty",
            )));
        }
        if matches!(self.expiration_seconds, Some(secs) if secs < 600) {
            return Err(KuserError::Validation(String::from(
                "Certificate lifetime must be at least 600 seconds",
            )));
        }
        self.subject().map(drop)
    }

    #[must_use]
    pub fn to_resource(&self) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta::managed(&self.name),
            spec: CertificateSigningRequestSpec {
                // Serialized as base64 on the wire.
                request: ByteString(self.request_pem.clone()),
                signer_name: self.signer_name.clone(),
                usages: Some(self.usages.clone()),
                expiration_seconds: self.expiration_seconds,
                ..Default::default()
            },
            status: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Created,
    /// The same request was already submitted under this name.
    Unchanged,
}

/// Submit a signing request.
///
/// Resubmitting the same request is a no-op. A request with the same name but
/// another key fails with `AlreadyExists`, one for another subject with `Validation`.
#[tracing::instrument(skip(cp, request), fields(name = %request.name, signer = %request.signer_name), err)]
pub async fn submit<C: ControlPlane>(cp: &C, request: &SigningRequest) -> KuserResult<SubmitOutcome> {
    request.validate()?;
    let err = match cp.create_csr(&request.to_resource()).await {
        Ok(_) => {
            tracing::info!("Signing request created");
            return Ok(SubmitOutcome::Created);
        }
        Err(err @ KuserError::AlreadyExists(_)) => err,
        Err(err) => return Err(err),
    };
    let Some(existing) = cp.get_csr(&request.name).await? else {
        return Err(err);
    };
    if existing.spec.request.0 == request.request_pem {
        tracing::info!("Signing request already submitted");
        return Ok(SubmitOutcome::Unchanged);
    }
    let existing_subject = X509Req::from_pem(&existing.spec.request.0)
        .ok()
        .as_ref()
        .and_then(request_subject);
    let subject = request.subject()?;
    if existing_subject.as_deref() != Some(subject.as_str()) {
        return Err(KuserError::Validation(format!(
            "Signing request {} already exists for subject {}, not {subject}",
            request.name,
            existing_subject.as_deref().unwrap_or("<unknown>"),
        )));
    }
    Err(KuserError::AlreadyExists(format!(
        "Signing request {} already exists with a different key",
        request.name
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    AlreadyApproved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialOutcome {
    Denied,
    AlreadyDenied,
}

fn condition(type_: &str, reason: &str, message: String) -> CertificateSigningRequestCondition {
    CertificateSigningRequestCondition {
        last_update_time: Some(Time(chrono::Utc::now())),
        message: Some(message),
        reason: Some(reason.to_string()),
        status: String::from("True"),
        type_: type_.to_string(),
        last_transition_time: None,
    }
}

fn push_condition(csr: &mut CertificateSigningRequest, condition: CertificateSigningRequestCondition) {
    csr.status
        .get_or_insert_with(CertificateSigningRequestStatus::default)
        .conditions
        .get_or_insert_with(Vec::new)
        .push(condition);
}

async fn get_existing<C: ControlPlane>(cp: &C, name: &str) -> KuserResult<CertificateSigningRequest> {
    cp.get_csr(name)
        .await?
        .ok_or_else(|| KuserError::NotFound(format!("Signing request {name}")))
}

#[tracing::instrument(skip(cp, reason), err)]
pub async fn approve<C: ControlPlane>(
    cp: &C,
    name: &str,
    reason: Option<&str>,
) -> KuserResult<ApprovalOutcome> {
    let mut csr = get_existing(cp, name).await?;
    match SigningRequestState::of(&csr) {
        SigningRequestState::Approved | SigningRequestState::Issued => {
            tracing::info!("Signing request is already approved");
            return Ok(ApprovalOutcome::AlreadyApproved);
        }
        SigningRequestState::Denied => {
            return Err(KuserError::Denied {
                name: name.to_string(),
                reason: denial_reason(&csr),
            });
        }
        SigningRequestState::Pending => {}
    }
    tracing::info!("Approving signing request");
    push_condition(
        &mut csr,
        condition(
            APPROVED,
            "KuserApproved",
            reason.map_or_else(|| String::from("Approved by kuser"), String::from),
        ),
    );
    csr.metadata.managed_fields = None;
    cp.update_csr_approval(&csr).await?;
    Ok(ApprovalOutcome::Approved)
}

#[tracing::instrument(skip(cp, reason), err)]
pub async fn deny<C: ControlPlane>(
    cp: &C,
    name: &str,
    reason: Option<&str>,
) -> KuserResult<DenialOutcome> {
    let mut csr = get_existing(cp, name).await?;
    match SigningRequestState::of(&csr) {
        SigningRequestState::Denied => return Ok(DenialOutcome::AlreadyDenied),
        state @ (SigningRequestState::Approved | SigningRequestState::Issued) => {
            return Err(KuserError::Validation(format!(
                "Signing request {name} is {state:?} and can no longer be denied"
            )));
        }
        SigningRequestState::Pending => {}
    }
    tracing::info!("Denying signing request");
    push_condition(
        &mut csr,
        condition(
            DENIED,
            "KuserDenied",
            reason.map_or_else(|| String::from("Denied by kuser"), String::from),
        ),
    );
    csr.metadata.managed_fields = None;
    cp.update_csr_approval(&csr).await?;
    Ok(DenialOutcome::Denied)
}
