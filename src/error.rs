use std::{fmt, time::Duration};

pub type KuserResult<T> = Result<T, KuserError>;

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CreateIdentity,
    SubmitRequest,
    ApproveRequest,
    FetchCertificate,
    WriteConfig,
    ProvisionPermissions,
    VerifyAccess,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateIdentity => "create-identity",
            Self::SubmitRequest => "submit-request",
            Self::ApproveRequest => "approve-request",
            Self::FetchCertificate => "fetch-certificate",
            Self::WriteConfig => "write-config",
            Self::ProvisionPermissions => "provision-permissions",
            Self::VerifyAccess => "verify-access",
        };
        f.write_str(name)
    }
}

/// Coarse classification used for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    AlreadyExists,
    Forbidden,
    NotFound,
    Timeout,
    Denied,
    Unauthenticated,
    Other,
}

#[derive(thiserror::Error, Debug)]
pub enum KuserError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Cannot authenticate to the cluster: {0}")]
    Unauthenticated(String),
    #[error("Signing request {name} was not issued within {waited:?}")]
    Timeout { name: String, waited: Duration },
    #[error("Signing request {name} was denied. Reason: {reason}")]
    Denied { name: String, reason: String },
    #[error("Cannot get root kube certificate. Reason: {0}")]
    CannotGetRootCert(String),
    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<KuserError>,
    },
    #[error("StdError: {0}")]
    StdError(#[from] std::io::Error),
    #[error("OpensslError: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("KubeError: {0}")]
    KubeError(kube::Error),
    #[error("Cannot load kubeconfig. Reason: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),
    #[error("Cannot infer kube config. Reason: {0}")]
    InferConfigError(#[from] kube::config::InferConfigError),
    #[error("Utf8Error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),
    #[error("Cannot send e-mail. Reason: {0}")]
    EmailSMTPError(#[from] lettre::transport::smtp::Error),
    #[error("Cannot send e-mail. Reason: {0}")]
    EmailAddressError(#[from] lettre::address::AddressError),
    #[error("Cannot send e-mail. Reason: {0}")]
    EmailError(#[from] lettre::error::Error),
    #[error("Cannot serialize/deserialize YAML. Reason: {0}")]
    YAMLError(#[from] serde_yaml::Error),
}

impl From<kube::Error> for KuserError {
    fn from(err: kube::Error) -> Self {
        let kube::Error::Api(response) = &err else {
            return Self::KubeError(err);
        };
        let message = response.message.clone();
        match response.code {
            400 | 422 => Self::Validation(message),
            401 => Self::Unauthenticated(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            409 => Self::AlreadyExists(message),
            _ => Self::KubeError(err),
        }
    }
}

impl KuserError {
    /// Wrap the error with the stage it came from.
    #[must_use]
    pub fn at(self, stage: Stage) -> Self {
        match self {
            // Keep the innermost stage.
            err @ Self::Stage { .. } => err,
            err => Self::Stage {
                stage,
                source: Box::new(err),
            },
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) | Self::CannotGetRootCert(_) => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Denied { .. } => ErrorKind::Denied,
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::Stage { source, .. } => source.kind(),
            _ => ErrorKind::Other,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }

    /// Errors worth retrying: server-side failures, throttling and
    /// connections that broke before an answer arrived.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::KubeError(kube::Error::Api(response)) => {
                response.code == 429 || response.code >= 500
            }
            Self::KubeError(kube::Error::HyperError(_) | kube::Error::Service(_)) => true,
            Self::Stage { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl ErrorKind {
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Other => 1,
            Self::Validation => 2,
            Self::NotFound => 3,
            Self::Forbidden => 4,
            Self::Timeout => 5,
            Self::Denied => 6,
            Self::AlreadyExists => 7,
            Self::Unauthenticated => 8,
        }
    }
}

pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> KuserResult<T>;
}

impl<T> StageExt<T> for KuserResult<T> {
    fn stage(self, stage: Stage) -> KuserResult<T> {
        self.map_err(|err| err.at(stage))
    }
}
