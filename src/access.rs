use k8s_openapi::api::authorization::v1::{ResourceAttributes, SubjectAccessReviewStatus};

use crate::{control_plane::ControlPlane, error::KuserResult};

/// One "can `subject` `verb` `resource` in `namespace`" question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCheck {
    pub verb: String,
    /// Resource type, optionally with a subresource (`pods/log`).
    pub resource: String,
    /// `None` for cluster-scoped checks.
    pub namespace: Option<String>,
    /// Empty for the core group.
    pub api_group: String,
}

impl AccessCheck {
    #[must_use]
    pub fn new(verb: &str, resource: &str, namespace: Option<&str>) -> Self {
        Self {
            verb: verb.to_string(),
            resource: resource.to_string(),
            namespace: namespace.map(String::from),
            api_group: String::new(),
        }
    }

    #[must_use]
    pub fn with_group(mut self, api_group: &str) -> Self {
        self.api_group = api_group.to_string();
        self
    }

    #[must_use]
    pub fn to_resource_attributes(&self) -> ResourceAttributes {
        let (resource, subresource) = match self.resource.split_once('/') {
            Some((resource, subresource)) => (resource, Some(subresource.to_string())),
            None => (self.resource.as_str(), None),
        };
        ResourceAttributes {
            group: Some(self.api_group.clone()),
            namespace: self.namespace.clone(),
            resource: Some(resource.to_string()),
            subresource,
            verb: Some(self.verb.clone()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied { reason: Option<String> },
}

impl AccessDecision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    #[must_use]
    pub fn from_status(status: Option<&SubjectAccessReviewStatus>) -> Self {
        match status {
            Some(status) if status.allowed && !status.denied.unwrap_or(false) => Self::Allowed,
            Some(status) => Self::Denied {
                reason: status
                    .reason
                    .clone()
                    .or_else(|| status.evaluation_error.clone())
                    .filter(|reason| !reason.is_empty()),
            },
            None => Self::Denied { reason: None },
        }
    }
}

/// Run an access review.
///
/// A denial is a regular answer: right after onboarding the identity has no
/// bindings yet, so "forbidden" only means a binding is still missing.
#[tracing::instrument(skip(cp, check), fields(verb = %check.verb, resource = %check.resource, namespace = ?check.namespace), err)]
pub async fn verify_access<C: ControlPlane>(
    cp: &C,
    subject: Option<&str>,
    check: &AccessCheck,
) -> KuserResult<AccessDecision> {
    let decision = cp.review_access(subject, check).await?;
    match &decision {
        AccessDecision::Allowed => tracing::info!("Access allowed"),
        AccessDecision::Denied { reason } => tracing::info!(
            reason = reason.as_deref().unwrap_or("none"),
            "Access forbidden. Bind a permission set to grant it."
        ),
    }
    Ok(decision)
}

/// Run several access reviews concurrently.
pub async fn verify_all<C: ControlPlane>(
    cp: &C,
    subject: Option<&str>,
    checks: &[AccessCheck],
) -> KuserResult<Vec<AccessDecision>> {
    futures::future::try_join_all(
        checks
            .iter()
            .map(|check| verify_access(cp, subject, check)),
    )
    .await
}
