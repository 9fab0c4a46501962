use std::{collections::BTreeMap, fmt};

use k8s_openapi::{
    api::rbac::v1::{
        ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
    },
    Resource,
};
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::{
    control_plane::ControlPlane,
    error::{KuserError, KuserResult},
    identity::validate_subject,
    utils::meta::{to_name, validate_name, validate_namespace, ObjectMetaKuserExt, USER_LABEL},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionScope {
    Namespace(String),
    Cluster,
}

impl PermissionScope {
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Namespace(namespace) => Some(namespace),
            Self::Cluster => None,
        }
    }
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace(namespace) => write!(f, "namespace {namespace}"),
            Self::Cluster => f.write_str("cluster"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// `APIGroups` is the name of the `APIGroup` that contains the resources.
    /// "" represents the core API group and "*" represents all API groups.
    pub api_groups: Vec<String>,
    /// Resources is a list of resources this rule applies to. '*' represents all resources.
    pub resources: Vec<String>,
    /// Verbs is a list of Verbs that apply to ALL the resources contained in this rule. '*' represents all verbs.
    pub verbs: Vec<String>,
}

/// API group a well-known resource is served from. Anything else is
/// assumed to be in the core group.
fn served_from(resource: &str) -> &'static str {
    match resource.split('/').next().unwrap_or(resource) {
        "deployments" | "replicasets" | "statefulsets" | "daemonsets"
        | "controllerrevisions" => "apps",
        "jobs" | "cronjobs" => "batch",
        "ingresses" | "ingressclasses" | "networkpolicies" => "networking.k8s.io",
        "horizontalpodautoscalers" => "autoscaling",
        "poddisruptionbudgets" => "policy",
        "roles" | "rolebindings" | "clusterroles" | "clusterrolebindings" => Role::GROUP,
        _ => "",
    }
}

impl Rule {
    /// Rules granting `verbs` on `resources`.
    ///
    /// With explicit `api_groups` that's a single rule. Otherwise resources
    /// are split by the group they are served from, so that `pods` and
    /// `deployments` don't leak into each other's group.
    #[must_use]
    pub fn grouped(resources: &[String], verbs: &[String], api_groups: &[String]) -> Vec<Self> {
        if !api_groups.is_empty() {
            return vec![Self {
                api_groups: api_groups.to_vec(),
                resources: resources.to_vec(),
                verbs: verbs.to_vec(),
            }];
        }
        let mut by_group: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for resource in resources {
            by_group
                .entry(served_from(resource))
                .or_default()
                .push(resource.clone());
        }
        by_group
            .into_iter()
            .map(|(group, resources)| Self {
                api_groups: vec![group.to_string()],
                resources,
                verbs: verbs.to_vec(),
            })
            .collect()
    }
}

impl From<Rule> for PolicyRule {
    fn from(rule: Rule) -> Self {
        Self {
            api_groups: Some(rule.api_groups),
            resources: Some(rule.resources),
            resource_names: None,
            non_resource_urls: None,
            verbs: rule.verbs,
        }
    }
}

/// Named set of rules, materialized as a `Role` or a `ClusterRole`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PermissionSet {
    pub name: String,
    pub scope: PermissionScope,
    pub rules: Vec<Rule>,
}

impl PermissionSet {
    pub fn validate(&self) -> KuserResult<()> {
        validate_name("Permission set", &self.name)?;
        if let PermissionScope::Namespace(namespace) = &self.scope {
            validate_namespace(namespace)?;
        }
        if self.rules.is_empty() {
            return Err(KuserError::Validation(format!(
                "Permission set {} has no rules",
                self.name
            )));
        }
        for rule in &self.rules {
            if rule.resources.is_empty() || rule.verbs.is_empty() {
                return Err(KuserError::Validation(format!(
                    "Every rule of permission set {} needs resources and verbs",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn rules(&self) -> Vec<PolicyRule> {
        self.rules.iter().cloned().map(PolicyRule::from).collect()
    }

    #[must_use]
    pub fn to_role(&self, namespace: &str) -> Role {
        let mut metadata = ObjectMeta::managed(&self.name);
        metadata.namespace = Some(namespace.to_string());
        Role {
            metadata,
            rules: Some(self.rules()),
        }
    }

    #[must_use]
    pub fn to_cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: ObjectMeta::managed(&self.name),
            rules: Some(self.rules()),
            ..Default::default()
        }
    }
}

/// Grants one permission set to one user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub subject: String,
    pub permission_set: String,
    pub scope: PermissionScope,
}

impl Binding {
    #[must_use]
    pub fn new(
        permission_set: &str,
        subject: &str,
        scope: PermissionScope,
        name: Option<String>,
    ) -> Self {
        Self {
            name: name.unwrap_or_else(|| to_name(&format!("{permission_set}-{subject}"))),
            subject: subject.to_string(),
            permission_set: permission_set.to_string(),
            scope,
        }
    }

    pub fn validate(&self) -> KuserResult<()> {
        validate_name("Binding", &self.name)?;
        validate_name("Permission set", &self.permission_set)?;
        if let PermissionScope::Namespace(namespace) = &self.scope {
            validate_namespace(namespace)?;
        }
        validate_subject(&self.subject)
    }

    fn metadata(&self) -> ObjectMeta {
        let mut metadata = ObjectMeta::managed(&self.name);
        metadata.insert_label(USER_LABEL, self.subject.clone());
        metadata
    }

    fn subjects(&self) -> Option<Vec<Subject>> {
        Some(vec![Subject {
            kind: String::from("User"),
            name: self.subject.clone(),
            namespace: None,
            api_group: Some(String::from(Role::GROUP)),
        }])
    }

    #[must_use]
    pub fn to_role_binding(&self, namespace: &str) -> RoleBinding {
        let mut metadata = self.metadata();
        metadata.namespace = Some(namespace.to_string());
        RoleBinding {
            metadata,
            role_ref: RoleRef {
                api_group: String::from(Role::GROUP),
                kind: String::from(Role::KIND),
                name: self.permission_set.clone(),
            },
            subjects: self.subjects(),
        }
    }

    #[must_use]
    pub fn to_cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: self.metadata(),
            role_ref: RoleRef {
                api_group: String::from(ClusterRole::GROUP),
                kind: String::from(ClusterRole::KIND),
                name: self.permission_set.clone(),
            },
            subjects: self.subjects(),
        }
    }
}

/// Create or update a permission set. Applying the same set twice converges.
#[tracing::instrument(skip(cp, set), fields(name = %set.name, scope = %set.scope), err)]
pub async fn create_permission<C: ControlPlane>(cp: &C, set: &PermissionSet) -> KuserResult<()> {
    set.validate()?;
    match &set.scope {
        PermissionScope::Namespace(namespace) => {
            cp.apply_role(&set.to_role(namespace)).await?;
        }
        PermissionScope::Cluster => {
            cp.apply_cluster_role(&set.to_cluster_role()).await?;
        }
    }
    tracing::info!("Permission set applied");
    Ok(())
}

/// Bind a permission set to a user.
///
/// The binding is created even if the permission set doesn't exist yet;
/// until it does, the binding grants nothing.
#[tracing::instrument(skip(cp, binding), fields(name = %binding.name, subject = %binding.subject, scope = %binding.scope), err)]
pub async fn bind_permission<C: ControlPlane>(cp: &C, binding: &Binding) -> KuserResult<()> {
    binding.validate()?;
    if !cp
        .permission_set_exists(&binding.scope, &binding.permission_set)
        .await?
    {
        tracing::warn!(
            permission_set = %binding.permission_set,
            "Permission set doesn't exist. The binding grants nothing until it is created."
        );
    }
    match &binding.scope {
        PermissionScope::Namespace(namespace) => {
            cp.apply_role_binding(&binding.to_role_binding(namespace))
                .await?;
        }
        PermissionScope::Cluster => {
            cp.apply_cluster_role_binding(&binding.to_cluster_role_binding())
                .await?;
        }
    }
    tracing::info!("Binding applied");
    Ok(())
}

/// Create the permission set and bind it to `subject`.
pub async fn provision<C: ControlPlane>(
    cp: &C,
    set: &PermissionSet,
    subject: &str,
) -> KuserResult<Binding> {
    create_permission(cp, set).await?;
    let binding = Binding::new(&set.name, subject, set.scope.clone(), None);
    bind_permission(cp, &binding).await?;
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::AccessCheck, control_plane::memory::MemoryControlPlane,
        utils::meta::MANAGED_BY_LABEL,
    };

    fn pod_reader(scope: PermissionScope) -> PermissionSet {
        PermissionSet {
            name: String::from("pod-reader"),
            scope,
            rules: vec![Rule {
                api_groups: vec![String::new()],
                resources: vec![String::from("pods")],
                verbs: vec![String::from("get"), String::from("list")],
            }],
        }
    }

    #[test]
    fn role_binding_refers_to_role() {
        let binding = Binding::new(
            "pod-reader",
            "jane",
            PermissionScope::Namespace(String::from("default")),
            None,
        );
        assert_eq!(binding.name, "pod-reader-jane");
        let rb = binding.to_role_binding("default");
        assert_eq!(rb.role_ref.kind, "Role");
        assert_eq!(rb.role_ref.api_group, "rbac.authorization.k8s.io");
        assert_eq!(rb.role_ref.name, "pod-reader");
        let subject = &rb.subjects.unwrap()[0];
        assert_eq!(subject.kind, "User");
        assert_eq!(subject.name, "jane");
        let labels = rb.metadata.labels.unwrap();
        assert_eq!(labels[USER_LABEL], "jane");
        assert_eq!(labels[MANAGED_BY_LABEL], "kuser");

        let crb = binding.to_cluster_role_binding();
        assert_eq!(crb.role_ref.kind, "ClusterRole");
    }

    #[test]
    fn rejects_empty_rules() {
        let mut set = pod_reader(PermissionScope::Namespace(String::from("default")));
        set.rules[0].verbs.clear();
        assert!(matches!(set.validate(), Err(KuserError::Validation(_))));
        set.rules.clear();
        assert!(matches!(set.validate(), Err(KuserError::Validation(_))));
        let empty_ns = pod_reader(PermissionScope::Namespace(String::new()));
        assert!(matches!(empty_ns.validate(), Err(KuserError::Validation(_))));
    }

    #[tokio::test]
    async fn bad_names_never_reach_the_api() {
        let cp = MemoryControlPlane::new().unwrap();
        let before = cp.snapshot().unwrap();
        let mut set = pod_reader(PermissionScope::Namespace(String::from("default")));
        set.name = String::from("Pod_Reader");
        let err = create_permission(&cp, &set).await.unwrap_err();
        assert!(matches!(err, KuserError::Validation(_)), "{err}");

        let binding = Binding::new(
            "pod-reader",
            "jane",
            PermissionScope::Namespace(String::from("Team A")),
            Some(String::from("jane's binding")),
        );
        let err = bind_permission(&cp, &binding).await.unwrap_err();
        assert!(matches!(err, KuserError::Validation(_)), "{err}");
        assert_eq!(cp.snapshot().unwrap(), before);
    }

    #[test]
    fn default_binding_name_is_valid_for_any_subject() {
        let binding = Binding::new(
            "pod-reader",
            "Jane.Doe@example.com",
            PermissionScope::Cluster,
            None,
        );
        assert_eq!(binding.name, "pod-reader-jane.doe-example.com");
        binding.validate().unwrap();
    }

    #[tokio::test]
    async fn applying_twice_converges() {
        let cp = MemoryControlPlane::new().unwrap();
        let set = pod_reader(PermissionScope::Namespace(String::from("default")));
        provision(&cp, &set, "jane").await.unwrap();
        let first = cp.snapshot().unwrap();
        provision(&cp, &set, "jane").await.unwrap();
        assert_eq!(first, cp.snapshot().unwrap());
    }

    #[tokio::test]
    async fn updated_rules_replace_old_ones() {
        let cp = MemoryControlPlane::new().unwrap();
        let mut set = pod_reader(PermissionScope::Namespace(String::from("default")));
        provision(&cp, &set, "jane").await.unwrap();
        set.rules[0].verbs = vec![String::from("get")];
        create_permission(&cp, &set).await.unwrap();

        let list = AccessCheck::new("list", "pods", Some("default"));
        let decision = cp.review_access(Some("jane"), &list).await.unwrap();
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn binding_without_permission_set_is_inert() {
        let cp = MemoryControlPlane::new().unwrap();
        let binding = Binding::new(
            "missing",
            "jane",
            PermissionScope::Namespace(String::from("default")),
            None,
        );
        bind_permission(&cp, &binding).await.unwrap();
        let check = AccessCheck::new("get", "pods", Some("default"));
        assert!(!cp
            .review_access(Some("jane"), &check)
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn cluster_scope_applies_everywhere() {
        let cp = MemoryControlPlane::new().unwrap();
        provision(&cp, &pod_reader(PermissionScope::Cluster), "jane")
            .await
            .unwrap();
        for namespace in ["default", "kube-system"] {
            let check = AccessCheck::new("get", "pods", Some(namespace));
            assert!(cp
                .review_access(Some("jane"), &check)
                .await
                .unwrap()
                .is_allowed());
        }
    }

    #[tokio::test]
    async fn provisioning_requires_privilege() {
        let cp = MemoryControlPlane::new().unwrap();
        let set = pod_reader(PermissionScope::Namespace(String::from("default")));
        let err = create_permission(&cp.as_user("jane"), &set)
            .await
            .unwrap_err();
        assert!(matches!(err, KuserError::Forbidden(_)), "{err}");
    }
}
