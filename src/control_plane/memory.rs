//! In-process control plane.
//!
//! Requests are signed by a CA generated on construction. Issuance happens
//! the first time an approved request is read, the way an external signer
//! picks it up some time after approval. Authorization follows the RBAC
//! rules stored in it; [`ADMIN`] may do everything.
//!
//! [`ControlPlane::connect_as`] checks a kubeconfig the way a TLS handshake
//! with the API server would: the server address, the CA data against the
//! serving certificate, and the client certificate and key.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};

use k8s_openapi::{
    api::{
        certificates::v1::CertificateSigningRequest,
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, Subject},
    },
    ByteString,
};
use kube::{
    config::{AuthInfo, Kubeconfig},
    core::ErrorResponse,
    ResourceExt,
};
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName},
        X509NameBuilder, X509Ref, X509Req, X509VerifyResult, X509,
    },
};
use serde::Serialize;

use super::ControlPlane;
use crate::{
    access::{AccessCheck, AccessDecision},
    error::{KuserError, KuserResult},
    identity::certificate_subject,
    permissions::PermissionScope,
    request::{SigningRequestState, DEFAULT_SIGNER_NAME, DEFAULT_USAGES},
};

/// User allowed to do everything.
pub const ADMIN: &str = "kubernetes-admin";
const SERVER_URL: &str = "https://127.0.0.1:6443";
const DEFAULT_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

const CERTIFICATES_GROUP: &str = "certificates.k8s.io";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
const AUTHORIZATION_GROUP: &str = "authorization.k8s.io";

fn serial_number() -> KuserResult<Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

#[derive(Debug)]
struct Authority {
    key: PKey<Private>,
    cert: X509,
}

impl Authority {
    fn generate() -> KuserResult<Self> {
        let key = PKey::from_rsa(Rsa::generate(2048)?)?;
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", "kuser-memory-ca")?;
        let name = name.build();

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*serial_number()?)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&*Asn1Time::days_from_now(365)?)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;
        builder.sign(&key, MessageDigest::sha256())?;
        Ok(Self {
            key,
            cert: builder.build(),
        })
    }

    fn sign(&self, request: &X509Req, expiration_seconds: Option<i32>) -> KuserResult<X509> {
        let pubkey = request.public_key()?;
        if !request.verify(&pubkey)? {
            return Err(KuserError::Validation(String::from(
                "Certificate request signature is invalid",
            )));
        }
        let lifetime = expiration_seconds.map_or(DEFAULT_LIFETIME_SECS, i64::from);
        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*serial_number()?)?;
        builder.set_subject_name(request.subject_name())?;
        builder.set_issuer_name(self.cert.subject_name())?;
        builder.set_pubkey(&pubkey)?;
        builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&*Asn1Time::from_unix(
            chrono::Utc::now().timestamp() + lifetime,
        )?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;
        builder.sign(&self.key, MessageDigest::sha256())?;
        Ok(builder.build())
    }

    /// Certificate the API server presents to clients.
    fn serving_cert(&self) -> KuserResult<X509> {
        let key = PKey::from_rsa(Rsa::generate(2048)?)?;
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", "kube-apiserver")?;
        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*serial_number()?)?;
        builder.set_subject_name(&name.build())?;
        builder.set_issuer_name(self.cert.subject_name())?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&*Asn1Time::days_from_now(365)?)?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
        let san = SubjectAlternativeName::new()
            .ip("127.0.0.1")
            .dns("kubernetes")
            .build(&builder.x509v3_context(Some(&*self.cert), None))?;
        builder.append_extension(san)?;
        builder.sign(&self.key, MessageDigest::sha256())?;
        Ok(builder.build())
    }

    fn issued(&self, cert: &X509Ref) -> KuserResult<bool> {
        Ok(self.cert.issued(cert) == X509VerifyResult::OK
            && cert.verify(&*self.cert.public_key()?)?)
    }
}

/// Ways to make the control plane misbehave.
#[derive(Debug, Default)]
struct Faults {
    /// Reads of signing requests left to fail with `503 Service Unavailable`.
    unavailable: AtomicUsize,
    /// Delay before answering a read of a signing request.
    latency_ms: AtomicU64,
    csr_reads: AtomicUsize,
}

fn unavailable() -> KuserError {
    KuserError::from(kube::Error::Api(ErrorResponse {
        status: String::from("Failure"),
        message: String::from("etcdserver: leader changed"),
        reason: String::from("ServiceUnavailable"),
        code: 503,
    }))
}

fn decode_pem(field: &str, data: Option<&str>) -> KuserResult<Vec<u8>> {
    let data = data.ok_or_else(|| KuserError::Validation(format!("Kubeconfig has no {field}")))?;
    BASE64_STANDARD
        .decode(data)
        .map_err(|err| KuserError::Validation(format!("{field} is not valid base64: {err}")))
}

/// PEM key of a kubeconfig user. `AuthInfo` keeps it as a secret and only
/// gives it away when serialized.
fn client_key_data(auth: &AuthInfo) -> KuserResult<Option<String>> {
    let value = serde_yaml::to_value(auth)?;
    Ok(value
        .get("client-key-data")
        .and_then(serde_yaml::Value::as_str)
        .map(String::from))
}

#[derive(Debug, Default, Serialize)]
struct State {
    csrs: BTreeMap<String, CertificateSigningRequest>,
    /// Keyed by `namespace/name`.
    roles: BTreeMap<String, Role>,
    cluster_roles: BTreeMap<String, ClusterRole>,
    /// Keyed by `namespace/name`.
    role_bindings: BTreeMap<String, RoleBinding>,
    cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
}

fn namespaced_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn matches_any(values: Option<&Vec<String>>, wanted: &str) -> bool {
    values.is_some_and(|values| values.iter().any(|value| value == "*" || value == wanted))
}

fn rule_allows(rule: &PolicyRule, verb: &str, group: &str, resource: &str) -> bool {
    matches_any(Some(&rule.verbs), verb)
        && matches_any(rule.api_groups.as_ref(), group)
        && matches_any(rule.resources.as_ref(), resource)
}

fn binds_user(subjects: Option<&Vec<Subject>>, user: &str) -> bool {
    subjects.is_some_and(|subjects| {
        subjects
            .iter()
            .any(|subject| subject.kind == "User" && subject.name == user)
    })
}

impl State {
    /// Rules granted to `user` in `namespace` (or cluster-wide for `None`).
    /// Bindings to missing roles contribute nothing.
    fn rules_for(&self, user: &str, namespace: Option<&str>) -> Vec<&PolicyRule> {
        let mut rules = Vec::new();
        for binding in self.cluster_role_bindings.values() {
            if !binds_user(binding.subjects.as_ref(), user) {
                continue;
            }
            if let Some(role) = self.cluster_roles.get(&binding.role_ref.name) {
                rules.extend(role.rules.iter().flatten());
            }
        }
        let Some(namespace) = namespace else {
            return rules;
        };
        for binding in self.role_bindings.values() {
            if binding.metadata.namespace.as_deref() != Some(namespace)
                || !binds_user(binding.subjects.as_ref(), user)
            {
                continue;
            }
            let role_rules = match binding.role_ref.kind.as_str() {
                "Role" => self
                    .roles
                    .get(&namespaced_key(namespace, &binding.role_ref.name))
                    .and_then(|role| role.rules.as_ref()),
                "ClusterRole" => self
                    .cluster_roles
                    .get(&binding.role_ref.name)
                    .and_then(|role| role.rules.as_ref()),
                _ => None,
            };
            rules.extend(role_rules.into_iter().flatten());
        }
        rules
    }

    fn allows(
        &self,
        user: &str,
        verb: &str,
        group: &str,
        resource: &str,
        namespace: Option<&str>,
    ) -> bool {
        user == ADMIN
            || self
                .rules_for(user, namespace)
                .into_iter()
                .any(|rule| rule_allows(rule, verb, group, resource))
    }
}

/// Control plane kept in memory.
///
/// Clones and [`MemoryControlPlane::as_user`] views share state.
#[derive(Clone, Debug)]
pub struct MemoryControlPlane {
    state: Arc<Mutex<State>>,
    authority: Arc<Authority>,
    serving: Arc<X509>,
    signing: Arc<AtomicBool>,
    faults: Arc<Faults>,
    caller: String,
}

impl MemoryControlPlane {
    /// Empty control plane acting as [`ADMIN`].
    pub fn new() -> KuserResult<Self> {
        let authority = Authority::generate()?;
        Ok(Self {
            state: Arc::default(),
            serving: Arc::new(authority.serving_cert()?),
            authority: Arc::new(authority),
            signing: Arc::new(AtomicBool::new(true)),
            faults: Arc::default(),
            caller: String::from(ADMIN),
        })
    }

    /// View of the same control plane acting as `user`.
    #[must_use]
    pub fn as_user(&self, user: &str) -> Self {
        Self {
            caller: user.to_string(),
            ..self.clone()
        }
    }

    /// Stop or resume issuing certificates for approved requests.
    pub fn set_signing(&self, enabled: bool) {
        self.signing.store(enabled, Ordering::SeqCst);
    }

    /// Fail the next `count` reads of signing requests as unavailable.
    pub fn fail_reads(&self, count: usize) {
        self.faults.unavailable.store(count, Ordering::SeqCst);
    }

    /// Delay every read of a signing request by `latency`.
    pub fn set_read_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.faults.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// How many times signing requests were read, failed reads included.
    #[must_use]
    pub fn csr_reads(&self) -> usize {
        self.faults.csr_reads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn csr_count(&self) -> usize {
        self.lock().csrs.len()
    }

    /// Who a client presenting `kubeconfig` would be, if anyone.
    fn handshake(&self, kubeconfig: &Kubeconfig) -> KuserResult<String> {
        let context_name = kubeconfig.current_context.as_deref().unwrap_or_default();
        let context = kubeconfig
            .contexts
            .iter()
            .find(|context| context.name == context_name)
            .and_then(|context| context.context.as_ref())
            .ok_or_else(|| {
                KuserError::Validation(format!("Kubeconfig has no context {context_name:?}"))
            })?;
        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|cluster| cluster.name == context.cluster)
            .and_then(|cluster| cluster.cluster.as_ref())
            .ok_or_else(|| {
                KuserError::Validation(format!("Kubeconfig has no cluster {}", context.cluster))
            })?;
        let auth = kubeconfig
            .auth_infos
            .iter()
            .find(|auth| auth.name == context.user)
            .and_then(|auth| auth.auth_info.as_ref())
            .ok_or_else(|| {
                KuserError::Validation(format!("Kubeconfig has no user {}", context.user))
            })?;

        let server = cluster.server.as_deref().unwrap_or_default();
        if server.trim_end_matches('/') != SERVER_URL {
            return Err(KuserError::Unauthenticated(format!(
                "dial {server}: connection refused"
            )));
        }
        let ca_data = decode_pem(
            "certificate-authority-data",
            cluster.certificate_authority_data.as_deref(),
        )?;
        let mut trusted = false;
        for authority in X509::stack_from_pem(&ca_data)? {
            if self.serving.verify(&*authority.public_key()?)? {
                trusted = true;
                break;
            }
        }
        if !trusted {
            return Err(KuserError::Unauthenticated(String::from(
                "tls: failed to verify certificate: x509: certificate signed by unknown authority",
            )));
        }

        let unauthorized = || KuserError::Unauthenticated(String::from("Unauthorized"));
        let cert = X509::from_pem(&decode_pem(
            "client-certificate-data",
            auth.client_certificate_data.as_deref(),
        )?)?;
        let key_pem = decode_pem("client-key-data", client_key_data(auth)?.as_deref())?;
        let key = PKey::private_key_from_pem(&key_pem)?;
        if !cert.public_key()?.public_eq(&key) || !self.authority.issued(&cert)? {
            return Err(unauthorized());
        }
        certificate_subject(&cert).ok_or_else(unauthorized)
    }

    /// Everything stored, serialized as YAML.
    pub fn snapshot(&self) -> KuserResult<String> {
        Ok(serde_yaml::to_string(&*self.lock())?)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authorize(
        &self,
        state: &State,
        verb: &str,
        group: &str,
        resource: &str,
        namespace: Option<&str>,
    ) -> KuserResult<()> {
        if state.allows(&self.caller, verb, group, resource, namespace) {
            return Ok(());
        }
        let scope = namespace.map_or_else(
            || String::from("at the cluster scope"),
            |namespace| format!("in the namespace \"{namespace}\""),
        );
        Err(KuserError::Forbidden(format!(
            "{resource}.{group} is forbidden: User \"{}\" cannot {verb} resource \"{resource}\" in API group \"{group}\" {scope}",
            self.caller
        )))
    }

    fn validate_csr(csr: &CertificateSigningRequest) -> KuserResult<()> {
        if csr.metadata.name.as_deref().unwrap_or_default().is_empty() {
            return Err(KuserError::Validation(String::from(
                "metadata.name: Required value",
            )));
        }
        if csr.spec.signer_name != DEFAULT_SIGNER_NAME {
            return Err(KuserError::Validation(format!(
                "spec.signerName: Unsupported value: {:?}",
                csr.spec.signer_name
            )));
        }
        let usages = csr.spec.usages.as_deref().unwrap_or_default();
        if !usages.iter().any(|usage| usage == "client auth")
            || usages
                .iter()
                .any(|usage| !DEFAULT_USAGES.contains(&usage.as_str()))
        {
            return Err(KuserError::Validation(format!(
                "spec.usages: Unsupported value: {usages:?}"
            )));
        }
        X509Req::from_pem(&csr.spec.request.0).map_err(|err| {
            KuserError::Validation(format!("spec.request: Invalid value: {err}"))
        })?;
        Ok(())
    }

    /// Sign approved requests, as the signer controller would.
    fn issue_if_approved(&self, csr: &mut CertificateSigningRequest) -> KuserResult<()> {
        if !self.signing.load(Ordering::SeqCst)
            || SigningRequestState::of(csr) != SigningRequestState::Approved
        {
            return Ok(());
        }
        let request = X509Req::from_pem(&csr.spec.request.0)?;
        let cert = self
            .authority
            .sign(&request, csr.spec.expiration_seconds)?;
        if let Some(status) = csr.status.as_mut() {
            status.certificate = Some(ByteString(cert.to_pem()?));
        }
        Ok(())
    }
}

impl ControlPlane for MemoryControlPlane {
    fn server_url(&self) -> String {
        String::from(SERVER_URL)
    }

    async fn connect_as(&self, kubeconfig: &Path) -> KuserResult<Self> {
        let user = self.handshake(&Kubeconfig::read_from(kubeconfig)?)?;
        Ok(self.as_user(&user))
    }

    async fn authenticated_user(&self) -> KuserResult<String> {
        Ok(self.caller.clone())
    }

    async fn root_ca(&self) -> KuserResult<String> {
        Ok(String::from_utf8(self.authority.cert.to_pem()?)?)
    }

    async fn create_csr(
        &self,
        csr: &CertificateSigningRequest,
    ) -> KuserResult<CertificateSigningRequest> {
        let mut state = self.lock();
        self.authorize(&state, "create", CERTIFICATES_GROUP, "certificatesigningrequests", None)?;
        Self::validate_csr(csr)?;
        let name = csr.name_any();
        if state.csrs.contains_key(&name) {
            return Err(KuserError::AlreadyExists(format!(
                "certificatesigningrequests.certificates.k8s.io \"{name}\" already exists"
            )));
        }
        let mut stored = csr.clone();
        stored.status = None;
        state.csrs.insert(name, stored.clone());
        Ok(stored)
    }

    async fn get_csr(&self, name: &str) -> KuserResult<Option<CertificateSigningRequest>> {
        self.faults.csr_reads.fetch_add(1, Ordering::SeqCst);
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self
            .faults
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(unavailable());
        }
        let mut state = self.lock();
        self.authorize(&state, "get", CERTIFICATES_GROUP, "certificatesigningrequests", None)?;
        let Some(csr) = state.csrs.get_mut(name) else {
            return Ok(None);
        };
        self.issue_if_approved(csr)?;
        Ok(Some(csr.clone()))
    }

    async fn update_csr_approval(
        &self,
        csr: &CertificateSigningRequest,
    ) -> KuserResult<CertificateSigningRequest> {
        let mut state = self.lock();
        self.authorize(
            &state,
            "update",
            CERTIFICATES_GROUP,
            "certificatesigningrequests/approval",
            None,
        )?;
        let name = csr.name_any();
        let Some(stored) = state.csrs.get_mut(&name) else {
            return Err(KuserError::NotFound(format!(
                "certificatesigningrequests.certificates.k8s.io \"{name}\" not found"
            )));
        };
        let mut updated = stored.clone();
        updated.status.get_or_insert_with(Default::default).conditions = csr
            .status
            .as_ref()
            .and_then(|status| status.conditions.clone());
        let (old, new) = (
            SigningRequestState::of(stored),
            SigningRequestState::of(&updated),
        );
        if old != new && !old.can_transition_to(new) {
            return Err(KuserError::Validation(format!(
                "status.conditions: Invalid value: signing request {name} cannot go from {old:?} to {new:?}"
            )));
        }
        *stored = updated.clone();
        Ok(updated)
    }

    async fn apply_role(&self, role: &Role) -> KuserResult<Role> {
        let mut state = self.lock();
        let namespace = role.namespace().unwrap_or_default();
        self.authorize(&state, "create", RBAC_GROUP, "roles", Some(&namespace))?;
        state
            .roles
            .insert(namespaced_key(&namespace, &role.name_any()), role.clone());
        Ok(role.clone())
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> KuserResult<ClusterRole> {
        let mut state = self.lock();
        self.authorize(&state, "create", RBAC_GROUP, "clusterroles", None)?;
        state.cluster_roles.insert(role.name_any(), role.clone());
        Ok(role.clone())
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> KuserResult<RoleBinding> {
        let mut state = self.lock();
        let namespace = binding.namespace().unwrap_or_default();
        self.authorize(&state, "create", RBAC_GROUP, "rolebindings", Some(&namespace))?;
        state.role_bindings.insert(
            namespaced_key(&namespace, &binding.name_any()),
            binding.clone(),
        );
        Ok(binding.clone())
    }

    async fn apply_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> KuserResult<ClusterRoleBinding> {
        let mut state = self.lock();
        self.authorize(&state, "create", RBAC_GROUP, "clusterrolebindings", None)?;
        state
            .cluster_role_bindings
            .insert(binding.name_any(), binding.clone());
        Ok(binding.clone())
    }

    async fn permission_set_exists(
        &self,
        scope: &PermissionScope,
        name: &str,
    ) -> KuserResult<bool> {
        let state = self.lock();
        Ok(match scope {
            PermissionScope::Namespace(namespace) => {
                self.authorize(&state, "get", RBAC_GROUP, "roles", Some(namespace))?;
                state.roles.contains_key(&namespaced_key(namespace, name))
            }
            PermissionScope::Cluster => {
                self.authorize(&state, "get", RBAC_GROUP, "clusterroles", None)?;
                state.cluster_roles.contains_key(name)
            }
        })
    }

    async fn review_access(
        &self,
        subject: Option<&str>,
        check: &AccessCheck,
    ) -> KuserResult<AccessDecision> {
        let state = self.lock();
        let user = match subject {
            Some(subject) if subject != self.caller => {
                self.authorize(&state, "create", AUTHORIZATION_GROUP, "subjectaccessreviews", None)?;
                subject
            }
            _ => self.caller.as_str(),
        };
        let allowed = state.allows(
            user,
            &check.verb,
            &check.api_group,
            &check.resource,
            check.namespace.as_deref(),
        );
        Ok(if allowed {
            AccessDecision::Allowed
        } else {
            AccessDecision::Denied { reason: None }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config_writer::AccessConfig,
        identity::Identity,
        request::{approve, submit, SigningRequest},
        retriever::{fetch_certificate, PollPolicy},
    };

    async fn access_config(cp: &MemoryControlPlane, subject: &str) -> AccessConfig {
        let identity = Identity::generate(subject, &[], 1024).unwrap();
        let request = SigningRequest::new(subject, identity.request_pem().unwrap());
        submit(cp, &request).await.unwrap();
        approve(cp, subject, None).await.unwrap();
        let cert = fetch_certificate(cp, subject, &PollPolicy::default())
            .await
            .unwrap();
        AccessConfig {
            cluster_name: String::from("memory"),
            server: cp.server_url(),
            ca_data: cp.root_ca().await.unwrap(),
            subject: subject.to_string(),
            certificate: cert.to_pem().unwrap(),
            key: identity.key,
            namespace: None,
        }
    }

    fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
        let owned = |values: &[&str]| values.iter().map(ToString::to_string).collect::<Vec<_>>();
        PolicyRule {
            api_groups: Some(owned(groups)),
            resources: Some(owned(resources)),
            verbs: owned(verbs),
            ..Default::default()
        }
    }

    #[test]
    fn wildcard_rules() {
        let any = rule(&["*"], &["*"], &["*"]);
        assert!(rule_allows(&any, "delete", "apps", "deployments"));
        let pods = rule(&[""], &["pods"], &["get"]);
        assert!(rule_allows(&pods, "get", "", "pods"));
        assert!(!rule_allows(&pods, "get", "apps", "pods"));
        assert!(!rule_allows(&pods, "list", "", "pods"));
        assert!(!rule_allows(&pods, "get", "", "pods/log"));
    }

    #[tokio::test]
    async fn signs_with_its_authority() {
        let cp = MemoryControlPlane::new().unwrap();
        let identity = Identity::generate("jane", &[], 1024).unwrap();
        let request = SigningRequest::new("jane", identity.request_pem().unwrap());
        let mut csr = cp.create_csr(&request.to_resource()).await.unwrap();
        csr.status = Some(k8s_openapi::api::certificates::v1::CertificateSigningRequestStatus {
            conditions: Some(vec![
                k8s_openapi::api::certificates::v1::CertificateSigningRequestCondition {
                    type_: String::from("Approved"),
                    status: String::from("True"),
                    ..Default::default()
                },
            ]),
            certificate: None,
        });
        cp.update_csr_approval(&csr).await.unwrap();

        let issued = cp.get_csr("jane").await.unwrap().unwrap();
        assert_eq!(SigningRequestState::of(&issued), SigningRequestState::Issued);
        let cert = X509::from_pem(&issued.status.unwrap().certificate.unwrap().0).unwrap();
        let ca = X509::from_pem(cp.root_ca().await.unwrap().as_bytes()).unwrap();
        assert!(cert.verify(&ca.public_key().unwrap()).unwrap());
        assert!(cert.public_key().unwrap().public_eq(identity.key.pkey()));
    }

    #[tokio::test]
    async fn users_see_only_their_bindings() {
        let cp = MemoryControlPlane::new().unwrap();
        let check = AccessCheck::new("create", "roles", Some("default")).with_group(RBAC_GROUP);
        assert!(cp.review_access(None, &check).await.unwrap().is_allowed());
        let jane = cp.as_user("jane");
        assert!(!jane.review_access(None, &check).await.unwrap().is_allowed());
        assert!(matches!(
            jane.review_access(Some("john"), &check).await.unwrap_err(),
            KuserError::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn issued_kubeconfig_authenticates() {
        let cp = MemoryControlPlane::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jane.kubeconfig");
        access_config(&cp, "jane").await.write(&path).unwrap();

        let jane = cp.connect_as(&path).await.unwrap();
        assert_eq!(jane.authenticated_user().await.unwrap(), "jane");
        let check = AccessCheck::new("get", "pods", Some("default"));
        assert!(!jane.review_access(None, &check).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn wrong_server_is_unreachable() {
        let cp = MemoryControlPlane::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jane.kubeconfig");
        let mut config = access_config(&cp, "jane").await;
        config.server = String::from("https://10.0.0.1:6443");
        config.write(&path).unwrap();

        let err = cp.connect_as(&path).await.unwrap_err();
        assert!(matches!(err, KuserError::Unauthenticated(_)), "{err}");
    }

    #[tokio::test]
    async fn server_must_be_trusted() {
        let cp = MemoryControlPlane::new().unwrap();
        let other = MemoryControlPlane::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jane.kubeconfig");
        let mut kubeconfig = access_config(&cp, "jane")
            .await
            .build_kubeconfig()
            .unwrap();
        let foreign_ca = other.root_ca().await.unwrap();
        kubeconfig.clusters[0]
            .cluster
            .as_mut()
            .unwrap()
            .certificate_authority_data = Some(BASE64_STANDARD.encode(foreign_ca));
        std::fs::write(&path, serde_yaml::to_string(&kubeconfig).unwrap()).unwrap();

        let err = cp.connect_as(&path).await.unwrap_err();
        assert!(err.to_string().contains("unknown authority"), "{err}");
    }

    #[tokio::test]
    async fn foreign_client_certificate_is_unauthorized() {
        let cp = MemoryControlPlane::new().unwrap();
        let other = MemoryControlPlane::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jane.kubeconfig");
        let mut config = access_config(&other, "jane").await;
        // Both CAs are trusted, but only `other` signed the client certificate.
        config.ca_data = format!("{}{}", cp.root_ca().await.unwrap(), config.ca_data);
        config.write(&path).unwrap();

        let err = cp.connect_as(&path).await.unwrap_err();
        assert!(matches!(err, KuserError::Unauthenticated(_)), "{err}");
        assert!(err.to_string().contains("Unauthorized"), "{err}");
    }
}
