use std::collections::BTreeMap;

use kube::api::ObjectMeta;

use crate::error::{KuserError, KuserResult};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "kuser";
pub const USER_LABEL: &str = "kuser.github.io/user";

fn is_label(part: &str) -> bool {
    let bytes = part.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}

/// Object name rule (DNS-1123 subdomain): lowercase alphanumerics, `-` and
/// `.`, at most 253 characters, alphanumeric at both ends of every label.
pub fn validate_name(kind: &str, name: &str) -> KuserResult<()> {
    if name.len() > 253 || !name.split('.').all(is_label) {
        return Err(KuserError::Validation(format!(
            "{kind} name {name:?} must consist of lower case alphanumeric characters, '-' or '.', \
             and must start and end with an alphanumeric character"
        )));
    }
    Ok(())
}

/// Namespace rule (DNS-1123 label).
pub fn validate_namespace(namespace: &str) -> KuserResult<()> {
    if !is_label(namespace) {
        return Err(KuserError::Validation(format!(
            "Namespace {namespace:?} must be a lower case alphanumeric label of at most 63 characters"
        )));
    }
    Ok(())
}

/// Turn arbitrary text into a valid object name.
#[must_use]
pub fn to_name(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
            _ => '-',
        })
        .collect();
    let mut name = mapped
        .split('.')
        .map(|label| label.trim_matches('-'))
        .filter(|label| !label.is_empty())
        .collect::<Vec<_>>()
        .join(".");
    name.truncate(253);
    name.trim_end_matches(['-', '.']).to_string()
}

pub trait ObjectMetaKuserExt: Default {
    /// Metadata with the given name and the `managed-by` label set.
    fn managed(name: &str) -> Self;

    fn insert_label(&mut self, key: &str, value: impl Into<String>);

    fn label(&self, key: &str) -> Option<&str>;
}

impl ObjectMetaKuserExt for ObjectMeta {
    fn managed(name: &str) -> Self {
        let mut meta = Self {
            name: Some(name.to_string()),
            ..Default::default()
        };
        meta.insert_label(MANAGED_BY_LABEL, MANAGED_BY);
        meta
    }

    fn insert_label(&mut self, key: &str, value: impl Into<String>) {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels.as_ref()?.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_meta_is_labelled() {
        let mut meta = ObjectMeta::managed("pod-reader");
        meta.insert_label(USER_LABEL, "jane");
        assert_eq!(meta.name.as_deref(), Some("pod-reader"));
        assert_eq!(meta.label(MANAGED_BY_LABEL), Some(MANAGED_BY));
        assert_eq!(meta.label(USER_LABEL), Some("jane"));
        assert_eq!(meta.label("missing"), None);
    }

    #[test]
    fn object_names() {
        for name in ["pod-reader", "a", "dev.team-a", "x1"] {
            validate_name("Role", name).unwrap();
        }
        let too_long = "a".repeat(254);
        for name in ["", "Pod-Reader", "-dev", "dev-", "a..b", "a_b", "jane@corp", too_long.as_str()] {
            assert!(validate_name("Role", name).is_err(), "{name:?}");
        }
        validate_namespace("team-a").unwrap();
        assert!(validate_namespace("team.a").is_err());
        assert!(validate_namespace("").is_err());
    }

    #[test]
    fn names_from_text() {
        assert_eq!(to_name("dev-Jane.Doe@Corp"), "dev-jane.doe-corp");
        assert_eq!(to_name("-weird_name-"), "weird-name");
        validate_name("RoleBinding", &to_name("viewer-Ana María")).unwrap();
    }
}
