use std::{
    fmt,
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use openssl::{
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509NameBuilder, X509NameRef, X509Ref, X509Req},
};

use crate::error::{KuserError, KuserResult};

pub const DEFAULT_KEY_SIZE: u32 = 2048;
const MIN_KEY_SIZE: u32 = 1024;

/// RSA private key of an identity.
///
/// The key never shows up in `Debug` output or logs.
#[derive(Clone)]
pub struct PrivateKey(PKey<Private>);

impl PrivateKey {
    pub fn from_pem(pem: &[u8]) -> KuserResult<Self> {
        Ok(Self(PKey::private_key_from_pem(pem)?))
    }

    pub fn to_pem(&self) -> KuserResult<Vec<u8>> {
        Ok(self.0.private_key_to_pem_pkcs8()?)
    }

    #[must_use]
    pub const fn pkey(&self) -> &PKey<Private> {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Key and certificate request for a single subject.
pub struct Identity {
    pub subject: String,
    pub groups: Vec<String>,
    pub key: PrivateKey,
    pub request: X509Req,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("subject", &self.subject)
            .field("groups", &self.groups)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

pub fn validate_subject(subject: &str) -> KuserResult<()> {
    if subject.trim().is_empty() {
        return Err(KuserError::Validation(String::from(
            "Subject name cannot be empty",
        )));
    }
    if subject.contains('/') || subject.chars().any(char::is_control) {
        return Err(KuserError::Validation(format!(
            "Subject name {subject:?} contains forbidden characters"
        )));
    }
    Ok(())
}

fn gen_pkey(key_size: u32) -> KuserResult<PKey<Private>> {
    if key_size < MIN_KEY_SIZE {
        return Err(KuserError::Validation(format!(
            "Key size must be at least {MIN_KEY_SIZE} bits, got {key_size}"
        )));
    }
    tracing::info!(key_size, "Generating RSA key");
    let rsa = Rsa::generate(key_size)?;
    Ok(PKey::from_rsa(rsa)?)
}

fn build_csr(subject: &str, groups: &[String], pkey: &PKey<Private>) -> KuserResult<X509Req> {
    tracing::info!("Building Certificate Signing Request (CSR)");
    let mut req_builder = X509Req::builder()?;
    // PKCS#10 only defines v1, encoded as 0.
    req_builder.set_version(0)?;
    let mut x509_name = X509NameBuilder::new()?;
    x509_name.append_entry_by_text("CN", subject)?;
    for group in groups {
        x509_name.append_entry_by_text("O", group)?;
    }
    req_builder.set_subject_name(&x509_name.build())?;
    req_builder.set_pubkey(pkey)?;
    req_builder.sign(pkey, MessageDigest::sha256())?;
    tracing::info!("CSR built successfully");
    Ok(req_builder.build())
}

impl Identity {
    /// Generate a fresh key pair and a request with `subject` as its common name.
    #[tracing::instrument(skip(groups), err)]
    pub fn generate(subject: &str, groups: &[String], key_size: u32) -> KuserResult<Self> {
        validate_subject(subject)?;
        let pkey = gen_pkey(key_size)?;
        let request = build_csr(subject, groups, &pkey)?;
        Ok(Self {
            subject: subject.to_string(),
            groups: groups.to_vec(),
            key: PrivateKey(pkey),
            request,
        })
    }

    pub fn request_pem(&self) -> KuserResult<Vec<u8>> {
        Ok(self.request.to_pem()?)
    }
}

fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
}

/// Common name of a certificate request.
pub fn request_subject(request: &X509Req) -> Option<String> {
    common_name(request.subject_name())
}

pub fn certificate_subject(cert: &X509Ref) -> Option<String> {
    common_name(cert.subject_name())
}

/// Where the artefacts of one identity live on disk.
#[derive(Debug, Clone)]
pub struct IdentityFiles {
    dir: PathBuf,
    subject: String,
}

impl IdentityFiles {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, subject: &str) -> Self {
        Self {
            dir: dir.into(),
            subject: subject.to_string(),
        }
    }

    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(format!("{}.key", self.subject))
    }

    #[must_use]
    pub fn request_path(&self) -> PathBuf {
        self.dir.join(format!("{}.csr", self.subject))
    }

    #[must_use]
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(format!("{}.crt", self.subject))
    }

    #[must_use]
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.dir.join(format!("{}.kubeconfig", self.subject))
    }

    /// Save key and request. Refuses to replace an existing key unless `force` is set.
    pub fn save(&self, identity: &Identity, force: bool) -> KuserResult<()> {
        let key_path = self.key_path();
        if key_path.exists() && !force {
            return Err(KuserError::AlreadyExists(format!(
                "Key file {} already exists",
                key_path.display()
            )));
        }
        std::fs::create_dir_all(&self.dir)?;
        write_secret(&key_path, &identity.key.to_pem()?)?;
        write_public(&self.request_path(), &identity.request_pem()?)?;
        tracing::info!(
            key = %key_path.display(),
            request = %self.request_path().display(),
            "Identity saved"
        );
        Ok(())
    }

    pub fn load_key(&self) -> KuserResult<PrivateKey> {
        let path = self.key_path();
        let pem = read_existing(&path)?;
        PrivateKey::from_pem(&pem)
    }

    pub fn load_request(&self) -> KuserResult<X509Req> {
        let pem = read_existing(&self.request_path())?;
        Ok(X509Req::from_pem(&pem)?)
    }

    pub fn load_cert(&self) -> KuserResult<Vec<u8>> {
        read_existing(&self.cert_path())
    }

    /// Whether both the key and the request were saved before.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.key_path().exists() && self.request_path().exists()
    }

    /// Load a saved identity. The request must name this subject and
    /// carry the public half of the saved key.
    pub fn load(&self) -> KuserResult<Identity> {
        let key = self.load_key()?;
        let request = self.load_request()?;
        if !request.public_key()?.public_eq(key.pkey()) {
            return Err(KuserError::Validation(format!(
                "{} was not made with the key in {}",
                self.request_path().display(),
                self.key_path().display()
            )));
        }
        let found = request_subject(&request);
        if found.as_deref() != Some(self.subject.as_str()) {
            return Err(KuserError::Validation(format!(
                "{} is for subject {}, not {}",
                self.request_path().display(),
                found.as_deref().unwrap_or("<none>"),
                self.subject
            )));
        }
        let groups = request
            .subject_name()
            .entries_by_nid(Nid::ORGANIZATIONNAME)
            .filter_map(|entry| entry.data().to_string().ok())
            .collect();
        Ok(Identity {
            subject: self.subject.clone(),
            groups,
            key,
            request,
        })
    }
}

fn read_existing(path: &Path) -> KuserResult<Vec<u8>> {
    match std::fs::read(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(KuserError::NotFound(
            format!("File {} doesn't exist", path.display()),
        )),
        Err(err) => Err(err.into()),
    }
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> KuserResult<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let file = options.open(path)?;
    #[cfg(unix)]
    {
        // `mode` only applies to newly created files.
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    let mut writer = BufWriter::new(file);
    writer.write_all(contents)?;
    writer.flush()?;
    Ok(())
}

/// Write secret material readable by the owner only.
pub fn write_secret(path: &Path, contents: &[u8]) -> KuserResult<()> {
    write_with_mode(path, contents, 0o600)
}

pub fn write_public(path: &Path, contents: &[u8]) -> KuserResult<()> {
    write_with_mode(path, contents, 0o644)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_subject_and_groups() {
        let groups = vec![String::from("developers")];
        let identity = Identity::generate("jane", &groups, 1024).unwrap();
        assert_eq!(request_subject(&identity.request).as_deref(), Some("jane"));
        let org = identity
            .request
            .subject_name()
            .entries_by_nid(Nid::ORGANIZATIONNAME)
            .next()
            .unwrap();
        assert_eq!(org.data().to_string().unwrap(), "developers");
        assert_eq!(identity.request.version(), 0);
        assert!(identity
            .request
            .verify(&identity.request.public_key().unwrap())
            .unwrap());
        let reloaded = X509Req::from_pem(&identity.request_pem().unwrap()).unwrap();
        assert!(reloaded.verify(&reloaded.public_key().unwrap()).unwrap());
    }

    #[test]
    fn rejects_bad_input() {
        for subject in ["", "   ", "a/b"] {
            let err = Identity::generate(subject, &[], 1024).unwrap_err();
            assert!(matches!(err, KuserError::Validation(_)), "{subject:?}");
        }
        for key_size in [0, 512] {
            let err = Identity::generate("jane", &[], key_size).unwrap_err();
            assert!(matches!(err, KuserError::Validation(_)), "{key_size}");
        }
    }

    #[test]
    fn key_is_redacted_in_debug() {
        let identity = Identity::generate("jane", &[], 1024).unwrap();
        let debug = format!("{identity:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[test]
    fn saves_with_restricted_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let files = IdentityFiles::new(dir.path(), "jane");
        let identity = Identity::generate("jane", &[], 1024).unwrap();
        files.save(&identity, false).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(files.key_path())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = files.load_key().unwrap();
        assert!(loaded.pkey().public_eq(identity.key.pkey()));
        assert_eq!(
            request_subject(&files.load_request().unwrap()).as_deref(),
            Some("jane")
        );

        let second = Identity::generate("jane", &[], 1024).unwrap();
        let err = files.save(&second, false).unwrap_err();
        assert!(matches!(err, KuserError::AlreadyExists(_)));
        files.save(&second, true).unwrap();
        assert!(files.load_key().unwrap().pkey().public_eq(second.key.pkey()));
    }

    #[test]
    fn saved_identity_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let files = IdentityFiles::new(dir.path(), "jane");
        assert!(!files.exists());
        let groups = vec![String::from("developers")];
        let identity = Identity::generate("jane", &groups, 1024).unwrap();
        files.save(&identity, false).unwrap();
        assert!(files.exists());

        let loaded = files.load().unwrap();
        assert_eq!(loaded.groups, groups);
        assert!(loaded.key.pkey().public_eq(identity.key.pkey()));
        assert_eq!(loaded.request_pem().unwrap(), identity.request_pem().unwrap());
    }

    #[test]
    fn mismatched_files_do_not_load() {
        let dir = tempfile::tempdir().unwrap();
        let files = IdentityFiles::new(dir.path(), "jane");
        files
            .save(&Identity::generate("jane", &[], 1024).unwrap(), false)
            .unwrap();
        let other = Identity::generate("jane", &[], 1024).unwrap();
        write_public(&files.request_path(), &other.request_pem().unwrap()).unwrap();
        assert!(matches!(
            files.load().unwrap_err(),
            KuserError::Validation(_)
        ));

        let john = IdentityFiles::new(dir.path(), "john");
        let identity = Identity::generate("jane", &[], 1024).unwrap();
        john.save(&identity, false).unwrap();
        assert!(matches!(john.load().unwrap_err(), KuserError::Validation(_)));
    }

    #[test]
    fn missing_files_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let files = IdentityFiles::new(dir.path(), "ghost");
        assert!(matches!(
            files.load_key().unwrap_err(),
            KuserError::NotFound(_)
        ));
    }
}
