use std::time::Duration;

use openssl::x509::X509;
use tokio::time::Instant;

use crate::{
    control_plane::ControlPlane,
    error::{KuserError, KuserResult},
    request::{denial_reason, SigningRequestState},
};

/// Bounded polling with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Total time to wait before giving up.
    pub deadline: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(120),
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
        }
    }
}

impl PollPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_interval)
    }
}

fn timed_out(name: &str, started: Instant) -> KuserError {
    KuserError::Timeout {
        name: name.to_string(),
        waited: started.elapsed(),
    }
}

/// Wait until the signing request `name` is issued and return its certificate.
///
/// The deadline covers every read, slow ones included. Transient API errors
/// are retried until it passes. Dropping the returned future stops polling.
#[tracing::instrument(skip(cp, policy), err)]
pub async fn fetch_certificate<C: ControlPlane>(
    cp: &C,
    name: &str,
    policy: &PollPolicy,
) -> KuserResult<X509> {
    let started = Instant::now();
    let mut interval = policy.initial_interval.max(Duration::from_millis(1));
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        let remaining = policy.deadline.saturating_sub(started.elapsed());
        let read = match tokio::time::timeout(remaining, cp.get_csr(name)).await {
            Ok(read) => read,
            Err(_) => return Err(timed_out(name, started)),
        };
        let csr = match read {
            Ok(Some(csr)) => csr,
            Ok(None) => return Err(KuserError::NotFound(format!("Signing request {name}"))),
            Err(err) if err.is_transient() => {
                tracing::warn!(attempt, %err, "Cannot read signing request, retrying");
                if !wait(policy, started, &mut interval).await {
                    return Err(timed_out(name, started));
                }
                continue;
            }
            Err(err) => return Err(err),
        };
        match SigningRequestState::of(&csr) {
            SigningRequestState::Issued => {
                let pem = csr
                    .status
                    .and_then(|status| status.certificate)
                    .map(|cert| cert.0)
                    .unwrap_or_default();
                let cert = X509::from_pem(&pem).map_err(|err| {
                    KuserError::Validation(format!(
                        "Signing request {name} holds an unreadable certificate: {err}"
                    ))
                })?;
                tracing::info!(attempt, "Certificate issued");
                return Ok(cert);
            }
            SigningRequestState::Denied => {
                return Err(KuserError::Denied {
                    name: name.to_string(),
                    reason: denial_reason(&csr),
                });
            }
            state => tracing::debug!(attempt, ?state, "Certificate is not issued yet"),
        }
        if !wait(policy, started, &mut interval).await {
            return Err(timed_out(name, started));
        }
    }
}

/// Sleep before the next attempt. `false` once the deadline has passed.
async fn wait(policy: &PollPolicy, started: Instant, interval: &mut Duration) -> bool {
    let waited = started.elapsed();
    if waited >= policy.deadline {
        return false;
    }
    tokio::time::sleep((*interval).min(policy.deadline - waited)).await;
    *interval = policy.next_interval(*interval);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        control_plane::memory::MemoryControlPlane,
        identity::Identity,
        request::{approve, deny, submit, SigningRequest},
    };

    async fn submitted(cp: &MemoryControlPlane, subject: &str) -> Identity {
        let identity = Identity::generate(subject, &[], 1024).unwrap();
        let request = SigningRequest::new(subject, identity.request_pem().unwrap());
        submit(cp, &request).await.unwrap();
        identity
    }

    #[test]
    fn backoff_is_capped() {
        let policy = PollPolicy {
            deadline: Duration::from_secs(10),
            initial_interval: Duration::from_millis(400),
            max_interval: Duration::from_secs(1),
        };
        assert_eq!(
            policy.next_interval(Duration::from_millis(400)),
            Duration::from_millis(800)
        );
        assert_eq!(
            policy.next_interval(Duration::from_millis(800)),
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn returns_issued_certificate() {
        let cp = MemoryControlPlane::new().unwrap();
        let identity = submitted(&cp, "jane").await;
        approve(&cp, "jane", None).await.unwrap();
        let cert = fetch_certificate(&cp, "jane", &PollPolicy::default())
            .await
            .unwrap();
        assert!(cert.public_key().unwrap().public_eq(identity.key.pkey()));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_approval() {
        let cp = MemoryControlPlane::new().unwrap();
        submitted(&cp, "jane").await;
        let policy = PollPolicy {
            deadline: Duration::from_secs(30),
            ..Default::default()
        };
        let err = fetch_certificate(&cp, "jane", &policy).await.unwrap_err();
        let KuserError::Timeout { waited, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert!(waited >= policy.deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_signer_is_stuck() {
        let cp = MemoryControlPlane::new().unwrap();
        cp.set_signing(false);
        submitted(&cp, "jane").await;
        approve(&cp, "jane", None).await.unwrap();
        let err = fetch_certificate(&cp, "jane", &PollPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KuserError::Timeout { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn picks_up_late_issuance() {
        let cp = MemoryControlPlane::new().unwrap();
        cp.set_signing(false);
        submitted(&cp, "jane").await;
        approve(&cp, "jane", None).await.unwrap();
        let signer = cp.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            signer.set_signing(true);
        });
        fetch_certificate(&cp, "jane", &PollPolicy::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn denied_is_never_issued() {
        let cp = MemoryControlPlane::new().unwrap();
        submitted(&cp, "jane").await;
        deny(&cp, "jane", Some("not on the list")).await.unwrap();
        let err = fetch_certificate(&cp, "jane", &PollPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KuserError::Denied { .. }), "{err}");
        // Approving afterwards doesn't revive it.
        assert!(approve(&cp, "jane", None).await.is_err());
        let csr = cp.get_csr("jane").await.unwrap().unwrap();
        assert_eq!(SigningRequestState::of(&csr), SigningRequestState::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_covers_a_hanging_read() {
        let cp = MemoryControlPlane::new().unwrap();
        submitted(&cp, "jane").await;
        cp.set_read_latency(Duration::from_secs(600));
        let policy = PollPolicy {
            deadline: Duration::from_secs(5),
            ..Default::default()
        };
        let err = fetch_certificate(&cp, "jane", &policy).await.unwrap_err();
        let KuserError::Timeout { waited, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert!(waited < Duration::from_secs(6), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_unavailable_api() {
        let cp = MemoryControlPlane::new().unwrap();
        let identity = submitted(&cp, "jane").await;
        approve(&cp, "jane", None).await.unwrap();
        cp.fail_reads(3);
        let before = cp.csr_reads();
        let cert = fetch_certificate(&cp, "jane", &PollPolicy::default())
            .await
            .unwrap();
        assert!(cert.public_key().unwrap().public_eq(identity.key.pkey()));
        assert_eq!(cp.csr_reads() - before, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_api_still_times_out() {
        let cp = MemoryControlPlane::new().unwrap();
        submitted(&cp, "jane").await;
        cp.fail_reads(usize::MAX);
        let policy = PollPolicy {
            deadline: Duration::from_secs(10),
            ..Default::default()
        };
        let err = fetch_certificate(&cp, "jane", &policy).await.unwrap_err();
        assert!(matches!(err, KuserError::Timeout { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_future_stops_polling() {
        let cp = MemoryControlPlane::new().unwrap();
        submitted(&cp, "jane").await;
        let cancelled = tokio::time::timeout(
            Duration::from_secs(3),
            fetch_certificate(&cp, "jane", &PollPolicy::default()),
        )
        .await;
        assert!(cancelled.is_err());
        let reads = cp.csr_reads();
        assert!(reads > 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cp.csr_reads(), reads);
    }

    #[tokio::test]
    async fn missing_request_is_not_found() {
        let cp = MemoryControlPlane::new().unwrap();
        let err = fetch_certificate(&cp, "ghost", &PollPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KuserError::NotFound(_)), "{err}");
    }
}
