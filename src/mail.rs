use std::{str::FromStr, time::Duration};

use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::{authentication::Credentials, PoolConfig},
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::{args::SMTPArgs, error::KuserResult};

pub type SmtpTransport = AsyncSmtpTransport<Tokio1Executor>;

pub fn transport(args: &SMTPArgs) -> KuserResult<SmtpTransport> {
    Ok(SmtpTransport::from_url(&args.url)?
        .port(args.port)
        .credentials(Credentials::new(args.user.clone(), args.password.clone()))
        .pool_config(
            PoolConfig::new()
                .max_size(3)
                .idle_timeout(Duration::from_secs(30)),
        )
        .build())
}

/// E-mail carrying the kubeconfig of `subject` as an attachment.
pub fn kubeconfig_message(
    args: &SMTPArgs,
    to: &str,
    full_name: Option<String>,
    subject: &str,
    kubeconfig: String,
) -> KuserResult<Message> {
    let attachment = Attachment::new(String::from("kubeconfig.yaml"))
        .body(kubeconfig, ContentType::TEXT_PLAIN);
    let greeting = full_name.clone().unwrap_or_else(|| subject.to_string());
    Ok(Message::builder()
        .from(Mailbox::new(
            Some(args.from_name.clone()),
            Address::from_str(&args.from_email)?,
        ))
        .to(Mailbox::new(full_name, Address::from_str(to)?))
        .subject("You've been added to the Kubernetes cluster!")
        .date_now()
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::html(format!(
                    "Hello, <b>{greeting}</b>! You've been added to the Kubernetes cluster as <b>{subject}</b>. Please download the kubeconfig.",
                )))
                .singlepart(attachment),
        )?)
}

#[tracing::instrument(skip(args, full_name, kubeconfig), err)]
pub async fn send_kubeconfig(
    args: &SMTPArgs,
    to: &str,
    full_name: Option<String>,
    subject: &str,
    kubeconfig: String,
) -> KuserResult<()> {
    let msg = kubeconfig_message(args, to, full_name, subject, kubeconfig)?;
    let smtp = transport(args)?;
    tracing::info!("Testing SMTP connection");
    smtp.test_connection().await?;
    smtp.send(msg).await?;
    tracing::info!("Kubeconfig sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KuserError;

    fn smtp_args() -> SMTPArgs {
        SMTPArgs {
            url: String::from("smtp://localhost"),
            port: 587,
            user: String::from("kuser"),
            password: String::from("kuser"),
            from_email: String::from("admin@example.com"),
            from_name: String::from("Cluster Admin"),
        }
    }

    #[test]
    fn message_has_kubeconfig_attached() {
        let msg = kubeconfig_message(
            &smtp_args(),
            "jane@example.com",
            Some(String::from("Jane Doe")),
            "jane",
            String::from("apiVersion: v1\nkind: Config\n"),
        )
        .unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("<jane@example.com>"));
        assert!(raw.contains("kubeconfig.yaml"));
        assert!(raw.contains("kind: Config"));
    }

    #[test]
    fn rejects_bad_address() {
        let err = kubeconfig_message(
            &smtp_args(),
            "not an address",
            None,
            "jane",
            String::new(),
        )
        .unwrap_err();
        assert!(matches!(err, KuserError::EmailAddressError(_)));
    }
}
