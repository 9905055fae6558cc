//! Delivering the "your export is ready" notification.
//!
//! `lettre`'s blocking SMTP transport does the actual dialogue; callers
//! run it through [`tokio::task::spawn_blocking`] the same way the rest
//! of this crate wraps blocking I/O for use inside an async task.

use lettre::message::{MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::error::PackageError;
use crate::prelude::*;

/// SMTP relay settings needed to send one message.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub login: Option<String>,
    pub password: Option<String>,
}

/// Send one multipart (plain text + HTML) email. Blocking; call through
/// `spawn_blocking` from async code.
#[instrument(skip_all, level = "debug")]
pub fn send(
    smtp: &SmtpConfig,
    from: &str,
    to: &str,
    subject: &str,
    text_body: String,
    html_body: String,
) -> Result<()> {
    let message = Message::builder()
        .from(
            from.parse()
                .with_context(|| format!("invalid From address {from:?}"))?,
        )
        .to(to
            .parse()
            .with_context(|| format!("invalid recipient address {to:?}"))?)
        .subject(subject)
        .multipart(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(text_body))
                .singlepart(SinglePart::html(html_body)),
        )
        .context("could not build notification email")?;

    let mut builder = SmtpTransport::builder_dangerous(&smtp.host).port(smtp.port);
    if let (Some(login), Some(password)) = (&smtp.login, &smtp.password) {
        builder = builder.credentials(Credentials::new(login.clone(), password.clone()));
    }
    let mailer = builder.build();

    mailer
        .send(&message)
        .map_err(|e| PackageError::SmtpError(e.to_string()))?;
    // `mailer` is dropped here, closing the connection and issuing QUIT.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_addresses() {
        let smtp = SmtpConfig {
            host: "localhost".to_owned(),
            port: 2525,
            login: None,
            password: None,
        };
        let err = send(
            &smtp,
            "not an address",
            "also not one",
            "subject",
            "body".to_owned(),
            "<p>body</p>".to_owned(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }
}
