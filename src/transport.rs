use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::error_chain_fmt;
use crate::selector::SelectedSender;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// One fully assembled message. The engine treats sending it as an atomic
/// external call.
pub struct OutgoingEmail<'a> {
    pub sender: &'a SelectedSender,
    pub recipient: &'a str,
    pub subject: &'a str,
    pub text_body: &'a str,
    pub html_body: &'a str,
    pub cc: &'a [String],
    pub bcc: &'a [String],
    pub attachment: Option<&'a Attachment>,
}

#[derive(thiserror::Error)]
pub enum TransportError {
    #[error("mail api request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The relay refused the message; the reason is kept verbatim for
    /// operator diagnosis.
    #[error("{0}")]
    Rejected(String),
}

impl std::fmt::Debug for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: OutgoingEmail<'_>) -> Result<(), TransportError>;
}

/// Mail relay client. The relay authenticates us with a bearer token and
/// submits each message through the mailbox named in `from`.
#[derive(Clone)]
pub struct HttpMailClient {
    http_client: Client,
    base_url: Url,
    auth_token: SecretString,
}

#[derive(Serialize)]
struct EmailUnit<'a> {
    email: &'a str,
}

impl<'a> EmailUnit<'a> {
    fn new(email: &'a str) -> Self {
        Self { email }
    }
}

#[derive(Serialize)]
struct MailboxCredential<'a> {
    email: &'a str,
    credential: &'a str,
}

#[derive(Serialize)]
struct AttachmentPayload<'a> {
    name: &'a str,
    content: String,
}

// Field order mirrors the part order mail clients expect: plain text first,
// HTML second, attachments last.
#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: MailboxCredential<'a>,
    to: Vec<EmailUnit<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc: Vec<EmailUnit<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc: Vec<EmailUnit<'a>>,
    subject: &'a str,
    text: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<AttachmentPayload<'a>>,
}

impl HttpMailClient {
    pub fn new(base_url: String, auth_token: SecretString, timeout: Duration) -> Self {
        Self {
            http_client: Client::builder().timeout(timeout).build().unwrap(),
            base_url: Url::parse(&base_url).expect("Failed parsing base email api url."),
            auth_token,
        }
    }
}

#[async_trait]
impl MailTransport for HttpMailClient {
    async fn send(&self, email: OutgoingEmail<'_>) -> Result<(), TransportError> {
        let url = self
            .base_url
            .join("v1/email")
            .expect("Failed joining route to email api url.");

        let body = SendEmailRequest {
            from: MailboxCredential {
                email: &email.sender.email,
                credential: email.sender.credential.expose_secret(),
            },
            to: vec![EmailUnit::new(email.recipient)],
            cc: email.cc.iter().map(|e| EmailUnit::new(e)).collect(),
            bcc: email.bcc.iter().map(|e| EmailUnit::new(e)).collect(),
            subject: email.subject,
            text: email.text_body,
            html: email.html_body,
            attachments: email
                .attachment
                .iter()
                .map(|a| AttachmentPayload {
                    name: &a.filename,
                    content: BASE64.encode(&a.content),
                })
                .collect(),
        };

        let response = self
            .http_client
            .post(url)
            .header(
                "Authorization",
                "Bearer ".to_owned() + self.auth_token.expose_secret(),
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let reason = if detail.is_empty() {
                status.to_string()
            } else {
                format!("{status}: {detail}")
            };
            return Err(TransportError::Rejected(reason));
        }

        Ok(())
    }
}
