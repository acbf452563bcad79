use super::{split_header, MailError, Mailer, OutgoingEmail};
use crate::config::{SmtpSettings, SmtpTls};
use crate::deliverability::HeaderEnhancer;
use lettre::message::header::{HeaderName, HeaderValue};
use lettre::message::{Mailbox, MessageBuilder, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::time::Duration;
use tracing::debug;

/// Headers lettre sets from the builder itself.
const STRUCTURED_HEADERS: &[&str] = &[
    "from",
    "reply-to",
    "to",
    "subject",
    "content-type",
    "content-transfer-encoding",
    "mime-version",
    "message-id",
    "date",
];

/// SMTP-based mailer using lettre.
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Mailbox,
    enhancer: HeaderEnhancer,
    message_id_domain: String,
}

impl SmtpMailer {
    pub fn new(
        settings: &SmtpSettings,
        enhancer: HeaderEnhancer,
        site_domain: &str,
    ) -> Result<Self, MailError> {
        let from = format!("{} <{}>", enhancer.sender_name(), enhancer.sender_email())
            .parse::<Mailbox>()
            .map_err(|_| MailError::InvalidAddress(enhancer.sender_email().to_string()))?;

        let mut builder = match settings.tls {
            SmtpTls::None => SmtpTransport::builder_dangerous(&settings.host),
            SmtpTls::Tls => {
                SmtpTransport::relay(&settings.host).map_err(|e| MailError::Smtp(e.to_string()))?
            }
            SmtpTls::StartTls => SmtpTransport::starttls_relay(&settings.host)
                .map_err(|e| MailError::Smtp(e.to_string()))?,
        };

        builder = builder
            .port(settings.port)
            .timeout(Some(Duration::from_secs(settings.timeout_secs)));

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            enhancer,
            message_id_domain: site_domain.to_string(),
        })
    }

    fn build_message(&self, email: &OutgoingEmail) -> Result<Message, MailError> {
        let headers = self.enhancer.enhance(&email.headers, &email.to);
        build_message(&self.from, &self.message_id_domain, email, &headers)
    }
}

pub(super) fn build_message(
    default_from: &Mailbox,
    message_id_domain: &str,
    email: &OutgoingEmail,
    headers: &[String],
) -> Result<Message, MailError> {
    let to: Mailbox = email
        .to
        .trim()
        .parse()
        .map_err(|_| MailError::InvalidAddress(email.to.clone()))?;

    let mut from = default_from.clone();
    let mut reply_to: Option<Mailbox> = None;
    let mut raw: Vec<(&str, &str)> = Vec::new();

    for line in headers {
        let Some((name, value)) = split_header(line) else {
            continue;
        };
        match name.to_ascii_lowercase().as_str() {
            "from" => {
                from = value
                    .parse()
                    .map_err(|_| MailError::InvalidAddress(value.to_string()))?;
            }
            "reply-to" => {
                reply_to = Some(
                    value
                        .parse()
                        .map_err(|_| MailError::InvalidAddress(value.to_string()))?,
                );
            }
            lower if STRUCTURED_HEADERS.contains(&lower) => {}
            _ => raw.push((name, value)),
        }
    }

    let mut builder: MessageBuilder = Message::builder()
        .from(from)
        .to(to)
        .subject(email.subject.clone())
        .message_id(Some(format!(
            "<{}@{}>",
            uuid::Uuid::new_v4(),
            message_id_domain
        )));
    if let Some(reply_to) = reply_to {
        builder = builder.reply_to(reply_to);
    }
    for (name, value) in raw {
        let header_name = HeaderName::new_from_ascii(name.to_string())
            .map_err(|e| MailError::Build(format!("bad header name {}: {}", name, e)))?;
        builder = builder.raw_header(HeaderValue::new(header_name, value.to_string()));
    }

    builder
        .singlepart(SinglePart::html(email.html_body.clone()))
        .map_err(|e| MailError::Build(e.to_string()))
}

impl Mailer for SmtpMailer {
    fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        let message = self.build_message(email)?;
        self.transport
            .send(&message)
            .map_err(|e| MailError::Smtp(e.to_string()))?;
        debug!("Sent '{}' to {}", email.subject, email.to);
        Ok(())
    }
}
