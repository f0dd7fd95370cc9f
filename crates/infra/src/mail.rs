//! Email lane: payload, mail transports and the lane consumer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::jobs::{HandlerError, Job, JobHandler};

/// Payload of a job on the email lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("mail API rejected message with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid mailer configuration: {0}")]
    Config(String),
}

/// Outbound mail transport.
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &EmailJob) -> Result<(), MailError>;
}

/// Transactional mail API client: `POST {api_url}` with a bearer token and a
/// `{from, to, subject, html}` JSON body.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

impl HttpMailer {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, MailError> {
        let api_url = api_url.into();
        if api_url.is_empty() {
            return Err(MailError::Config("mail API URL is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            api_url,
            api_key: api_key.into(),
            from: from.into(),
        })
    }
}

#[async_trait::async_trait]
impl Mailer for HttpMailer {
    #[instrument(skip(self, email), fields(to = %email.to), err)]
    async fn send(&self, email: &EmailJob) -> Result<(), MailError> {
        let body = OutboundMessage {
            from: &self.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html,
        };
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(status = status.as_u16(), "email accepted");
        Ok(())
    }
}

/// Mailer that only logs; used when no mail API is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMailer;

#[async_trait::async_trait]
impl Mailer for TracingMailer {
    async fn send(&self, email: &EmailJob) -> Result<(), MailError> {
        info!(to = %email.to, subject = %email.subject, "email delivery skipped, no mail API configured");
        Ok(())
    }
}

/// Email lane consumer.
pub struct EmailSender {
    mailer: Arc<dyn Mailer>,
    timeout: Duration,
}

impl EmailSender {
    pub fn new(mailer: Arc<dyn Mailer>, timeout: Duration) -> Self {
        Self { mailer, timeout }
    }
}

#[async_trait::async_trait]
impl JobHandler for EmailSender {
    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempt))]
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let email: EmailJob = serde_json::from_value(job.payload.clone())?;
        match tokio::time::timeout(self.timeout, self.mailer.send(&email)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(to = %email.to, error = %e, "email delivery failed");
                Err(HandlerError::failed(e.to_string()))
            }
            Err(_) => Err(HandlerError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::jobs::QueueName;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<EmailJob>>,
    }

    #[async_trait::async_trait]
    impl Mailer for Recording {
        async fn send(&self, email: &EmailJob) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    struct Hanging;

    #[async_trait::async_trait]
    impl Mailer for Hanging {
        async fn send(&self, _email: &EmailJob) -> Result<(), MailError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn email_job() -> Job {
        Job::new(
            QueueName::Email,
            serde_json::json!({ "to": "a@b.test", "subject": "Hi", "html": "<p>Hi</p>" }),
        )
    }

    #[tokio::test]
    async fn sender_delivers_payload() {
        let mailer = Arc::new(Recording::default());
        let sender = EmailSender::new(mailer.clone(), Duration::from_secs(1));

        sender.handle(&email_job()).await.unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@b.test");
    }

    #[tokio::test]
    async fn slow_mailer_times_out() {
        let sender = EmailSender::new(Arc::new(Hanging), Duration::from_millis(20));
        let err = sender.handle(&email_job()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Timeout(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let sender = EmailSender::new(Arc::new(TracingMailer), Duration::from_secs(1));
        let job = Job::new(QueueName::Email, serde_json::json!({ "to": 1 }));
        let err = sender.handle(&job).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }

    #[test]
    fn http_mailer_requires_url() {
        let err = HttpMailer::new("", "key", "noreply@x.test", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, MailError::Config(_)));
    }
}
