//! Outbound email.
//!
//! The directory only renders messages. Delivering them is left to a [`Mailer`]
//! implementation supplied when the server is spawned.

use std::{net::IpAddr, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// A rendered-on-demand email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub from: String,
    pub template: MailTemplate,
}

impl Email {
    pub fn subject(&self) -> String {
        self.template.subject()
    }

    pub fn body(&self) -> String {
        self.template.render()
    }
}

/// The messages the directory sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailTemplate {
    /// Asks the registrant of a node to confirm the registration.
    Verification {
        map_name: String,
        owner_name: String,
        address: IpAddr,
        link: String,
        expires_in: Duration,
    },
}

impl MailTemplate {
    /// Stable name of the template, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            MailTemplate::Verification { .. } => "verification",
        }
    }

    pub fn subject(&self) -> String {
        match self {
            MailTemplate::Verification { map_name, .. } => {
                format!("{map_name}: confirm your node registration")
            }
        }
    }

    pub fn render(&self) -> String {
        match self {
            MailTemplate::Verification {
                map_name,
                owner_name,
                address,
                link,
                expires_in,
            } => format!(
                "Hello {owner_name},\n\n\
                 somebody registered the node {address} on {map_name} with this email address.\n\
                 To add it to the map, open the following link from the node itself:\n\n\
                 {link}\n\n\
                 The link is valid for {}. If you did not register this node, ignore this email.\n",
                humantime::format_duration(*expires_in)
            ),
        }
    }
}

/// Delivers emails.
#[async_trait]
pub trait Mailer: std::fmt::Debug + Send + Sync + 'static {
    /// Send one email. An error means the email was not delivered.
    async fn send(&self, email: &Email) -> Result<()>;
}

/// A [`Mailer`] writing every email to the log instead of delivering it.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        info!(
            to = %email.to,
            from = %email.from,
            template = email.template.name(),
            "email: {}\n{}",
            email.subject(),
            email.body()
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use parking_lot::Mutex;

    use super::*;

    /// Records sent emails and can be switched into failing.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct TestMailer {
        pub(crate) sent: Arc<Mutex<Vec<Email>>>,
        failing: Arc<AtomicBool>,
    }

    impl TestMailer {
        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub(crate) fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl Mailer for TestMailer {
        async fn send(&self, email: &Email) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("mail transport unavailable");
            }
            self.sent.lock().push(email.clone());
            Ok(())
        }
    }

    #[test]
    fn verification_template() {
        let template = MailTemplate::Verification {
            map_name: "Testmap".to_string(),
            owner_name: "alice".to_string(),
            address: "10.0.0.1".parse().unwrap(),
            link: "http://map.example/api/verify?id=42".to_string(),
            expires_in: Duration::from_secs(3600),
        };
        assert_eq!(template.name(), "verification");
        assert_eq!(template.subject(), "Testmap: confirm your node registration");
        let body = template.render();
        assert!(body.contains("10.0.0.1"));
        assert!(body.contains("http://map.example/api/verify?id=42"));
        assert!(body.contains("1h"));
    }
}
