//! Email verification of new registrations.
//!
//! A registration is held as a [`Ticket`] under a random token until the registrant opens the
//! emailed confirmation link, or until it expires.

use std::{net::IpAddr, sync::Arc, time::Duration};

use anyhow::Context;
use iroh_metrics::{inc, inc_by};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{Error, InvalidInput, Result},
    mail::{Email, MailTemplate, Mailer},
    metrics::Metrics,
    node::{Node, NodeAddr},
    store::{ConfirmOutcome, Store, Ticket},
};

/// Attempts at drawing an unused token before giving up.
const MAX_TOKEN_ATTEMPTS: usize = 8;

/// A positive 63-bit confirmation token.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[serde(transparent)]
pub struct Token(u64);

impl Token {
    fn generate() -> Self {
        Self(rand::thread_rng().gen_range(1..=i64::MAX as u64))
    }
}

/// The party asking to act on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub addr: IpAddr,
    pub is_admin: bool,
}

impl Requester {
    /// Whether the requester may act on behalf of the node at `addr`.
    pub fn may_act_for(&self, addr: &NodeAddr) -> bool {
        self.is_admin || NodeAddr::from(self.addr) == *addr
    }
}

/// Settings of the [`VerificationQueue`].
#[derive(Debug, Clone)]
pub struct VerificationOptions {
    /// Name of the map, used in emails.
    pub map_name: String,
    /// Sender address of verification emails.
    pub from: String,
    /// Public base URL of the map, used to build confirmation links.
    pub public_url: Url,
    /// Lifetime of new tickets.
    pub expiry: Duration,
    /// Require the confirming party to connect from the node's address.
    pub require_matching_address: bool,
}

/// Result of queueing a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub token: Token,
    /// Whether the confirmation email went out. If not, it will be resent.
    pub delivered: bool,
}

/// Result of a resend pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResendReport {
    pub attempted: usize,
    pub delivered: usize,
}

/// Queue of registrations awaiting email confirmation.
#[derive(Debug, Clone)]
pub struct VerificationQueue {
    store: Store,
    mailer: Arc<dyn Mailer>,
    options: Arc<VerificationOptions>,
}

impl VerificationQueue {
    pub fn new(store: Store, mailer: Arc<dyn Mailer>, options: VerificationOptions) -> Self {
        Self {
            store,
            mailer,
            options: Arc::new(options),
        }
    }

    /// Lifetime of tickets created by [`Self::enqueue_default`].
    pub fn default_expiry(&self) -> Duration {
        self.options.expiry
    }

    /// Queue `node` with the configured expiry.
    pub async fn enqueue_default(&self, node: Node) -> Result<Enqueued> {
        self.enqueue(node, self.options.expiry).await
    }

    /// Queue `node` for verification and send the confirmation email.
    ///
    /// The ticket is recorded before the email is sent, so a failed delivery leaves it
    /// pending for [`Self::resend_pending`].
    pub async fn enqueue(&self, node: Node, expiry: Duration) -> Result<Enqueued> {
        node.validate_registrant()?;
        let addr = node.addr;
        let ticket = Ticket {
            node,
            delivered: false,
            expires: Node::now_unix()
                .saturating_add(i64::try_from(expiry.as_secs()).unwrap_or(i64::MAX)),
        };
        let token = self.reserve_token(&ticket)?;
        inc!(Metrics, tickets_queued);

        let delivered = self.deliver(token, &ticket.node, expiry).await;
        if delivered {
            match self.store.mark_delivered(token.into()) {
                Ok(true) => {}
                Ok(false) => debug!(%token, "ticket consumed before delivery was recorded"),
                Err(err) => warn!(%token, %addr, ?err, "failed to record email delivery"),
            }
        }
        Ok(Enqueued { token, delivered })
    }

    fn reserve_token(&self, ticket: &Ticket) -> Result<Token> {
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = Token::generate();
            let queued = self
                .store
                .queue_ticket(token.into(), ticket)
                .with_context(|| format!("failed to queue node {}", ticket.node.addr))?;
            if queued {
                return Ok(token);
            }
            debug!(%token, "token collision, drawing a new one");
        }
        Err(anyhow::anyhow!("no unused verification token after {MAX_TOKEN_ATTEMPTS} attempts").into())
    }

    async fn deliver(&self, token: Token, node: &Node, expires_in: Duration) -> bool {
        let email = match self.verification_email(token, node, expires_in) {
            Ok(email) => email,
            Err(err) => {
                warn!(%token, addr = %node.addr, ?err, "failed to build verification email");
                return false;
            }
        };
        match self.mailer.send(&email).await {
            Ok(()) => {
                inc!(Metrics, emails_sent);
                true
            }
            Err(err) => {
                inc!(Metrics, emails_failed);
                warn!(%token, addr = %node.addr, to = %email.to, ?err, "failed to send verification email");
                false
            }
        }
    }

    fn verification_email(
        &self,
        token: Token,
        node: &Node,
        expires_in: Duration,
    ) -> anyhow::Result<Email> {
        let mut link = self.options.public_url.join("api/verify")?;
        link.query_pairs_mut().append_pair("id", &token.to_string());
        Ok(Email {
            to: node.owner_email.clone(),
            from: self.options.from.clone(),
            template: MailTemplate::Verification {
                map_name: self.options.map_name.clone(),
                owner_name: node.owner_name.clone(),
                address: node.addr.to_ip(),
                link: link.to_string(),
                expires_in,
            },
        })
    }

    /// Confirm a pending registration, adding its node as a local node.
    ///
    /// Unknown, consumed and expired tokens fail with [`Error::UnknownToken`]. A requester that
    /// may not confirm the node gets [`Error::IdentityMismatch`] and the ticket stays pending.
    /// If the address was registered locally in the meantime, the ticket is dropped and the
    /// call fails with [`InvalidInput::AddressTaken`].
    pub fn confirm(&self, token: Token, requester: &Requester) -> Result<Node> {
        let require_match = self.options.require_matching_address;
        let outcome = self
            .store
            .confirm_ticket(token.into(), Node::now_unix(), |node| {
                !require_match || requester.may_act_for(&node.addr)
            })
            .with_context(|| format!("failed to confirm ticket {token}"))?;
        match outcome {
            ConfirmOutcome::Confirmed(node) => {
                inc!(Metrics, tickets_confirmed);
                info!(addr = %node.addr, "node verified");
                Ok(node)
            }
            ConfirmOutcome::Unknown => Err(Error::UnknownToken),
            ConfirmOutcome::Rejected => Err(Error::IdentityMismatch),
            ConfirmOutcome::Taken => Err(InvalidInput::AddressTaken.into()),
        }
    }

    /// Discard every ticket expired at the unix timestamp `now`.
    pub fn sweep_expired(&self, now: i64) -> Result<usize> {
        let removed = self
            .store
            .sweep_tickets(now)
            .context("failed to sweep expired tickets")?;
        if removed > 0 {
            inc_by!(Metrics, tickets_expired, removed as u64);
            debug!("discarded {removed} expired registrations");
        }
        Ok(removed)
    }

    /// Retry the confirmation email of every live ticket that was not delivered yet.
    ///
    /// Expiry deadlines are left as they are.
    pub async fn resend_pending(&self, now: i64) -> Result<ResendReport> {
        let pending = self
            .store
            .undelivered_tickets(now)
            .context("failed to list undelivered tickets")?;
        let mut report = ResendReport::default();
        for (token, ticket) in pending {
            let token = Token::from(token);
            let remaining = Duration::from_secs(ticket.expires.saturating_sub(now).max(0) as u64);
            report.attempted += 1;
            if !self.deliver(token, &ticket.node, remaining).await {
                continue;
            }
            report.delivered += 1;
            if let Err(err) = self.store.mark_delivered(token.into()) {
                warn!(%token, ?err, "failed to record email delivery");
            }
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                "resent verification emails"
            );
        }
        Ok(report)
    }
}

/// Spawn a task that expires stale tickets and resends undelivered emails every `interval`,
/// until `cancel` fires.
pub fn spawn_maintenance_loop(
    queue: VerificationQueue,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Node::now_unix();
            if let Err(err) = queue.sweep_expired(now) {
                warn!("ticket maintenance failed: {:#}", anyhow::Error::from(err));
            }
            if let Err(err) = queue.resend_pending(now).await {
                warn!("resending verification emails failed: {:#}", anyhow::Error::from(err));
            }
        }
    })
}
