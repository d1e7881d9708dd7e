//! Transaction client -- send a request and wait for its correlated ACK/NAK.
//!
//! Each attempt transmits once and waits up to an absolute deadline. A NAK
//! backs off briefly and retransmits; a timeout retransmits at once. The
//! staging area is scanned in full on every wake and then emptied, which is
//! only sound because a session never has more than one transaction in
//! flight: `send_and_wait` takes `&mut self` and the client is owned by
//! exactly one task at a time.

use std::sync::Arc;
use std::time::Duration;

use canbus_protocol::{ExtHeader, Packet, PacketType, TIMING};
use canbus_transport::{Session, TransportError};
use tokio::time::Instant;

use crate::staging::AckStaging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionPolicy {
    /// Absolute wait per attempt.
    pub deadline: Duration,
    pub nak_backoff: Duration,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self {
            deadline: TIMING.ack_deadline(),
            nak_backoff: TIMING.nak_backoff(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked(Packet),
    Naked(Packet),
    TimedOut,
}

impl Outcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, Outcome::Acked(_))
    }

    pub fn into_result(self) -> Result<Packet, TransactionError> {
        match self {
            Outcome::Acked(pkt) => Ok(pkt),
            Outcome::Naked(pkt) => Err(TransactionError::Refused(pkt.ext)),
            Outcome::TimedOut => Err(TransactionError::TimedOut),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("request refused: {0}")]
    Refused(ExtHeader),
    #[error("no reply before deadline")]
    TimedOut,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

type RetryHook = Box<dyn Fn() + Send + Sync>;

pub struct TransactionClient {
    session: Arc<Session>,
    staging: Arc<AckStaging>,
    policy: TransactionPolicy,
    on_timeout: Option<RetryHook>,
}

impl TransactionClient {
    pub fn new(session: Arc<Session>, staging: Arc<AckStaging>, policy: TransactionPolicy) -> Self {
        Self {
            session,
            staging,
            policy,
            on_timeout: None,
        }
    }

    /// Called after each timed-out attempt of a retried request.
    pub fn on_timeout(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_timeout = Some(Box::new(hook));
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn policy(&self) -> TransactionPolicy {
        self.policy
    }

    /// Send `request` and wait for the reply, making up to `max_retries`
    /// attempts. With `max_retries == 0` the request is sent once and the
    /// outcome is best effort: a single wait, no retry, nothing reported.
    pub async fn send_and_wait(&mut self, request: Packet, max_retries: u32) -> Outcome {
        let attempts = max_retries.max(1);
        let _outstanding = self.staging.begin();
        self.staging.take_all();

        let mut outcome = Outcome::TimedOut;
        for attempt in 1..=attempts {
            if let Err(e) = self.session.send(request) {
                tracing::debug!(ext = %request.ext, attempt, "request not queued: {e}");
            }
            let deadline = Instant::now() + self.policy.deadline;
            outcome = match self.wait_for(&request.ext, deadline).await {
                Some(reply) if reply.ext.kind == PacketType::Ack => Outcome::Acked(reply),
                Some(reply) => {
                    tokio::time::sleep(self.policy.nak_backoff).await;
                    Outcome::Naked(reply)
                }
                None => {
                    if max_retries > 0 {
                        if let Some(hook) = &self.on_timeout {
                            hook();
                        }
                    }
                    Outcome::TimedOut
                }
            };
            if outcome.is_ack() {
                return outcome;
            }
            tracing::trace!(ext = %request.ext, attempt, ?outcome, "attempt failed");
        }

        if max_retries > 0 {
            tracing::warn!(ext = %request.ext, attempts, "send aborted after {attempts} tries");
        }
        outcome
    }

    /// Scan staged replies for one correlating with `key` until `deadline`.
    /// The last match in a batch wins; everything else in it is discarded.
    async fn wait_for(&self, key: &ExtHeader, deadline: Instant) -> Option<Packet> {
        loop {
            let found = self
                .staging
                .take_all()
                .into_iter()
                .filter(|pkt| pkt.ext.correlates(key))
                .last();
            if found.is_some() {
                return found;
            }
            if tokio::time::timeout_at(deadline, self.staging.arrived())
                .await
                .is_err()
            {
                return None;
            }
        }
    }
}
