//! Console session -- connect, steal, steady state, disconnect.
//!
//! Tasks while connected:
//!   reader   sole consumer of the session queue; stages ACK/NAK, outputs
//!            and ACKs DAT for our identity, reacts to force-disconnect
//!   input    reads local bytes, filters escapes, fills the input ring
//!   writer   drains the input ring into DAT requests; runs break/reset
//!   shutdown spawned on the first disconnect request
//!
//! The transaction client moves from the connect logic to the writer and
//! from the writer to the shutdown task, so only one of them ever sends
//! requests.

use std::sync::Arc;
use std::time::Duration;

use canbus_protocol::{objects, ExtHeader, NodeAddress, Packet, PacketType, Payload, ProtocolError, MAX_PAYLOAD, TIMING};
use canbus_transport::{Session, SharedRing, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc, watch};

use crate::escape::{EscapeCommand, EscapeFilter};
use crate::staging::AckStaging;
use crate::transaction::{Outcome, TransactionClient, TransactionPolicy};

#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    pub target: NodeAddress,
    /// Displace an existing owner instead of failing.
    pub steal: bool,
    pub escape: u8,
    pub max_retries: u32,
    pub steal_polls: u32,
    pub steal_poll_interval: Duration,
    /// Object id of the board H8's reset register, when known.
    pub reset_object: Option<u16>,
    pub input_queue_bytes: usize,
    pub policy: TransactionPolicy,
}

impl ConsoleOptions {
    pub fn new(target: NodeAddress) -> Self {
        Self {
            target,
            steal: false,
            escape: b'&',
            max_retries: TIMING.max_retries,
            steal_polls: TIMING.steal_polls,
            steal_poll_interval: TIMING.steal_poll_interval(),
            reset_object: None,
            input_queue_bytes: TIMING.input_queue_bytes,
            policy: TransactionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// What the console has for the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// Bytes from the remote console.
    Data(Vec<u8>),
    /// A status line.
    Notice(String),
    /// A request attempt timed out and is being retried.
    Progress,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("Console is already in use by {0}")]
    InUse(ExtHeader),
    #[error("no response from {target} after {attempts} tries")]
    NoResponse { target: NodeAddress, attempts: u32 },
    #[error("{target} refused the request: {ext}")]
    Refused { target: NodeAddress, ext: ExtHeader },
    #[error("malformed owner record: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

// ============================================================================
// Requests
// ============================================================================

/// Everything a sender needs besides the transaction client.
struct Link {
    options: ConsoleOptions,
    local: NodeAddress,
    identity: ExtHeader,
    events: mpsc::UnboundedSender<ConsoleEvent>,
}

impl Link {
    fn notice(&self, text: impl Into<String>) {
        let _ = self.events.send(ConsoleEvent::Notice(text.into()));
    }

    fn request(&self, kind: PacketType, at: NodeAddress, object: u16, payload: Option<Payload>) -> Packet {
        Packet::request(&self.local, ExtHeader::new(kind, at, object), payload)
    }

    async fn transact(&self, client: &mut TransactionClient, request: Packet) -> Result<Packet, ConsoleError> {
        let target = request.ext.address();
        match client.send_and_wait(request, self.options.max_retries).await {
            Outcome::Acked(reply) => Ok(reply),
            Outcome::Naked(reply) => Err(ConsoleError::Refused {
                target,
                ext: reply.ext,
            }),
            Outcome::TimedOut => {
                self.notice(format!("send aborted after {} tries", self.options.max_retries));
                Err(ConsoleError::NoResponse {
                    target,
                    attempts: self.options.max_retries,
                })
            }
        }
    }

    async fn read_owner(&self, client: &mut TransactionClient) -> Result<ExtHeader, ConsoleError> {
        let request = self.request(PacketType::Ro, self.options.target, objects::CONSOLE_CONNECT, None);
        let reply = self.transact(client, request).await?;
        Ok(reply.payload.as_ext()?)
    }

    async fn send_disconnect(&self, client: &mut TransactionClient, owner: &ExtHeader) -> Result<(), ConsoleError> {
        let request = self.request(
            PacketType::Wo,
            self.options.target,
            objects::CONSOLE_DISCONN,
            Some(Payload::from_ext(owner)),
        );
        self.transact(client, request).await.map(|_| ())
    }

    async fn connect(&self, client: &mut TransactionClient) -> Result<(), ConsoleError> {
        let owner = self.read_owner(client).await?;
        if !owner.is_unconnected() {
            if !self.options.steal {
                return Err(ConsoleError::InUse(owner));
            }
            self.steal(client, owner).await?;
        }

        let claim = self.request(
            PacketType::Wo,
            self.options.target,
            objects::CONSOLE_CONNECT,
            Some(Payload::from_ext(&self.identity)),
        );
        match self.transact(client, claim).await {
            Ok(_) => Ok(()),
            Err(ConsoleError::Refused { .. }) => {
                let owner = self.read_owner(client).await?;
                Err(ConsoleError::InUse(owner))
            }
            Err(e) => Err(e),
        }
    }

    async fn steal(&self, client: &mut TransactionClient, mut owner: ExtHeader) -> Result<(), ConsoleError> {
        tracing::info!(node = %self.options.target, owner = %owner, "stealing console");

        // Ask the previous owner to let go. A live client ACKs and runs its
        // own disconnect; otherwise release it on the owner's behalf.
        let notice = self.request(
            PacketType::Wo,
            owner.address(),
            objects::FORCE_DISCONN,
            Some(Payload::from_ext(&owner)),
        );
        if !client.send_and_wait(notice, 0).await.is_ack() {
            self.send_disconnect(client, &owner).await?;
        }

        let mut polls = 0;
        while !owner.is_unconnected() && polls < self.options.steal_polls {
            tokio::time::sleep(self.options.steal_poll_interval).await;
            owner = self.read_owner(client).await?;
            polls += 1;
        }
        if !owner.is_unconnected() {
            tracing::debug!(owner = %owner, polls, "owner still attached, forcing disconnect");
            if let Err(e) = self.send_disconnect(client, &owner).await {
                tracing::warn!("forced disconnect failed: {e}");
            }
        }
        Ok(())
    }

    async fn send_data(&self, client: &mut TransactionClient, chunk: &[u8]) {
        let ext = ExtHeader::new(PacketType::Dat, self.options.target, objects::CONSOLE_DATA);
        let request = Packet::with_data(ext, chunk).dest(self.local.next_hop(&self.options.target));
        if let Err(e) = self.transact(client, request).await {
            tracing::debug!(bytes = chunk.len(), "console input lost: {e}");
        }
    }

    async fn send_break(&self, client: &mut TransactionClient) {
        let request = self.request(PacketType::Wo, self.options.target, objects::BREAK, None);
        match self.transact(client, request).await {
            Ok(_) => self.notice("Sent break."),
            Err(_) => self.notice("CAN giving up sending break."),
        }
    }

    async fn send_reset(&self, client: &mut TransactionClient) {
        let Some(object) = self.options.reset_object else {
            self.notice("No RESET object known, cannot reset H8.");
            return;
        };
        let h8 = self.options.target.board_h8();
        let request = self.request(
            PacketType::Wo,
            h8,
            object,
            Some(Payload::from_u32(objects::RESET_PULSE)),
        );
        match self.transact(client, request).await {
            Ok(_) => self.notice("Sent reset to H8"),
            Err(_) => self.notice("CAN giving up sending reset to H8."),
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

struct Reader {
    session: Arc<Session>,
    staging: Arc<AckStaging>,
    identity: ExtHeader,
    events: mpsc::UnboundedSender<ConsoleEvent>,
    requests: mpsc::UnboundedSender<()>,
}

impl Reader {
    async fn run(self, mut stop: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                pkt = self.session.recv() => self.handle(pkt),
                _ = stop.recv() => return,
            }
        }
    }

    fn reply(&self, pkt: Packet) {
        if let Err(e) = self.session.send(pkt) {
            tracing::debug!(ext = %pkt.ext, "reply not queued: {e}");
        }
    }

    fn handle(&self, pkt: Packet) {
        match pkt.ext.kind {
            PacketType::Ack | PacketType::Nak => {
                self.staging.offer(pkt);
            }
            PacketType::Dat if pkt.ext.pack() == self.identity.pack() => {
                let _ = self.events.send(ConsoleEvent::Data(pkt.data().to_vec()));
                self.reply(pkt.ack(None));
            }
            PacketType::Wo
                if pkt.ext.object == objects::FORCE_DISCONN
                    && pkt.payload.as_u32() == self.identity.pack() =>
            {
                tracing::info!(src = pkt.std.src, "console taken over by another client");
                let _ = self.events.send(ConsoleEvent::Notice("Console has been stolen!".into()));
                self.reply(pkt.ack(Some(Payload::from_u32(1))));
                let _ = self.requests.send(());
            }
            _ => {}
        }
    }
}

struct Input<R> {
    source: R,
    filter: EscapeFilter,
    ring: Arc<SharedRing<u8>>,
    commands: mpsc::UnboundedSender<EscapeCommand>,
    events: mpsc::UnboundedSender<ConsoleEvent>,
    requests: mpsc::UnboundedSender<()>,
}

impl<R: AsyncRead + Unpin> Input<R> {
    fn queue(&self, data: &mut Vec<u8>) {
        let total = data.len();
        let queued = self.ring.push_all(data.drain(..));
        if queued < total {
            let _ = self
                .events
                .send(ConsoleEvent::Notice(format!("{} tty chars dropped", total - queued)));
        }
    }

    async fn run(mut self, mut stop: broadcast::Receiver<()>) {
        let mut buf = [0u8; 256];
        let mut data = Vec::with_capacity(buf.len());
        loop {
            let read = tokio::select! {
                read = self.source.read(&mut buf) => read,
                _ = stop.recv() => return,
            };
            let n = match read {
                Ok(0) => {
                    tracing::debug!("console input closed");
                    let _ = self.requests.send(());
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("console input failed: {e}");
                    let _ = self.requests.send(());
                    return;
                }
            };

            for &b in &buf[..n] {
                let Some(command) = self.filter.filter(b, &mut data) else {
                    continue;
                };
                self.queue(&mut data);
                match command {
                    EscapeCommand::Help => {
                        let _ = self.events.send(ConsoleEvent::Notice(self.filter.help()));
                    }
                    EscapeCommand::Disconnect => {
                        let _ = self.requests.send(());
                        return;
                    }
                    EscapeCommand::Break | EscapeCommand::Reset => {
                        let _ = self.commands.send(command);
                    }
                }
            }
            self.queue(&mut data);
        }
    }
}

async fn run_writer(
    link: Arc<Link>,
    mut client: TransactionClient,
    ring: Arc<SharedRing<u8>>,
    mut commands: mpsc::UnboundedReceiver<EscapeCommand>,
    mut stop: broadcast::Receiver<()>,
) -> TransactionClient {
    loop {
        tokio::select! {
            biased;
            _ = stop.recv() => break,
            first = ring.pop() => {
                let mut chunk = Vec::with_capacity(MAX_PAYLOAD);
                chunk.push(first);
                while chunk.len() < MAX_PAYLOAD {
                    match ring.try_pop() {
                        Some(b) => chunk.push(b),
                        None => break,
                    }
                }
                tokio::select! {
                    _ = link.send_data(&mut client, &chunk) => {}
                    _ = stop.recv() => break,
                }
            }
            Some(command) = commands.recv() => {
                let sent = async {
                    match command {
                        EscapeCommand::Break => link.send_break(&mut client).await,
                        EscapeCommand::Reset => link.send_reset(&mut client).await,
                        EscapeCommand::Disconnect | EscapeCommand::Help => {}
                    }
                };
                tokio::select! {
                    _ = sent => {}
                    _ = stop.recv() => break,
                }
            }
        }
    }
    client
}

// ============================================================================
// Console
// ============================================================================

/// Control handle for a running console.
#[derive(Clone)]
pub struct ConsoleHandle {
    requests: mpsc::UnboundedSender<()>,
    state: watch::Receiver<ConsoleState>,
}

impl ConsoleHandle {
    /// Ask the console to disconnect. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.requests.send(());
    }

    pub fn state(&self) -> ConsoleState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConsoleState> {
        self.state.clone()
    }
}

pub struct Console {
    link: Arc<Link>,
    session: Arc<Session>,
    staging: Arc<AckStaging>,
    state: Arc<watch::Sender<ConsoleState>>,
    requests: mpsc::UnboundedSender<()>,
    request_rx: mpsc::UnboundedReceiver<()>,
}

impl Console {
    /// Bind a console to `session`. The identity is the session's console
    /// object at the local address.
    pub fn open(
        session: Session,
        options: ConsoleOptions,
        events: mpsc::UnboundedSender<ConsoleEvent>,
    ) -> Result<Self, ConsoleError> {
        let local = session.local_address();
        let identity = ExtHeader::new(PacketType::Dat, local, session.console_object()?);
        let (state, _) = watch::channel(ConsoleState::Disconnected);
        let state = Arc::new(state);
        let (requests, request_rx) = mpsc::unbounded_channel();
        Ok(Self {
            link: Arc::new(Link {
                options,
                local,
                identity,
                events,
            }),
            session: Arc::new(session),
            staging: Arc::new(AckStaging::new(TIMING.staging_capacity)),
            state,
            requests,
            request_rx,
        })
    }

    pub fn identity(&self) -> ExtHeader {
        self.link.identity
    }

    pub fn handle(&self) -> ConsoleHandle {
        ConsoleHandle {
            requests: self.requests.clone(),
            state: self.state.subscribe(),
        }
    }

    fn set_state(&self, state: ConsoleState) {
        tracing::debug!(?state, "console state");
        self.state.send_replace(state);
    }

    /// Connect, then relay between `input` and the remote console until a
    /// disconnect is requested (escape command, end of input, a takeover by
    /// another client, or the handle). Returns once the disconnect handshake
    /// has finished or given up.
    pub async fn run<R>(mut self, input: R) -> Result<(), ConsoleError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let link = self.link.clone();
        let (reader_stop, _) = broadcast::channel(1);
        let reader = tokio::spawn(
            Reader {
                session: self.session.clone(),
                staging: self.staging.clone(),
                identity: link.identity,
                events: link.events.clone(),
                requests: self.requests.clone(),
            }
            .run(reader_stop.subscribe()),
        );

        let progress = link.events.clone();
        let mut client = TransactionClient::new(self.session.clone(), self.staging.clone(), link.options.policy)
            .on_timeout(move || {
                let _ = progress.send(ConsoleEvent::Progress);
            });

        self.set_state(ConsoleState::Connecting);
        if let Err(e) = link.connect(&mut client).await {
            let _ = reader_stop.send(());
            let _ = reader.await;
            self.set_state(ConsoleState::Disconnected);
            return Err(e);
        }
        tracing::info!(node = %link.options.target, identity = %link.identity, "console connected");
        self.set_state(ConsoleState::Connected);

        let ring = Arc::new(SharedRing::new(link.options.input_queue_bytes + 1));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (input_stop, _) = broadcast::channel(1);
        let (writer_stop, _) = broadcast::channel(1);

        let input = tokio::spawn(
            Input {
                source: input,
                filter: EscapeFilter::new(link.options.escape),
                ring: ring.clone(),
                commands,
                events: link.events.clone(),
                requests: self.requests.clone(),
            }
            .run(input_stop.subscribe()),
        );
        let writer = tokio::spawn(run_writer(
            link.clone(),
            client,
            ring,
            command_rx,
            writer_stop.subscribe(),
        ));

        // All senders live in this struct or its tasks, so `None` cannot
        // happen before one of them asks; treat it as a request anyway.
        let _ = self.request_rx.recv().await;

        let state = self.state.clone();
        let shutdown = tokio::spawn(async move {
            state.send_replace(ConsoleState::Disconnecting);
            let _ = input_stop.send(());
            let _ = writer_stop.send(());
            let _ = input.await;

            match writer.await {
                Ok(mut client) => {
                    if let Err(e) = link.send_disconnect(&mut client, &link.identity).await {
                        tracing::warn!(node = %link.options.target, "disconnect not acknowledged: {e}");
                    }
                }
                Err(e) => tracing::error!("console writer failed: {e}"),
            }

            let _ = reader_stop.send(());
            let _ = reader.await;
            state.send_replace(ConsoleState::Disconnected);
            tracing::info!(node = %link.options.target, "console disconnected");
        });
        if let Err(e) = shutdown.await {
            tracing::error!("console shutdown failed: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(source: &'static [u8], slots: usize) -> (
        Input<&'static [u8]>,
        mpsc::UnboundedReceiver<ConsoleEvent>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let (commands, _) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (requests, request_rx) = mpsc::unbounded_channel();
        let input = Input {
            source,
            filter: EscapeFilter::new(b'&'),
            ring: Arc::new(SharedRing::new(slots)),
            commands,
            events,
            requests,
        };
        (input, event_rx, request_rx)
    }

    #[test]
    fn test_full_input_queue_drops_excess() {
        let (input, mut events, _) = input(b"", 5);
        let mut data = b"abcdef".to_vec();
        input.queue(&mut data);

        assert!(data.is_empty());
        assert_eq!(input.ring.len(), 4);
        assert_eq!(
            events.try_recv().unwrap(),
            ConsoleEvent::Notice("2 tty chars dropped".into())
        );
        assert_eq!(input.ring.try_pop(), Some(b'a'));
    }

    #[tokio::test]
    async fn test_end_of_input_requests_disconnect() {
        let (input, mut events, mut requests) = input(b"hi\r&?", 64);
        let ring = input.ring.clone();
        let (_stop, stop_rx) = broadcast::channel(1);
        input.run(stop_rx).await;

        let queued: Vec<u8> = std::iter::from_fn(|| ring.try_pop()).collect();
        assert_eq!(queued, b"hi\r");
        assert!(matches!(events.try_recv().unwrap(), ConsoleEvent::Notice(_)));
        assert!(requests.try_recv().is_ok());
    }
}
