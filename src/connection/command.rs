//! Command channel: one UDP socket for discovery, handshakes, echo and text commands.
//!
//! Requests are strictly one at a time. A single receive task decodes every datagram on the
//! socket and hands replies to the one pending exchange, discovery replies to the active
//! collector, and frame data to the dispatcher (unicast servers may stream through this socket).

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, trace, warn};

use super::state::Session;
use crate::pipeline::Dispatcher;
use crate::protocol::server_info::ServerInfo;
use crate::protocol::{self, Message, MessageId};
use crate::types::Version;
use crate::{NatNetError, Result, lock};

const MAX_ERRORS: u32 = 10;
const RECEIVE_BUFFER: usize = 65_536;

/// Reply an exchange is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    ServerInfo,
    ModelDef,
    /// A text command reply; an unrecognized-request reply also completes the exchange.
    Response,
    /// An echo reply carrying this request stamp. Replies to older echoes are ignored.
    Echo(u64),
}

impl Expect {
    fn matches(self, message: &Message) -> bool {
        match (self, message) {
            (Expect::ServerInfo, Message::ServerInfo(_)) => true,
            (Expect::ModelDef, Message::ModelDef(_)) => true,
            (Expect::Response, Message::Response(_) | Message::UnrecognizedRequest(_)) => true,
            (Expect::Echo(stamp), Message::EchoResponse(reply)) => reply.request_stamp == stamp,
            _ => false,
        }
    }
}

struct Pending {
    expect: Expect,
    reply: oneshot::Sender<Message>,
}

pub(crate) type Discovered = (SocketAddr, ServerInfo);

#[derive(Default)]
struct Slots {
    pending: Option<Pending>,
    discovery: Option<mpsc::UnboundedSender<Discovered>>,
}

pub(crate) struct CommandChannel {
    socket: Arc<UdpSocket>,
    slots: Arc<Mutex<Slots>>,
    exchanges: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl CommandChannel {
    /// Binds an ephemeral port on `client_address` and starts the receive task.
    ///
    /// `lost` is cancelled when the socket keeps failing; `cancel` stops the task.
    pub(crate) async fn open(
        client_address: IpAddr,
        sessions: watch::Receiver<Option<Arc<Session>>>,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
        lost: CancellationToken,
        span: Span,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(client_address, 0))
            .await
            .map_err(|e| NatNetError::io_error(format!("binding command socket on {client_address}"), e))?;
        socket
            .set_broadcast(true)
            .map_err(|e| NatNetError::io_error("enabling broadcast on command socket", e))?;
        let socket = Arc::new(socket);
        let slots = Arc::new(Mutex::new(Slots::default()));

        info!(local = ?socket.local_addr().ok(), "Command socket opened");
        tokio::spawn(
            receive_loop(
                Arc::clone(&socket),
                Arc::clone(&slots),
                sessions,
                dispatcher,
                cancel.clone(),
                lost,
            )
            .instrument(span),
        );

        Ok(Self { socket, slots, exchanges: tokio::sync::Mutex::new(()), cancel })
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(|e| NatNetError::io_error("reading command socket address", e))
    }

    /// Fire-and-forget send.
    pub(crate) async fn send(&self, target: SocketAddr, message: &Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(NatNetError::Closed);
        }
        let bytes = protocol::encode(message, Version::LATEST)?;
        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| NatNetError::io_error(format!("sending {:?} to {target}", message.id()), e))?;
        trace!(id = ?message.id(), %target, "Sent command");
        Ok(())
    }

    /// Holds off other exchanges, e.g. for the length of a discovery window.
    pub(crate) async fn exclusive(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NatNetError::Closed),
            guard = self.exchanges.lock() => Ok(guard),
        }
    }

    /// Sends `request` and waits for the expected reply, resending up to `attempts` times.
    ///
    /// An exhausted budget yields [`NatNetError::Unreachable`] for connect requests and
    /// [`NatNetError::Timeout`] for everything else; closing the channel yields
    /// [`NatNetError::Closed`].
    pub(crate) async fn exchange(
        &self,
        target: SocketAddr,
        request: &Message,
        expect: Expect,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Message> {
        let _guard = self.exclusive().await?;
        let attempts = attempts.max(1);
        let result = self.exchange_locked(target, request, expect, timeout, attempts).await;
        lock(&self.slots).pending = None;
        result
    }

    async fn exchange_locked(
        &self,
        target: SocketAddr,
        request: &Message,
        expect: Expect,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Message> {
        let id = request.id();
        for attempt in 1..=attempts {
            let (reply, receiver) = oneshot::channel();
            lock(&self.slots).pending = Some(Pending { expect, reply });
            self.send(target, request).await?;

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(NatNetError::Closed),
                outcome = tokio::time::timeout(timeout, receiver) => outcome,
            };
            match outcome {
                Ok(Ok(message)) => return Ok(message),
                Ok(Err(_)) => return Err(NatNetError::Closed),
                Err(_) => debug!(?id, %target, attempt, attempts, "No reply within {:?}", timeout),
            }
        }
        Err(match id {
            MessageId::Connect => NatNetError::unreachable(target, attempts),
            _ => NatNetError::timeout(format!("{id:?} exchange with {target}"), timeout * attempts),
        })
    }

    /// Routes every server info reply to the returned receiver until [`Self::end_discovery`].
    pub(crate) fn begin_discovery(&self) -> mpsc::UnboundedReceiver<Discovered> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.slots).discovery = Some(sender);
        receiver
    }

    pub(crate) fn end_discovery(&self) {
        lock(&self.slots).discovery = None;
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    slots: Arc<Mutex<Slots>>,
    sessions: watch::Receiver<Option<Arc<Session>>>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    lost: CancellationToken,
) {
    debug!("Command receive task started");
    let mut buffer = vec![0u8; RECEIVE_BUFFER];
    let mut error_count = 0u32;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Command receive task cancelled");
                break;
            }
            received = socket.recv_from(&mut buffer) => received,
        };

        let (len, from) = match received {
            Ok(received) => {
                error_count = 0;
                received
            }
            Err(e) => {
                error_count += 1;
                warn!("Command socket error ({}/{}): {}", error_count, MAX_ERRORS, e);
                if error_count >= MAX_ERRORS {
                    error!("Too many command socket errors, closing connection");
                    lost.cancel();
                    break;
                }
                let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let datagram = &buffer[..len];
        if datagram.get(..2) == Some(&(MessageId::FrameOfData as u16).to_le_bytes()[..]) {
            dispatcher.dispatch(datagram);
            continue;
        }

        let version = sessions.borrow().as_ref().map_or(Version::LATEST, |session| session.version);
        match protocol::decode_datagram(datagram, version) {
            Ok(message) => route(&slots, from, message),
            Err(e) => debug!(%from, error = %e, "Dropping malformed command datagram"),
        }
    }

    // dropping the senders fails whatever is still waiting
    let mut slots = lock(&slots);
    slots.pending = None;
    slots.discovery = None;
    debug!("Command receive task ended");
}

fn route(slots: &Mutex<Slots>, from: SocketAddr, message: Message) {
    let mut slots = lock(slots);
    if let (Message::ServerInfo(info), Some(discovery)) = (&message, &slots.discovery) {
        let _ = discovery.send((from, info.clone()));
    }

    if slots.pending.as_ref().is_some_and(|pending| pending.expect.matches(&message)) {
        if let Some(pending) = slots.pending.take() {
            let _ = pending.reply.send(message);
        }
        return;
    }

    match message {
        Message::MessageString(text) => info!(%from, "Server message: {}", text),
        Message::EchoResponse(reply) => {
            debug!(%from, stamp = reply.request_stamp, "Ignoring echo reply to an earlier request")
        }
        Message::Disconnect | Message::DisconnectByTimeout => {
            warn!(%from, id = ?message.id(), "Server ended the session")
        }
        Message::ServerInfo(_) => trace!(%from, "Server info outside of an exchange"),
        other => debug!(%from, id = ?other.id(), "Unexpected command reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::server_info::EchoResponse;

    #[test]
    fn echo_replies_must_match_their_stamp() {
        let reply = Message::EchoResponse(EchoResponse { request_stamp: 10, received_stamp: 5 });
        assert!(Expect::Echo(10).matches(&reply));
        assert!(!Expect::Echo(11).matches(&reply));
        assert!(!Expect::Response.matches(&reply));
    }

    #[test]
    fn unrecognized_request_completes_command_exchanges() {
        assert!(Expect::Response.matches(&Message::UnrecognizedRequest(Vec::new())));
        assert!(!Expect::ModelDef.matches(&Message::UnrecognizedRequest(Vec::new())));
    }

    #[test]
    fn routing_prefers_the_pending_exchange() {
        let slots = Mutex::new(Slots::default());
        let (reply, mut receiver) = oneshot::channel();
        lock(&slots).pending = Some(Pending { expect: Expect::ServerInfo, reply });
        let (sender, mut discovered) = mpsc::unbounded_channel();
        lock(&slots).discovery = Some(sender);

        let from = SocketAddr::from(([127, 0, 0, 1], 1510));
        route(&slots, from, Message::KeepAlive);
        assert!(receiver.try_recv().is_err());

        route(&slots, from, Message::ServerInfo(ServerInfo::default()));
        assert!(matches!(receiver.try_recv(), Ok(Message::ServerInfo(_))));
        assert_eq!(discovered.try_recv().map(|(addr, _)| addr).ok(), Some(from));
        assert!(lock(&slots).pending.is_none());
    }
}
