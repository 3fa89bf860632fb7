//! One peer session: a task that owns a binary WebSocket, performs the
//! hello exchange, answers and emits liveness probes, and pumps an ordered
//! queue of outbound messages with at most one write in flight. Everything
//! the session reads is handed to the conductor through a bounded channel,
//! so the socket is never read faster than the conductor can keep up.

use std::{
	collections::VecDeque,
	sync::Arc,
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
	io::{AsyncRead, AsyncWrite},
	net::{TcpListener, TcpSocket, TcpStream},
	sync::{mpsc, watch},
};
use tokio_tungstenite::{
	tungstenite::{protocol::WebSocketConfig, Message},
	WebSocketStream,
};
use tracing::{debug, info_span, trace, warn, Instrument};
use utilities::make_periodic_tick;

use crate::p2p::{
	protocol::{Hello, IcpMessage, Ping, Pong},
	NodeId, NodeInfo, SessionId,
};

/// How often to probe the peer for liveness while no ping is in flight.
const PING_INTERVAL: Duration = Duration::from_secs(3);

/// Maximum incoming message size: a peer sending a larger frame is
/// disconnected by the websocket layer. Sized for header burst batches.
const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Socket-level send buffer, sized to absorb block bursts without stalling
/// the send pump.
const SEND_BUFFER_SIZE: u32 = 1024 * 1024;

/// Why a session ended. Decides logging and the conductor's reconnect
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	/// Undecodable frame, unknown tag, or a protocol-order violation.
	BadPayload,
	/// The peer lives on a different chain than we do.
	ChainIdMismatch,
	/// The peer introduced itself with our own node id.
	SelfConnect,
	/// A newer session to the same peer superseded this one.
	DuplicatePeer,
	/// A pong echoed a code we never sent.
	PingMismatch,
	/// The transport failed or the peer went away.
	TransportError,
	/// We are shutting the session down deliberately.
	Shutdown,
}

impl CloseReason {
	/// Only transport failures warrant dialing the peer again; every other
	/// reason would just reproduce itself.
	pub fn should_reconnect(self) -> bool {
		matches!(self, CloseReason::TransportError)
	}
}

#[derive(Debug)]
pub enum SessionCommand {
	Send(IcpMessage),
	Close(CloseReason),
}

#[derive(Debug)]
pub enum SessionEvent {
	/// Hello received and locally validated. The conductor may still close
	/// this session as a duplicate of an existing one.
	PeerIdentified { session_id: SessionId, hello: Hello },
	/// An operational message, delivered after the hello exchange.
	Message { session_id: SessionId, message: IcpMessage },
	/// Terminal: the session task has stopped and dropped the transport.
	Closed { session_id: SessionId, reason: CloseReason },
}

/// The conductor's grip on a running session task.
#[derive(Debug)]
pub struct SessionHandle {
	pub session_id: SessionId,
	/// Set by the conductor once the peer's hello has been accepted.
	pub peer_id: Option<NodeId>,
	command_sender: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
	pub fn send(&self, message: IcpMessage) {
		// A session that is already gone will report Closed by itself.
		let _ = self.command_sender.send(SessionCommand::Send(message));
	}

	pub fn close(&self, reason: CloseReason) {
		let _ = self.command_sender.send(SessionCommand::Close(reason));
	}
}

/// Spawns the session task and returns the handle used to talk to it. The
/// task keeps itself alive for as long as the transport is up; its last act
/// is emitting [SessionEvent::Closed].
pub fn spawn<S>(
	session_id: SessionId,
	node: Arc<NodeInfo>,
	websocket: WebSocketStream<S>,
	event_sender: mpsc::Sender<SessionEvent>,
	local_head: watch::Receiver<u32>,
) -> SessionHandle
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (command_sender, command_receiver) = mpsc::unbounded_channel();
	let session = Session {
		session_id,
		node,
		websocket,
		command_receiver,
		event_sender,
		local_head,
		msg_queue: VecDeque::new(),
		pending_pong: None,
		pending_ping: None,
		ping_in_flight: None,
		recv_hello: false,
	};
	tokio::spawn(session.run().instrument(info_span!("session", id = session_id)));
	SessionHandle { session_id, peer_id: None, command_sender }
}

struct Session<S> {
	session_id: SessionId,
	node: Arc<NodeInfo>,
	websocket: WebSocketStream<S>,
	command_receiver: mpsc::UnboundedReceiver<SessionCommand>,
	event_sender: mpsc::Sender<SessionEvent>,
	local_head: watch::Receiver<u32>,
	msg_queue: VecDeque<IcpMessage>,
	pending_pong: Option<u64>,
	pending_ping: Option<Ping>,
	ping_in_flight: Option<u64>,
	recv_hello: bool,
}

impl<S> Session<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	async fn run(mut self) {
		// Both sides introduce themselves immediately after the transport
		// is up; nothing else may be sent or accepted before that.
		let hello = IcpMessage::Hello(Hello {
			node_id: self.node.node_id,
			chain_id: self.node.chain_id,
			contract: self.node.contract.clone(),
			peer_contract: self.node.peer_contract.clone(),
		});
		if self.websocket.send(Message::Binary(hello.encode())).await.is_err() {
			self.finish(CloseReason::TransportError).await;
			return
		}

		let mut ping_tick = make_periodic_tick(PING_INTERVAL, false);

		let reason = loop {
			// Drain prioritized outbound traffic before arming anything
			// else; awaiting the send is what keeps a single write in
			// flight.
			if let Some(message) = self.next_outbound() {
				if self.websocket.send(Message::Binary(message.encode())).await.is_err() {
					break CloseReason::TransportError
				}
				continue
			}

			tokio::select! {
				frame = self.websocket.next() => {
					match frame {
						Some(Ok(frame)) => {
							if let Err(reason) = self.process_frame(frame).await {
								break reason
							}
						},
						Some(Err(error)) => {
							debug!("websocket error: {error}");
							break CloseReason::TransportError
						},
						None => break CloseReason::TransportError,
					}
				}
				command = self.command_receiver.recv() => {
					match command {
						Some(SessionCommand::Send(message)) => self.msg_queue.push_back(message),
						Some(SessionCommand::Close(reason)) => break reason,
						None => break CloseReason::Shutdown,
					}
				}
				_ = ping_tick.tick(), if self.recv_hello && self.ping_in_flight.is_none() => {
					let ping = Ping {
						sent_ms: unix_time_ms(),
						code: rand::random(),
						head: *self.local_head.borrow(),
					};
					self.ping_in_flight = Some(ping.code);
					self.pending_ping = Some(ping);
				}
			}
		};

		self.finish(reason).await;
	}

	/// Send pump priority: an owed pong, then a due ping, then one queued
	/// application message (only once the session is operational).
	fn next_outbound(&mut self) -> Option<IcpMessage> {
		if let Some(code) = self.pending_pong.take() {
			return Some(IcpMessage::Pong(Pong { code }))
		}
		if let Some(ping) = self.pending_ping.take() {
			return Some(IcpMessage::Ping(ping))
		}
		if self.recv_hello {
			return self.msg_queue.pop_front()
		}
		None
	}

	async fn process_frame(&mut self, frame: Message) -> Result<(), CloseReason> {
		let bytes = match frame {
			Message::Binary(bytes) => bytes,
			// Transport-level control frames are handled by the websocket
			// layer itself.
			Message::Ping(_) | Message::Pong(_) => return Ok(()),
			Message::Close(_) => return Err(CloseReason::TransportError),
			_ => return Err(CloseReason::BadPayload),
		};

		let message = match IcpMessage::decode(&bytes) {
			Ok(message) => message,
			Err(error) => {
				warn!("could not decode peer message: {error}");
				return Err(CloseReason::BadPayload)
			},
		};

		if !self.recv_hello {
			return self.process_hello(message).await
		}

		match message {
			// Exactly one hello per session.
			IcpMessage::Hello(_) => Err(CloseReason::BadPayload),
			IcpMessage::Ping(ping) => {
				self.pending_pong = Some(ping.code);
				// The conductor still wants the head the ping carries.
				self.forward(IcpMessage::Ping(ping)).await
			},
			IcpMessage::Pong(pong) => match self.ping_in_flight.take() {
				Some(code) if code == pong.code => {
					trace!("pong received");
					Ok(())
				},
				_ => Err(CloseReason::PingMismatch),
			},
			message => self.forward(message).await,
		}
	}

	async fn process_hello(&mut self, message: IcpMessage) -> Result<(), CloseReason> {
		let IcpMessage::Hello(hello) = message else {
			warn!("peer spoke before introducing itself");
			return Err(CloseReason::BadPayload)
		};
		if hello.chain_id != self.node.chain_id {
			warn!("peer is on chain {}, we are on {}", hello.chain_id, self.node.chain_id);
			return Err(CloseReason::ChainIdMismatch)
		}
		if hello.node_id == self.node.node_id {
			return Err(CloseReason::SelfConnect)
		}
		self.recv_hello = true;
		self.event_sender
			.send(SessionEvent::PeerIdentified { session_id: self.session_id, hello })
			.await
			.map_err(|_| CloseReason::Shutdown)
	}

	/// The application-thread handoff: awaiting the bounded send is what
	/// stops this task from reading the socket faster than the conductor
	/// consumes.
	async fn forward(&mut self, message: IcpMessage) -> Result<(), CloseReason> {
		self.event_sender
			.send(SessionEvent::Message { session_id: self.session_id, message })
			.await
			.map_err(|_| CloseReason::Shutdown)
	}

	async fn finish(mut self, reason: CloseReason) {
		debug!("session closing: {reason:?}");
		if reason != CloseReason::TransportError {
			let _ = self.websocket.close(None).await;
		}
		// The conductor drops its registry entry in response to this; it is
		// the session's last word.
		let _ = self
			.event_sender
			.send(SessionEvent::Closed { session_id: self.session_id, reason })
			.await;
	}
}

fn unix_time_ms() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn websocket_config() -> WebSocketConfig {
	let mut config = WebSocketConfig::default();
	config.max_message_size = Some(MAX_MESSAGE_SIZE);
	config.max_frame_size = Some(MAX_MESSAGE_SIZE);
	config
}

/// Binds the listening socket for incoming peer connections. The send
/// buffer is configured on the listener so accepted sockets inherit it.
pub fn bind(ip: &str, port: u16) -> Result<TcpListener> {
	let address: std::net::SocketAddr = format!("{ip}:{port}").parse()?;
	let socket = if address.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
	socket.set_reuseaddr(true)?;
	socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
	socket.bind(address)?;
	Ok(socket.listen(1024)?)
}

/// Upgrades an accepted connection to a websocket.
pub async fn accept(stream: TcpStream) -> Result<WebSocketStream<TcpStream>> {
	stream.set_nodelay(true)?;
	Ok(tokio_tungstenite::accept_async_with_config(stream, Some(websocket_config())).await?)
}

/// Dials the peer relay at `endpoint` (`host:port`) and upgrades to a
/// websocket.
pub async fn connect(endpoint: &str) -> Result<WebSocketStream<TcpStream>> {
	let address = tokio::net::lookup_host(endpoint)
		.await?
		.next()
		.ok_or_else(|| anyhow!("could not resolve peer endpoint {endpoint}"))?;
	let socket = if address.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
	socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
	let stream = socket.connect(address).await?;
	stream.set_nodelay(true)?;
	let (websocket, _response) = tokio_tungstenite::client_async_with_config(
		format!("ws://{endpoint}/"),
		stream,
		Some(websocket_config()),
	)
	.await?;
	Ok(websocket)
}
