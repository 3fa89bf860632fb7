//! The application side of the relay: one task owning the session
//! registry, peer dedup, the reconnect policy, and the translation of
//! inbound peer messages into local chain transactions. Sessions hand it
//! everything through a bounded channel; nothing here holds a lock.

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use codec::{Decode, Encode};
use icp_channel::{ChannelAction, Digest, Header, IcpActionPayload};
use tokio::{
	io::{AsyncRead, AsyncWrite},
	sync::{mpsc, watch},
};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::{
	client::ChainClient,
	p2p::{
		protocol::{BlockHeadersWithMerklePath, Hello, IcpActions, IcpMessage, PeerActionKind},
		session::{self, CloseReason, SessionEvent, SessionHandle},
		NodeInfo, SessionId,
	},
};

/// Wait this long until the first reconnection attempt.
const RECONNECT_INTERVAL: Duration = Duration::from_millis(250);
/// Reconnection uses exponential backoff: each attempt waits twice as long
/// as the previous one, up to this maximum.
const RECONNECT_INTERVAL_MAX: Duration = Duration::from_secs(5);

/// Sessions hand decoded messages to the conductor through a channel of
/// this depth; a full channel stalls the session's reader, not the
/// conductor.
pub(super) const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Spawns sessions with conductor-issued ids and the shared node identity.
pub struct SessionFactory {
	node: Arc<NodeInfo>,
	event_sender: mpsc::Sender<SessionEvent>,
	local_head: watch::Receiver<u32>,
	next_session_id: AtomicU64,
}

impl SessionFactory {
	fn new(
		node: Arc<NodeInfo>,
		event_sender: mpsc::Sender<SessionEvent>,
		local_head: watch::Receiver<u32>,
	) -> Self {
		SessionFactory { node, event_sender, local_head, next_session_id: AtomicU64::new(1) }
	}

	/// Session ids increase monotonically, which is what makes "older
	/// duplicate" well defined during peer dedup.
	pub fn spawn<S>(&self, websocket: WebSocketStream<S>) -> SessionHandle
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
		session::spawn(
			session_id,
			self.node.clone(),
			websocket,
			self.event_sender.clone(),
			self.local_head.clone(),
		)
	}
}

/// How freshly spawned sessions reach the conductor's registry.
pub enum Registration {
	Session { handle: SessionHandle, outbound: bool },
	DialFailed,
}

struct ReconnectDelay {
	current: Option<Duration>,
}

impl ReconnectDelay {
	fn next_delay(&mut self) -> Duration {
		let delay = match self.current {
			Some(delay) => std::cmp::min(delay * 2, RECONNECT_INTERVAL_MAX),
			None => RECONNECT_INTERVAL,
		};
		self.current = Some(delay);
		delay
	}

	fn reset(&mut self) {
		if self.current.take().is_some() {
			debug!("reconnection delay reset");
		}
	}
}

pub struct Conductor<C> {
	node: Arc<NodeInfo>,
	client: C,
	factory: Arc<SessionFactory>,
	sessions: BTreeMap<SessionId, SessionHandle>,
	outbound_session: Option<SessionId>,
	peer_endpoint: Option<String>,
	peer_head: watch::Sender<u32>,
	reconnect: ReconnectDelay,
	registration_sender: mpsc::UnboundedSender<Registration>,
	registration_receiver: mpsc::UnboundedReceiver<Registration>,
	event_receiver: mpsc::Receiver<SessionEvent>,
	reconnect_sender: mpsc::UnboundedSender<()>,
	reconnect_receiver: mpsc::UnboundedReceiver<()>,
}

impl<C: ChainClient> Conductor<C> {
	pub fn new(
		node: Arc<NodeInfo>,
		client: C,
		peer_endpoint: Option<String>,
		peer_head: watch::Sender<u32>,
		local_head: watch::Receiver<u32>,
	) -> Self {
		let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
		let (registration_sender, registration_receiver) = mpsc::unbounded_channel();
		let (reconnect_sender, reconnect_receiver) = mpsc::unbounded_channel();
		Conductor {
			factory: Arc::new(SessionFactory::new(node.clone(), event_sender, local_head)),
			node,
			client,
			sessions: BTreeMap::new(),
			outbound_session: None,
			peer_endpoint,
			peer_head,
			reconnect: ReconnectDelay { current: None },
			registration_sender,
			registration_receiver,
			event_receiver,
			reconnect_sender,
			reconnect_receiver,
		}
	}

	pub fn session_factory(&self) -> Arc<SessionFactory> {
		self.factory.clone()
	}

	pub fn registration_sender(&self) -> mpsc::UnboundedSender<Registration> {
		self.registration_sender.clone()
	}

	pub async fn run(mut self, mut outgoing_message_receiver: mpsc::UnboundedReceiver<IcpMessage>) {
		info!("conductor started as {}", self.node.node_id);
		self.dial();
		loop {
			tokio::select! {
				Some(registration) = self.registration_receiver.recv() => {
					self.on_registration(registration);
				}
				Some(event) = self.event_receiver.recv() => {
					self.on_session_event(event).await;
				}
				Some(message) = outgoing_message_receiver.recv() => {
					self.broadcast(message);
				}
				Some(()) = self.reconnect_receiver.recv() => {
					self.dial();
				}
				else => break,
			}
		}
	}

	fn on_registration(&mut self, registration: Registration) {
		match registration {
			Registration::Session { handle, outbound } => {
				debug!(
					"session {} registered{}",
					handle.session_id,
					if outbound { " (outbound)" } else { "" }
				);
				if outbound {
					self.outbound_session = Some(handle.session_id);
				}
				self.sessions.insert(handle.session_id, handle);
			},
			Registration::DialFailed => self.schedule_reconnect(),
		}
	}

	async fn on_session_event(&mut self, event: SessionEvent) {
		match event {
			SessionEvent::PeerIdentified { session_id, hello } =>
				self.on_peer_identified(session_id, hello),
			SessionEvent::Message { session_id, message } =>
				self.on_peer_message(session_id, message).await,
			SessionEvent::Closed { session_id, reason } =>
				self.on_session_closed(session_id, reason),
		}
	}

	fn on_peer_identified(&mut self, session_id: SessionId, hello: Hello) {
		info!(
			"peer {} identified on session {session_id} (contract {}, peer contract {})",
			hello.node_id, hello.contract, hello.peer_contract
		);
		// Newest session wins: close every older session to the same peer.
		for (&id, handle) in &self.sessions {
			if id != session_id && handle.peer_id == Some(hello.node_id) {
				debug!("closing session {id} as a duplicate of {session_id}");
				handle.close(CloseReason::DuplicatePeer);
			}
		}
		if let Some(handle) = self.sessions.get_mut(&session_id) {
			handle.peer_id = Some(hello.node_id);
		}
		if self.outbound_session == Some(session_id) {
			self.reconnect.reset();
		}
	}

	fn on_session_closed(&mut self, session_id: SessionId, reason: CloseReason) {
		debug!("session {session_id} closed: {reason:?}");
		self.sessions.remove(&session_id);
		if self.outbound_session == Some(session_id) {
			self.outbound_session = None;
			if reason.should_reconnect() {
				self.schedule_reconnect();
			}
		}
	}

	/// Queues `message` on every operational session. In the usual
	/// two-node deployment that is exactly one peer link.
	fn broadcast(&self, message: IcpMessage) {
		for handle in self.sessions.values().filter(|handle| handle.peer_id.is_some()) {
			handle.send(message.clone());
		}
	}

	async fn on_peer_message(&mut self, session_id: SessionId, message: IcpMessage) {
		match message {
			IcpMessage::Ping(ping) => {
				// The ping's head is how we notice the peer chain moved
				// while no activity is flowing.
				self.record_peer_head(ping.head);
			},
			IcpMessage::ChannelSeed(seed) => {
				trace!("received channel seed ({} bytes)", seed.seed.len());
				self.push(vec![ChannelAction::OpenChannel { seed: seed.seed }]).await;
			},
			IcpMessage::BlockHeadersWithMerklePath(batch) =>
				self.on_header_batch(session_id, batch).await,
			IcpMessage::IcpActions(bundle) => self.on_icp_actions(session_id, bundle).await,
			// Hello and pong never leave the session.
			message => warn!("unexpected message from session {session_id}: {message:?}"),
		}
	}

	async fn on_header_batch(&mut self, session_id: SessionId, batch: BlockHeadersWithMerklePath) {
		let mut headers = Vec::with_capacity(batch.headers.len());
		for bytes in &batch.headers {
			match Header::decode(&mut bytes.as_slice()) {
				Ok(header) => headers.push(header),
				Err(_) => {
					self.close_session(session_id, CloseReason::BadPayload);
					return
				},
			}
		}
		let Some(first) = headers.first() else {
			self.close_session(session_id, CloseReason::BadPayload);
			return
		};
		let channel_head = match self.client.channel_head().await {
			Ok(head) => head,
			Err(error) => {
				warn!("could not query the channel head: {error:#}");
				return
			},
		};
		if first.block_num != channel_head + 1 {
			// Not an attack, just a relay that is ahead or behind; the
			// liveness exchange will trigger a re-send from the right spot.
			debug!(
				"ignoring header batch starting at {} (channel head is {channel_head})",
				first.block_num
			);
			return
		}
		if let Some(last) = headers.last() {
			self.record_peer_head(last.block_num);
		}
		self.push(vec![ChannelAction::AddBlocks { headers: headers.encode() }]).await;
	}

	async fn on_icp_actions(&mut self, session_id: SessionId, bundle: IcpActions) {
		// The arrays are index-aligned, one entry per proven action;
		// anything else is a protocol violation.
		if bundle.peer_actions.len() != bundle.actions.len() ||
			bundle.actions.len() != bundle.action_receipts.len()
		{
			warn!("misaligned icp_actions arrays from session {session_id}");
			self.close_session(session_id, CloseReason::BadPayload);
			return
		}
		let Ok(header) = Header::decode(&mut bundle.block_header.as_slice()) else {
			self.close_session(session_id, CloseReason::BadPayload);
			return
		};
		let block_id = header.id();
		let action_digests: Vec<Digest> =
			bundle.action_digests.iter().copied().map(Digest).collect();
		self.record_peer_head(header.block_num);

		let mut actions = vec![ChannelAction::AddBlock { header: bundle.block_header }];
		for ((kind, action_bytes), receipt_bytes) in
			bundle.peer_actions.iter().zip(bundle.actions).zip(bundle.action_receipts)
		{
			let payload = IcpActionPayload {
				action_bytes,
				receipt_bytes,
				block_id,
				action_digests: action_digests.clone(),
			};
			actions.push(match kind {
				PeerActionKind::Packet => ChannelAction::OnPacket { action: payload },
				PeerActionKind::Receipt => ChannelAction::OnReceipt { action: payload },
				PeerActionKind::Cleanup => ChannelAction::OnCleanup { action: payload },
			});
		}
		self.push(actions).await;
	}

	async fn push(&self, actions: Vec<ChannelAction>) {
		let count = actions.len();
		if let Err(error) = self.client.push_transaction(actions).await {
			// A rejected submission is not fatal to the link: the peer
			// re-sends, and `genproof` covers lost ground.
			warn!("submission of {count} actions failed: {error:#}");
		}
	}

	fn record_peer_head(&self, head: u32) {
		self.peer_head.send_if_modified(|current| {
			if head > *current {
				*current = head;
				true
			} else {
				false
			}
		});
	}

	fn close_session(&self, session_id: SessionId, reason: CloseReason) {
		if let Some(handle) = self.sessions.get(&session_id) {
			handle.close(reason);
		}
	}

	fn schedule_reconnect(&mut self) {
		let Some(endpoint) = &self.peer_endpoint else { return };
		let delay = self.reconnect.next_delay();
		debug!("will reconnect to {endpoint} in {delay:?}");
		let sender = self.reconnect_sender.clone();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let _ = sender.send(());
		});
	}

	fn dial(&mut self) {
		let Some(endpoint) = self.peer_endpoint.clone() else { return };
		let factory = self.factory.clone();
		let registration_sender = self.registration_sender.clone();
		tokio::spawn(async move {
			match session::connect(&endpoint).await {
				Ok(websocket) => {
					let handle = factory.spawn(websocket);
					let _ = registration_sender
						.send(Registration::Session { handle, outbound: true });
				},
				Err(error) => {
					debug!("could not connect to {endpoint}: {error:#}");
					let _ = registration_sender.send(Registration::DialFailed);
				},
			}
		});
	}
}
