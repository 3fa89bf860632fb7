pub mod conductor;
pub mod protocol;
pub mod session;

use std::{fmt, sync::Arc};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::{
	net::TcpListener,
	sync::{mpsc, watch},
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{client::ChainClient, settings::Settings};
use conductor::{Conductor, Registration, SessionFactory};

pub use protocol::IcpMessage;
pub use session::{CloseReason, SessionEvent, SessionHandle};

pub type SessionId = u64;

/// Identifies one relay process instance; fresh and random per start, so a
/// relay never mistakes its own connection attempt for a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
	pub fn random() -> Self {
		NodeId(rand::random())
	}
}

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl fmt::Debug for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "NodeId({self})")
	}
}

/// Genesis identity of a chain; sessions between relays of different
/// chains are refused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub [u8; 32]);

impl ChainId {
	pub fn from_hex(hex_str: &str) -> Result<Self> {
		let bytes = hex::decode(hex_str)?;
		Ok(ChainId(
			bytes.as_slice().try_into().map_err(|_| anyhow!("chain id must be 32 bytes"))?,
		))
	}
}

impl fmt::Display for ChainId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl fmt::Debug for ChainId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ChainId({self})")
	}
}

/// This relay's identity, shared by every session it spawns.
pub struct NodeInfo {
	pub node_id: NodeId,
	pub chain_id: ChainId,
	pub contract: String,
	pub peer_contract: String,
}

/// Brings up the whole p2p stack: the listener for incoming peer
/// connections, the outbound dial to the configured peer, and the
/// conductor that owns them all. Runs until the process shuts down.
///
/// `local_head` is fed by whatever observes our own chain; `peer_head` is
/// updated from peer traffic and drives the catch-up logic of the scraper.
pub async fn start<C: ChainClient>(
	settings: &Settings,
	client: C,
	local_head: watch::Receiver<u32>,
	peer_head: watch::Sender<u32>,
	outgoing_message_receiver: mpsc::UnboundedReceiver<IcpMessage>,
) -> Result<()> {
	let node = Arc::new(NodeInfo {
		node_id: NodeId::random(),
		chain_id: ChainId::from_hex(&settings.chain.chain_id)?,
		contract: settings.chain.contract.clone(),
		peer_contract: settings.chain.peer_contract.clone(),
	});
	info!("our node id: {}", node.node_id);

	let conductor = Conductor::new(
		node,
		client,
		Some(settings.peer.endpoint.clone()),
		peer_head,
		local_head,
	);

	let listener = session::bind(&settings.node.ip, settings.node.port)?;
	info!("listening for peer connections on {}:{}", settings.node.ip, settings.node.port);
	tokio::spawn(
		accept_loop(listener, conductor.session_factory(), conductor.registration_sender())
			.instrument(info_span!("acceptor")),
	);

	conductor.run(outgoing_message_receiver).instrument(info_span!("p2p")).await;
	Ok(())
}

async fn accept_loop(
	listener: TcpListener,
	factory: Arc<SessionFactory>,
	registration_sender: mpsc::UnboundedSender<Registration>,
) {
	loop {
		match listener.accept().await {
			Ok((stream, address)) => {
				debug!("incoming connection from {address}");
				let factory = factory.clone();
				let registration_sender = registration_sender.clone();
				// The websocket handshake can stall; never block the
				// accept loop on it.
				tokio::spawn(async move {
					match session::accept(stream).await {
						Ok(websocket) => {
							let handle = factory.spawn(websocket);
							let _ = registration_sender
								.send(Registration::Session { handle, outbound: false });
						},
						Err(error) =>
							debug!("websocket handshake with {address} failed: {error:#}"),
					}
				});
			},
			Err(error) => warn!("could not accept a connection: {error}"),
		}
	}
}
