//! The channel contract proper: sequence-numbered packet and receipt
//! tables, merkle-verified ingestion of proven peer actions, rate metering
//! and lifecycle, all behind an atomic [Channel::transact] entry point.

use std::collections::BTreeMap;

use codec::{Decode, Encode};

use crate::{
	fork_store::{ForkStore, ForkStoreError},
	host::{DispatchError, Host},
	merkle,
	types::{
		ActionReceipt, BlockHeaderState, CleanupData, Header, IcpActionPayload, Meter, Packet,
		PacketData, PacketStatus, PeerRecord, ProducerId, Receipt, ReceiptStatus, Timestamp,
	},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
	#[error("channel is already open")]
	AlreadyOpen,
	#[error("channel is not open")]
	NotOpen,
	#[error("missing contract owner authority")]
	NotAuthorized,
	#[error(transparent)]
	Fork(#[from] ForkStoreError),
	#[error("batch of {got} headers exceeds the configured maximum of {max}")]
	TooManyBlocks { got: u32, max: u32 },
	#[error("first header of a batch must extend the head at {head} by one, got {got}")]
	BatchOutOfOrder { head: u32, got: u32 },
	#[error("referenced block is not in the fork store")]
	BlockNotFound,
	#[error("referenced block {block_num} is not yet irreversible (lib is {lib})")]
	NotIrreversible { block_num: u32, lib: u32 },
	#[error("merkle proof does not reconstruct the block's action root")]
	BadMerkleProof,
	#[error("expected sequence {expected}, got {got}")]
	BadSeq { expected: u64, got: u64 },
	#[error("packet {0} not found")]
	PacketNotFound(u64),
	#[error("receipt {0} not found")]
	ReceiptNotFound(u64),
	#[error("packet {0} already has a terminal receipt")]
	AlreadyReceipted(u64),
	#[error("packet meter saturated at {0} unreceipted packets")]
	RateLimited(u32),
	#[error("send action must not be empty")]
	EmptyAction,
	#[error("expiration {expiration} is not in the future (now {now})")]
	BadExpiration { expiration: Timestamp, now: Timestamp },
	#[error("cleanup range is empty or leaves a hole")]
	CleanupHole,
	#[error("range start {start} is past its end {end}")]
	BadRange { start: u64, end: u64 },
	#[error("cleanup range end {end} is past the peer's advertised cursor {advertised}")]
	CleanupPastCursor { end: u64, advertised: u64 },
	#[error("undecodable payload")]
	BadPayload,
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
}

/// The contract's action surface. `Vec<u8>` payloads are SCALE bytes of the
/// corresponding schema type, mirroring how the host codec delivers them.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ChannelAction {
	SetPeer { peer_contract: ProducerId },
	SetMaxPackets { max_packets: u32 },
	SetMaxBlocks { max_blocks: u32 },
	OpenChannel { seed: Vec<u8> },
	CloseChannel,
	AddBlock { header: Vec<u8> },
	AddBlocks { headers: Vec<u8> },
	SendAction { seq: u64, send_action: Vec<u8>, expiration: Timestamp, receipt_action: Vec<u8> },
	OnPacket { action: IcpActionPayload },
	OnReceipt { action: IcpActionPayload },
	OnCleanup { action: IcpActionPayload },
	Cleanup { start: u64, end: u64 },
	/// Re-emits the canonical bytes of an old packet and/or receipt for a
	/// relay that lost them. A sequence of zero skips that side.
	GenProof { packet_seq: u64, receipt_seq: u64 },
	Prune { start: u64, end: u64 },
}

/// What the contract publishes for the relay to scrape. Each `bytes` field
/// holds the canonical encoding that the peer side will verify against the
/// action merkle root of the enclosing block.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ChannelEvent {
	PacketStored { seq: u64, bytes: Vec<u8> },
	ReceiptStored { seq: u64, bytes: Vec<u8> },
	CleanupStored { bytes: Vec<u8> },
	ProofRegenerated { packet: Option<Vec<u8>>, receipt: Option<Vec<u8>> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
	fork_store: Option<ForkStore>,
	packets: BTreeMap<u64, Packet>,
	receipts: BTreeMap<u64, Receipt>,
	peer: PeerRecord,
	meter: Meter,
}

impl Channel {
	pub fn new() -> Self {
		Self::default()
	}

	/// Applies `action` atomically: on error the channel is left untouched,
	/// mirroring the hosting chain's transaction rollback. Events are only
	/// produced by committed transactions.
	pub fn transact(
		&mut self,
		host: &mut impl Host,
		action: ChannelAction,
	) -> Result<Vec<ChannelEvent>, ChannelError> {
		let mut next = self.clone();
		let mut events = Vec::new();
		next.dispatch(host, action, &mut events)?;
		*self = next;
		Ok(events)
	}

	pub fn is_open(&self) -> bool {
		self.fork_store.is_some()
	}

	pub fn fork_store(&self) -> Option<&ForkStore> {
		self.fork_store.as_ref()
	}

	pub fn peer(&self) -> &PeerRecord {
		&self.peer
	}

	pub fn meter(&self) -> &Meter {
		&self.meter
	}

	pub fn packet(&self, seq: u64) -> Option<&Packet> {
		self.packets.get(&seq)
	}

	pub fn receipt(&self, seq: u64) -> Option<&Receipt> {
		self.receipts.get(&seq)
	}

	fn dispatch(
		&mut self,
		host: &mut impl Host,
		action: ChannelAction,
		events: &mut Vec<ChannelEvent>,
	) -> Result<(), ChannelError> {
		match action {
			ChannelAction::SetPeer { peer_contract } => self.set_peer(host, peer_contract),
			ChannelAction::SetMaxPackets { max_packets } => self.set_max_packets(host, max_packets),
			ChannelAction::SetMaxBlocks { max_blocks } => self.set_max_blocks(host, max_blocks),
			ChannelAction::OpenChannel { seed } => self.open_channel(host, &seed),
			ChannelAction::CloseChannel => self.close_channel(host),
			ChannelAction::AddBlock { header } => self.add_block(&header),
			ChannelAction::AddBlocks { headers } => self.add_blocks(&headers),
			ChannelAction::SendAction { seq, send_action, expiration, receipt_action } =>
				self.send_action(host, seq, send_action, expiration, receipt_action, events),
			ChannelAction::OnPacket { action } => self.on_packet(host, &action, events),
			ChannelAction::OnReceipt { action } => self.on_receipt(host, &action),
			ChannelAction::OnCleanup { action } => self.on_cleanup(&action),
			ChannelAction::Cleanup { start, end } => self.cleanup(start, end, events),
			ChannelAction::GenProof { packet_seq, receipt_seq } =>
				self.gen_proof(packet_seq, receipt_seq, events),
			ChannelAction::Prune { start, end } => self.prune(host, start, end),
		}
	}

	fn require_owner(host: &impl Host) -> Result<(), ChannelError> {
		if host.is_owner() {
			Ok(())
		} else {
			Err(ChannelError::NotAuthorized)
		}
	}

	fn store(&self) -> Result<&ForkStore, ChannelError> {
		self.fork_store.as_ref().ok_or(ChannelError::NotOpen)
	}

	fn store_mut(&mut self) -> Result<&mut ForkStore, ChannelError> {
		self.fork_store.as_mut().ok_or(ChannelError::NotOpen)
	}

	fn set_peer(&mut self, host: &impl Host, peer_contract: ProducerId) -> Result<(), ChannelError> {
		Self::require_owner(host)?;
		self.peer.peer_contract = peer_contract;
		Ok(())
	}

	fn set_max_packets(&mut self, host: &impl Host, max_packets: u32) -> Result<(), ChannelError> {
		Self::require_owner(host)?;
		self.meter.max_packets = max_packets;
		Ok(())
	}

	fn set_max_blocks(&mut self, host: &impl Host, max_blocks: u32) -> Result<(), ChannelError> {
		Self::require_owner(host)?;
		self.meter.max_blocks_per_submission = max_blocks;
		Ok(())
	}

	fn open_channel(&mut self, host: &impl Host, seed: &[u8]) -> Result<(), ChannelError> {
		Self::require_owner(host)?;
		if self.fork_store.is_some() {
			return Err(ChannelError::AlreadyOpen)
		}
		let state = decode::<BlockHeaderState>(seed)?;
		// The seed is trusted, but it still has to be self-consistent.
		if state.id != state.header.id() || state.active_schedule.producers.is_empty() {
			return Err(ChannelError::BadPayload)
		}
		self.fork_store = Some(ForkStore::new(state));
		Ok(())
	}

	fn close_channel(&mut self, host: &impl Host) -> Result<(), ChannelError> {
		Self::require_owner(host)?;
		self.store()?;
		*self = Channel::default();
		Ok(())
	}

	fn add_block(&mut self, header: &[u8]) -> Result<(), ChannelError> {
		let header = decode::<Header>(header)?;
		self.store_mut()?.add_header(&header)?;
		Ok(())
	}

	fn add_blocks(&mut self, headers: &[u8]) -> Result<(), ChannelError> {
		let headers = decode::<Vec<Header>>(headers)?;
		let max = self.meter.max_blocks_per_submission;
		if headers.is_empty() {
			return Err(ChannelError::BadPayload)
		}
		if headers.len() > max as usize {
			return Err(ChannelError::TooManyBlocks { got: headers.len() as u32, max })
		}
		let store = self.store_mut()?;
		let head = store.head_num();
		if headers[0].block_num != head + 1 {
			return Err(ChannelError::BatchOutOfOrder { head, got: headers[0].block_num })
		}
		store.add_header_batch(&headers)?;
		Ok(())
	}

	fn send_action(
		&mut self,
		host: &impl Host,
		seq: u64,
		send_action: Vec<u8>,
		expiration: Timestamp,
		receipt_action: Vec<u8>,
		events: &mut Vec<ChannelEvent>,
	) -> Result<(), ChannelError> {
		self.store()?;
		let expected = self.peer.last_outgoing_packet_seq + 1;
		if seq != expected {
			return Err(ChannelError::BadSeq { expected, got: seq })
		}
		if send_action.is_empty() {
			return Err(ChannelError::EmptyAction)
		}
		let now = host.now();
		if expiration <= now {
			return Err(ChannelError::BadExpiration { expiration, now })
		}
		if self.meter.current_packets >= self.meter.max_packets {
			return Err(ChannelError::RateLimited(self.meter.max_packets))
		}

		let last_incoming_receipt_seq = self.peer.last_incoming_receipt_seq;
		let data = PacketData {
			seq,
			expiration,
			send_action: send_action.clone(),
			receipt_action: receipt_action.clone(),
			last_incoming_receipt_seq,
		};
		self.packets.insert(
			seq,
			Packet {
				seq,
				expiration,
				send_action,
				receipt_action,
				last_incoming_receipt_seq,
				status: PacketStatus::Unreceipted,
				receipted_by: None,
			},
		);
		self.peer.last_outgoing_packet_seq = seq;
		self.meter.current_packets += 1;
		events.push(ChannelEvent::PacketStored { seq, bytes: data.encode() });
		Ok(())
	}

	/// Common gate for every proven peer action: the referenced block must
	/// be stored and irreversible, the execution record must commit to the
	/// action bytes, and the digest list must fold to the block's action
	/// merkle root.
	fn verify_proven(&self, payload: &IcpActionPayload) -> Result<(), ChannelError> {
		let store = self.store()?;
		let state = store.find(&payload.block_id).ok_or(ChannelError::BlockNotFound)?;
		let lib = store.lib();
		if state.block_num() > lib {
			return Err(ChannelError::NotIrreversible { block_num: state.block_num(), lib })
		}
		let receipt = decode::<ActionReceipt>(&payload.receipt_bytes)?;
		if receipt.action_digest != merkle::hash(&payload.action_bytes) ||
			!payload.action_digests.contains(&merkle::hash(&payload.receipt_bytes)) ||
			merkle::merkle_root(&payload.action_digests) != state.header.action_mroot
		{
			return Err(ChannelError::BadMerkleProof)
		}
		Ok(())
	}

	fn on_packet(
		&mut self,
		host: &mut impl Host,
		payload: &IcpActionPayload,
		events: &mut Vec<ChannelEvent>,
	) -> Result<(), ChannelError> {
		self.verify_proven(payload)?;
		let data = decode::<PacketData>(&payload.action_bytes)?;

		let expected = self.peer.last_incoming_packet_seq + 1;
		if data.seq != expected {
			return Err(ChannelError::BadSeq { expected, got: data.seq })
		}

		// The packet advertises how far the sender has consumed our
		// receipts; that is what bounds our `cleanup`.
		self.peer.peer_confirmed_receipt_seq =
			self.peer.peer_confirmed_receipt_seq.max(data.last_incoming_receipt_seq);

		// An expired packet is receipted as such rather than rejected, so
		// the sender's meter can still drain.
		let status = if host.now() >= data.expiration {
			ReceiptStatus::Expired
		} else {
			host.dispatch_action(&data.send_action)?;
			ReceiptStatus::Executed
		};

		let receipt_seq = self.peer.last_outgoing_receipt_seq + 1;
		let receipt = Receipt { seq: receipt_seq, packet_seq: data.seq, status };
		let bytes = receipt.encode();
		self.receipts.insert(receipt_seq, receipt);
		self.peer.last_incoming_packet_seq = data.seq;
		self.peer.last_outgoing_receipt_seq = receipt_seq;
		events.push(ChannelEvent::ReceiptStored { seq: receipt_seq, bytes });
		Ok(())
	}

	fn on_receipt(
		&mut self,
		host: &mut impl Host,
		payload: &IcpActionPayload,
	) -> Result<(), ChannelError> {
		self.verify_proven(payload)?;
		let receipt = decode::<Receipt>(&payload.action_bytes)?;

		let expected = self.peer.last_incoming_receipt_seq + 1;
		if receipt.seq != expected {
			return Err(ChannelError::BadSeq { expected, got: receipt.seq })
		}

		let packet = self
			.packets
			.get_mut(&receipt.packet_seq)
			.ok_or(ChannelError::PacketNotFound(receipt.packet_seq))?;
		if packet.status != PacketStatus::Unreceipted {
			return Err(ChannelError::AlreadyReceipted(receipt.packet_seq))
		}

		packet.status = match receipt.status {
			ReceiptStatus::Executed => PacketStatus::Receipted,
			ReceiptStatus::Expired => PacketStatus::Expired,
		};
		packet.receipted_by = Some(receipt.seq);
		let receipt_action = packet.receipt_action.clone();

		self.meter.current_packets = self.meter.current_packets.saturating_sub(1);
		self.peer.last_incoming_receipt_seq = receipt.seq;

		if receipt.status == ReceiptStatus::Executed && !receipt_action.is_empty() {
			host.dispatch_action(&receipt_action)?;
		}
		Ok(())
	}

	fn on_cleanup(&mut self, payload: &IcpActionPayload) -> Result<(), ChannelError> {
		self.verify_proven(payload)?;
		let data = decode::<CleanupData>(&payload.action_bytes)?;

		self.peer.peer_confirmed_receipt_seq =
			self.peer.peer_confirmed_receipt_seq.max(data.last_incoming_receipt_seq);

		// The peer has erased its receipts `start..=end`: every local packet
		// settled by one of them can never be re-referenced.
		self.packets.retain(|_, packet| {
			!(packet.status != PacketStatus::Unreceipted &&
				packet
					.receipted_by
					.is_some_and(|seq| (data.start..=data.end).contains(&seq)))
		});
		Ok(())
	}

	fn cleanup(
		&mut self,
		start: u64,
		end: u64,
		events: &mut Vec<ChannelEvent>,
	) -> Result<(), ChannelError> {
		if start > end {
			return Err(ChannelError::CleanupHole)
		}
		let first = self.receipts.keys().next().copied().ok_or(ChannelError::CleanupHole)?;
		if start != first {
			return Err(ChannelError::CleanupHole)
		}
		if end > self.peer.last_outgoing_receipt_seq {
			return Err(ChannelError::ReceiptNotFound(end))
		}
		let advertised = self.peer.peer_confirmed_receipt_seq;
		if end > advertised {
			return Err(ChannelError::CleanupPastCursor { end, advertised })
		}

		self.receipts.retain(|seq, _| !(start..=end).contains(seq));
		let notice = CleanupData {
			start,
			end,
			last_incoming_receipt_seq: self.peer.last_incoming_receipt_seq,
		};
		events.push(ChannelEvent::CleanupStored { bytes: notice.encode() });
		Ok(())
	}

	fn gen_proof(
		&self,
		packet_seq: u64,
		receipt_seq: u64,
		events: &mut Vec<ChannelEvent>,
	) -> Result<(), ChannelError> {
		if packet_seq == 0 && receipt_seq == 0 {
			return Err(ChannelError::BadPayload)
		}
		let packet = match packet_seq {
			0 => None,
			seq => {
				let packet =
					self.packets.get(&seq).ok_or(ChannelError::PacketNotFound(seq))?;
				Some(
					PacketData {
						seq: packet.seq,
						expiration: packet.expiration,
						send_action: packet.send_action.clone(),
						receipt_action: packet.receipt_action.clone(),
						last_incoming_receipt_seq: packet.last_incoming_receipt_seq,
					}
					.encode(),
				)
			},
		};
		let receipt = match receipt_seq {
			0 => None,
			seq => Some(
				self.receipts.get(&seq).ok_or(ChannelError::ReceiptNotFound(seq))?.encode(),
			),
		};
		events.push(ChannelEvent::ProofRegenerated { packet, receipt });
		Ok(())
	}

	fn prune(&mut self, host: &impl Host, start: u64, end: u64) -> Result<(), ChannelError> {
		Self::require_owner(host)?;
		if start > end {
			return Err(ChannelError::BadRange { start, end })
		}
		self.packets.retain(|seq, packet| {
			!((start..=end).contains(seq) && packet.status != PacketStatus::Unreceipted)
		});
		self.receipts.retain(|seq, _| !(start..=end).contains(seq));
		Ok(())
	}
}

fn decode<T: Decode>(bytes: &[u8]) -> Result<T, ChannelError> {
	T::decode(&mut &bytes[..]).map_err(|_| ChannelError::BadPayload)
}
