//! Wire schema of the relay link: a four byte big-endian tag followed by
//! the bincode payload of the tagged variant. Tags are stable; an unknown
//! tag or an undecodable payload closes the session.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::p2p::{ChainId, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
	pub node_id: NodeId,
	pub chain_id: ChainId,
	pub contract: String,
	pub peer_contract: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
	/// Sender's clock at send time, unix milliseconds. Diagnostic only.
	pub sent_ms: u64,
	/// Echo code; a pong returning anything else closes the session.
	pub code: u64,
	/// Sender's local chain head, so the peer can notice it is behind.
	pub head: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
	pub code: u64,
}

/// Trust seed for the peer's `openchannel`, SCALE bytes of a header state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSeed {
	pub seed: Vec<u8>,
}

/// A catch-up batch of consecutive headers, each SCALE encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeadersWithMerklePath {
	pub headers: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerActionKind {
	Packet,
	Receipt,
	Cleanup,
}

/// One block of channel activity: the header plus the proven actions it
/// carries. The three arrays are index-aligned, one entry per action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcpActions {
	pub block_header: Vec<u8>,
	pub peer_actions: Vec<PeerActionKind>,
	pub actions: Vec<Vec<u8>>,
	pub action_receipts: Vec<Vec<u8>>,
	pub action_digests: Vec<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcpMessage {
	Hello(Hello),
	Ping(Ping),
	Pong(Pong),
	ChannelSeed(ChannelSeed),
	BlockHeadersWithMerklePath(BlockHeadersWithMerklePath),
	IcpActions(IcpActions),
}

fn split_header<const HEADER_LEN: usize>(buffer: &[u8]) -> Result<(&[u8; HEADER_LEN], &[u8])> {
	if buffer.len() >= HEADER_LEN {
		let (header, payload) = buffer.split_at(HEADER_LEN);
		let header: &[u8; HEADER_LEN] = header.try_into().expect("unexpected size");
		Ok((header, payload))
	} else {
		Err(anyhow!("unexpected buffer len: {}", buffer.len()))
	}
}

impl IcpMessage {
	fn tag(&self) -> u32 {
		match self {
			IcpMessage::Hello(_) => 0,
			IcpMessage::Ping(_) => 1,
			IcpMessage::Pong(_) => 2,
			IcpMessage::ChannelSeed(_) => 3,
			IcpMessage::BlockHeadersWithMerklePath(_) => 4,
			IcpMessage::IcpActions(_) => 5,
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let payload = match self {
			IcpMessage::Hello(message) => bincode::serialize(message),
			IcpMessage::Ping(message) => bincode::serialize(message),
			IcpMessage::Pong(message) => bincode::serialize(message),
			IcpMessage::ChannelSeed(message) => bincode::serialize(message),
			IcpMessage::BlockHeadersWithMerklePath(message) => bincode::serialize(message),
			IcpMessage::IcpActions(message) => bincode::serialize(message),
		}
		.expect("message serialization does not fail");
		[&self.tag().to_be_bytes()[..], &payload].concat()
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		const TAG_LEN: usize = std::mem::size_of::<u32>();
		let (tag, payload) = split_header::<TAG_LEN>(bytes)?;
		Ok(match u32::from_be_bytes(*tag) {
			0 => IcpMessage::Hello(bincode::deserialize(payload)?),
			1 => IcpMessage::Ping(bincode::deserialize(payload)?),
			2 => IcpMessage::Pong(bincode::deserialize(payload)?),
			3 => IcpMessage::ChannelSeed(bincode::deserialize(payload)?),
			4 => IcpMessage::BlockHeadersWithMerklePath(bincode::deserialize(payload)?),
			5 => IcpMessage::IcpActions(bincode::deserialize(payload)?),
			unknown => return Err(anyhow!("unknown message tag: {unknown}")),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip(message: IcpMessage) {
		assert_eq!(IcpMessage::decode(&message.encode()).unwrap(), message);
	}

	#[test]
	fn every_variant_round_trips() {
		round_trip(IcpMessage::Hello(Hello {
			node_id: NodeId([1; 32]),
			chain_id: ChainId([2; 32]),
			contract: "icp.local".to_owned(),
			peer_contract: "icp.peer".to_owned(),
		}));
		round_trip(IcpMessage::Ping(Ping { sent_ms: 1_700_000_000_000, code: 42, head: 101 }));
		round_trip(IcpMessage::Pong(Pong { code: 42 }));
		round_trip(IcpMessage::ChannelSeed(ChannelSeed { seed: vec![1, 2, 3] }));
		round_trip(IcpMessage::BlockHeadersWithMerklePath(BlockHeadersWithMerklePath {
			headers: vec![vec![4, 5], vec![6]],
		}));
		round_trip(IcpMessage::IcpActions(IcpActions {
			block_header: vec![7, 8],
			peer_actions: vec![PeerActionKind::Packet, PeerActionKind::Receipt],
			actions: vec![vec![9], vec![10]],
			action_receipts: vec![vec![11], vec![12]],
			action_digests: vec![[13; 32]],
		}));
	}

	/// Ensure the framing produces the exact bytes we expect: tags are big
	/// endian, payload integers are bincode little endian.
	#[test]
	fn check_tag_and_payload_serialization() {
		let encoded = IcpMessage::Pong(Pong { code: 7 }).encode();
		assert_eq!(encoded, [[0x00, 0x00, 0x00, 0x02].as_slice(), &7u64.to_le_bytes()].concat());
	}

	#[test]
	fn unknown_tags_are_rejected() {
		let mut encoded = IcpMessage::Pong(Pong { code: 7 }).encode();
		encoded[3] = 0x77;
		assert!(IcpMessage::decode(&encoded).is_err());
	}

	#[test]
	fn truncated_buffers_are_rejected() {
		assert!(IcpMessage::decode(&[0x00, 0x00]).is_err());
		// A valid tag with a short payload must not decode either.
		assert!(IcpMessage::decode(&[0x00, 0x00, 0x00, 0x02, 0x01]).is_err());
	}
}
