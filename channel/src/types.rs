use std::{collections::BTreeMap, fmt};

use codec::{Decode, Encode};
use sha2::{Digest as _, Sha256};

/// Fixed-width account name on the hosting chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Encode, Decode)]
pub struct ProducerId(pub [u8; 8]);

impl ProducerId {
	pub const fn new(raw: [u8; 8]) -> Self {
		ProducerId(raw)
	}

	/// Builds an id from an ascii name of up to 8 bytes, zero padded.
	pub fn from_name(name: &str) -> Option<Self> {
		if name.len() > 8 || !name.is_ascii() {
			return None
		}
		let mut raw = [0u8; 8];
		raw[..name.len()].copy_from_slice(name.as_bytes());
		Some(ProducerId(raw))
	}
}

impl fmt::Display for ProducerId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let trimmed: Vec<u8> = self.0.iter().copied().take_while(|byte| *byte != 0).collect();
		write!(f, "{}", String::from_utf8_lossy(&trimmed))
	}
}

/// Content hash identifying a block.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct BlockId(pub [u8; 32]);

impl fmt::Display for BlockId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl fmt::Debug for BlockId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "BlockId({self})")
	}
}

/// A sha256 digest (action digests, schedule digests, merkle nodes).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Digest(pub [u8; 32]);

impl fmt::Display for Digest {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl fmt::Debug for Digest {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Digest({self})")
	}
}

/// Seconds since the unix epoch, at the hosting chain's resolution.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Encode, Decode,
)]
pub struct Timestamp(pub u32);

impl fmt::Display for Timestamp {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}s", self.0)
	}
}

/// The ordered set of producers authorized to extend the peer chain.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ProducerSchedule {
	pub version: u32,
	pub producers: Vec<ProducerId>,
}

impl ProducerSchedule {
	pub fn digest(&self) -> Digest {
		Digest(Sha256::digest(self.encode()).into())
	}
}

/// Peer chain block header, as decoded from the host codec.
///
/// Two headers with the same `block_num` may coexist while the peer chain is
/// forked; they are distinguished by their content hash ([Header::id]).
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Header {
	pub block_num: u32,
	pub previous: BlockId,
	pub producer: ProducerId,
	/// Digest of the schedule the producer claims to be signing under.
	pub schedule_digest: Digest,
	/// Merkle root committing to all action receipts of this block.
	pub action_mroot: Digest,
	/// A schedule change proposed by this block, if any.
	pub new_schedule: Option<ProducerSchedule>,
}

impl Header {
	pub fn id(&self) -> BlockId {
		BlockId(Sha256::digest(self.encode()).into())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleViolation {
	#[error("header's schedule digest does not match the active schedule")]
	DigestMismatch,
	#[error("producer is not part of the active schedule")]
	UnknownProducer,
	#[error("proposed schedule version must increment the active version")]
	VersionSkip,
	#[error("a schedule proposal is already pending")]
	PendingAlreadySet,
	#[error("proposed schedule has no producers")]
	EmptySchedule,
}

/// A [Header] plus the state accumulated by applying it to its parent:
/// the schedules in force, which producer last extended the fork at which
/// height, and the irreversibility implied by that.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockHeaderState {
	pub header: Header,
	pub id: BlockId,
	pub active_schedule: ProducerSchedule,
	/// A proposed schedule together with the number of the block that
	/// proposed it. Promoted once that block is irreversible.
	pub pending_schedule: Option<(u32, ProducerSchedule)>,
	/// Highest block number each producer has produced on this fork.
	pub producer_to_last_produced: BTreeMap<ProducerId, u32>,
	/// Last irreversible block number implied by this fork.
	pub dpos_lib: u32,
}

impl BlockHeaderState {
	/// A trusted seed state: the block itself is taken to be irreversible.
	pub fn genesis(header: Header, schedule: ProducerSchedule) -> Self {
		let id = header.id();
		let dpos_lib = header.block_num;
		BlockHeaderState {
			header,
			id,
			active_schedule: schedule,
			pending_schedule: None,
			producer_to_last_produced: BTreeMap::new(),
			dpos_lib,
		}
	}

	pub fn block_num(&self) -> u32 {
		self.header.block_num
	}

	/// Applies `header` on top of this state, producing the child state.
	///
	/// The caller is responsible for having resolved `header.previous` to
	/// this state; everything schedule-related is checked here.
	pub fn next(&self, header: &Header) -> Result<Self, ScheduleViolation> {
		debug_assert_eq!(header.previous, self.id);

		let mut active_schedule = self.active_schedule.clone();
		let mut pending_schedule = self.pending_schedule.clone();
		let mut producer_to_last_produced = self.producer_to_last_produced.clone();

		// Promote a pending schedule once the block that proposed it can no
		// longer be reverted.
		if pending_schedule
			.as_ref()
			.is_some_and(|(proposed_at, _)| *proposed_at <= self.dpos_lib)
		{
			let (_, schedule) = pending_schedule.take().expect("present by the check above");
			active_schedule = schedule;
			producer_to_last_produced
				.retain(|producer, _| active_schedule.producers.contains(producer));
		}

		if header.schedule_digest != active_schedule.digest() {
			return Err(ScheduleViolation::DigestMismatch)
		}
		if !active_schedule.producers.contains(&header.producer) {
			return Err(ScheduleViolation::UnknownProducer)
		}
		if let Some(schedule) = &header.new_schedule {
			if pending_schedule.is_some() {
				return Err(ScheduleViolation::PendingAlreadySet)
			}
			if schedule.producers.is_empty() {
				return Err(ScheduleViolation::EmptySchedule)
			}
			if schedule.version != active_schedule.version + 1 {
				return Err(ScheduleViolation::VersionSkip)
			}
			pending_schedule = Some((header.block_num, schedule.clone()));
		}

		producer_to_last_produced.insert(header.producer, header.block_num);

		let dpos_lib = std::cmp::max(
			self.dpos_lib,
			implied_irreversible(&active_schedule, &producer_to_last_produced),
		);

		Ok(BlockHeaderState {
			id: header.id(),
			header: header.clone(),
			active_schedule,
			pending_schedule,
			producer_to_last_produced,
			dpos_lib,
		})
	}
}

/// The highest block number that more than two thirds of the schedule have
/// produced at or after: with the per-producer numbers sorted ascending,
/// the one at index `(n - 1) / 3`.
fn implied_irreversible(
	schedule: &ProducerSchedule,
	last_produced: &BTreeMap<ProducerId, u32>,
) -> u32 {
	let mut produced: Vec<u32> = schedule
		.producers
		.iter()
		.map(|producer| last_produced.get(producer).copied().unwrap_or_default())
		.collect();
	produced.sort_unstable();
	produced[(produced.len() - 1) / 3]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum PacketStatus {
	Unreceipted,
	Receipted,
	Expired,
}

/// An outbound cross-chain message, stored until the peer's receipt comes
/// back and both sides have advanced past it.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Packet {
	pub seq: u64,
	pub expiration: Timestamp,
	pub send_action: Vec<u8>,
	/// Dispatched locally once the peer reports successful execution.
	pub receipt_action: Vec<u8>,
	/// Receipt-consumption cursor at publish time. Kept so `genproof`
	/// regenerates byte-identical [PacketData].
	pub last_incoming_receipt_seq: u64,
	pub status: PacketStatus,
	/// Incoming receipt sequence that moved this packet to a terminal
	/// status, used to resolve the peer's cleanup notices.
	pub receipted_by: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ReceiptStatus {
	Executed,
	Expired,
}

/// Acknowledgement of a peer packet; also its own canonical wire form (the
/// peer's `onreceipt` decodes exactly these bytes).
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Receipt {
	pub seq: u64,
	pub packet_seq: u64,
	pub status: ReceiptStatus,
}

/// Canonical bytes of a packet as published for the relay: what the peer's
/// `onpacket` decodes. Every packet piggybacks the sender's
/// receipt-consumption cursor so the receiving side learns how far its own
/// receipts have been consumed and may clean them up.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PacketData {
	pub seq: u64,
	pub expiration: Timestamp,
	pub send_action: Vec<u8>,
	pub receipt_action: Vec<u8>,
	pub last_incoming_receipt_seq: u64,
}

/// Canonical bytes of a cleanup notice: the sender has erased its receipts
/// `start..=end` and has consumed the peer's receipts up to
/// `last_incoming_receipt_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct CleanupData {
	pub start: u64,
	pub end: u64,
	pub last_incoming_receipt_seq: u64,
}

/// The hosting chain's execution record of one action. The leaves of a
/// block's `action_mroot` are digests of these records, which is what ties
/// a proven action to its enclosing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct ActionReceipt {
	pub action_digest: Digest,
}

/// A proven peer action as submitted by the relay: the peer action's bytes,
/// its execution record, the block it was executed in, and all action
/// receipt digests of that block.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct IcpActionPayload {
	pub action_bytes: Vec<u8>,
	pub receipt_bytes: Vec<u8>,
	pub block_id: BlockId,
	pub action_digests: Vec<Digest>,
}

/// Singleton cursor record. The four `last_*` sequences are authoritative;
/// consumption out of order is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct PeerRecord {
	pub peer_contract: ProducerId,
	pub last_outgoing_packet_seq: u64,
	pub last_incoming_packet_seq: u64,
	pub last_outgoing_receipt_seq: u64,
	pub last_incoming_receipt_seq: u64,
	/// Highest of our outgoing receipts the peer has advertised it will
	/// never reference again (learned from its cleanup notices).
	pub peer_confirmed_receipt_seq: u64,
}

pub const DEFAULT_MAX_PACKETS: u32 = 1000;
pub const DEFAULT_MAX_BLOCKS_PER_SUBMISSION: u32 = 300;

/// Singleton rate meter. `current_packets` counts unreceipted packets only.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Meter {
	pub max_packets: u32,
	pub current_packets: u32,
	pub max_blocks_per_submission: u32,
}

impl Default for Meter {
	fn default() -> Self {
		Meter {
			max_packets: DEFAULT_MAX_PACKETS,
			current_packets: 0,
			max_blocks_per_submission: DEFAULT_MAX_BLOCKS_PER_SUBMISSION,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn schedule(names: &[&str]) -> ProducerSchedule {
		ProducerSchedule {
			version: 0,
			producers: names.iter().map(|name| ProducerId::from_name(name).unwrap()).collect(),
		}
	}

	fn header_on(parent: &BlockHeaderState, producer: &str) -> Header {
		Header {
			block_num: parent.block_num() + 1,
			previous: parent.id,
			producer: ProducerId::from_name(producer).unwrap(),
			schedule_digest: parent.active_schedule.digest(),
			action_mroot: Digest::default(),
			new_schedule: None,
		}
	}

	fn seed(names: &[&str]) -> BlockHeaderState {
		let schedule = schedule(names);
		BlockHeaderState::genesis(
			Header {
				block_num: 100,
				previous: BlockId::default(),
				producer: ProducerId::from_name(names[0]).unwrap(),
				schedule_digest: schedule.digest(),
				action_mroot: Digest::default(),
				new_schedule: None,
			},
			schedule,
		)
	}

	#[test]
	fn producer_names_round_trip() {
		let id = ProducerId::from_name("icp.peer").unwrap();
		assert_eq!(id.to_string(), "icp.peer");
		assert_eq!(ProducerId::from_name("shorty").unwrap().to_string(), "shorty");
		assert!(ProducerId::from_name("ninecharsx").is_none());
	}

	#[test]
	fn lib_advances_once_two_thirds_have_produced() {
		let seed = seed(&["alpha", "bravo", "carol", "delta"]);
		assert_eq!(seed.dpos_lib, 100);

		let a = seed.next(&header_on(&seed, "alpha")).unwrap();
		assert_eq!(a.dpos_lib, 100);
		let b = a.next(&header_on(&a, "bravo")).unwrap();
		assert_eq!(b.dpos_lib, 100);
		// Third distinct producer of four: 101 is now irreversible.
		let c = b.next(&header_on(&b, "carol")).unwrap();
		assert_eq!(c.dpos_lib, 101);
		let d = c.next(&header_on(&c, "delta")).unwrap();
		assert_eq!(d.dpos_lib, 102);
	}

	#[test]
	fn single_producer_schedule_finalizes_immediately() {
		let seed = seed(&["solo"]);
		let next = seed.next(&header_on(&seed, "solo")).unwrap();
		assert_eq!(next.dpos_lib, next.block_num());
	}

	#[test]
	fn repeated_producer_does_not_advance_lib() {
		let seed = seed(&["alpha", "bravo", "carol", "delta"]);
		let mut state = seed.clone();
		for _ in 0..5 {
			state = state.next(&header_on(&state, "alpha")).unwrap();
		}
		assert_eq!(state.dpos_lib, 100);
	}

	#[test]
	fn unknown_producer_is_rejected() {
		let seed = seed(&["alpha", "bravo", "carol", "delta"]);
		let header = header_on(&seed, "mallory");
		assert_eq!(seed.next(&header), Err(ScheduleViolation::UnknownProducer));
	}

	#[test]
	fn stale_schedule_digest_is_rejected() {
		let seed = seed(&["alpha", "bravo", "carol", "delta"]);
		let mut header = header_on(&seed, "alpha");
		header.schedule_digest = Digest([7; 32]);
		assert_eq!(seed.next(&header), Err(ScheduleViolation::DigestMismatch));
	}

	#[test]
	fn pending_schedule_promotes_after_irreversibility() {
		let seed = seed(&["alpha", "bravo", "carol"]);
		let replacement = ProducerSchedule {
			version: 1,
			producers: vec![
				ProducerId::from_name("delta").unwrap(),
				ProducerId::from_name("echo").unwrap(),
				ProducerId::from_name("fox").unwrap(),
			],
		};

		let mut proposal = header_on(&seed, "alpha");
		proposal.new_schedule = Some(replacement.clone());
		let state = seed.next(&proposal).unwrap();
		assert_eq!(state.active_schedule.version, 0);

		// Extend under the old schedule until the proposing block (101)
		// becomes irreversible.
		let state = state.next(&header_on(&state, "bravo")).unwrap();
		let state = state.next(&header_on(&state, "carol")).unwrap();
		assert_eq!(state.dpos_lib, 101);
		assert!(state.pending_schedule.is_some());

		// The next block is produced under the promoted schedule.
		let handover = Header {
			block_num: 104,
			previous: state.id,
			producer: ProducerId::from_name("delta").unwrap(),
			schedule_digest: replacement.digest(),
			action_mroot: Digest::default(),
			new_schedule: None,
		};
		let state = state.next(&handover).unwrap();
		assert_eq!(state.active_schedule, replacement);
		assert!(state.pending_schedule.is_none());
		// Confirmation counts from the retired schedule are gone.
		assert!(state
			.producer_to_last_produced
			.keys()
			.all(|producer| replacement.producers.contains(producer)));
	}

	#[test]
	fn schedule_version_must_increment() {
		let seed = seed(&["alpha", "bravo", "carol"]);
		let mut proposal = header_on(&seed, "alpha");
		proposal.new_schedule =
			Some(ProducerSchedule { version: 5, producers: seed.active_schedule.producers.clone() });
		assert_eq!(seed.next(&proposal), Err(ScheduleViolation::VersionSkip));
	}

	#[test]
	fn header_state_scale_round_trip() {
		let seed = seed(&["alpha", "bravo", "carol", "delta"]);
		let state = seed.next(&header_on(&seed, "alpha")).unwrap();
		let decoded = BlockHeaderState::decode(&mut state.encode().as_slice()).unwrap();
		assert_eq!(decoded, state);
	}
}
