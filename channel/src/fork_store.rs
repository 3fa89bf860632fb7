//! Light-client view of the peer chain: an id-keyed arena of
//! [BlockHeaderState]s with a number index, fork choice, and
//! last-irreversible tracking. Parent edges are block ids, not references.

use std::{
	cmp::Ordering,
	collections::{BTreeMap, BTreeSet},
};

use crate::types::{BlockHeaderState, BlockId, Digest, Header, ScheduleViolation};

/// Finalized states older than this many blocks behind the LIB are dropped
/// automatically; proof regeneration cannot reach past this window.
pub const FINALIZED_RETENTION: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ForkStoreError {
	#[error("header does not link to any known block")]
	Unlinkable,
	#[error("producer schedule rule violated: {0}")]
	BadSchedule(#[from] ScheduleViolation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddHeaderOutcome {
	Added,
	/// The header was already present. Idempotent success.
	Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkStore {
	states: BTreeMap<BlockId, BlockHeaderState>,
	by_num: BTreeMap<u32, BTreeSet<BlockId>>,
	head: BlockId,
	lib_id: BlockId,
}

impl ForkStore {
	/// Seeds the store with a trusted state, which becomes both head and
	/// last irreversible block.
	pub fn new(seed: BlockHeaderState) -> Self {
		let id = seed.id;
		let mut states = BTreeMap::new();
		let mut by_num = BTreeMap::new();
		by_num.insert(seed.block_num(), BTreeSet::from([id]));
		states.insert(id, seed);
		ForkStore { states, by_num, head: id, lib_id: id }
	}

	pub fn find(&self, id: &BlockId) -> Option<&BlockHeaderState> {
		self.states.get(id)
	}

	pub fn head(&self) -> &BlockHeaderState {
		self.state(&self.head)
	}

	pub fn head_num(&self) -> u32 {
		self.head().block_num()
	}

	/// Number of the last irreversible block.
	pub fn lib(&self) -> u32 {
		self.state(&self.lib_id).block_num()
	}

	pub fn lib_id(&self) -> BlockId {
		self.lib_id
	}

	pub fn add_header(&mut self, header: &Header) -> Result<AddHeaderOutcome, ForkStoreError> {
		let id = header.id();
		if self.states.contains_key(&id) {
			return Ok(AddHeaderOutcome::Duplicate)
		}
		let parent = self.states.get(&header.previous).ok_or(ForkStoreError::Unlinkable)?;
		let state = parent.next(header)?;

		self.by_num.entry(state.block_num()).or_default().insert(id);
		self.states.insert(id, state);

		self.elect_head();
		self.advance_lib();
		Ok(AddHeaderOutcome::Added)
	}

	pub fn add_header_batch(&mut self, headers: &[Header]) -> Result<(), ForkStoreError> {
		for header in headers {
			self.add_header(header)?;
		}
		Ok(())
	}

	/// Drops a block and all of its descendants. The irreversible chain is
	/// immutable: requests to remove any part of it are ignored.
	pub fn remove(&mut self, id: &BlockId) {
		if *id == self.lib_id || self.is_ancestor(&self.lib_id, id) {
			return
		}
		self.remove_subtree(*id);
		if !self.states.contains_key(&self.head) {
			self.elect_head();
		}
	}

	/// True when `ancestor` is on the chain leading to `descendant`
	/// (inclusive: every block is its own ancestor).
	pub fn is_ancestor(&self, descendant: &BlockId, ancestor: &BlockId) -> bool {
		let Some(ancestor_state) = self.states.get(ancestor) else { return false };
		let mut cursor = match self.states.get(descendant) {
			Some(state) => state,
			None => return false,
		};
		while cursor.block_num() > ancestor_state.block_num() {
			cursor = match self.states.get(&cursor.header.previous) {
				Some(state) => state,
				None => return false,
			};
		}
		cursor.id == *ancestor
	}

	/// Action merkle root of the canonical block at `block_num`, if it is
	/// still stored and on the chain of the current head.
	pub fn merkle_root_at(&self, block_num: u32) -> Option<Digest> {
		self.canonical_id_at(block_num)
			.and_then(|id| self.states.get(&id))
			.map(|state| state.header.action_mroot)
	}

	/// Drops finalized states with numbers in `start..=end`. Only blocks
	/// strictly below the current LIB are touched; proofs referencing a
	/// dropped block no longer verify.
	pub fn prune_finalized(&mut self, start: u32, end: u32) {
		let end = end.min(self.lib().saturating_sub(1));
		if start > end {
			return
		}
		let pruned: Vec<(u32, BlockId)> = self
			.by_num
			.range(start..=end)
			.flat_map(|(num, ids)| ids.iter().map(|id| (*num, *id)))
			.collect();
		for (num, id) in pruned {
			self.states.remove(&id);
			self.unindex(num, &id);
		}
	}

	fn state(&self, id: &BlockId) -> &BlockHeaderState {
		self.states.get(id).expect("head and lib ids always resolve to a stored state")
	}

	/// Head is the tip with the greatest `(implied lib, block number)` key;
	/// ties go to the smaller block id so every node picks the same fork.
	fn elect_head(&mut self) {
		let best = self
			.states
			.values()
			.max_by(|a, b| {
				(a.dpos_lib, a.block_num())
					.cmp(&(b.dpos_lib, b.block_num()))
					.then_with(|| b.id.cmp(&a.id))
			})
			.expect("the irreversible chain is never removed, so the store is never empty");
		self.head = best.id;
	}

	fn advance_lib(&mut self) {
		let target = self.state(&self.head).dpos_lib;
		if target <= self.lib() {
			return
		}
		self.lib_id = self
			.canonical_id_at(target)
			.expect("the head's implied irreversible block lies on its own chain");
		self.prune_stale_forks();
		self.prune_finalized(0, self.lib().saturating_sub(FINALIZED_RETENTION));
	}

	/// Any block at or below the LIB that is not the canonical block of its
	/// height can never be reorganized back in; drop it with its
	/// descendants.
	fn prune_stale_forks(&mut self) {
		let lib_num = self.lib();
		let canonical: BTreeSet<BlockId> = self.ancestry_of_head().collect();
		let stale: Vec<BlockId> = self
			.by_num
			.range(..=lib_num)
			.flat_map(|(_, ids)| ids.iter().copied())
			.filter(|id| !canonical.contains(id))
			.collect();
		for id in stale {
			self.remove_subtree(id);
		}
	}

	fn canonical_id_at(&self, block_num: u32) -> Option<BlockId> {
		let mut cursor = self.states.get(&self.head)?;
		loop {
			match cursor.block_num().cmp(&block_num) {
				Ordering::Equal => return Some(cursor.id),
				Ordering::Less => return None,
				Ordering::Greater => cursor = self.states.get(&cursor.header.previous)?,
			}
		}
	}

	fn ancestry_of_head(&self) -> impl Iterator<Item = BlockId> + '_ {
		let mut next = Some(self.head);
		std::iter::from_fn(move || {
			let id = next?;
			let state = self.states.get(&id)?;
			next = Some(state.header.previous);
			Some(id)
		})
	}

	fn remove_subtree(&mut self, root: BlockId) {
		let mut queue = vec![root];
		while let Some(id) = queue.pop() {
			let Some(state) = self.states.remove(&id) else { continue };
			let num = state.block_num();
			self.unindex(num, &id);
			if let Some(children) = self.by_num.get(&(num + 1)) {
				queue.extend(children.iter().copied().filter(|child| {
					self.states.get(child).is_some_and(|c| c.header.previous == id)
				}));
			}
		}
	}

	fn unindex(&mut self, num: u32, id: &BlockId) {
		if let Some(ids) = self.by_num.get_mut(&num) {
			ids.remove(id);
			if ids.is_empty() {
				self.by_num.remove(&num);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{ProducerId, ProducerSchedule};

	const PRODUCERS: [&str; 4] = ["alpha", "bravo", "carol", "delta"];

	fn schedule() -> ProducerSchedule {
		ProducerSchedule {
			version: 0,
			producers: PRODUCERS
				.iter()
				.map(|name| ProducerId::from_name(name).unwrap())
				.collect(),
		}
	}

	fn header(block_num: u32, previous: BlockId, producer: &str, mroot: u8) -> Header {
		Header {
			block_num,
			previous,
			producer: ProducerId::from_name(producer).unwrap(),
			schedule_digest: schedule().digest(),
			action_mroot: Digest([mroot; 32]),
			new_schedule: None,
		}
	}

	fn seeded_store() -> ForkStore {
		let genesis = header(100, BlockId::default(), "alpha", 0);
		ForkStore::new(BlockHeaderState::genesis(genesis, schedule()))
	}

	#[test]
	fn seeded_store_exposes_head_and_lib() {
		let store = seeded_store();
		assert_eq!(store.head_num(), 100);
		assert_eq!(store.lib(), 100);
		assert_eq!(store.head().id, store.lib_id());
	}

	#[test]
	fn linear_growth_advances_head_and_lib() {
		let mut store = seeded_store();
		let mut previous = store.head().id;
		for (offset, producer) in ["bravo", "carol", "delta", "alpha"].iter().enumerate() {
			let h = header(101 + offset as u32, previous, producer, 0);
			previous = h.id();
			assert_eq!(store.add_header(&h), Ok(AddHeaderOutcome::Added));
		}
		assert_eq!(store.head_num(), 104);
		// Three distinct producers extended past 101 and 102.
		assert_eq!(store.lib(), 102);
	}

	#[test]
	fn unlinkable_header_is_rejected() {
		let mut store = seeded_store();
		let orphan = header(101, BlockId([9; 32]), "bravo", 0);
		assert_eq!(store.add_header(&orphan), Err(ForkStoreError::Unlinkable));
	}

	#[test]
	fn duplicate_header_is_idempotent() {
		let mut store = seeded_store();
		let h = header(101, store.head().id, "bravo", 0);
		assert_eq!(store.add_header(&h), Ok(AddHeaderOutcome::Added));
		let snapshot = store.clone();
		assert_eq!(store.add_header(&h), Ok(AddHeaderOutcome::Duplicate));
		assert_eq!(store, snapshot);
	}

	#[test]
	fn schedule_violations_are_rejected() {
		let mut store = seeded_store();
		let mut h = header(101, store.head().id, "bravo", 0);
		h.schedule_digest = Digest([1; 32]);
		assert_eq!(
			store.add_header(&h),
			Err(ForkStoreError::BadSchedule(ScheduleViolation::DigestMismatch))
		);
	}

	#[test]
	fn equal_weight_fork_tips_tie_break_to_smaller_id() {
		let mut store = seeded_store();
		let seed_id = store.head().id;
		let fork_a = header(101, seed_id, "bravo", 1);
		let fork_b = header(101, seed_id, "carol", 2);
		store.add_header(&fork_a).unwrap();
		store.add_header(&fork_b).unwrap();

		let expected = std::cmp::min(fork_a.id(), fork_b.id());
		assert_eq!(store.head().id, expected);
	}

	#[test]
	fn longer_fork_wins_head() {
		let mut store = seeded_store();
		let seed_id = store.head().id;
		let fork_a = header(101, seed_id, "bravo", 1);
		let fork_b = header(101, seed_id, "carol", 2);
		store.add_header(&fork_a).unwrap();
		store.add_header(&fork_b).unwrap();
		let extension = header(102, fork_b.id(), "delta", 0);
		store.add_header(&extension).unwrap();
		assert_eq!(store.head().id, extension.id());
	}

	#[test]
	fn lib_advance_prunes_the_losing_fork() {
		let mut store = seeded_store();
		let seed_id = store.head().id;

		let fork_a = header(101, seed_id, "alpha", 1);
		let fork_b = header(101, seed_id, "bravo", 2);
		let fork_b_child = header(102, fork_b.id(), "delta", 0);
		store.add_header(&fork_a).unwrap();
		store.add_header(&fork_b).unwrap();
		store.add_header(&fork_b_child).unwrap();

		// Extend fork a until 101 is irreversible on it.
		let a102 = header(102, fork_a.id(), "bravo", 0);
		let a103 = header(103, a102.id(), "carol", 0);
		let a104 = header(104, a103.id(), "delta", 0);
		store.add_header(&a102).unwrap();
		store.add_header(&a103).unwrap();
		store.add_header(&a104).unwrap();

		assert!(store.lib() >= 101);
		assert_eq!(store.find(&fork_b.id()), None);
		assert_eq!(store.find(&fork_b_child.id()), None);
		// Proofs must resolve against the surviving fork only.
		assert_eq!(store.merkle_root_at(101), Some(Digest([1; 32])));
	}

	#[test]
	fn lib_is_monotone_across_any_add_sequence() {
		let mut store = seeded_store();
		let mut previous = store.head().id;
		let mut last_lib = store.lib();
		for round in 0u32..12 {
			let producer = PRODUCERS[(round as usize) % PRODUCERS.len()];
			let h = header(101 + round, previous, producer, 0);
			previous = h.id();
			store.add_header(&h).unwrap();
			assert!(store.lib() >= last_lib);
			last_lib = store.lib();
		}
	}

	#[test]
	fn remove_drops_descendants_and_reelects_head() {
		let mut store = seeded_store();
		let b101 = header(101, store.head().id, "bravo", 0);
		let b102 = header(102, b101.id(), "carol", 0);
		store.add_header(&b101).unwrap();
		store.add_header(&b102).unwrap();
		assert_eq!(store.head_num(), 102);

		store.remove(&b101.id());
		assert_eq!(store.find(&b101.id()), None);
		assert_eq!(store.find(&b102.id()), None);
		assert_eq!(store.head_num(), 100);
	}

	#[test]
	fn remove_refuses_the_irreversible_chain() {
		let mut store = seeded_store();
		let lib_id = store.lib_id();
		store.remove(&lib_id);
		assert!(store.find(&lib_id).is_some());
	}

	#[test]
	fn ancestry_is_tracked_across_forks() {
		let mut store = seeded_store();
		let seed_id = store.head().id;
		let fork_a = header(101, seed_id, "bravo", 1);
		let fork_b = header(101, seed_id, "carol", 2);
		let a102 = header(102, fork_a.id(), "delta", 0);
		store.add_header(&fork_a).unwrap();
		store.add_header(&fork_b).unwrap();
		store.add_header(&a102).unwrap();

		assert!(store.is_ancestor(&a102.id(), &fork_a.id()));
		assert!(store.is_ancestor(&a102.id(), &seed_id));
		assert!(!store.is_ancestor(&a102.id(), &fork_b.id()));
		assert!(store.is_ancestor(&a102.id(), &a102.id()));
	}

	#[test]
	fn prune_finalized_drops_old_proof_roots() {
		let mut store = seeded_store();
		let mut previous = store.head().id;
		for round in 0u32..8 {
			let producer = PRODUCERS[(round as usize) % PRODUCERS.len()];
			let h = header(101 + round, previous, producer, 0);
			previous = h.id();
			store.add_header(&h).unwrap();
		}
		let lib = store.lib();
		assert!(lib > 102);

		store.prune_finalized(0, u32::MAX);
		// Everything strictly below the LIB is gone, the LIB itself stays.
		assert_eq!(store.merkle_root_at(lib.saturating_sub(1)), None);
		assert!(store.merkle_root_at(lib).is_some());
		assert_eq!(store.lib(), lib);
	}
}
