use crate::types::Timestamp;

/// Raised by the host when an inner action cannot be executed; aborts the
/// enclosing channel transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("inner action rejected by the host: {0}")]
pub struct DispatchError(pub String);

/// Seam to the hosting chain. The contract stays deterministic; everything
/// environmental comes through here.
///
/// The host is expected to run each [crate::Channel::transact] call inside
/// one of its own transactions: when the call returns an error, any side
/// effects of [Host::dispatch_action] made during that call must be rolled
/// back along with it.
pub trait Host {
	/// Current block time of the hosting chain.
	fn now(&self) -> Timestamp;

	/// Whether the enclosing transaction carries the contract owner's
	/// authority.
	fn is_owner(&self) -> bool;

	/// Executes an inner action carried by a packet or receipt. Semantics
	/// are entirely the host's; the channel only records the outcome.
	fn dispatch_action(&mut self, action: &[u8]) -> Result<(), DispatchError>;
}

/// An in-memory host: time and authority are plain fields and dispatched
/// inner actions are collected. Used by the test suites and suitable for
/// local tooling.
#[derive(Debug, Clone, Default)]
pub struct MemoryHost {
	pub now: Timestamp,
	pub owner: bool,
	pub dispatched: Vec<Vec<u8>>,
}

impl MemoryHost {
	pub fn owner_at(now: Timestamp) -> Self {
		MemoryHost { now, owner: true, dispatched: Vec::new() }
	}
}

impl Host for MemoryHost {
	fn now(&self) -> Timestamp {
		self.now
	}

	fn is_owner(&self) -> bool {
		self.owner
	}

	fn dispatch_action(&mut self, action: &[u8]) -> Result<(), DispatchError> {
		self.dispatched.push(action.to_vec());
		Ok(())
	}
}
