//! Contract-resident core of an inter-chain communication channel.
//!
//! Everything in this crate is deterministic: no I/O, no clocks, no
//! randomness. The hosting chain is reached exclusively through the
//! [host::Host] seam, and every state transition either commits fully or
//! leaves the channel untouched (see [contract::Channel::transact]).

pub mod contract;
pub mod fork_store;
pub mod host;
pub mod merkle;
pub mod types;

pub use contract::{Channel, ChannelAction, ChannelError, ChannelEvent};
pub use fork_store::{AddHeaderOutcome, ForkStore, ForkStoreError};
pub use host::{DispatchError, Host, MemoryHost};
pub use types::{
	ActionReceipt, BlockHeaderState, BlockId, CleanupData, Digest, Header, IcpActionPayload,
	Meter, Packet, PacketData, PacketStatus, PeerRecord, ProducerId, ProducerSchedule, Receipt,
	ReceiptStatus, ScheduleViolation, Timestamp,
};
