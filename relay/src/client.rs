use async_trait::async_trait;
use icp_channel::ChannelAction;

/// Submission seam to the local chain. The wallet that signs and the node
/// that accepts the transaction both live outside this crate; the relay
/// only decides *what* to submit.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
	/// Head block number of the channel contract's fork store, i.e. our
	/// light-client view of the peer chain. Gates header batch submission.
	async fn channel_head(&self) -> anyhow::Result<u32>;

	/// Submits the actions as a single transaction. The host chain applies
	/// them atomically; an error here means nothing was committed and the
	/// peer is expected to re-send.
	async fn push_transaction(&self, actions: Vec<ChannelAction>) -> anyhow::Result<()>;
}
