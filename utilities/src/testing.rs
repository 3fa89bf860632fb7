use core::{fmt::Debug, time::Duration};

use tokio::sync::mpsc;

/// A reasonable upper bound on how long a test should wait on a channel
/// before concluding that the expected item is never going to arrive.
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives the next item from the channel, panicking if nothing
/// arrives within [CHANNEL_TIMEOUT].
pub async fn expect_recv_with_timeout<I: Debug>(receiver: &mut mpsc::Receiver<I>) -> I {
	match tokio::time::timeout(CHANNEL_TIMEOUT, receiver.recv()).await {
		Ok(Some(item)) => item,
		Ok(None) => panic!("channel was closed while waiting to receive an item"),
		Err(_) => panic!("timeout waiting to receive an item ({CHANNEL_TIMEOUT:?})"),
	}
}

/// Same as [expect_recv_with_timeout], but for unbounded channels.
pub async fn expect_unbounded_recv_with_timeout<I: Debug>(
	receiver: &mut mpsc::UnboundedReceiver<I>,
) -> I {
	match tokio::time::timeout(CHANNEL_TIMEOUT, receiver.recv()).await {
		Ok(Some(item)) => item,
		Ok(None) => panic!("channel was closed while waiting to receive an item"),
		Err(_) => panic!("timeout waiting to receive an item ({CHANNEL_TIMEOUT:?})"),
	}
}

/// Asserts that the channel yields nothing within a short grace period,
/// used to check that e.g. a deduplicated session produced no event.
pub async fn assert_no_recv<I: Debug>(receiver: &mut mpsc::Receiver<I>) {
	if let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(200), receiver.recv()).await
	{
		panic!("unexpectedly received an item: {item:?}");
	}
}
