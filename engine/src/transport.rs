//! The wire boundary. Transports deliver pre-decoded frames over boxed
//! streams; heights are never carried on the wire, the sync layer derives
//! them from its own position tracking. Dropping a stream cancels the
//! underlying server-side subscription.

use std::pin::Pin;

use futures::Stream;
use tokio::sync::oneshot;

use crate::types::{Address, BlockHeader, BlockHeight};

/// Error surfaced by a transport stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
	/// The subscription was cancelled, by either end. Absorbed by the sync
	/// layer: never retried, never surfaced.
	#[error("stream cancelled")]
	Cancelled,
	/// Any other transport failure. Candidate for retry.
	#[error(transparent)]
	Transport(#[from] anyhow::Error),
}

pub type BoxHeaderStream =
	Pin<Box<dyn Stream<Item = Result<Vec<BlockHeader>, StreamError>> + Send>>;

/// Subscription arguments a continuous stream resumes with after a
/// transparent reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeArgs {
	pub from_height: BlockHeight,
	/// Always 0 for continuous subscriptions.
	pub count: u32,
}

/// Handed out by a continuous stream immediately before it transparently
/// reconnects; the subscriber answers with the arguments the new
/// subscription should use. Dropping the handle reconnects with the
/// original arguments.
#[derive(Debug)]
pub struct ResumeHandle {
	sender: oneshot::Sender<ResumeArgs>,
}

impl ResumeHandle {
	pub fn new() -> (Self, oneshot::Receiver<ResumeArgs>) {
		let (sender, receiver) = oneshot::channel();
		(Self { sender }, receiver)
	}

	pub fn resume_from(self, args: ResumeArgs) {
		let _result = self.sender.send(args);
	}
}

/// Frame of a continuous header subscription.
#[derive(Debug)]
pub enum ContinuousEvent {
	Headers(Vec<BlockHeader>),
	/// The transport is about to reconnect and invites the subscriber to
	/// amend the subscription arguments first.
	BeforeReconnect(ResumeHandle),
}

pub type BoxContinuousStream =
	Pin<Box<dyn Stream<Item = Result<ContinuousEvent, StreamError>> + Send>>;

/// Frame of a filtered transaction subscription: raw transactions matched by
/// the server-side bloom filter, interleaved with the merkle blocks proving
/// their inclusion.
#[derive(Debug, Clone)]
pub enum TransactionsFrame {
	RawTransactions(Vec<Vec<u8>>),
	RawMerkleBlock(Vec<u8>),
}

pub type BoxTransactionsStream =
	Pin<Box<dyn Stream<Item = Result<TransactionsFrame, StreamError>> + Send>>;

/// Opens block header subscriptions against the backing node fleet.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait HeaderStreamApi: Send + Sync + 'static {
	async fn open_historical(
		&self,
		from_height: BlockHeight,
		count: u32,
	) -> anyhow::Result<BoxHeaderStream>;

	async fn open_continuous(&self, from_height: BlockHeight)
		-> anyhow::Result<BoxContinuousStream>;
}

/// Opens filtered transaction subscriptions. The address set becomes the
/// server-side bloom filter. `count == 0` keeps the subscription open for
/// newly mined blocks.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait TransactionStreamApi: Send + Sync + 'static {
	async fn open_transactions(
		&self,
		addresses: Vec<Address>,
		from_height: BlockHeight,
		count: u32,
	) -> anyhow::Result<BoxTransactionsStream>;
}
