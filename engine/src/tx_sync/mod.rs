//! Filtered transaction synchronisation: one server-side-filtered stream of
//! raw transactions interleaved with the merkle blocks proving them,
//! consumer-driven merkle-block acceptance, and bloom-filter growth via
//! stream restart.

pub mod reader;
pub mod session;

use tokio::sync::oneshot;

use crate::types::{Address, BlockHeight};

/// One-shot channel for addresses the consumer generates while processing
/// matched transactions (HD wallet gap-limit advancement). They are folded
/// into the watched set at the next merkle-block acceptance. Dropping the
/// handle appends nothing.
#[derive(Debug)]
pub struct AppendAddressesHandle {
	sender: oneshot::Sender<Vec<Address>>,
}

impl AppendAddressesHandle {
	pub(crate) fn new() -> (Self, oneshot::Receiver<Vec<Address>>) {
		let (sender, receiver) = oneshot::channel();
		(Self { sender }, receiver)
	}

	pub fn append(self, addresses: Vec<Address>) {
		let _result = self.sender.send(addresses);
	}
}

#[derive(Debug)]
pub(crate) enum MerkleVerdict {
	Accept { height: BlockHeight, new_addresses: Vec<Address> },
	Reject(anyhow::Error),
}

/// Two-phase commit handle for a merkle block.
///
/// Move-only: exactly one of `accept`/`reject` can ever be invoked, and the
/// reader does not process further frames until the verdict is in. Dropping
/// the handle without a verdict violates the contract and destroys the
/// stream.
#[derive(Debug)]
pub struct MerkleBlockHandle {
	sender: oneshot::Sender<MerkleVerdict>,
}

impl MerkleBlockHandle {
	pub(crate) fn new() -> (Self, oneshot::Receiver<MerkleVerdict>) {
		let (sender, receiver) = oneshot::channel();
		(Self { sender }, receiver)
	}

	/// Accept the merkle block at `height`.
	pub fn accept(self, height: BlockHeight) {
		self.accept_with_addresses(height, Vec::new())
	}

	/// Accept and grow the watched set. If the set actually grows, the
	/// stream restarts once from `height + 1` with the enlarged filter.
	pub fn accept_with_addresses(self, height: BlockHeight, new_addresses: Vec<Address>) {
		let _result = self.sender.send(MerkleVerdict::Accept { height, new_addresses });
	}

	pub fn reject(self, error: anyhow::Error) {
		let _result = self.sender.send(MerkleVerdict::Reject(error));
	}
}

/// Events emitted by [`reader::TransactionsReader`].
#[derive(Debug)]
pub enum TransactionsEvent {
	/// Transactions relevant to the watched addresses.
	NewTransactions(Vec<bitcoin::Transaction>, AppendAddressesHandle),
	/// A merkle block proving previously delivered transactions. Must be
	/// accepted or rejected before the stream continues.
	MerkleBlock(bitcoin::merkle_tree::MerkleBlock, MerkleBlockHandle),
	/// The historical range was fully delivered.
	HistoricalDataObtained,
	/// Terminal failure of the run.
	Error(anyhow::Error),
}
