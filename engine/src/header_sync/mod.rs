//! Block header synchronisation: parallel historical reads and the
//! continuous subscription ([`reader`]), coordinated with the SPV chain
//! validator ([`provider`]).

pub mod partition;
pub mod provider;
pub mod reader;

use std::time::Duration;

use tokio::sync::oneshot;

use crate::{
	constants::{
		DEFAULT_MAX_PARALLEL_STREAMS, DEFAULT_MAX_RETRIES, DEFAULT_STREAM_RETRY_DELAY,
		DEFAULT_TARGET_BATCH_SIZE,
	},
	types::{BlockHeader, BlockHeight},
};

#[derive(Debug, Clone)]
pub struct ReaderOptions {
	/// Transient failures tolerated per sub-stream, not per run.
	pub max_retries: u32,
	pub max_parallel_streams: u32,
	pub target_batch_size: u32,
	/// Base delay before the first retry of a failed sub-stream.
	pub retry_delay: Duration,
}

impl Default for ReaderOptions {
	fn default() -> Self {
		Self {
			max_retries: DEFAULT_MAX_RETRIES,
			max_parallel_streams: DEFAULT_MAX_PARALLEL_STREAMS,
			target_batch_size: DEFAULT_TARGET_BATCH_SIZE,
			retry_delay: DEFAULT_STREAM_RETRY_DELAY,
		}
	}
}

/// A contiguous run of headers whose first element sits at `head_height`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBatch {
	pub headers: Vec<BlockHeader>,
	pub head_height: BlockHeight,
}

/// One-shot rejection capability handed out with every [`HeaderBatch`].
///
/// Dropping the handle accepts the batch and the delivering stream moves on.
/// `reject` destroys the delivering stream with the given error; the covered
/// range is then re-fetched through the retry machinery. The reader does not
/// process further frames from that stream until the handle is consumed or
/// dropped.
#[derive(Debug)]
pub struct RejectHandle {
	sender: oneshot::Sender<anyhow::Error>,
}

impl RejectHandle {
	pub(crate) fn new() -> (Self, oneshot::Receiver<anyhow::Error>) {
		let (sender, receiver) = oneshot::channel();
		(Self { sender }, receiver)
	}

	pub fn reject(self, error: anyhow::Error) {
		let _result = self.sender.send(error);
	}
}

/// Events emitted by [`reader::BlockHeadersReader`] towards its consumer.
#[derive(Debug)]
pub enum ReaderEvent {
	/// A header batch from one of the underlying streams. Between
	/// sub-streams no ordering is guaranteed; within one sub-stream head
	/// heights strictly increase.
	Batch(HeaderBatch, RejectHandle),
	/// Every historical sub-stream ended cleanly; fired exactly once per
	/// successful `read_historical` run.
	HistoricalDataObtained,
	/// Terminal failure of the current run. All streams are torn down
	/// before this fires.
	Error(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
	#[error("from_height must be at least 1")]
	InvalidHeight,
	#[error("invalid header range: to_height {to_height} is below from_height {from_height}")]
	InvalidRange { from_height: BlockHeight, to_height: BlockHeight },
	#[error("a read is already in progress")]
	AlreadyRunning,
	#[error("failed to open stream: {0}")]
	Open(anyhow::Error),
	#[error("the reader task has shut down")]
	Shutdown,
}
