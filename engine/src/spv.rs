//! Boundary to the SPV chain validator. The validator itself (proof of work,
//! linkage, reorg resolution, orphan buffering) lives behind [`SpvChain`];
//! the engine only routes headers into it and reacts to the outcome.

use crate::types::{BlockHash, BlockHeader, BlockHeight};

/// Semantic rejection by the validator. Recoverable: the delivering stream is
/// destroyed and the covered range is re-fetched by the retry machinery.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpvError {
	#[error("header at height {0} does not satisfy proof of work")]
	InvalidProofOfWork(BlockHeight),
	#[error("headers claimed at height {claimed} do not connect to the chain")]
	DoesNotConnect { claimed: BlockHeight },
	#[error("header validation failed: {0}")]
	InvalidHeader(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AddHeadersError {
	/// The validator refused the batch on its merits.
	#[error(transparent)]
	Rejected(#[from] SpvError),
	/// Anything else. Fatal to the current sync run.
	#[error(transparent)]
	Fatal(#[from] anyhow::Error),
}

/// Capability set the engine requires of a chain validator. Implementations
/// inject their own hash function at construction; the engine never hashes.
#[cfg_attr(test, mockall::automock)]
pub trait SpvChain: Send + 'static {
	/// Feed a contiguous batch whose first header is claimed to sit at
	/// `head_height`. Returns the headers actually appended; headers
	/// overlapping pruned or already-known state are silently dropped from
	/// the front of the batch.
	fn add_headers(
		&mut self,
		headers: &[BlockHeader],
		head_height: BlockHeight,
	) -> Result<Vec<BlockHeader>, AddHeadersError>;

	/// Full validation pass over the assembled chain.
	fn validate(&mut self) -> anyhow::Result<()>;

	/// Forget all state and re-anchor so the next `add_headers` call may
	/// start at `from_height` without prior history.
	fn reset(&mut self, from_height: BlockHeight);

	fn hash_by_height(&self, height: BlockHeight) -> Option<BlockHash>;
}
