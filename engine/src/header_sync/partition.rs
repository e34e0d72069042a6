//! The historical plan: how a height range is split into parallel
//! sub-streams, and the per-sub-stream progress bookkeeping.

use core::cmp::min;

use crate::types::BlockHeight;

use super::ReaderError;

/// One contiguous slice of a historical read.
///
/// `next_height` is both the head height of the next batch this slice will
/// emit and the height a replacement stream resumes from after a transient
/// failure. It only advances once a batch has been accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubStream {
	pub from_height: BlockHeight,
	pub next_height: BlockHeight,
	pub remaining_count: u32,
	pub retries_left: u32,
}

impl SubStream {
	pub fn new(from_height: BlockHeight, count: u32, max_retries: u32) -> Self {
		Self { from_height, next_height: from_height, remaining_count: count, retries_left: max_retries }
	}

	pub fn advance(&mut self, delivered: u32) {
		self.next_height += delivered;
		self.remaining_count = self.remaining_count.saturating_sub(delivered);
	}
}

// A range within 1.4x of the target batch size is not worth splitting.
const SINGLE_STREAM_FACTOR_TENTHS: u64 = 14;

/// Split `[from_height, to_height]` into at most `max_parallel_streams`
/// contiguous slices of roughly `target_batch_size` headers each. The final
/// slice absorbs the remainder. The union of the slices covers the range
/// exactly once.
pub fn partition(
	from_height: BlockHeight,
	to_height: BlockHeight,
	target_batch_size: u32,
	max_parallel_streams: u32,
	max_retries: u32,
) -> Result<Vec<SubStream>, ReaderError> {
	if from_height < 1 {
		return Err(ReaderError::InvalidHeight)
	}
	if to_height < from_height {
		return Err(ReaderError::InvalidRange { from_height, to_height })
	}

	let total = u64::from(to_height) - u64::from(from_height) + 1;
	let target = u64::from(target_batch_size).max(1);

	if total * 10 <= target * SINGLE_STREAM_FACTOR_TENTHS {
		return Ok(vec![SubStream::new(from_height, total as u32, max_retries)])
	}

	// Round half-up to the nearest whole number of target-sized streams,
	// then cap by the allowed parallelism.
	let num_streams =
		min((total + target / 2) / target, u64::from(max_parallel_streams)).max(1);
	let per = total.div_ceil(num_streams);

	let mut slices = Vec::with_capacity(num_streams as usize);
	let mut next_height = u64::from(from_height);
	let mut remaining = total;
	while (slices.len() as u64) + 1 < num_streams && remaining > per {
		slices.push(SubStream::new(next_height as BlockHeight, per as u32, max_retries));
		next_height += per;
		remaining -= per;
	}
	slices.push(SubStream::new(next_height as BlockHeight, remaining as u32, max_retries));

	Ok(slices)
}
