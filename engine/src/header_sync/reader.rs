//! The reader: fan-out of a historical header range over parallel transport
//! sub-streams with per-stream retry, and the single continuous subscription
//! delivering newly mined headers.
//!
//! All state lives in one task; [`BlockHeadersReader`] is a cloneable client
//! in front of it. Batches are emitted together with a one-shot
//! [`RejectHandle`] and the task does not advance a stream's position until
//! the consumer has accepted (dropped) or rejected the handle, so batch
//! handling is serialized exactly like a synchronous event dispatch.

use std::{collections::BTreeMap, pin::Pin, sync::Arc};

use futures::{
	future::{self, BoxFuture},
	stream::{self, FuturesUnordered},
	Stream, StreamExt,
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamMap;
use tracing::{debug, trace, warn};
use utilities::{task_scope::Scope, UnendingStream};

use crate::{
	backoff,
	constants::READER_EVENT_BUFFER,
	transport::{
		BoxContinuousStream, BoxHeaderStream, ContinuousEvent, HeaderStreamApi, ResumeArgs,
		StreamError,
	},
	types::{BlockHeader, BlockHeight},
};

use super::{
	partition::{partition, SubStream},
	HeaderBatch, ReaderError, ReaderEvent, ReaderOptions, RejectHandle,
};

type StreamId = usize;

enum ReaderRequest {
	ReadHistorical {
		from_height: BlockHeight,
		to_height: BlockHeight,
		reply: oneshot::Sender<Result<(), ReaderError>>,
	},
	SubscribeToNew {
		from_height: BlockHeight,
		reply: oneshot::Sender<Result<(), ReaderError>>,
	},
	StopReadingHistorical {
		reply: oneshot::Sender<()>,
	},
	UnsubscribeFromNew {
		reply: oneshot::Sender<()>,
	},
}

/// Client handle to the reader task. Cheap to clone.
#[derive(Clone)]
pub struct BlockHeadersReader {
	request_sender: mpsc::Sender<ReaderRequest>,
}

impl BlockHeadersReader {
	pub fn new(
		scope: &Scope<'_, anyhow::Error>,
		streams: Arc<dyn HeaderStreamApi>,
		options: ReaderOptions,
	) -> (Self, mpsc::Receiver<ReaderEvent>) {
		let (request_sender, request_receiver) = mpsc::channel(1);
		let (event_sender, event_receiver) = mpsc::channel(READER_EVENT_BUFFER);

		scope.spawn(run_reader(
			ReaderContext { streams, options, events: event_sender },
			request_receiver,
		));

		(Self { request_sender }, event_receiver)
	}

	/// Begin a parallel historical read of `[from_height, to_height]`.
	/// Returns once every sub-stream has been opened, not once the data has
	/// arrived.
	pub async fn read_historical(
		&self,
		from_height: BlockHeight,
		to_height: BlockHeight,
	) -> Result<(), ReaderError> {
		self.request(|reply| ReaderRequest::ReadHistorical { from_height, to_height, reply })
			.await?
	}

	/// Subscribe to headers of newly mined blocks, starting at `from_height`.
	pub async fn subscribe_to_new(&self, from_height: BlockHeight) -> Result<(), ReaderError> {
		self.request(|reply| ReaderRequest::SubscribeToNew { from_height, reply }).await?
	}

	/// Cancel the historical run, if any. Idempotent; no events follow.
	pub async fn stop_reading_historical(&self) {
		let _result = self.request(|reply| ReaderRequest::StopReadingHistorical { reply }).await;
	}

	/// Drop the continuous subscription, if any. Idempotent.
	pub async fn unsubscribe_from_new(&self) {
		let _result = self.request(|reply| ReaderRequest::UnsubscribeFromNew { reply }).await;
	}

	async fn request<T>(
		&self,
		request: impl FnOnce(oneshot::Sender<T>) -> ReaderRequest,
	) -> Result<T, ReaderError> {
		let (reply, receiver) = oneshot::channel();
		self.request_sender.send(request(reply)).await.map_err(|_| ReaderError::Shutdown)?;
		receiver.await.map_err(|_| ReaderError::Shutdown)
	}
}

struct ReaderContext {
	streams: Arc<dyn HeaderStreamApi>,
	options: ReaderOptions,
	events: mpsc::Sender<ReaderEvent>,
}

/// Every sub-stream is chained with an explicit end marker so a clean end is
/// observable before the `StreamMap` drops the exhausted entry.
enum SubStreamItem {
	Frame(Result<Vec<BlockHeader>, StreamError>),
	End,
}

type MarkedSubStream = Pin<Box<dyn Stream<Item = SubStreamItem> + Send>>;

fn with_end_marker(header_stream: BoxHeaderStream) -> MarkedSubStream {
	Box::pin(
		header_stream
			.map(SubStreamItem::Frame)
			.chain(stream::once(future::ready(SubStreamItem::End))),
	)
}

/// An emitted batch whose [`RejectHandle`] the consumer has not yet consumed
/// or dropped. While one is pending the run holds position: no stream is
/// polled, which serializes batch handling exactly like a synchronous event
/// dispatch. The reader task itself stays responsive to requests.
struct PendingVerdict {
	id: StreamId,
	delivered: u32,
	receiver: oneshot::Receiver<anyhow::Error>,
}

struct HistoricalRun {
	live: StreamMap<StreamId, MarkedSubStream>,
	descriptors: BTreeMap<StreamId, SubStream>,
	retry_timers: FuturesUnordered<BoxFuture<'static, StreamId>>,
	pending_verdict: Option<PendingVerdict>,
	/// Set when a sub-stream was cancelled server-side: part of the range is
	/// then uncovered and the run can no longer complete successfully.
	cancelled: bool,
}

enum HistoricalEvent {
	Item(StreamId, SubStreamItem),
	RetryDue(StreamId),
	/// `Ok` carries a rejection; the handle being dropped is an acceptance.
	Verdict(Result<anyhow::Error, oneshot::error::RecvError>),
}

impl HistoricalRun {
	fn new() -> Self {
		Self {
			live: StreamMap::new(),
			descriptors: BTreeMap::new(),
			retry_timers: FuturesUnordered::new(),
			pending_verdict: None,
			cancelled: false,
		}
	}

	fn is_drained(&self) -> bool {
		self.live.is_empty() && self.retry_timers.is_empty()
	}

	async fn next_event(&mut self) -> HistoricalEvent {
		let Self { live, retry_timers, pending_verdict, .. } = self;
		if let Some(pending) = pending_verdict {
			HistoricalEvent::Verdict((&mut pending.receiver).await)
		} else {
			tokio::select! {
				Some((id, item)) = live.next() => HistoricalEvent::Item(id, item),
				id = retry_timers.next_or_pending() => HistoricalEvent::RetryDue(id),
			}
		}
	}
}

struct ContinuousSub {
	stream: BoxContinuousStream,
	from_height: BlockHeight,
	/// Head height of the next expected batch; also the height a reconnect
	/// resumes from, which is what guarantees no height is re-delivered.
	next_height: BlockHeight,
	/// Batch awaiting the consumer's verdict; the stream is not polled while
	/// one is outstanding.
	pending_verdict: Option<ContinuousPending>,
}

struct ContinuousPending {
	delivered: u32,
	head_height: BlockHeight,
	receiver: oneshot::Receiver<anyhow::Error>,
}

enum ContinuousItem {
	Frame(Option<Result<ContinuousEvent, StreamError>>),
	/// `Ok` carries a rejection; the handle being dropped is an acceptance.
	Verdict(Result<anyhow::Error, oneshot::error::RecvError>),
}

async fn run_reader(
	context: ReaderContext,
	mut request_receiver: mpsc::Receiver<ReaderRequest>,
) -> Result<(), anyhow::Error> {
	let mut historical: Option<HistoricalRun> = None;
	let mut continuous: Option<ContinuousSub> = None;

	loop {
		tokio::select! {
			request = request_receiver.recv() => match request {
				Some(request) =>
					handle_request(&context, &mut historical, &mut continuous, request).await,
				// All clients gone.
				None => break Ok(()),
			},
			Some(event) = next_historical_event(&mut historical) =>
				handle_historical_event(&context, &mut historical, event).await,
			Some(item) = next_continuous_item(&mut continuous) =>
				handle_continuous_item(&context, &mut continuous, item).await,
		}
	}
}

async fn next_historical_event(historical: &mut Option<HistoricalRun>) -> Option<HistoricalEvent> {
	match historical.as_mut() {
		Some(run) => Some(run.next_event().await),
		None => None,
	}
}

async fn next_continuous_item(continuous: &mut Option<ContinuousSub>) -> Option<ContinuousItem> {
	match continuous.as_mut() {
		Some(sub) => Some(match &mut sub.pending_verdict {
			Some(pending) => ContinuousItem::Verdict((&mut pending.receiver).await),
			None => ContinuousItem::Frame(sub.stream.next().await),
		}),
		None => None,
	}
}

async fn handle_request(
	context: &ReaderContext,
	historical: &mut Option<HistoricalRun>,
	continuous: &mut Option<ContinuousSub>,
	request: ReaderRequest,
) {
	match request {
		ReaderRequest::ReadHistorical { from_height, to_height, reply } => {
			let _result =
				reply.send(start_historical(context, historical, from_height, to_height).await);
		},
		ReaderRequest::SubscribeToNew { from_height, reply } => {
			let _result = reply.send(start_continuous(context, continuous, from_height).await);
		},
		ReaderRequest::StopReadingHistorical { reply } => {
			// Dropping the run drops every live stream and pending retry,
			// which cancels the transport subscriptions.
			if historical.take().is_some() {
				debug!("historical read stopped");
			}
			let _result = reply.send(());
		},
		ReaderRequest::UnsubscribeFromNew { reply } => {
			if continuous.take().is_some() {
				debug!("unsubscribed from new headers");
			}
			let _result = reply.send(());
		},
	}
}

async fn start_historical(
	context: &ReaderContext,
	historical: &mut Option<HistoricalRun>,
	from_height: BlockHeight,
	to_height: BlockHeight,
) -> Result<(), ReaderError> {
	if historical.is_some() {
		return Err(ReaderError::AlreadyRunning)
	}

	let slices = partition(
		from_height,
		to_height,
		context.options.target_batch_size,
		context.options.max_parallel_streams,
		context.options.max_retries,
	)?;

	// Open every sub-stream before reporting success. On failure the streams
	// already opened are dropped, which cancels them.
	let streams = future::try_join_all(
		slices
			.iter()
			.map(|slice| context.streams.open_historical(slice.from_height, slice.remaining_count)),
	)
	.await
	.map_err(ReaderError::Open)?;

	debug!(from_height, to_height, sub_streams = slices.len(), "historical read started");

	let mut run = HistoricalRun::new();
	for (id, (slice, header_stream)) in slices.into_iter().zip(streams).enumerate() {
		run.live.insert(id, with_end_marker(header_stream));
		run.descriptors.insert(id, slice);
	}
	*historical = Some(run);
	Ok(())
}

async fn start_continuous(
	context: &ReaderContext,
	continuous: &mut Option<ContinuousSub>,
	from_height: BlockHeight,
) -> Result<(), ReaderError> {
	if continuous.is_some() {
		return Err(ReaderError::AlreadyRunning)
	}
	if from_height < 1 {
		return Err(ReaderError::InvalidHeight)
	}

	let stream =
		context.streams.open_continuous(from_height).await.map_err(ReaderError::Open)?;

	debug!(from_height, "subscribed to new block headers");

	*continuous =
		Some(ContinuousSub { stream, from_height, next_height: from_height, pending_verdict: None });
	Ok(())
}

async fn handle_historical_event(
	context: &ReaderContext,
	historical: &mut Option<HistoricalRun>,
	event: HistoricalEvent,
) {
	match event {
		HistoricalEvent::Item(id, SubStreamItem::Frame(Ok(headers))) =>
			handle_historical_batch(context, historical, id, headers).await,
		HistoricalEvent::Item(id, SubStreamItem::Frame(Err(StreamError::Cancelled))) => {
			// Absorbed: a cancelled sub-stream is abandoned without retry.
			let run = expect_run(historical);
			run.live.remove(&id);
			run.descriptors.remove(&id);
			run.cancelled = true;
			debug!("historical sub-stream {id} cancelled");
			try_finish(context, historical).await;
		},
		HistoricalEvent::Item(id, SubStreamItem::Frame(Err(StreamError::Transport(error)))) =>
			handle_sub_stream_failure(context, historical, id, error).await,
		HistoricalEvent::Item(id, SubStreamItem::End) => {
			let run = expect_run(historical);
			run.live.remove(&id);
			let descriptor =
				run.descriptors.remove(&id).expect("descriptor exists for live sub-stream");
			if descriptor.remaining_count > 0 {
				warn!(
					"historical sub-stream {id} ended {} headers short of its range",
					descriptor.remaining_count
				);
			} else {
				trace!("historical sub-stream {id} ended");
			}
			try_finish(context, historical).await;
		},
		HistoricalEvent::RetryDue(id) => retry_sub_stream(context, historical, id).await,
		HistoricalEvent::Verdict(outcome) => {
			let pending = expect_run(historical)
				.pending_verdict
				.take()
				.expect("verdict events only arrive while a batch is outstanding");
			match outcome {
				// Handle dropped without rejection: the batch is accepted and
				// the stream's position advances.
				Err(_) => {
					expect_run(historical)
						.descriptors
						.get_mut(&pending.id)
						.expect("descriptor exists for live sub-stream")
						.advance(pending.delivered);
				},
				Ok(error) => {
					// The consumer destroyed the stream; the failure takes
					// the same path as a transport error, so the range is
					// re-fetched.
					warn!("historical batch rejected: {error:#}");
					handle_sub_stream_failure(context, historical, pending.id, error).await;
				},
			}
		},
	}
}

async fn handle_historical_batch(
	context: &ReaderContext,
	historical: &mut Option<HistoricalRun>,
	id: StreamId,
	headers: Vec<BlockHeader>,
) {
	if headers.is_empty() {
		return
	}

	let delivered = headers.len() as u32;
	let head_height = {
		let run = expect_run(historical);
		run.descriptors.get(&id).expect("descriptor exists for live sub-stream").next_height
	};

	trace!("historical sub-stream {id} delivered {delivered} headers at height {head_height}");

	let (handle, receiver) = RejectHandle::new();
	if context
		.events
		.send(ReaderEvent::Batch(HeaderBatch { headers, head_height }, handle))
		.await
		.is_err()
	{
		// Consumer gone; tear the run down.
		*historical = None;
		return
	}

	expect_run(historical).pending_verdict = Some(PendingVerdict { id, delivered, receiver });
}

async fn handle_sub_stream_failure(
	context: &ReaderContext,
	historical: &mut Option<HistoricalRun>,
	id: StreamId,
	error: anyhow::Error,
) {
	let run = expect_run(historical);
	run.live.remove(&id);

	let descriptor =
		run.descriptors.get_mut(&id).expect("descriptor exists for failed sub-stream");

	if descriptor.remaining_count == 0 {
		// The full range was already delivered; the failure is an end.
		run.descriptors.remove(&id);
		debug!("historical sub-stream {id} failed after delivering its range: {error:#}");
		try_finish(context, historical).await;
	} else if descriptor.retries_left > 0 {
		descriptor.retries_left -= 1;
		let attempt = context.options.max_retries - descriptor.retries_left - 1;
		let delay = backoff::retry_delay(context.options.retry_delay, attempt);
		warn!(
			"historical sub-stream {id} failed at height {}, retrying in {}ms ({} retries left): {error:#}",
			descriptor.next_height,
			delay.as_millis(),
			descriptor.retries_left,
		);
		run.retry_timers.push(Box::pin(async move {
			tokio::time::sleep(delay).await;
			id
		}));
	} else {
		fail_run(context, historical, error).await;
	}
}

async fn retry_sub_stream(
	context: &ReaderContext,
	historical: &mut Option<HistoricalRun>,
	id: StreamId,
) {
	let (from_height, count) = {
		let run = expect_run(historical);
		let descriptor =
			run.descriptors.get(&id).expect("descriptor exists for retrying sub-stream");
		(descriptor.next_height, descriptor.remaining_count)
	};

	match context.streams.open_historical(from_height, count).await {
		Ok(header_stream) => {
			debug!("historical sub-stream {id} resumed at height {from_height}");
			expect_run(historical).live.insert(id, with_end_marker(header_stream));
		},
		// A failed reopen is fatal to the whole run.
		Err(error) =>
			fail_run(context, historical, error.context("failed to reopen sub-stream")).await,
	}
}

/// Emit `HistoricalDataObtained` once the live and retry sets are empty,
/// strictly after every batch of the run.
async fn try_finish(context: &ReaderContext, historical: &mut Option<HistoricalRun>) {
	let run = expect_run(historical);
	if !run.is_drained() {
		return
	}

	let cancelled = run.cancelled;
	*historical = None;
	if cancelled {
		warn!("historical read abandoned after sub-stream cancellation");
	} else {
		debug!("historical read complete");
		let _result = context.events.send(ReaderEvent::HistoricalDataObtained).await;
	}
}

/// Tear the run down, cancelling every other live stream, then surface the
/// failure.
async fn fail_run(
	context: &ReaderContext,
	historical: &mut Option<HistoricalRun>,
	error: anyhow::Error,
) {
	*historical = None;
	warn!("historical read failed: {error:#}");
	let _result = context.events.send(ReaderEvent::Error(error)).await;
}

fn expect_run(historical: &mut Option<HistoricalRun>) -> &mut HistoricalRun {
	historical.as_mut().expect("events can only arrive while a run is active")
}

async fn handle_continuous_item(
	context: &ReaderContext,
	continuous: &mut Option<ContinuousSub>,
	item: ContinuousItem,
) {
	let frame = match item {
		ContinuousItem::Frame(frame) => frame,
		ContinuousItem::Verdict(outcome) => {
			let sub = continuous.as_mut().expect("verdicts can only arrive while subscribed");
			let pending = sub
				.pending_verdict
				.take()
				.expect("verdict events only arrive while a batch is outstanding");
			match outcome {
				Err(_) => {
					sub.next_height += pending.delivered;
					trace!("new headers accepted up to height {}", sub.next_height - 1);
				},
				Ok(error) => {
					// Destroyed by the consumer. The continuous stream has no
					// retry budget; the failure surfaces directly.
					*continuous = None;
					warn!(
						"continuous batch at height {} rejected: {error:#}",
						pending.head_height
					);
					let _result = context.events.send(ReaderEvent::Error(error)).await;
				},
			}
			return
		},
	};

	match frame {
		Some(Ok(ContinuousEvent::Headers(headers))) => {
			if headers.is_empty() {
				return
			}

			let delivered = headers.len() as u32;
			let head_height =
				continuous.as_ref().expect("items can only arrive while subscribed").next_height;

			let (handle, receiver) = RejectHandle::new();
			if context
				.events
				.send(ReaderEvent::Batch(HeaderBatch { headers, head_height }, handle))
				.await
				.is_err()
			{
				*continuous = None;
				return
			}

			continuous.as_mut().expect("items can only arrive while subscribed").pending_verdict =
				Some(ContinuousPending { delivered, head_height, receiver });
		},
		Some(Ok(ContinuousEvent::BeforeReconnect(handle))) => {
			let sub = continuous.as_ref().expect("items can only arrive while subscribed");
			let args = ResumeArgs { from_height: sub.next_height, count: 0 };
			debug!(
				"continuous stream reconnecting, resuming at height {} (subscribed at {})",
				args.from_height, sub.from_height
			);
			handle.resume_from(args);
		},
		Some(Err(StreamError::Cancelled)) => {
			*continuous = None;
			debug!("continuous stream cancelled");
		},
		Some(Err(StreamError::Transport(error))) => {
			*continuous = None;
			warn!("continuous stream failed: {error:#}");
			let _result = context.events.send(ReaderEvent::Error(error)).await;
		},
		None => {
			// Transparent re-subscription happens inside the transport via
			// BeforeReconnect; a bare end just clears the subscription.
			*continuous = None;
			debug!("continuous stream ended");
		},
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicU32, Ordering},
		time::Duration,
	};

	use futures::FutureExt;
	use tokio_stream::wrappers::ReceiverStream;
	use utilities::task_scope::task_scope;

	use crate::transport::{MockHeaderStreamApi, ResumeHandle};

	use super::*;

	fn header(height: u8) -> BlockHeader {
		BlockHeader::from_bytes([height; 80])
	}

	fn headers(heights: std::ops::RangeInclusive<u8>) -> Vec<BlockHeader> {
		heights.map(header).collect()
	}

	fn options(max_retries: u32, target_batch_size: u32) -> ReaderOptions {
		ReaderOptions {
			max_retries,
			max_parallel_streams: 6,
			target_batch_size,
			retry_delay: Duration::from_millis(10),
		}
	}

	async fn expect_batch(
		events: &mut mpsc::Receiver<ReaderEvent>,
		head_height: BlockHeight,
		len: usize,
	) {
		match events.recv().await.unwrap() {
			ReaderEvent::Batch(batch, _accept) => {
				assert_eq!(batch.head_height, head_height);
				assert_eq!(batch.headers.len(), len);
			},
			event => panic!("expected batch, got {event:?}"),
		}
	}

	async fn expect_no_event(events: &mut mpsc::Receiver<ReaderEvent>) {
		tokio::time::timeout(Duration::from_millis(50), events.recv()).await.unwrap_err();
	}

	fn frames_stream(frames: Vec<Result<Vec<BlockHeader>, StreamError>>) -> BoxHeaderStream {
		Box::pin(stream::iter(frames))
	}

	#[tokio::test]
	async fn opens_one_sub_stream_per_slice() {
		task_scope(|scope| {
			async move {
				let mut api = MockHeaderStreamApi::new();
				for (from, count) in [(1u32, 12u32), (13, 12), (25, 10)] {
					api.expect_open_historical()
						.withf(move |&f, &c| (f, c) == (from, count))
						.times(1)
						.returning(|from, count| {
							Ok(frames_stream(vec![Ok(headers(
								from as u8..=(from + count - 1) as u8,
							))]))
						});
				}

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(0, 10));
				reader.read_historical(1, 34).await.unwrap();

				let mut total = 0;
				for _ in 0..3 {
					match events.recv().await.unwrap() {
						ReaderEvent::Batch(batch, _accept) => total += batch.headers.len(),
						event => panic!("expected batch, got {event:?}"),
					}
				}
				assert_eq!(total, 34);
				assert!(matches!(
					events.recv().await.unwrap(),
					ReaderEvent::HistoricalDataObtained
				));
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test(start_paused = true)]
	async fn retry_resumes_mid_range() {
		task_scope(|scope| {
			async move {
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_historical()
					.withf(|&from, &count| (from, count) == (1, 12))
					.times(1)
					.returning(|_, _| {
						Ok(frames_stream(vec![
							Ok(headers(1..=4)),
							Err(StreamError::Transport(anyhow::anyhow!("connection reset"))),
						]))
					});
				api.expect_open_historical()
					.withf(|&from, &count| (from, count) == (5, 8))
					.times(1)
					.returning(|_, _| Ok(frames_stream(vec![Ok(headers(5..=12))])));

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(1, 50));
				reader.read_historical(1, 12).await.unwrap();

				expect_batch(&mut events, 1, 4).await;
				expect_batch(&mut events, 5, 8).await;
				assert!(matches!(
					events.recv().await.unwrap(),
					ReaderEvent::HistoricalDataObtained
				));
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test(start_paused = true)]
	async fn exhausted_retries_fail_the_run_with_the_last_error() {
		task_scope(|scope| {
			async move {
				let failures = AtomicU32::new(0);
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_historical().times(2).returning(move |_, _| {
					let failure = failures.fetch_add(1, Ordering::Relaxed) + 1;
					Ok(frames_stream(vec![Err(StreamError::Transport(anyhow::anyhow!(
						"failure {failure}"
					)))]))
				});

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(1, 50));
				reader.read_historical(1, 12).await.unwrap();

				match events.recv().await.unwrap() {
					ReaderEvent::Error(error) => assert_eq!(error.to_string(), "failure 2"),
					event => panic!("expected error, got {event:?}"),
				}
				expect_no_event(&mut events).await;
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test(start_paused = true)]
	async fn rejected_batch_is_refetched_through_the_retry_path() {
		task_scope(|scope| {
			async move {
				let mut api = MockHeaderStreamApi::new();
				let mut open_calls = mockall::Sequence::new();
				api.expect_open_historical()
					.withf(|&from, &count| (from, count) == (1, 10))
					.times(1)
					.in_sequence(&mut open_calls)
					.returning(|_, _| Ok(frames_stream(vec![Ok(headers(1..=4))])));
				api.expect_open_historical()
					.withf(|&from, &count| (from, count) == (1, 10))
					.times(1)
					.in_sequence(&mut open_calls)
					.returning(|_, _| Ok(frames_stream(vec![Ok(headers(1..=10))])));

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(1, 50));
				reader.read_historical(1, 10).await.unwrap();

				match events.recv().await.unwrap() {
					ReaderEvent::Batch(batch, reject) => {
						assert_eq!(batch.head_height, 1);
						reject.reject(anyhow::anyhow!("does not connect"));
					},
					event => panic!("expected batch, got {event:?}"),
				}

				// The replacement starts over: the rejected range did not
				// count as delivered.
				expect_batch(&mut events, 1, 10).await;
				assert!(matches!(
					events.recv().await.unwrap(),
					ReaderEvent::HistoricalDataObtained
				));
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn stop_is_silent_and_idempotent() {
		task_scope(|scope| {
			async move {
				let (_frame_sender, frame_receiver) = mpsc::channel(1);
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_historical().times(1).return_once(move |_, _| {
					Ok(Box::pin(ReceiverStream::new(frame_receiver)) as BoxHeaderStream)
				});

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(0, 50));
				reader.read_historical(1, 10).await.unwrap();

				reader.stop_reading_historical().await;
				reader.stop_reading_historical().await;

				expect_no_event(&mut events).await;
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn server_side_cancellation_is_absorbed() {
		task_scope(|scope| {
			async move {
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_historical()
					.times(1)
					.returning(|_, _| Ok(frames_stream(vec![Err(StreamError::Cancelled)])));

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(3, 50));
				reader.read_historical(1, 10).await.unwrap();

				expect_no_event(&mut events).await;
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn historical_read_rejects_bad_arguments_and_reentry() {
		task_scope(|scope| {
			async move {
				let (_frame_sender, frame_receiver) = mpsc::channel(1);
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_historical().times(1).return_once(move |_, _| {
					Ok(Box::pin(ReceiverStream::new(frame_receiver)) as BoxHeaderStream)
				});

				let (reader, _events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(0, 50));

				assert!(matches!(
					reader.read_historical(0, 10).await,
					Err(ReaderError::InvalidHeight)
				));
				assert!(matches!(
					reader.read_historical(10, 9).await,
					Err(ReaderError::InvalidRange { from_height: 10, to_height: 9 })
				));

				reader.read_historical(1, 10).await.unwrap();
				assert!(matches!(
					reader.read_historical(1, 10).await,
					Err(ReaderError::AlreadyRunning)
				));
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn open_failure_is_returned_to_the_caller() {
		task_scope(|scope| {
			async move {
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_historical()
					.returning(|_, _| Err(anyhow::anyhow!("no backend available")));

				let (reader, _events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(0, 50));

				assert!(matches!(
					reader.read_historical(1, 10).await,
					Err(ReaderError::Open(_))
				));
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn continuous_reconnect_resumes_without_duplicates() {
		task_scope(|scope| {
			async move {
				let (frame_sender, frame_receiver) = mpsc::channel(8);
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_continuous().withf(|&from| from == 100).times(1).return_once(
					move |_| Ok(Box::pin(ReceiverStream::new(frame_receiver)) as BoxContinuousStream),
				);

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(0, 50));
				reader.subscribe_to_new(100).await.unwrap();

				frame_sender
					.send(Ok(ContinuousEvent::Headers(headers(100..=101))))
					.await
					.unwrap();
				expect_batch(&mut events, 100, 2).await;

				let (resume_handle, resume_receiver) = ResumeHandle::new();
				frame_sender
					.send(Ok(ContinuousEvent::BeforeReconnect(resume_handle)))
					.await
					.unwrap();
				assert_eq!(
					resume_receiver.await.unwrap(),
					ResumeArgs { from_height: 102, count: 0 }
				);

				frame_sender
					.send(Ok(ContinuousEvent::Headers(headers(102..=102))))
					.await
					.unwrap();
				expect_batch(&mut events, 102, 1).await;
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn reconnect_before_any_delivery_resumes_at_the_subscription_height() {
		task_scope(|scope| {
			async move {
				let (frame_sender, frame_receiver) = mpsc::channel(8);
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_continuous().times(1).return_once(move |_| {
					Ok(Box::pin(ReceiverStream::new(frame_receiver)) as BoxContinuousStream)
				});

				let (reader, _events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(0, 50));
				reader.subscribe_to_new(100).await.unwrap();

				let (resume_handle, resume_receiver) = ResumeHandle::new();
				frame_sender
					.send(Ok(ContinuousEvent::BeforeReconnect(resume_handle)))
					.await
					.unwrap();
				assert_eq!(
					resume_receiver.await.unwrap(),
					ResumeArgs { from_height: 100, count: 0 }
				);
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn continuous_cancellation_is_absorbed_and_clears_the_subscription() {
		task_scope(|scope| {
			async move {
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_continuous()
					.times(2)
					.returning(|_| Ok(Box::pin(stream::iter(vec![Err(StreamError::Cancelled)])) as BoxContinuousStream));

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(0, 50));

				reader.subscribe_to_new(100).await.unwrap();
				expect_no_event(&mut events).await;

				// The cancelled subscription was cleared, so a new one opens.
				reader.subscribe_to_new(100).await.unwrap();
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn continuous_transport_error_is_surfaced() {
		task_scope(|scope| {
			async move {
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_continuous().times(1).returning(|_| {
					Ok(Box::pin(stream::iter(vec![Err(StreamError::Transport(
						anyhow::anyhow!("connection lost"),
					))])) as BoxContinuousStream)
				});

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(0, 50));
				reader.subscribe_to_new(100).await.unwrap();

				match events.recv().await.unwrap() {
					ReaderEvent::Error(error) =>
						assert_eq!(error.to_string(), "connection lost"),
					event => panic!("expected error, got {event:?}"),
				}
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn rejected_continuous_batch_destroys_the_subscription() {
		task_scope(|scope| {
			async move {
				let (frame_sender, frame_receiver) = mpsc::channel(8);
				let mut api = MockHeaderStreamApi::new();
				api.expect_open_continuous().times(1).return_once(move |_| {
					Ok(Box::pin(ReceiverStream::new(frame_receiver)) as BoxContinuousStream)
				});

				let (reader, mut events) =
					BlockHeadersReader::new(scope, Arc::new(api), options(0, 50));
				reader.subscribe_to_new(100).await.unwrap();

				frame_sender
					.send(Ok(ContinuousEvent::Headers(headers(100..=100))))
					.await
					.unwrap();
				match events.recv().await.unwrap() {
					ReaderEvent::Batch(_, reject) =>
						reject.reject(anyhow::anyhow!("bad proof of work")),
					event => panic!("expected batch, got {event:?}"),
				}

				match events.recv().await.unwrap() {
					ReaderEvent::Error(error) =>
						assert_eq!(error.to_string(), "bad proof of work"),
					event => panic!("expected error, got {event:?}"),
				}
				Ok(())
			}
			.boxed()
		})
		.await
		.unwrap()
	}
}
