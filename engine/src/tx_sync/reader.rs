//! The filtered transaction reader: one stream at a time, delivering
//! transactions that pay watched addresses and the merkle blocks proving
//! them. Acceptance of every merkle block is driven by the consumer; when an
//! acceptance grows the watched set, the stream is restarted once from the
//! accepted height with the enlarged server-side filter.

use std::{collections::BTreeSet, sync::Arc};

use bitcoin::consensus;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use utilities::task_scope::Scope;

use crate::{
	constants::READER_EVENT_BUFFER,
	header_sync::ReaderError,
	transport::{BoxTransactionsStream, StreamError, TransactionStreamApi, TransactionsFrame},
	types::{Address, BlockHeight},
};

use super::{
	session::{FilterSession, RestartArgs},
	AppendAddressesHandle, MerkleBlockHandle, MerkleVerdict, TransactionsEvent,
};

/// Returns the transactions with at least one output paying a watched
/// address.
pub fn relevant_transactions(
	transactions: Vec<bitcoin::Transaction>,
	addresses: &BTreeSet<Address>,
) -> Vec<bitcoin::Transaction> {
	transactions
		.into_iter()
		.filter(|transaction| {
			transaction
				.output
				.iter()
				.any(|tx_out| addresses.contains(tx_out.script_pubkey.as_bytes()))
		})
		.collect()
}

enum TxRequest {
	StartSync {
		addresses: Vec<Address>,
		from_height: BlockHeight,
		count: u32,
		reply: oneshot::Sender<Result<(), ReaderError>>,
	},
	Stop {
		reply: oneshot::Sender<()>,
	},
}

/// Client handle to the transaction reader task. Cheap to clone.
#[derive(Clone)]
pub struct TransactionsReader {
	request_sender: mpsc::Sender<TxRequest>,
}

impl TransactionsReader {
	pub fn new(
		scope: &Scope<'_, anyhow::Error>,
		streams: Arc<dyn TransactionStreamApi>,
	) -> (Self, mpsc::Receiver<TransactionsEvent>) {
		let (request_sender, request_receiver) = mpsc::channel(1);
		let (event_sender, event_receiver) = mpsc::channel(READER_EVENT_BUFFER);

		scope.spawn(run_transactions_reader(
			TxReaderContext { streams, events: event_sender },
			request_receiver,
		));

		(Self { request_sender }, event_receiver)
	}

	/// Open a filtered subscription for `addresses`, covering `count` blocks
	/// from `from_height`. `count == 0` keeps the subscription open for
	/// newly mined blocks.
	pub async fn start_sync(
		&self,
		addresses: Vec<Address>,
		from_height: BlockHeight,
		count: u32,
	) -> Result<(), ReaderError> {
		let (reply, receiver) = oneshot::channel();
		self.request_sender
			.send(TxRequest::StartSync { addresses, from_height, count, reply })
			.await
			.map_err(|_| ReaderError::Shutdown)?;
		receiver.await.map_err(|_| ReaderError::Shutdown)?
	}

	/// Drop the subscription, if any. Idempotent.
	pub async fn stop(&self) {
		let (reply, receiver) = oneshot::channel();
		if self.request_sender.send(TxRequest::Stop { reply }).await.is_ok() {
			let _result = receiver.await;
		}
	}
}

struct TxReaderContext {
	streams: Arc<dyn TransactionStreamApi>,
	events: mpsc::Sender<TransactionsEvent>,
}

/// Consumer reply the run is waiting for. No further frames are polled while
/// one is outstanding, which serializes frame handling; the reader task
/// itself stays responsive to requests.
enum TxPending {
	Append(oneshot::Receiver<Vec<Address>>),
	Merkle(oneshot::Receiver<MerkleVerdict>),
}

struct TxRun {
	stream: BoxTransactionsStream,
	session: FilterSession,
	from_height: BlockHeight,
	count: u32,
	pending: Option<TxPending>,
}

impl TxRun {
	fn is_historical(&self) -> bool {
		self.count > 0
	}

	fn last_height(&self) -> BlockHeight {
		self.from_height + self.count - 1
	}
}

enum TxItem {
	Frame(Option<Result<TransactionsFrame, StreamError>>),
	Appended(Result<Vec<Address>, oneshot::error::RecvError>),
	Judged(Result<MerkleVerdict, oneshot::error::RecvError>),
}

async fn run_transactions_reader(
	context: TxReaderContext,
	mut request_receiver: mpsc::Receiver<TxRequest>,
) -> Result<(), anyhow::Error> {
	let mut run: Option<TxRun> = None;

	loop {
		tokio::select! {
			request = request_receiver.recv() => match request {
				Some(request) => handle_request(&context, &mut run, request).await,
				// All clients gone.
				None => break Ok(()),
			},
			Some(item) = next_item(&mut run) => handle_item(&context, &mut run, item).await,
		}
	}
}

async fn next_item(run: &mut Option<TxRun>) -> Option<TxItem> {
	match run.as_mut() {
		Some(run) => Some(match &mut run.pending {
			Some(TxPending::Append(receiver)) => TxItem::Appended(receiver.await),
			Some(TxPending::Merkle(receiver)) => TxItem::Judged(receiver.await),
			None => TxItem::Frame(run.stream.next().await),
		}),
		None => None,
	}
}

async fn handle_request(context: &TxReaderContext, run: &mut Option<TxRun>, request: TxRequest) {
	match request {
		TxRequest::StartSync { addresses, from_height, count, reply } => {
			let _result = reply.send(start_sync(context, run, addresses, from_height, count).await);
		},
		TxRequest::Stop { reply } => {
			if run.take().is_some() {
				debug!("transaction sync stopped");
			}
			let _result = reply.send(());
		},
	}
}

async fn start_sync(
	context: &TxReaderContext,
	run: &mut Option<TxRun>,
	addresses: Vec<Address>,
	from_height: BlockHeight,
	count: u32,
) -> Result<(), ReaderError> {
	if run.is_some() {
		return Err(ReaderError::AlreadyRunning)
	}
	if from_height < 1 {
		return Err(ReaderError::InvalidHeight)
	}

	let stream = context
		.streams
		.open_transactions(addresses.clone(), from_height, count)
		.await
		.map_err(ReaderError::Open)?;

	debug!(
		from_height,
		count,
		addresses = addresses.len(),
		"filtered transaction stream opened"
	);

	*run = Some(TxRun {
		stream,
		session: FilterSession::new(addresses),
		from_height,
		count,
		pending: None,
	});
	Ok(())
}

async fn handle_item(context: &TxReaderContext, run: &mut Option<TxRun>, item: TxItem) {
	let frame = match item {
		TxItem::Frame(frame) => frame,
		TxItem::Appended(generated) => {
			let active = run.as_mut().expect("replies can only arrive while a run is active");
			active.pending = None;
			if let Ok(addresses) = generated {
				active.session.buffer_generated(addresses);
			}
			return
		},
		TxItem::Judged(verdict) => {
			run.as_mut().expect("replies can only arrive while a run is active").pending = None;
			match verdict {
				Ok(MerkleVerdict::Accept { height, new_addresses }) =>
					accept_merkle_block(context, run, height, new_addresses).await,
				Ok(MerkleVerdict::Reject(error)) => {
					warn!("merkle block rejected: {error:#}");
					fail(context, run, error).await;
				},
				// Dropped without a verdict: the two-phase contract was
				// violated and the stream cannot safely continue.
				Err(_) =>
					fail(
						context,
						run,
						anyhow::anyhow!("merkle block neither accepted nor rejected"),
					)
					.await,
			}
			return
		},
	};

	match frame {
		Some(Ok(TransactionsFrame::RawTransactions(raw_transactions))) =>
			handle_raw_transactions(context, run, raw_transactions).await,
		Some(Ok(TransactionsFrame::RawMerkleBlock(raw_merkle_block))) =>
			handle_raw_merkle_block(context, run, raw_merkle_block).await,
		Some(Err(StreamError::Cancelled)) => {
			*run = None;
			debug!("filtered transaction stream cancelled");
		},
		Some(Err(StreamError::Transport(error))) => fail(context, run, error).await,
		None => {
			let finished_run = run.take().expect("frames can only arrive while a run is active");
			if finished_run.is_historical() {
				debug!("filtered transaction stream delivered its range");
				let _result =
					context.events.send(TransactionsEvent::HistoricalDataObtained).await;
			} else {
				debug!("filtered transaction stream ended");
			}
		},
	}
}

async fn handle_raw_transactions(
	context: &TxReaderContext,
	run: &mut Option<TxRun>,
	raw_transactions: Vec<Vec<u8>>,
) {
	let transactions: Result<Vec<bitcoin::Transaction>, _> =
		raw_transactions.iter().map(|bytes| consensus::deserialize(bytes)).collect();
	let transactions = match transactions {
		Ok(transactions) => transactions,
		Err(error) => {
			fail(context, run, anyhow::Error::new(error).context("undecodable raw transaction"))
				.await;
			return
		},
	};

	let relevant = {
		let run = run.as_ref().expect("frames can only arrive while a run is active");
		relevant_transactions(transactions, run.session.addresses())
	};
	if relevant.is_empty() {
		return
	}

	trace!("{} transactions matched the watched addresses", relevant.len());

	let (handle, receiver) = AppendAddressesHandle::new();
	if context.events.send(TransactionsEvent::NewTransactions(relevant, handle)).await.is_err() {
		// Consumer gone.
		*run = None;
		return
	}

	run.as_mut().expect("frames can only arrive while a run is active").pending =
		Some(TxPending::Append(receiver));
}

async fn handle_raw_merkle_block(
	context: &TxReaderContext,
	run: &mut Option<TxRun>,
	raw_merkle_block: Vec<u8>,
) {
	let merkle_block: bitcoin::merkle_tree::MerkleBlock =
		match consensus::deserialize(&raw_merkle_block) {
			Ok(merkle_block) => merkle_block,
			Err(error) => {
				fail(context, run, anyhow::Error::new(error).context("undecodable merkle block"))
					.await;
				return
			},
		};

	let (handle, receiver) = MerkleBlockHandle::new();
	if context.events.send(TransactionsEvent::MerkleBlock(merkle_block, handle)).await.is_err() {
		*run = None;
		return
	}

	run.as_mut().expect("frames can only arrive while a run is active").pending =
		Some(TxPending::Merkle(receiver));
}

async fn accept_merkle_block(
	context: &TxReaderContext,
	run: &mut Option<TxRun>,
	height: BlockHeight,
	new_addresses: Vec<Address>,
) {
	let (out_of_range, grew) = {
		let run = run.as_mut().expect("frames can only arrive while a run is active");
		let out_of_range =
			height < run.from_height || (run.is_historical() && height > run.last_height());
		(out_of_range, if out_of_range { false } else { run.session.grow(new_addresses) })
	};

	if out_of_range {
		fail(context, run, anyhow::anyhow!("merkle block accepted at out-of-range height {height}"))
			.await;
		return
	}

	if !grew {
		trace!("merkle block accepted at height {height}");
		return
	}

	restart_with_grown_filter(context, run, height).await;
}

/// The accepted height splits the range: everything at or below it is done,
/// the rest is re-fetched with the enlarged filter so previously unwatched
/// addresses are covered from the accepted height onwards.
async fn restart_with_grown_filter(
	context: &TxReaderContext,
	run: &mut Option<TxRun>,
	height: BlockHeight,
) {
	let args = {
		let active = run.as_mut().expect("frames can only arrive while a run is active");
		if active.is_historical() {
			let remaining = active.count - (height + 1 - active.from_height);
			if remaining == 0 {
				None
			} else {
				Some(RestartArgs { from_height: height + 1, count: remaining })
			}
		} else {
			Some(RestartArgs { from_height: height + 1, count: 0 })
		}
	};

	let Some(args) = args else {
		// The growth landed on the final block of the range; nothing is
		// left to re-fetch.
		*run = None;
		debug!("filter grew on the final block of the range");
		let _result = context.events.send(TransactionsEvent::HistoricalDataObtained).await;
		return
	};

	let (addresses, args) = {
		let active = run.as_mut().expect("frames can only arrive while a run is active");
		active.session.stage_restart(args);
		let addresses: Vec<Address> = active.session.addresses().iter().cloned().collect();
		let args = active.session.take_restart().expect("restart was staged above");
		(addresses, args)
	};

	match context.streams.open_transactions(addresses, args.from_height, args.count).await {
		Ok(stream) => {
			let active = run.as_mut().expect("frames can only arrive while a run is active");
			// Replacing the stream drops and thereby cancels the old one.
			active.stream = stream;
			active.from_height = args.from_height;
			active.count = args.count;
			debug!(
				"filtered stream restarted at height {} with {} watched addresses",
				args.from_height,
				active.session.addresses().len()
			);
		},
		Err(error) =>
			fail(context, run, error.context("failed to restart filtered stream")).await,
	}
}

async fn fail(context: &TxReaderContext, run: &mut Option<TxRun>, error: anyhow::Error) {
	*run = None;
	warn!("filtered transaction stream failed: {error:#}");
	let _result = context.events.send(TransactionsEvent::Error(error)).await;
}
