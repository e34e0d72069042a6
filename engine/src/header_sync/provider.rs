//! The provider: state machine above the reader that feeds accepted batches
//! into the SPV chain validator and exposes the consumer-facing event
//! contract.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use utilities::task_scope::Scope;

use crate::{
	constants::PROVIDER_EVENT_BUFFER,
	spv::{AddHeadersError, SpvChain},
	types::{BlockHeader, BlockHeight},
};

use super::{reader::BlockHeadersReader, HeaderBatch, ReaderError, ReaderEvent, RejectHandle};

/// Events emitted towards the embedding application.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
	/// Headers were accepted into the chain. `head_height` is the height of
	/// `headers[0]` after accounting for any prefix the chain dropped as
	/// already known.
	ChainUpdated { headers: Vec<BlockHeader>, head_height: BlockHeight },
	/// A historical run completed and the chain revalidated.
	HistoricalDataObtained,
	Stopped,
	/// Terminal failure of the current run; the provider is Idle again.
	Error(Arc<anyhow::Error>),
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
	#[error("a sync operation is already running")]
	Busy,
	#[error("no header stream transport is configured")]
	NotConfigured,
	#[error(transparent)]
	Reader(#[from] ReaderError),
	#[error("the provider task has shut down")]
	Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
	Idle,
	HistoricalSync,
	ContinuousSync,
}

enum ProviderRequest {
	ReadHistorical {
		from_height: BlockHeight,
		to_height: BlockHeight,
		reply: oneshot::Sender<Result<(), ProviderError>>,
	},
	StartContinuousSync {
		from_height: BlockHeight,
		reply: oneshot::Sender<Result<(), ProviderError>>,
	},
	Stop {
		reply: oneshot::Sender<()>,
	},
}

/// Client handle to the provider task. Cheap to clone.
#[derive(Clone)]
pub struct BlockHeadersProvider {
	request_sender: mpsc::Sender<ProviderRequest>,
}

impl BlockHeadersProvider {
	/// The reader is injected at construction; without one, sync operations
	/// fail with [`ProviderError::NotConfigured`]. The chain is owned by the
	/// provider task and mutated only from it.
	pub fn new<Chain: SpvChain>(
		scope: &Scope<'_, anyhow::Error>,
		chain: Chain,
		reader: Option<(BlockHeadersReader, mpsc::Receiver<ReaderEvent>)>,
	) -> (Self, async_broadcast::Receiver<ProviderEvent>) {
		let (request_sender, request_receiver) = mpsc::channel(1);
		let (event_sender, event_receiver) = async_broadcast::broadcast(PROVIDER_EVENT_BUFFER);

		scope.spawn(run_provider(chain, reader, request_receiver, event_sender));

		(Self { request_sender }, event_receiver)
	}

	/// Synchronise the historical range `[from_height, to_height]` into the
	/// chain. Use `from_height = 1` to sync from genesis.
	pub async fn read_historical(
		&self,
		from_height: BlockHeight,
		to_height: BlockHeight,
	) -> Result<(), ProviderError> {
		self.request(|reply| ProviderRequest::ReadHistorical { from_height, to_height, reply })
			.await?
	}

	/// Follow the chain tip, starting at `from_height`.
	pub async fn start_continuous_sync(
		&self,
		from_height: BlockHeight,
	) -> Result<(), ProviderError> {
		self.request(|reply| ProviderRequest::StartContinuousSync { from_height, reply }).await?
	}

	/// Stop the current run, if any. Idempotent.
	pub async fn stop(&self) {
		let _result = self.request(|reply| ProviderRequest::Stop { reply }).await;
	}

	async fn request<T>(
		&self,
		request: impl FnOnce(oneshot::Sender<T>) -> ProviderRequest,
	) -> Result<T, ProviderError> {
		let (reply, receiver) = oneshot::channel();
		self.request_sender.send(request(reply)).await.map_err(|_| ProviderError::Shutdown)?;
		receiver.await.map_err(|_| ProviderError::Shutdown)
	}
}

async fn run_provider<Chain: SpvChain>(
	mut chain: Chain,
	reader: Option<(BlockHeadersReader, mpsc::Receiver<ReaderEvent>)>,
	mut request_receiver: mpsc::Receiver<ProviderRequest>,
	event_sender: async_broadcast::Sender<ProviderEvent>,
) -> Result<(), anyhow::Error> {
	let mut state = SyncState::Idle;
	let (reader, mut reader_events) = match reader {
		Some((reader, events)) => (Some(reader), Some(events)),
		None => (None, None),
	};

	loop {
		tokio::select! {
			request = request_receiver.recv() => match request {
				Some(request) =>
					handle_request(&mut chain, &reader, &mut state, &event_sender, request).await,
				// All clients gone.
				None => break Ok(()),
			},
			Some(event) = next_reader_event(&mut reader_events) =>
				handle_reader_event(&mut chain, &reader, &mut state, &event_sender, event).await,
		}
	}
}

async fn next_reader_event(
	reader_events: &mut Option<mpsc::Receiver<ReaderEvent>>,
) -> Option<ReaderEvent> {
	match reader_events.as_mut() {
		Some(events) => events.recv().await,
		None => None,
	}
}

async fn handle_request<Chain: SpvChain>(
	chain: &mut Chain,
	reader: &Option<BlockHeadersReader>,
	state: &mut SyncState,
	event_sender: &async_broadcast::Sender<ProviderEvent>,
	request: ProviderRequest,
) {
	match request {
		ProviderRequest::ReadHistorical { from_height, to_height, reply } => {
			let result = async {
				let reader = ready_to_sync(reader, state)?;
				if from_height < 1 {
					return Err(ReaderError::InvalidHeight.into())
				}
				ensure_chain_root(chain, from_height);
				reader.read_historical(from_height, to_height).await?;
				*state = SyncState::HistoricalSync;
				Ok(())
			}
			.await;
			let _result = reply.send(result);
		},
		ProviderRequest::StartContinuousSync { from_height, reply } => {
			let result = async {
				let reader = ready_to_sync(reader, state)?;
				if from_height < 1 {
					return Err(ReaderError::InvalidHeight.into())
				}
				ensure_chain_root(chain, from_height);
				reader.subscribe_to_new(from_height).await?;
				*state = SyncState::ContinuousSync;
				Ok(())
			}
			.await;
			let _result = reply.send(result);
		},
		ProviderRequest::Stop { reply } => {
			if stop_current_run(reader, state).await {
				let _result = event_sender.broadcast(ProviderEvent::Stopped).await;
			}
			let _result = reply.send(());
		},
	}
}

fn ready_to_sync<'r>(
	reader: &'r Option<BlockHeadersReader>,
	state: &SyncState,
) -> Result<&'r BlockHeadersReader, ProviderError> {
	if *state != SyncState::Idle {
		return Err(ProviderError::Busy)
	}
	reader.as_ref().ok_or(ProviderError::NotConfigured)
}

/// Allow syncs anchored above genesis: if the chain has no header below the
/// start of the requested range, re-root it at the range start.
fn ensure_chain_root<Chain: SpvChain>(chain: &mut Chain, from_height: BlockHeight) {
	if chain.hash_by_height(from_height - 1).is_none() {
		debug!("chain has no header at height {}, re-rooting at {from_height}", from_height - 1);
		chain.reset(from_height);
	}
}

/// Returns whether a run was actually stopped.
async fn stop_current_run(
	reader: &Option<BlockHeadersReader>,
	state: &mut SyncState,
) -> bool {
	let stopped = match (*state, reader) {
		(SyncState::HistoricalSync, Some(reader)) => {
			reader.stop_reading_historical().await;
			true
		},
		(SyncState::ContinuousSync, Some(reader)) => {
			reader.unsubscribe_from_new().await;
			true
		},
		_ => false,
	};
	*state = SyncState::Idle;
	stopped
}

async fn handle_reader_event<Chain: SpvChain>(
	chain: &mut Chain,
	reader: &Option<BlockHeadersReader>,
	state: &mut SyncState,
	event_sender: &async_broadcast::Sender<ProviderEvent>,
	event: ReaderEvent,
) {
	// Events straggling in after a stop or failure belong to a run that is
	// already torn down.
	if *state == SyncState::Idle {
		return
	}

	match event {
		ReaderEvent::Batch(batch, reject) =>
			handle_batch(chain, reader, state, event_sender, batch, reject).await,
		ReaderEvent::HistoricalDataObtained => {
			*state = SyncState::Idle;
			match chain.validate() {
				Ok(()) => {
					debug!("historical sync complete, chain validated");
					let _result =
						event_sender.broadcast(ProviderEvent::HistoricalDataObtained).await;
				},
				Err(error) => {
					warn!("chain validation failed after historical sync: {error:#}");
					let _result =
						event_sender.broadcast(ProviderEvent::Error(Arc::new(error))).await;
				},
			}
		},
		ReaderEvent::Error(error) => {
			*state = SyncState::Idle;
			let _result = event_sender.broadcast(ProviderEvent::Error(Arc::new(error))).await;
		},
	}
}

async fn handle_batch<Chain: SpvChain>(
	chain: &mut Chain,
	reader: &Option<BlockHeadersReader>,
	state: &mut SyncState,
	event_sender: &async_broadcast::Sender<ProviderEvent>,
	batch: HeaderBatch,
	reject: RejectHandle,
) {
	match chain.add_headers(&batch.headers, batch.head_height) {
		Ok(accepted) => {
			drop(reject);
			// The chain may silently drop a prefix it already knows; the
			// consumer-facing head height shifts by the same amount.
			let difference = (batch.headers.len() - accepted.len()) as u32;
			if !accepted.is_empty() {
				let _result = event_sender
					.broadcast(ProviderEvent::ChainUpdated {
						headers: accepted,
						head_height: batch.head_height + difference,
					})
					.await;
			}
		},
		Err(AddHeadersError::Rejected(spv_error)) => {
			// A bad peer or a race; destroying the delivering stream lets
			// the retry machinery re-fetch the range. Not surfaced.
			warn!("chain rejected batch at height {}: {spv_error}", batch.head_height);
			reject.reject(anyhow::Error::new(spv_error));
		},
		Err(AddHeadersError::Fatal(error)) => {
			drop(reject);
			warn!("chain failed fatally at height {}: {error:#}", batch.head_height);
			stop_current_run(reader, state).await;
			let _result = event_sender.broadcast(ProviderEvent::Error(Arc::new(error))).await;
		},
	}
}
