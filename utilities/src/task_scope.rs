//! Structured task spawning.
//!
//! A [`Scope`] ties the lifetime of spawned tasks to an enclosing
//! [`task_scope`] call: when the top-level task returns, every task still
//! running in the scope is cancelled, and when any spawned task returns an
//! error, the whole scope is cancelled and the error propagates out of
//! [`task_scope`]. Panics in spawned tasks resurface on the scope's caller.

use std::{future::Future, marker::PhantomData};

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use tokio::{
	sync::mpsc,
	task::{AbortHandle, JoinHandle},
};

pub struct Scope<'env, Error: Send + 'static> {
	handle_sender: mpsc::UnboundedSender<JoinHandle<Result<(), Error>>>,
	_phantom: PhantomData<&'env mut &'env ()>,
}

impl<Error: Send + 'static> Scope<'_, Error> {
	/// Spawn a task into the scope. The task runs until it completes, the
	/// scope's top-level task returns, or a sibling task fails.
	pub fn spawn(&self, task: impl Future<Output = Result<(), Error>> + Send + 'static) {
		// Send can only fail while the scope is winding down, at which point
		// the newly spawned task is aborted with the rest.
		let _result = self.handle_sender.send(tokio::spawn(task));
	}
}

pub async fn task_scope<'env, T, Error, C>(top_level_task: C) -> Result<T, Error>
where
	Error: Send + 'static,
	C: for<'scope> FnOnce(&'scope Scope<'env, Error>) -> BoxFuture<'scope, Result<T, Error>>,
{
	let (handle_sender, mut handle_receiver) = mpsc::unbounded_channel();
	let scope = Scope { handle_sender, _phantom: PhantomData };

	let mut running = FuturesUnordered::new();
	let mut abort_handles: Vec<AbortHandle> = Vec::new();

	let result = {
		let mut top_level = top_level_task(&scope);
		loop {
			tokio::select! {
				result = &mut top_level => break result,
				Some(handle) = handle_receiver.recv() => {
					abort_handles.push(handle.abort_handle());
					running.push(handle);
				},
				Some(join_result) = running.next() => match join_result {
					Ok(Ok(())) => {},
					Ok(Err(error)) => break Err(error),
					Err(join_error) =>
						if join_error.is_panic() {
							std::panic::resume_unwind(join_error.into_panic())
						},
				},
			}
		}
	};

	// Cancel everything still running and wait for it to wind down, so no
	// task outlives the scope. Panics from losing tasks still surface.
	drop(scope);
	for abort_handle in &abort_handles {
		abort_handle.abort();
	}
	while let Some(handle) = handle_receiver.recv().await {
		handle.abort();
		running.push(handle);
	}
	while let Some(join_result) = running.next().await {
		if let Err(join_error) = join_result {
			if join_error.is_panic() {
				std::panic::resume_unwind(join_error.into_panic())
			}
		}
	}

	result
}
