pub mod task_scope;

use std::{
	future::Future,
	pin::Pin,
	task::{Context, Poll},
};

use futures::Stream;

/// Adapter over [`Stream`] that treats an exhausted stream as pending rather
/// than terminated. Select loops can then hold a source that drains and
/// refills, such as a `FuturesUnordered` of retry timers, without the empty
/// state completing the branch.
pub trait UnendingStream: Stream + Unpin {
	fn next_or_pending(&mut self) -> NextOrPending<'_, Self> {
		NextOrPending { stream: self }
	}
}
impl<S: Stream + Unpin + ?Sized> UnendingStream for S {}

pub struct NextOrPending<'a, S: ?Sized> {
	stream: &'a mut S,
}

impl<S: Stream + Unpin + ?Sized> Future for NextOrPending<'_, S> {
	type Output = S::Item;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.get_mut();
		match Pin::new(&mut *this.stream).poll_next(cx) {
			Poll::Ready(Some(item)) => Poll::Ready(item),
			_ => Poll::Pending,
		}
	}
}
