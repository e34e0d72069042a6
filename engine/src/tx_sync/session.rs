use std::collections::BTreeSet;

use crate::types::{Address, BlockHeight};

/// Arguments for the single stream restart that follows a filter growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartArgs {
	pub from_height: BlockHeight,
	/// 0 when the subscription is continuous.
	pub count: u32,
}

/// The watched address set of one filtered subscription, the addresses the
/// consumer has generated but not yet folded in, and the staged restart
/// performed when the filter grows.
#[derive(Debug)]
pub struct FilterSession {
	addresses: BTreeSet<Address>,
	generated_addresses: Vec<Address>,
	restart_args: Option<RestartArgs>,
}

impl FilterSession {
	pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
		Self {
			addresses: addresses.into_iter().collect(),
			generated_addresses: Vec::new(),
			restart_args: None,
		}
	}

	pub fn addresses(&self) -> &BTreeSet<Address> {
		&self.addresses
	}

	/// Buffer addresses generated by the consumer. They stay pending until
	/// the next merkle-block acceptance folds them in.
	pub fn buffer_generated(&mut self, addresses: Vec<Address>) {
		self.generated_addresses.extend(addresses);
	}

	/// Fold the pending and the explicitly supplied addresses into the
	/// watched set. Returns whether the set actually grew.
	pub fn grow(&mut self, new_addresses: Vec<Address>) -> bool {
		let mut grew = false;
		for address in self.generated_addresses.drain(..).chain(new_addresses) {
			grew |= self.addresses.insert(address);
		}
		grew
	}

	/// At most one restart can be pending at a time; it is taken by the same
	/// handler that staged it.
	pub fn stage_restart(&mut self, args: RestartArgs) {
		assert!(self.restart_args.is_none(), "a stream restart is already staged");
		self.restart_args = Some(args);
	}

	pub fn take_restart(&mut self) -> Option<RestartArgs> {
		self.restart_args.take()
	}
}
