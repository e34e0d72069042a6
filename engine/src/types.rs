use std::{borrow::Borrow, fmt};

pub type BlockHeight = u32;

pub const BLOCK_HEADER_SIZE: usize = 80;

/// A raw block header as carried on the wire. The engine never looks inside:
/// decoding and hashing are the chain validator's concern.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHeader([u8; BLOCK_HEADER_SIZE]);

impl BlockHeader {
	pub fn from_bytes(bytes: [u8; BLOCK_HEADER_SIZE]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; BLOCK_HEADER_SIZE] {
		&self.0
	}
}

impl TryFrom<&[u8]> for BlockHeader {
	type Error = anyhow::Error;

	fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
		Ok(Self(bytes.try_into().map_err(|_| {
			anyhow::anyhow!("block header must be {BLOCK_HEADER_SIZE} bytes, got {}", bytes.len())
		})?))
	}
}

impl fmt::Debug for BlockHeader {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "BlockHeader({}..)", hex::encode(&self.0[..8]))
	}
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl fmt::Debug for BlockHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "BlockHash({})", hex::encode(self.0))
	}
}

/// A watched wallet address in script-pubkey form, the shape transaction
/// outputs are matched against.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(Vec<u8>);

impl Address {
	pub fn new(script_pubkey_bytes: Vec<u8>) -> Self {
		Self(script_pubkey_bytes)
	}

	pub fn as_script_bytes(&self) -> &[u8] {
		&self.0
	}
}

// Lets a `BTreeSet<Address>` be probed with raw output script bytes without
// allocating. Lexicographic `Ord` on the inner bytes keeps the two consistent.
impl Borrow<[u8]> for Address {
	fn borrow(&self) -> &[u8] {
		&self.0
	}
}

impl From<bitcoin::ScriptBuf> for Address {
	fn from(script: bitcoin::ScriptBuf) -> Self {
		Self(script.into_bytes())
	}
}

impl fmt::Debug for Address {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Address({})", hex::encode(&self.0))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_from_short_slice_is_rejected() {
		assert!(BlockHeader::try_from(&[0u8; 79][..]).is_err());
		assert!(BlockHeader::try_from(&[0u8; 80][..]).is_ok());
	}

	#[test]
	fn address_set_is_probed_with_raw_script_bytes() {
		let set =
			std::collections::BTreeSet::from([Address::new(vec![1, 2, 3]), Address::new(vec![9])]);

		assert!(set.contains(&[1u8, 2, 3][..]));
		assert!(!set.contains(&[1u8, 2][..]));
	}
}
