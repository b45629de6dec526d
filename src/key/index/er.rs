//! Stores one entry of the recorded-errors ring
use serde::Serialize;

use crate::key::{prefix_range, KeyEncode};
use crate::kvs::Key;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Er {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
	pub seq: u64,
}

impl Er {
	pub fn new(seq: u64) -> Self {
		Self { __: b'/', _a: b'!', _b: b'e', _c: b'r', seq }
	}

	/// The scan range covering the whole ring, oldest entry first.
	pub fn range() -> anyhow::Result<(Key, Key)> {
		let root = ErRoot::new().encode()?;
		Ok(prefix_range(root))
	}
}

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
struct ErRoot {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
}

impl ErRoot {
	fn new() -> Self {
		Self { __: b'/', _a: b'!', _b: b'e', _c: b'r' }
	}
}

crate::key::impl_key!(Er);
crate::key::impl_key!(ErRoot);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key() {
		let enc = Er::new(7).encode().unwrap();
		assert_eq!(enc, b"/!er\x00\x00\x00\x00\x00\x00\x00\x07");
	}

	#[test]
	fn range_covers_all_sequences() {
		let (beg, end) = Er::range().unwrap();
		let low = Er::new(0).encode().unwrap();
		let high = Er::new(u64::MAX).encode().unwrap();
		assert!(beg <= low);
		assert!(high < end);
	}
}
