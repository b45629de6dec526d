//! Stores the entry record for one indexed document
use serde::Serialize;

use crate::key::{prefix_range, KeyEncode};
use crate::kvs::Key;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Dk<'a> {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
	pub key: &'a str,
}

impl<'a> Dk<'a> {
	pub fn new(key: &'a str) -> Self {
		Self { __: b'/', _a: b'*', _b: b'd', _c: b'k', key }
	}

	/// The scan range covering every entry record.
	pub fn range() -> anyhow::Result<(Key, Key)> {
		let root = DkRoot::new().encode()?;
		Ok(prefix_range(root))
	}
}

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
struct DkRoot {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
}

impl DkRoot {
	fn new() -> Self {
		Self { __: b'/', _a: b'*', _b: b'd', _c: b'k' }
	}
}

crate::key::impl_key!(Dk<'a>);
crate::key::impl_key!(DkRoot);
