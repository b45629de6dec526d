//! Stores the number of entries in the full-text index
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Ec {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
}

impl Default for Ec {
	fn default() -> Self {
		Self::new()
	}
}

impl Ec {
	pub fn new() -> Self {
		Self { __: b'/', _a: b'*', _b: b'e', _c: b'c' }
	}
}

crate::key::impl_key!(Ec);
