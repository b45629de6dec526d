//! Stores the persisted index definition
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Df {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
}

impl Default for Df {
	fn default() -> Self {
		Self::new()
	}
}

impl Df {
	pub fn new() -> Self {
		Self { __: b'/', _a: b'!', _b: b'd', _c: b'f' }
	}
}

crate::key::impl_key!(Df);
