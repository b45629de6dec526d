//! Stores the persisted index lock mode
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Lk {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
}

impl Default for Lk {
	fn default() -> Self {
		Self::new()
	}
}

impl Lk {
	pub fn new() -> Self {
		Self { __: b'/', _a: b'!', _b: b'l', _c: b'k' }
	}
}

crate::key::impl_key!(Lk);
