//! Stores the persisted index priority
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Pr {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
}

impl Default for Pr {
	fn default() -> Self {
		Self::new()
	}
}

impl Pr {
	pub fn new() -> Self {
		Self { __: b'/', _a: b'!', _b: b'p', _c: b'r' }
	}
}

crate::key::impl_key!(Pr);
