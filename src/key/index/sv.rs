//! Stores the schema version of the index environment
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Sv {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
}

impl Default for Sv {
	fn default() -> Self {
		Self::new()
	}
}

impl Sv {
	pub fn new() -> Self {
		Self { __: b'/', _a: b'!', _b: b's', _c: b'v' }
	}
}

crate::key::impl_key!(Sv);
