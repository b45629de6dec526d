//! Stores the accumulated indexing statistics
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct St {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
}

impl Default for St {
	fn default() -> Self {
		Self::new()
	}
}

impl St {
	pub fn new() -> Self {
		Self { __: b'/', _a: b'!', _b: b's', _c: b't' }
	}
}

crate::key::impl_key!(St);
