//! Stores the last processed tombstone etag for one collection
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Te<'a> {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
	pub collection: &'a str,
}

impl<'a> Te<'a> {
	pub fn new(collection: &'a str) -> Self {
		Self { __: b'/', _a: b'*', _b: b't', _c: b'e', collection }
	}
}

crate::key::impl_key!(Te<'a>);
