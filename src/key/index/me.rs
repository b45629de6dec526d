//! Stores the last mapped document etag for one collection
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Me<'a> {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
	pub collection: &'a str,
}

impl<'a> Me<'a> {
	pub fn new(collection: &'a str) -> Self {
		Self { __: b'/', _a: b'*', _b: b'm', _c: b'e', collection }
	}
}

crate::key::impl_key!(Me<'a>);
