//! Stores one term to document posting
use serde::Serialize;

use crate::key::{prefix_range, KeyEncode};
use crate::kvs::Key;

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
pub struct Td<'a> {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
	pub term: &'a str,
	pub key: &'a str,
}

impl<'a> Td<'a> {
	pub fn new(term: &'a str, key: &'a str) -> Self {
		Self { __: b'/', _a: b'*', _b: b't', _c: b'd', term, key }
	}

	/// The scan range covering every posting of one term.
	pub fn term_range(term: &str) -> anyhow::Result<(Key, Key)> {
		let root = TdTerm::new(term).encode()?;
		Ok(prefix_range(root))
	}
}

#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Serialize)]
struct TdTerm<'a> {
	__: u8,
	_a: u8,
	_b: u8,
	_c: u8,
	term: &'a str,
}

impl<'a> TdTerm<'a> {
	fn new(term: &'a str) -> Self {
		Self { __: b'/', _a: b'*', _b: b't', _c: b'd', term }
	}
}

crate::key::impl_key!(Td<'a>);
crate::key::impl_key!(TdTerm<'a>);
