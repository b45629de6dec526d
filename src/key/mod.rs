//! How the keys of the index environment are structured.
//!
//! Every record an index persists lives in its own storage environment, so
//! keys carry no namespace components: a one-byte `/` root, a `!` marker for
//! singleton metadata records or a `*` marker for the data trees, a two-byte
//! tag, then the record's own components. Key components are encoded with
//! `storekey` so that lexicographic byte order matches component order.

pub mod index;

use anyhow::Result;

use crate::kvs::Key;

/// A trait for types which can be encoded as a kv-store key.
pub trait KeyEncode {
	fn encode(&self) -> Result<Vec<u8>> {
		let mut buf = Vec::new();
		self.encode_into(&mut buf)?;
		Ok(buf)
	}

	/// Push the bytes this key would encode into the buffer.
	///
	/// Implementations can make no assumption about the contents of the
	/// buffer: bytes already present must also be present when this
	/// function returns.
	fn encode_into(&self, buffer: &mut Vec<u8>) -> Result<()>;
}

impl KeyEncode for Vec<u8> {
	fn encode(&self) -> Result<Vec<u8>> {
		Ok(self.clone())
	}

	fn encode_into(&self, buffer: &mut Vec<u8>) -> Result<()> {
		buffer.extend_from_slice(self);
		Ok(())
	}
}

impl<K: KeyEncode> KeyEncode for &K {
	fn encode_into(&self, buffer: &mut Vec<u8>) -> Result<()> {
		(*self).encode_into(buffer)
	}
}

/// Implements KeyEncode using storekey and the type's serde implementation.
macro_rules! impl_key {
	($name:ident$(<$l:lifetime>)?) => {
		impl$(<$l>)? crate::key::KeyEncode for $name$(<$l>)? {
			fn encode(&self) -> ::std::result::Result<Vec<u8>, ::anyhow::Error> {
				Ok(storekey::serialize(self)?)
			}

			fn encode_into(&self, buffer: &mut Vec<u8>) -> ::std::result::Result<(), ::anyhow::Error> {
				Ok(storekey::serialize_into(buffer, self)?)
			}
		}
	};
}
pub(crate) use impl_key;

/// Produce the exclusive scan range covering every key starting with the
/// given prefix.
pub(crate) fn prefix_range(prefix: Key) -> (Key, Key) {
	let mut end = prefix.clone();
	while let Some(last) = end.last_mut() {
		if *last < 0xff {
			*last += 1;
			break;
		}
		end.pop();
	}
	(prefix, end)
}
