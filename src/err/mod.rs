use thiserror::Error;

/// An error raised by the indexing engine.
///
/// Batch-internal failures are classified by the indexing loop through
/// [`Error::downcast_ref`](anyhow::Error::downcast_ref) on the propagated
/// [`anyhow::Error`]; everything else surfaces synchronously to the caller.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// An argument to a public operation was invalid
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// A lifecycle operation was attempted in the wrong state
	#[error("Invalid state: {0}")]
	InvalidState(String),

	/// The persisted index type tag is not supported by this build
	#[error("The index type '{0}' is not implemented")]
	NotImplementedIndexType(String),

	/// The full-text writer failed to apply an entry
	#[error("Index write failure: {message}")]
	IndexWrite {
		message: String,
		/// Transient failures stem from the underlying system (I/O
		/// pressure, pool exhaustion) and do not count towards the
		/// write-error limit.
		transient: bool,
	},

	/// A single document could not be analyzed into terms
	#[error("Analyzer failure: {0}")]
	IndexAnalyzer(String),

	/// A collaborator ran out of memory or buffer space
	#[error("Out of memory: {0}")]
	OutOfMemory(String),

	/// The operation was cancelled cooperatively
	#[error("The operation was cancelled")]
	Cancelled,

	/// The index was already disposed
	#[error("The index '{0}' was disposed")]
	Disposed(String),

	/// The storage environment was created by an incompatible version
	#[error("Unsupported storage schema version {found}, expected {expected}")]
	SchemaVersion { expected: u16, found: u16 },

	/// The transaction was already cancelled or committed
	#[error("Couldn't update a finished transaction")]
	TxFinished,

	/// The current transaction was created as read-only
	#[error("Couldn't write to a read only transaction")]
	TxReadonly,

	/// The on-disk index structure is inconsistent
	#[error("Corrupted index: {0}")]
	CorruptedIndex(&'static str),

	/// There was a problem with the underlying datastore
	#[error("There was a problem with the datastore: {0}")]
	Datastore(String),

	/// There was an unknown internal error
	#[error("There was an internal error: {0}")]
	Internal(String),
}

impl Error {
	/// Check whether an error chain terminates in a cooperative cancellation.
	pub fn is_cancelled(err: &anyhow::Error) -> bool {
		matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled))
	}

	/// Check whether an error chain is a write failure, returning its
	/// transience classification.
	pub fn as_write_error(err: &anyhow::Error) -> Option<bool> {
		match err.downcast_ref::<Error>() {
			Some(Error::IndexWrite { transient, .. }) => Some(*transient),
			_ => None,
		}
	}
}
