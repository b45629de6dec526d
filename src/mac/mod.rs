/// Lazily parse a configuration value from an environment variable,
/// falling back to a default when the variable is missing or malformed.
macro_rules! lazy_env_parse {
	($key:expr, $t:ty, $default:expr) => {
		std::sync::LazyLock::new(|| {
			std::env::var($key).ok().and_then(|s| s.parse::<$t>().ok()).unwrap_or($default)
		})
	};
}

/// Run an operation against a transaction, cancelling the transaction
/// before propagating a failure. Keeps `?`-style early returns from
/// leaving a transaction open and uncommitted.
macro_rules! catch {
	($txn:ident, $default:expr) => {
		match $default {
			Err(e) => {
				let _ = $txn.cancel().await;
				return Err(e);
			}
			Ok(v) => v,
		}
	};
}

/// Run an operation against a transaction and commit on success,
/// cancelling on either the operation's or the commit's failure.
macro_rules! run {
	($txn:ident, $default:expr) => {
		match $default {
			Err(e) => {
				let _ = $txn.cancel().await;
				Err(e)
			}
			Ok(v) => match $txn.commit().await {
				Err(e) => {
					let _ = $txn.cancel().await;
					Err(e)
				}
				Ok(_) => Ok(v),
			},
		}
	};
}
