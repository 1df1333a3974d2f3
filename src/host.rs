//! Interfaces the embedding host provides to the engine.

use crate::error::Result;
use crate::types::PgValue;

/// Callbacks the engine makes into the embedding host during a call.
///
/// All methods have conservative defaults so tests and simple embeddings only
/// override what they need.
pub trait HostHooks: Send + Sync {
    /// Polled once per drive-loop iteration. Returning `true` aborts the call
    /// with a cancellation error after best-effort remote cancels.
    fn is_canceled(&self) -> bool {
        false
    }

    /// Receives backend notices, forwarded as warnings. Never aborts a call.
    fn notice(&self, _notice: &Notice) {}

    /// The local server encoding. Remote sessions reporting a different
    /// `client_encoding` are aligned to this one after login.
    fn local_encoding(&self) -> String {
        "UTF8".to_string()
    }

    /// The local server version, e.g. `"16.4"`. Binary result transfer is
    /// only negotiated with backends whose major.minor matches. An empty
    /// string disables the match.
    fn local_server_version(&self) -> String {
        String::new()
    }

    /// The effective user of the embedding session.
    fn current_user(&self) -> String;

    /// The authenticated session user. Defaults to the effective user.
    fn session_user(&self) -> String {
        self.current_user()
    }
}

/// A backend notice, tagged with the function that was executing when it
/// arrived.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Notice {
    /// The fanned-out function.
    pub function: String,
    /// Severity reported by the backend, e.g. `NOTICE` or `WARNING`.
    pub severity: String,
    /// SQLSTATE code.
    pub code: String,
    /// Primary message.
    pub message: String,
}

/// Executes the routing queries on the local database.
///
/// The host is expected to prepare each distinct SQL text once and execute
/// the prepared statement on subsequent calls, SPI-style.
pub trait HashSource {
    /// Runs the hash query once with the given argument row and returns the
    /// values of its single integer column, `None` for SQL nulls.
    fn hash_rows(&mut self, sql: &str, args: &[PgValue]) -> Result<Vec<Option<i64>>>;

    /// Optimized split probe: one execution that yields `(index, hash)`
    /// pairs with 1-based indexes covering `1..=rows` over the split arrays,
    /// in place of `rows` single-row executions of `hash_rows`.
    fn split_hash_rows(
        &mut self,
        sql: &str,
        args: &[PgValue],
        rows: usize,
    ) -> Result<Vec<(i64, Option<i64>)>>;
}
