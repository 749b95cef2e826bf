use thiserror::Error;

/// The error kinds the core pipeline can raise, matching the policy table
/// in the spec: most are recoverable at the call site and only `Fatal`
/// should ever reach a process exit code.
#[derive(Debug, Error)]
pub enum Error {
    /// TCP reset, TLS error, or a partial read. Callers retry once, then
    /// log and skip.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP 404. Not surfaced as an error at the pipeline level, just a
    /// skip, but it still needs to unwind out of `fetchObject`.
    #[error("not found")]
    NotFound,

    /// Unparseable state file.
    #[error("bad state file: {0}")]
    BadState(String),

    /// Malformed osmChange XML. Aborts the current change file, leaves the
    /// catalog unchanged.
    #[error("bad osmChange document: {0}")]
    BadChange(String),

    /// Version guard rejected an upsert. Expected under concurrent
    /// replay; recorded in a counter, never surfaced to the user.
    #[error("store conflict")]
    StoreConflict,

    /// Out-of-memory, unreachable DB at startup, or anything else that
    /// should abort the process.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Db(#[from] postgres::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
