use thiserror::Error;

/// Postgres SQLSTATEs that indicate a blip in the infrastructure rather
/// than a problem with the statement or the data.
const TRANSIENT_SQLSTATES: &[&str] = &[
    "08000", // connection exception
    "08001", // unable to connect to server
    "08003", // connection does not exist
    "08006", // connection failure
    "40001", // serialization failure
    "40P01", // deadlock detected
    "53300", // too many connections
    "53400", // configuration limit exceeded
    "57P01", // admin shutdown
    "57P03", // cannot connect now (starting up)
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error from {source_name}: {details}")]
    Protocol { source_name: String, details: String },

    #[error("pagination loop detected on {source_name}: cursor {cursor:?} repeated on consecutive empty pages")]
    PaginationLoop { source_name: String, cursor: String },

    #[error("transformation failed: {0}")]
    Transform(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn protocol(source_name: impl Into<String>, details: impl Into<String>) -> Self {
        Error::Protocol {
            source_name: source_name.into(),
            details: details.into(),
        }
    }

    /// Transient infrastructure failures: connection loss, timeouts, pool
    /// exhaustion. Only these are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => is_transient_db_error(e),
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Io(_) => true,
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

pub fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map_or(false, |code| TRANSIENT_SQLSTATES.contains(&code.as_ref())),
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_and_io_failures_are_transient() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(Error::Database(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer"
        )))
        .is_transient());
        assert!(Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow")).is_transient());
    }

    #[test]
    fn data_and_contract_failures_are_not_transient() {
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!Error::Database(sqlx::Error::ColumnNotFound("id".into())).is_transient());
        assert!(!Error::protocol("order", "envelope is not an object").is_transient());
        assert!(!Error::PaginationLoop {
            source_name: "order".into(),
            cursor: "abc".into()
        }
        .is_transient());
        assert!(!Error::Config("missing token".into()).is_transient());
    }

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(Error::Config("database.url is required".into()).is_fatal());
        assert!(!Error::Transform("dbt exited 1".into()).is_fatal());
    }
}
