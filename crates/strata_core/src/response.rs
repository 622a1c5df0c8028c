//! Client response envelope.
//!
//! Exactly one of these is produced per stored procedure invocation unless
//! the site crashes. The status byte comes from a closed set; the app
//! status code and string are an application-level side channel the
//! procedure itself may set.

use serde::{Deserialize, Serialize};

use crate::table::ResultTable;

/// App status code value meaning "the procedure never set one".
pub const UNINITIALIZED_APP_STATUS_CODE: i8 = i8::MIN;

/// Client-visible outcome of an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    UserAbort,
    GracefulFailure,
    UnexpectedFailure,
    TxnRestart,
}

impl StatusCode {
    /// Wire byte for this status.
    pub const fn code(self) -> i8 {
        match self {
            StatusCode::Success => 1,
            StatusCode::UserAbort => -1,
            StatusCode::GracefulFailure => -2,
            StatusCode::UnexpectedFailure => -3,
            StatusCode::TxnRestart => -6,
        }
    }

    /// True when the transaction this response describes committed.
    ///
    /// A user abort rolls back, so only `Success` qualifies.
    pub const fn is_transactionally_successful(self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientResponse {
    status: StatusCode,
    app_status_code: i8,
    app_status_string: Option<String>,
    results: Vec<ResultTable>,
    status_string: Option<String>,
    hash: Option<i32>,
}

impl ClientResponse {
    pub fn new(
        status: StatusCode,
        app_status_code: i8,
        app_status_string: Option<String>,
        results: Vec<ResultTable>,
        status_string: Option<String>,
    ) -> Self {
        Self {
            status,
            app_status_code,
            app_status_string,
            results,
            status_string,
            hash: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn app_status_code(&self) -> i8 {
        self.app_status_code
    }

    pub fn app_status_string(&self) -> Option<&str> {
        self.app_status_string.as_deref()
    }

    pub fn results(&self) -> &[ResultTable] {
        &self.results
    }

    pub fn status_string(&self) -> Option<&str> {
        self.status_string.as_deref()
    }

    pub fn hash(&self) -> Option<i32> {
        self.hash
    }

    pub fn set_hash(&mut self, hash: i32) {
        self.hash = Some(hash);
    }

    pub fn is_transactionally_successful(&self) -> bool {
        self.status.is_transactionally_successful()
    }

    /// Replace the result payload with its determinism fingerprint.
    ///
    /// Replayed (replicated) invocations do not return their tables to any
    /// client; the tables are collapsed to a single scalar hash that the
    /// replication agreement layer compares across replicas.
    pub fn convert_results_to_hash_for_determinism(&mut self) {
        let mut combined: u32 = 0;
        for table in &self.results {
            combined = crc32c::crc32c_append(combined, &table.fingerprint().to_le_bytes());
        }
        self.results = vec![ResultTable::scalar_bigint(i64::from(combined))];
    }
}
