//! Runner error taxonomy and client-response classification.
//!
//! Every failure a stored procedure invocation can hit maps onto one
//! variant of [`RunnerError`], and every variant maps onto exactly one
//! client-visible status code. Usage errors raised from the queueing API
//! abort the invocation like a user abort; engine faults keep their typed
//! kind; anything unclassifiable is an unexpected failure with a full
//! trace. [`RunnerError::FatalToServer`] is the one variant that never
//! becomes a response: it propagates out of `call` so the site can crash
//! deterministically.

use std::backtrace::Backtrace;

use thiserror::Error;

use strata_core::{SqlType, StatusCode};

/// Typed failures surfaced by the site engine and coordinator seams.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("sql error: {0}")]
    Sql(String),
    #[error("transaction interrupted: {0}")]
    Interrupt(String),
    #[error("transaction restart: {0}")]
    Restart(String),
    #[error("fatal engine fault: {0}")]
    Fatal(String),
    #[error("{0}")]
    Other(String),
}

/// The closed set of invocation failure kinds.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("statement handle passed to queue_sql was never bound to a prepared statement")]
    NullStatement,
    #[error("{target} EXPECTS {expected} PARAMS, BUT RECEIVED {received}")]
    ArityMismatch {
        target: String,
        expected: usize,
        received: usize,
    },
    #[error("{target} TYPE ERROR FOR PARAMETER {index}: {detail}")]
    TypeError {
        target: String,
        index: usize,
        detail: String,
    },
    #[error("type {sql_type} can not be converted to a NULL representation for parameter {index}")]
    UnknownTypeForNull { index: usize, sql_type: SqlType },
    #[error("failed to plan sql '{sql}': {detail}")]
    PlannerError { sql: String, detail: String },
    #[error("attempted to queue DML adhoc sql '{sql}' from a read only procedure")]
    DmlFromReadOnly { sql: String },
    #[error("{detail} for statement: {sql}")]
    ExtractedParamsConflict { sql: String, detail: String },
    #[error(
        "procedure {procedure} attempted to execute a batch after claiming a previous \
         batch was final and will be aborted; verify that only the last call to \
         execute_sql passes true"
    )]
    DoubleFinalBatch { procedure: String },
    #[error("expectation failed for statement {statement_index}: {detail}")]
    ExpectationMismatch {
        statement_index: usize,
        detail: String,
    },
    #[error("{0}")]
    InvocationReturnError(String),
    #[error("procedure returned an unacceptable type: {0}")]
    ReturnTypeError(String),
    #[error("{message}")]
    UserAbort { message: String, trace: Vec<String> },
    #[error("{0}")]
    ConstraintViolation(String),
    #[error("{0}")]
    SqlError(String),
    #[error("{0}")]
    Interrupt(String),
    #[error("{message}")]
    ExpectedProcedureError {
        status: StatusCode,
        message: String,
        cause: Option<String>,
    },
    #[error("{0}")]
    TransactionRestart(String),
    #[error("{message}")]
    UnexpectedFailure { message: String, trace: Vec<String> },
    #[error("fatal server condition: {0}")]
    FatalToServer(String),
}

/// Client-visible classification of one error kind.
#[derive(Debug, Clone, Copy)]
pub struct Classified {
    pub status: StatusCode,
    pub prefix: &'static str,
    /// Expected failures render a frame list filtered to the procedure;
    /// unexpected ones render everything captured.
    pub expected: bool,
}

impl RunnerError {
    /// A user abort with the caller's frames captured at the abort site.
    pub fn user_abort(message: impl Into<String>) -> RunnerError {
        RunnerError::UserAbort {
            message: message.into(),
            trace: capture_frames(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> RunnerError {
        RunnerError::UnexpectedFailure {
            message: message.into(),
            trace: capture_frames(),
        }
    }

    pub fn from_engine(err: EngineError) -> RunnerError {
        match err {
            EngineError::ConstraintViolation(m) => RunnerError::ConstraintViolation(m),
            EngineError::Sql(m) => RunnerError::SqlError(m),
            EngineError::Interrupt(m) => RunnerError::Interrupt(m),
            EngineError::Restart(m) => RunnerError::TransactionRestart(m),
            EngineError::Fatal(m) => RunnerError::FatalToServer(m),
            EngineError::Other(m) => RunnerError::unexpected(m),
        }
    }

    /// Wrap a reference-backend failure, keeping one unwrappable cause layer.
    pub fn expected_backend_error(err: EngineError) -> RunnerError {
        RunnerError::ExpectedProcedureError {
            status: StatusCode::GracefulFailure,
            message: "reference backend rejected the statement".to_owned(),
            cause: Some(err.to_string()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RunnerError::FatalToServer(_))
    }

    pub fn trace(&self) -> &[String] {
        match self {
            RunnerError::UserAbort { trace, .. } | RunnerError::UnexpectedFailure { trace, .. } => {
                trace
            }
            _ => &[],
        }
    }

    pub fn classify(&self) -> Classified {
        match self {
            RunnerError::UserAbort { .. }
            | RunnerError::NullStatement
            | RunnerError::ArityMismatch { .. }
            | RunnerError::TypeError { .. }
            | RunnerError::UnknownTypeForNull { .. }
            | RunnerError::PlannerError { .. }
            | RunnerError::DmlFromReadOnly { .. }
            | RunnerError::ExtractedParamsConflict { .. }
            | RunnerError::ExpectationMismatch { .. } => Classified {
                status: StatusCode::UserAbort,
                prefix: "USER ABORT",
                expected: true,
            },
            RunnerError::ConstraintViolation(_) => Classified {
                status: StatusCode::GracefulFailure,
                prefix: "CONSTRAINT VIOLATION",
                expected: true,
            },
            RunnerError::SqlError(_) => Classified {
                status: StatusCode::GracefulFailure,
                prefix: "SQL ERROR",
                expected: true,
            },
            RunnerError::Interrupt(_) => Classified {
                status: StatusCode::GracefulFailure,
                prefix: "Transaction Interrupted",
                expected: true,
            },
            RunnerError::ExpectedProcedureError { status, .. } => Classified {
                status: *status,
                prefix: "REFERENCE-BACKEND ERROR",
                expected: true,
            },
            RunnerError::TransactionRestart(_) => Classified {
                status: StatusCode::TxnRestart,
                prefix: "TRANSACTION RESTART",
                expected: true,
            },
            RunnerError::DoubleFinalBatch { .. }
            | RunnerError::InvocationReturnError(_)
            | RunnerError::ReturnTypeError(_)
            | RunnerError::UnexpectedFailure { .. }
            | RunnerError::FatalToServer(_) => Classified {
                status: StatusCode::UnexpectedFailure,
                prefix: "UNEXPECTED FAILURE",
                expected: false,
            },
        }
    }
}

/// Render the status and message body for an error response.
///
/// Expected failures show the error text plus only the frames that belong
/// to the failing procedure; unexpected failures show everything captured.
pub fn build_error_message(err: &RunnerError, procedure_name: &str) -> (StatusCode, String) {
    let classified = err.classify();
    let mut msg = String::new();
    msg.push_str(classified.prefix);
    msg.push('\n');
    msg.push_str("  ");
    match err {
        // One layer of cause unwrapping for reference-backend failures.
        RunnerError::ExpectedProcedureError {
            cause: Some(cause), ..
        } => msg.push_str(cause),
        other => msg.push_str(&other.to_string()),
    }

    if classified.expected {
        for frame in filter_procedure_frames(err.trace(), procedure_name) {
            msg.push_str("\n    at ");
            msg.push_str(frame);
        }
    } else {
        for frame in err.trace() {
            msg.push_str("\n    at ");
            msg.push_str(frame);
        }
    }
    (classified.status, msg)
}

/// Capture the current backtrace as a list of symbol strings.
///
/// Returns an empty list when backtraces are disabled in the environment.
pub fn capture_frames() -> Vec<String> {
    parse_frames(&Backtrace::force_capture().to_string())
}

fn parse_frames(rendered: &str) -> Vec<String> {
    let mut frames = Vec::new();
    for line in rendered.lines() {
        let line = line.trim_start();
        let Some((index, symbol)) = line.split_once(": ") else {
            continue;
        };
        if index.bytes().all(|b| b.is_ascii_digit()) && !symbol.is_empty() {
            frames.push(symbol.trim_end().to_owned());
        }
    }
    frames
}

/// Frames whose declaring path contains the procedure itself.
///
/// A frame belongs to the procedure when any `::`-separated segment of its
/// symbol equals the procedure name, or starts with the name followed by
/// the inner-scope delimiter `$`.
pub fn filter_procedure_frames<'a>(frames: &'a [String], procedure_name: &str) -> Vec<&'a String> {
    frames
        .iter()
        .filter(|frame| is_procedure_frame(frame, procedure_name))
        .collect()
}

fn is_procedure_frame(symbol: &str, procedure_name: &str) -> bool {
    symbol.split("::").any(|segment| {
        segment == procedure_name
            || (segment.len() > procedure_name.len()
                && segment.starts_with(procedure_name)
                && segment.as_bytes()[procedure_name.len()] == b'$')
    })
}
