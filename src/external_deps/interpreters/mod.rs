//! JavaScript interpreter infrastructure.
//!
//! Provides a shared trait and error type used by the script-challenge solver
//! and the verification subsystem, along with a Boa-backed implementation.
//! Every evaluation runs in a fresh, isolated scope.

mod boa;

pub use boa::BoaJavascriptInterpreter;

use thiserror::Error;

/// Abstraction over JavaScript runtimes capable of evaluating challenge logic.
pub trait JavascriptInterpreter: Send + Sync {
    /// Evaluate a challenge computation and return the answer. Numeric answers
    /// are formatted with 10 decimal places, matching what challenge forms
    /// expect to receive.
    fn solve_expression(&self, expression: &str, host: &str) -> Result<String, InterpreterError>;

    /// Execute an arbitrary script within an isolated scope, returning the
    /// final value rendered as a string.
    fn execute(&self, script: &str, host: &str) -> Result<String, InterpreterError>;
}

/// Failures produced by JavaScript runtimes.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("javascript execution failed: {0}")]
    Execution(String),
    #[error("javascript engine error: {0}")]
    Other(String),
}

impl InterpreterError {
    /// Parse errors are fatal for verification purposes; runtime errors from
    /// scripts expecting a full browser environment are not.
    pub fn is_syntax_error(&self) -> bool {
        matches!(self, InterpreterError::Execution(msg) if msg.contains("SyntaxError"))
    }
}

/// Convenience alias for runtime results.
pub type InterpreterResult<T> = Result<T, InterpreterError>;
