// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fmt;

/// Error categories surfaced by the execution core.
///
/// Runtime filter timeouts are not errors and have no code here.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StatusCode {
    /// Repartitioning hit the maximum partition depth.
    ResourceLimitExceeded,
    IoError,
    Cancelled,
    InvalidArgument,
    /// Operation not allowed in the current state, e.g. disabling a filter that already has partials.
    IllegalState,
    /// Integer aggregate result left the 64-bit range.
    ArithmeticOverflow,
    Internal,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::ResourceLimitExceeded => "RESOURCE_LIMIT_EXCEEDED",
            StatusCode::IoError => "IO_ERROR",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::IllegalState => "ILLEGAL_STATE",
            StatusCode::ArithmeticOverflow => "ARITHMETIC_OVERFLOW",
            StatusCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

pub type StatusResult<T> = Result<T, Status>;

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn resource_limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceLimitExceeded, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::IoError, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::new(StatusCode::IllegalState, message)
    }

    pub fn arithmetic_overflow(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ArithmeticOverflow, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == StatusCode::Cancelled
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        Status::io_error(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for Status {
    fn from(err: arrow::error::ArrowError) -> Self {
        match err {
            arrow::error::ArrowError::IoError(msg, _) => Status::io_error(msg),
            other => Status::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_name() {
        let st = Status::resource_limit_exceeded("too deep");
        assert_eq!(st.to_string(), "RESOURCE_LIMIT_EXCEEDED: too deep");
        assert!(!st.is_cancelled());
        assert!(Status::cancelled("x").is_cancelled());
    }

    #[test]
    fn overflow_has_its_own_code() {
        let st = Status::arithmetic_overflow("SUM overflowed");
        assert_eq!(st.code, StatusCode::ArithmeticOverflow);
        assert_eq!(st.to_string(), "ARITHMETIC_OVERFLOW: SUM overflowed");
    }

    #[test]
    fn io_error_maps_to_io_code() {
        let st: Status = std::io::Error::other("disk gone").into();
        assert_eq!(st.code, StatusCode::IoError);
    }
}
