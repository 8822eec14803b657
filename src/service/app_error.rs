// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::ErrorKind;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("frame of length {0} is too large, limit is {1}")]
    FrameTooLarge(usize, usize),

    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),

    #[error("write queue of session {0} is full ({1} frames)")]
    WriteQueueFull(String, usize),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, an incomplete frame is still being accumulated
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Whether this error just means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            AppError::IoError(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_classification() {
        let reset = AppError::from(std::io::Error::from(ErrorKind::ConnectionReset));
        assert!(reset.is_disconnect());
        let refused = AppError::from(std::io::Error::from(ErrorKind::ConnectionRefused));
        assert!(!refused.is_disconnect());
        assert!(!AppError::Incomplete.is_disconnect());
    }

    #[test]
    fn error_messages() {
        let err = AppError::FrameTooLarge(10, 4);
        assert_eq!(err.to_string(), "frame of length 10 is too large, limit is 4");
        let err = AppError::WriteQueueFull("abc".to_string(), 2);
        assert_eq!(err.to_string(), "write queue of session abc is full (2 frames)");
    }
}
