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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    /// payload errors, raised by handlers while decoding bodies
    #[error("payload decode error: {0}")]
    PayloadDecode(#[from] prost::DecodeError),

    /// marker error, a frame is not fully buffered yet
    #[error("incomplete frame")]
    Incomplete,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(value: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::ChannelSendError(value.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for AppError {
    fn from(value: tokio::sync::oneshot::error::RecvError) -> Self {
        AppError::ChannelRecvError(value.to_string())
    }
}
