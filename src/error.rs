// Copyright 2026 Daniel Pelikan
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

//! Error taxonomy shared by the transport and service layers.
//!
//! Every core operation reports a plain OK/Failed outcome: `Ok(())` or one
//! of these variants. Nothing panics across a component boundary.

use thiserror::Error;

/// Failure reasons for bridge and service operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FinderError {
    /// Operation attempted outside the state it is valid in.
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Radio is off, missing, or the bridge was never initialized.
    #[error("bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Connect timeout or I/O error on a link.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// A received message could not be parsed.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A read left more bytes pending than the connection accepts.
    #[error("{0} pending bytes exceed the read ceiling")]
    BufferOverload(usize),

    /// Not a `XX:XX:XX:XX:XX:XX` Bluetooth address.
    #[error("invalid bluetooth address: {0:?}")]
    InvalidAddress(String),
}

impl FinderError {
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            operation,
            state: format!("{:?}", state),
        }
    }
}

/// OK/Failed result of a core operation.
pub type FinderResult<T> = Result<T, FinderError>;
