/*
 * Copyright (c) 2020-2022, Stalwart Labs Ltd.
 *
 * This file is part of the Stalwart Mesh Server.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@stalw.art
 * for more details.
*/

use std::fmt::Display;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the membership engine. `Protocol` and `Transport`
/// failures are recovered locally by the task that hit them; `State` is
/// surfaced to the caller; `Configuration` is fatal at startup only, and
/// `Fatal` propagates a one-shot shutdown.
#[derive(Debug)]
pub enum Error {
    Protocol(String),
    Transport(std::io::Error),
    State(String),
    Configuration(String),
    Fatal(String),

    // Keyring failures, kept distinct so the codec can drop packets
    // silently while counters record the reason.
    DecryptionFailed,
    InvalidKeyLength(usize),
    PrimaryKeyNotFound,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Protocol(err) => write!(f, "Protocol error: {}", err),
            Error::Transport(err) => write!(f, "Transport error: {}", err),
            Error::State(err) => write!(f, "{}", err),
            Error::Configuration(err) => write!(f, "Configuration error: {}", err),
            Error::Fatal(err) => write!(f, "Fatal error: {}", err),
            Error::DecryptionFailed => write!(f, "No installed key could decrypt the message"),
            Error::InvalidKeyLength(len) => {
                write!(f, "Key length {} is not 16, 24 or 32 bytes", len)
            }
            Error::PrimaryKeyNotFound => write!(f, "Requested primary key is not in the keyring"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err)
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Protocol(format!("Failed to serialize message: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Protocol(format!("Failed to deserialize message: {}", err))
    }
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
