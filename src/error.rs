// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Error types for the A1 chain driver

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// General error not covered by a more specific kind below.
    #[fail(display = "{}", _0)]
    General(String),

    /// SPI transport failure (the transfer itself failed, not a protocol mismatch).
    #[fail(display = "SPI: {}", _0)]
    Spi(String),

    /// I2C transport failure (board selector / temperature sensor).
    #[fail(display = "I2C: {}", _0)]
    I2c(String),

    /// A1 command frame came back with an opcode/echo mismatch.
    #[fail(display = "protocol: {}", _0)]
    Protocol(String),

    /// PLL divider computation or lock-wait failure.
    #[fail(display = "PLL: {}", _0)]
    Pll(String),

    /// Error concerning one particular chip.
    #[fail(display = "chip {}: {}", _0, _1)]
    Chip(usize, String),

    /// Error concerning a whole chain.
    #[fail(display = "chain {}: {}", _0, _1)]
    Chain(usize, String),

    /// Board selector (I2C mux) error.
    #[fail(display = "board selector: {}", _0)]
    Selector(String),

    /// Configuration parsing/validation error.
    #[fail(display = "config: {}", _0)]
    Config(String),
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::General(msg)),
        }
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
