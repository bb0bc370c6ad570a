// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

use crate::SolverState;
use std::io;
use thiserror::Error;

/// Error kinds surfaced by the codec, the pipe transport and the driver.
#[derive(Debug, Error)]
pub enum Error {
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("allocation failed: {0}")]
    Alloc(String),

    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("operation '{operation}' invalid in solver state {state}")]
    InvalidSolverState {
        operation: &'static str,
        state: SolverState,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
