// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Fork-aware pipe handles.
//!
//! Every pipe end declares up front which side of the fork keeps it. After
//! forking, each process applies its side once and the unclaimed ends are
//! closed, instead of spreading ad-hoc `close` calls around the fork site.

use quapi_common::{Error, Result};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForkSide {
    Parent,
    Child,
}

/// One end of a pipe together with its post-fork owner.
pub(crate) struct PipeEnd {
    raw: RawFd,
    owned: Option<OwnedFd>,
    owner: ForkSide,
}

impl PipeEnd {
    fn new(fd: OwnedFd, owner: ForkSide) -> Self {
        PipeEnd {
            raw: fd.as_raw_fd(),
            owned: Some(fd),
            owner,
        }
    }

    /// The descriptor number, valid for as long as some process keeps the
    /// end open. Used to transmit descriptors in the header block.
    pub fn raw(&self) -> RawFd {
        self.raw
    }

    /// Claims ownership of the descriptor, e.g. to wrap it in a buffered
    /// transport on the owning side.
    pub fn take(&mut self) -> Result<OwnedFd> {
        self.owned
            .take()
            .ok_or_else(|| Error::other("pipe end was already closed or claimed"))
    }

    fn apply_fork_side(&mut self, side: ForkSide) {
        if self.owner != side {
            self.owned = None;
        }
    }
}

/// A pipe with both ends annotated for fork-time ownership transfer.
pub(crate) struct PipePair {
    pub read: PipeEnd,
    pub write: PipeEnd,
}

impl PipePair {
    pub fn new(read_owner: ForkSide, write_owner: ForkSide) -> Result<Self> {
        let (read, write) =
            nix::unistd::pipe().map_err(|e| Error::other(format!("pipe creation failed: {e}")))?;
        Ok(PipePair {
            read: PipeEnd::new(read, read_owner),
            write: PipeEnd::new(write, write_owner),
        })
    }

    /// `[read, write]` descriptor numbers for the header block.
    pub fn fds(&self) -> [RawFd; 2] {
        [self.read.raw(), self.write.raw()]
    }

    /// Closes the ends that do not belong to `side`.
    pub fn apply_fork_side(&mut self, side: ForkSide) {
        self.read.apply_fork_side(side);
        self.write.apply_fork_side(side);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_side_closes_the_other_ends() {
        let mut pair = PipePair::new(ForkSide::Child, ForkSide::Parent).unwrap();
        pair.apply_fork_side(ForkSide::Parent);
        assert!(pair.read.take().is_err());
        assert!(pair.write.take().is_ok());

        let mut pair = PipePair::new(ForkSide::Child, ForkSide::Parent).unwrap();
        pair.apply_fork_side(ForkSide::Child);
        assert!(pair.read.take().is_ok());
        assert!(pair.write.take().is_err());
    }

    #[test]
    fn take_claims_only_once() {
        let mut pair = PipePair::new(ForkSide::Parent, ForkSide::Parent).unwrap();
        assert!(pair.read.take().is_ok());
        assert!(pair.read.take().is_err());
    }
}
