//! An [`IpLayer`] that records frames instead of delivering them.
//!
//! A tap gives tests and simulations direct access to everything a stack
//! transmits. Frames can be inspected, dropped, or fed into another stack's
//! [`Tcp::process`](super::Tcp::process) to connect two stacks by hand.

use super::ip::{IpAddress, IpLayer, RouteError, SendError};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;

/// A segment handed to the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub local: IpAddress,
    pub remote: IpAddress,
    pub protocol: u8,
    /// IPv4 type of service or IPv6 traffic class
    pub tos: u8,
    pub bytes: Vec<u8>,
}

/// Records every frame sent through it.
#[derive(Debug, Clone)]
pub struct Tap {
    local: IpAddress,
    unreachable: FxHashSet<IpAddress>,
    frames: VecDeque<Frame>,
}

impl Tap {
    /// Creates a tap whose single interface has the address `local`.
    pub fn new(local: impl Into<IpAddress>) -> Self {
        Self {
            local: local.into(),
            unreachable: Default::default(),
            frames: Default::default(),
        }
    }

    /// Makes route resolution fail for `remote`.
    pub fn unreachable(mut self, remote: impl Into<IpAddress>) -> Self {
        self.unreachable.insert(remote.into());
        self
    }

    /// The interface address
    pub fn local(&self) -> IpAddress {
        self.local
    }

    /// Takes the oldest recorded frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Takes every recorded frame.
    pub fn frames(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }

    /// The number of recorded frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing has been recorded since the last drain
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl IpLayer for Tap {
    fn resolve_route(&self, remote: IpAddress) -> Result<IpAddress, RouteError> {
        if self.unreachable.contains(&remote) || !self.local.same_family(&remote) {
            Err(RouteError(remote))
        } else {
            Ok(self.local)
        }
    }

    fn send(
        &mut self,
        local: IpAddress,
        remote: IpAddress,
        protocol: u8,
        tos: u8,
        segment: Vec<u8>,
    ) -> Result<(), SendError> {
        if self.unreachable.contains(&remote) {
            Err(SendError::NoRoute(remote))?
        }
        self.frames.push_back(Frame {
            local,
            remote,
            protocol,
            tos,
            bytes: segment,
        });
        Ok(())
    }
}
