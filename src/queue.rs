//! FIFO of exposures requested while a chip was busy.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::connection::{ConnectionId, ConnectionRef};
use crate::geometry::Shutter;

/// A client's request for one exposure.
#[derive(Clone)]
pub struct ExposureRequest {
    /// Target chip
    pub chip: usize,
    /// Integration time
    pub exposure: Duration,
    /// Light or dark frame
    pub shutter: Shutter,
    /// Client that asked, receives the image or the error
    pub connection: ConnectionRef,
}

impl ExposureRequest {
    /// Creates a request.
    pub fn new(chip: usize, shutter: Shutter, exposure: Duration, connection: ConnectionRef) -> Self {
        Self {
            chip,
            exposure,
            shutter,
            connection,
        }
    }
}

impl fmt::Debug for ExposureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExposureRequest")
            .field("chip", &self.chip)
            .field("exposure", &self.exposure)
            .field("shutter", &self.shutter)
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// Pending exposures of one chip, served in submission order.
#[derive(Debug, Default)]
pub struct ExposureQueue {
    pending: VecDeque<ExposureRequest>,
}

impl ExposureQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request and returns its 1-based position.
    pub fn enqueue(&mut self, request: ExposureRequest) -> usize {
        self.pending.push_back(request);
        self.pending.len()
    }

    /// Pops the oldest request.
    pub fn drain_next(&mut self) -> Option<ExposureRequest> {
        self.pending.pop_front()
    }

    /// Empties the queue, handing the requests back for notification.
    pub fn cancel_all(&mut self) -> Vec<ExposureRequest> {
        self.pending.drain(..).collect()
    }

    /// Drops every request from `connection`, returns how many were removed.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|r| r.connection.id() != connection);
        before - self.pending.len()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending requests, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ExposureRequest> {
        self.pending.iter()
    }
}
