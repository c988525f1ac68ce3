//! Client connection seen from the acquisition core.
//!
//! The command parser and socket handling live outside this crate. The core
//! only needs somewhere to report command results and push per-channel image
//! streams, which is what [`Connection`] describes. [`MemoryConnection`] keeps
//! everything in memory; the daemon binary and the tests use it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CamdError, CamdResult};
use crate::stream::ImageHeader;

/// Identifies a client connection.
pub type ConnectionId = u64;

/// Shared handle to a client connection.
pub type ConnectionRef = Arc<dyn Connection>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique connection id.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// One channel of an image about to be streamed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStream {
    /// Position among the enabled channels
    pub channel: usize,
    /// Physical channel index on the sensor
    pub physical: usize,
    /// Pixel bytes that will follow
    pub size: u64,
    /// Image metadata for this channel
    pub header: ImageHeader,
}

/// Client connection consumed by the state machine.
///
/// Implementations must not block: `send_binary_data` accepts what it can and
/// reports the count, the readout is re-polled for the rest.
pub trait Connection: Send + Sync {
    /// Connection id, unique per process.
    fn id(&self) -> ConnectionId;

    /// Name used in logs.
    fn name(&self) -> String {
        format!("connection {}", self.id())
    }

    /// Announces a new image: one binary stream per enabled channel.
    ///
    /// # Errors
    /// Any error aborts the readout before data is sent.
    fn start_image_data(&self, chip: usize, exposure: u64, channels: &[ChannelStream])
        -> CamdResult<()>;

    /// Pushes pixel bytes on one channel, returns how many were accepted.
    ///
    /// # Errors
    /// `TransientIo` when the client cannot take data right now, anything else
    /// aborts the readout.
    fn send_binary_data(&self, chip: usize, channel: usize, data: &[u8]) -> CamdResult<usize>;

    /// Closes the image streams; `complete` is false when a readout was aborted.
    fn end_image_data(&self, chip: usize, complete: bool);

    /// Reports success of a command.
    fn command_ok(&self, message: &str);

    /// Reports failure of a command, including asynchronous failures of queued
    /// or running exposures.
    fn command_failed(&self, error: &CamdError);
}

/// Image received by a [`MemoryConnection`].
#[derive(Debug, Clone, Default)]
pub struct ReceivedImage {
    /// Chip that produced the image
    pub chip: usize,
    /// Exposure number
    pub exposure: u64,
    /// Announced channel streams
    pub channels: Vec<ChannelStream>,
    /// Bytes received per enabled channel
    pub data: BTreeMap<usize, Vec<u8>>,
    /// Whether the stream was closed normally
    pub complete: Option<bool>,
}

impl ReceivedImage {
    /// Total pixel bytes received across channels.
    pub fn total_bytes(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    images: Vec<ReceivedImage>,
    oks: Vec<String>,
    failures: Vec<CamdError>,
    fail_next_send: Option<CamdError>,
}

/// Connection that records everything in memory.
///
/// `max_chunk` limits how many bytes one `send_binary_data` call accepts, which
/// is how backpressure is simulated.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    name: String,
    max_chunk: Option<usize>,
    state: Mutex<MemoryState>,
}

impl MemoryConnection {
    /// Unthrottled connection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: next_connection_id(),
            name: name.into(),
            max_chunk: None,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Connection accepting at most `max_chunk` bytes per send.
    pub fn throttled(name: impl Into<String>, max_chunk: usize) -> Self {
        Self {
            max_chunk: Some(max_chunk.max(1)),
            ..Self::new(name)
        }
    }

    /// Wraps the connection in a shared handle.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Makes the next `send_binary_data` call fail with `error`.
    pub fn fail_next_send(&self, error: CamdError) {
        self.state.lock().fail_next_send = Some(error);
    }

    /// Images announced on this connection, oldest first.
    pub fn images(&self) -> Vec<ReceivedImage> {
        self.state.lock().images.clone()
    }

    /// Removes and returns images whose streams were closed.
    pub fn take_finished_images(&self) -> Vec<ReceivedImage> {
        let mut state = self.state.lock();
        let (finished, open): (Vec<_>, Vec<_>) = std::mem::take(&mut state.images)
            .into_iter()
            .partition(|image| image.complete.is_some());
        state.images = open;
        finished
    }

    /// Success messages, oldest first.
    pub fn oks(&self) -> Vec<String> {
        self.state.lock().oks.clone()
    }

    /// Failures reported, oldest first.
    pub fn failures(&self) -> Vec<CamdError> {
        self.state.lock().failures.clone()
    }

    fn open_image_mut<'a>(
        state: &'a mut MemoryState,
        chip: usize,
    ) -> Option<&'a mut ReceivedImage> {
        state
            .images
            .iter_mut()
            .rev()
            .find(|image| image.chip == chip && image.complete.is_none())
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn start_image_data(
        &self,
        chip: usize,
        exposure: u64,
        channels: &[ChannelStream],
    ) -> CamdResult<()> {
        self.state.lock().images.push(ReceivedImage {
            chip,
            exposure,
            channels: channels.to_vec(),
            data: channels.iter().map(|c| (c.channel, Vec::new())).collect(),
            complete: None,
        });
        Ok(())
    }

    fn send_binary_data(&self, chip: usize, channel: usize, data: &[u8]) -> CamdResult<usize> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_send.take() {
            return Err(error);
        }
        let accepted = self.max_chunk.map_or(data.len(), |max| max.min(data.len()));
        let image = Self::open_image_mut(&mut state, chip).ok_or_else(|| {
            CamdError::ProtocolViolation(format!("no open image for chip {chip}"))
        })?;
        image
            .data
            .entry(channel)
            .or_default()
            .extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn end_image_data(&self, chip: usize, complete: bool) {
        let mut state = self.state.lock();
        if let Some(image) = Self::open_image_mut(&mut state, chip) {
            image.complete = Some(complete);
        }
    }

    fn command_ok(&self, message: &str) {
        self.state.lock().oks.push(message.to_string());
    }

    fn command_failed(&self, error: &CamdError) {
        self.state.lock().failures.push(error.clone());
    }
}
