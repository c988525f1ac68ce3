//! Multi-channel readout streaming.
//!
//! A readout opens one binary stream per enabled channel. Each stream owes the
//! client exactly `chip_byte_size` bytes; [`ReadoutStream::write_binary_data_size`]
//! reports what is still owed and reaching zero on every channel is what marks
//! the readout complete. How fast the driver digitizes pixels and how fast the
//! client accepts bytes are independent: a short send just leaves bytes owed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::chip::ExposureSettings;
use crate::connection::{ChannelStream, ConnectionRef};
use crate::error::{CamdError, CamdResult};
use crate::geometry::DataType;
use crate::statistics::{ReadoutStatistics, StatisticsSummary};

// =============================================================================
// Image header
// =============================================================================

/// Metadata sent ahead of each channel's pixel stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageHeader {
    /// Pixel data type
    pub data_type: DataType,
    /// Number of axes, always 2
    pub naxes: u16,
    /// Binned width
    pub width: u32,
    /// Binned height
    pub height: u32,
    /// Horizontal binning
    pub bin_horizontal: u16,
    /// Vertical binning
    pub bin_vertical: u16,
    /// ROI left column
    pub x: u32,
    /// ROI top row
    pub y: u32,
    /// Filter position, -1 when no wheel is attached
    pub filter: i16,
    /// Shutter code
    pub shutter: u16,
    /// Physical channel
    pub channel: u16,
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            data_type: DataType::UShort,
            naxes: 2,
            width: 0,
            height: 0,
            bin_horizontal: 1,
            bin_vertical: 1,
            x: 0,
            y: 0,
            filter: -1,
            shutter: 0,
            channel: 0,
        }
    }
}

impl ImageHeader {
    /// Encoded size in bytes.
    pub const ENCODED_LEN: usize = 30;

    /// Header for `physical` channel of the frame described by `settings`.
    pub fn for_channel(settings: &ExposureSettings, physical: usize) -> Self {
        let narrow = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
        Self {
            data_type: settings.data_type,
            naxes: 2,
            width: settings.width_binned(),
            height: settings.height_binned(),
            bin_horizontal: narrow(settings.binning.horizontal),
            bin_vertical: narrow(settings.binning.vertical),
            x: settings.roi.x,
            y: settings.roi.y,
            filter: settings
                .filter
                .and_then(|f| i16::try_from(f).ok())
                .unwrap_or(-1),
            shutter: settings.shutter.code(),
            channel: u16::try_from(physical).unwrap_or(u16::MAX),
        }
    }

    /// Encodes the header in network byte order.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_i16(self.data_type.code());
        buf.put_u16(self.naxes);
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u16(self.bin_horizontal);
        buf.put_u16(self.bin_vertical);
        buf.put_u32(self.x);
        buf.put_u32(self.y);
        buf.put_i16(self.filter);
        buf.put_u16(self.shutter);
        buf.put_u16(self.channel);
        buf.freeze()
    }

    /// Decodes a header produced by [`ImageHeader::encode`].
    ///
    /// # Errors
    /// `ProtocolViolation` for short input or an unknown data type code.
    pub fn decode(mut buf: impl Buf) -> CamdResult<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(CamdError::ProtocolViolation(format!(
                "image header needs {} bytes, got {}",
                Self::ENCODED_LEN,
                buf.remaining()
            )));
        }
        let code = buf.get_i16();
        let data_type = data_type_from_code(code).ok_or_else(|| {
            CamdError::ProtocolViolation(format!("unknown data type code {code}"))
        })?;
        Ok(Self {
            data_type,
            naxes: buf.get_u16(),
            width: buf.get_u32(),
            height: buf.get_u32(),
            bin_horizontal: buf.get_u16(),
            bin_vertical: buf.get_u16(),
            x: buf.get_u32(),
            y: buf.get_u32(),
            filter: buf.get_i16(),
            shutter: buf.get_u16(),
            channel: buf.get_u16(),
        })
    }
}

fn data_type_from_code(code: i16) -> Option<DataType> {
    [
        DataType::Byte,
        DataType::Short,
        DataType::Long,
        DataType::LongLong,
        DataType::Float,
        DataType::Double,
        DataType::SByte,
        DataType::UShort,
        DataType::ULong,
    ]
    .into_iter()
    .find(|dt| dt.code() == code)
}

// =============================================================================
// Channels
// =============================================================================

/// Enabled mask over the channels a sensor can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannels {
    enabled: Vec<bool>,
}

impl DataChannels {
    /// `count` channels, all enabled.
    pub fn new(count: usize) -> Self {
        Self {
            enabled: vec![true; count.max(1)],
        }
    }

    /// Physical channel count.
    pub fn count(&self) -> usize {
        self.enabled.len()
    }

    /// Number of enabled channels.
    pub fn enabled_count(&self) -> usize {
        self.enabled.iter().filter(|on| **on).count()
    }

    /// Enabled mask.
    pub fn mask(&self) -> &[bool] {
        &self.enabled
    }

    /// Replaces the enabled mask.
    ///
    /// # Errors
    /// `InvalidParameter` if the mask length differs from the channel count or
    /// nothing would be enabled.
    pub fn set_mask(&mut self, mask: &[bool]) -> CamdResult<()> {
        if mask.len() != self.enabled.len() {
            return Err(CamdError::InvalidParameter(format!(
                "channel mask has {} entries, sensor has {} channels",
                mask.len(),
                self.enabled.len()
            )));
        }
        if !mask.iter().any(|on| *on) {
            return Err(CamdError::InvalidParameter(
                "at least one channel must stay enabled".into(),
            ));
        }
        self.enabled = mask.to_vec();
        Ok(())
    }

    /// Physical index of the `n`-th enabled channel.
    pub fn physical_channel(&self, n: usize) -> Option<usize> {
        self.enabled
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(index, _)| index)
            .nth(n)
    }

    /// Physical indices of the enabled channels, in order.
    pub fn enabled_physical(&self) -> Vec<usize> {
        (0..self.enabled_count())
            .filter_map(|n| self.physical_channel(n))
            .collect()
    }
}

// =============================================================================
// Readout stream
// =============================================================================

#[derive(Debug, Clone)]
struct ChannelCursor {
    physical: usize,
    size: u64,
    sent: u64,
}

impl ChannelCursor {
    fn remaining(&self) -> u64 {
        self.size - self.sent
    }
}

/// Outgoing streams of one readout cycle.
pub struct ReadoutStream {
    chip: usize,
    exposure: u64,
    connection: Option<ConnectionRef>,
    channels: Vec<ChannelCursor>,
    statistics: Option<ReadoutStatistics>,
    started: Instant,
    drained_at: Option<Instant>,
    drain_events: u32,
}

impl std::fmt::Debug for ReadoutStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadoutStream")
            .field("chip", &self.chip)
            .field("exposure", &self.exposure)
            .field("channels", &self.channels)
            .field("drain_events", &self.drain_events)
            .finish_non_exhaustive()
    }
}

impl ReadoutStream {
    /// Opens one stream per enabled channel of `settings` on `connection`.
    ///
    /// Without a connection the bytes are counted and discarded so the
    /// hardware still gets read out.
    ///
    /// # Errors
    /// Whatever the connection returns from `start_image_data`.
    pub fn open(
        settings: &ExposureSettings,
        connection: Option<ConnectionRef>,
        collect_statistics: bool,
    ) -> CamdResult<Self> {
        let size = settings.chip_byte_size();
        let streams: Vec<ChannelStream> = settings
            .channels
            .iter()
            .enumerate()
            .map(|(channel, &physical)| ChannelStream {
                channel,
                physical,
                size,
                header: ImageHeader::for_channel(settings, physical),
            })
            .collect();

        if let Some(conn) = &connection {
            conn.start_image_data(settings.chip, settings.number, &streams)?;
        }
        debug!(
            chip = settings.chip,
            exposure = settings.number,
            channels = streams.len(),
            bytes_per_channel = size,
            "readout stream opened"
        );

        Ok(Self {
            chip: settings.chip,
            exposure: settings.number,
            connection,
            channels: streams
                .iter()
                .map(|s| ChannelCursor {
                    physical: s.physical,
                    size: s.size,
                    sent: 0,
                })
                .collect(),
            statistics: collect_statistics
                .then(|| ReadoutStatistics::new(settings.data_type, settings.channels.len())),
            started: Instant::now(),
            drained_at: None,
            drain_events: 0,
        })
    }

    /// Number of enabled channels in this readout.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Physical index of enabled channel `channel`.
    pub fn physical_channel(&self, channel: usize) -> Option<usize> {
        self.channels.get(channel).map(|c| c.physical)
    }

    /// Sends up to `data.len()` bytes on `channel`, returns the bytes accepted.
    ///
    /// Bytes beyond what the channel still owes are not sent.
    ///
    /// # Errors
    /// * `ProtocolViolation` - unknown channel
    /// * whatever the connection returns, `TransientIo` included
    pub fn send_readout_data(&mut self, channel: usize, data: &[u8]) -> CamdResult<usize> {
        let cursor = self.channels.get(channel).ok_or_else(|| {
            CamdError::ProtocolViolation(format!(
                "chip {} readout has {} channels, got channel {channel}",
                self.chip,
                self.channels.len()
            ))
        })?;

        let owed = usize::try_from(cursor.remaining()).unwrap_or(usize::MAX);
        let chunk = &data[..data.len().min(owed)];
        if chunk.is_empty() {
            return Ok(0);
        }

        let accepted = match &self.connection {
            Some(conn) => conn.send_binary_data(self.chip, channel, chunk)?.min(chunk.len()),
            None => chunk.len(),
        };

        if let Some(stats) = self.statistics.as_mut() {
            stats.update(channel, &chunk[..accepted]);
        }
        if let Some(cursor) = self.channels.get_mut(channel) {
            cursor.sent += accepted as u64;
        }
        trace!(chip = self.chip, channel, accepted, "readout data sent");

        if accepted > 0 && self.drained_at.is_none() && self.all_drained() {
            self.drained_at = Some(Instant::now());
            self.drain_events += 1;
        }
        Ok(accepted)
    }

    /// Bytes still owed on `channel`; zero for unknown channels.
    pub fn write_binary_data_size(&self, channel: usize) -> u64 {
        self.channels.get(channel).map_or(0, ChannelCursor::remaining)
    }

    /// Bytes still owed across all channels.
    pub fn total_remaining(&self) -> u64 {
        self.channels.iter().map(ChannelCursor::remaining).sum()
    }

    /// Bytes sent across all channels.
    pub fn total_sent(&self) -> u64 {
        self.channels.iter().map(|c| c.sent).sum()
    }

    /// True once every channel has been sent in full.
    pub fn all_drained(&self) -> bool {
        self.channels.iter().all(|c| c.remaining() == 0)
    }

    /// How many times the streams went from owing bytes to fully drained.
    pub fn drain_events(&self) -> u32 {
        self.drain_events
    }

    /// Statistics collected so far, when enabled.
    pub fn statistics(&self) -> Option<StatisticsSummary> {
        self.statistics.as_ref().map(ReadoutStatistics::summary)
    }

    /// Drops the client; remaining bytes are discarded as they are produced.
    pub fn detach_connection(&mut self) -> Option<ConnectionRef> {
        self.connection.take()
    }

    /// Client receiving this readout, if still attached.
    pub fn connection(&self) -> Option<&ConnectionRef> {
        self.connection.as_ref()
    }

    /// Pixels per second sent so far, over the time since the stream opened.
    pub fn speed(&self, pixel_byte_size: u32) -> Option<f64> {
        let end = self.drained_at.unwrap_or_else(Instant::now);
        let elapsed = end.duration_since(self.started).as_secs_f64();
        let pixels = self.total_sent() / u64::from(pixel_byte_size.max(1));
        (elapsed > 0.0).then(|| pixels as f64 / elapsed)
    }

    /// Closes the client streams.
    pub fn close(&self, complete: bool) {
        if let Some(conn) = &self.connection {
            conn.end_image_data(self.chip, complete);
        }
    }
}

// =============================================================================
// Driver handle
// =============================================================================

/// What a driver sees during one readout step.
pub struct Readout<'a> {
    settings: &'a ExposureSettings,
    stream: &'a mut ReadoutStream,
}

impl<'a> Readout<'a> {
    pub(crate) fn new(settings: &'a ExposureSettings, stream: &'a mut ReadoutStream) -> Self {
        Self { settings, stream }
    }

    /// Frame being read out.
    pub fn settings(&self) -> &ExposureSettings {
        self.settings
    }

    /// Number of enabled channels.
    pub fn channel_count(&self) -> usize {
        self.stream.channel_count()
    }

    /// Physical index of enabled channel `channel`.
    pub fn physical_channel(&self, channel: usize) -> Option<usize> {
        self.stream.physical_channel(channel)
    }

    /// See [`ReadoutStream::send_readout_data`].
    ///
    /// # Errors
    /// `ProtocolViolation` for an unknown channel, connection errors otherwise.
    pub fn send_readout_data(&mut self, channel: usize, data: &[u8]) -> CamdResult<usize> {
        self.stream.send_readout_data(channel, data)
    }

    /// See [`ReadoutStream::write_binary_data_size`].
    pub fn write_binary_data_size(&self, channel: usize) -> u64 {
        self.stream.write_binary_data_size(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;
    use crate::geometry::{Binning2D, Rect, Shutter};
    use std::sync::Arc;
    use std::time::Duration;

    fn settings(channels: Vec<usize>) -> ExposureSettings {
        ExposureSettings {
            number: 7,
            chip: 0,
            roi: Rect::new(10, 20, 4, 2),
            binning: Binning2D::unbinned(),
            data_type: DataType::UShort,
            channels,
            shutter: Shutter::Light,
            exposure: Duration::from_millis(10),
            started_at: chrono::Utc::now(),
            filter: Some(3),
        }
    }

    #[test]
    fn test_header_encoding_layout() {
        let header = ImageHeader::for_channel(&settings(vec![0]), 2);
        let encoded = header.encode();
        assert_eq!(encoded.len(), ImageHeader::ENCODED_LEN);
        // data type code 20 in network order
        assert_eq!(&encoded[..2], &[0, 20]);
        assert_eq!(ImageHeader::decode(encoded).unwrap(), header);
    }

    #[test]
    fn test_header_decode_rejects_short_input() {
        let err = ImageHeader::decode(&[0u8; 4][..]).unwrap_err();
        assert!(matches!(err, CamdError::ProtocolViolation(_)));
    }

    #[test]
    fn test_physical_channel_mapping() {
        let mut channels = DataChannels::new(4);
        channels.set_mask(&[false, true, false, true]).unwrap();
        assert_eq!(channels.enabled_count(), 2);
        assert_eq!(channels.physical_channel(0), Some(1));
        assert_eq!(channels.physical_channel(1), Some(3));
        assert_eq!(channels.physical_channel(2), None);
        assert_eq!(channels.enabled_physical(), vec![1, 3]);
    }

    #[test]
    fn test_channel_mask_validation() {
        let mut channels = DataChannels::new(2);
        assert!(channels.set_mask(&[true]).is_err());
        assert!(channels.set_mask(&[false, false]).is_err());
        assert_eq!(channels.mask(), &[true, true]);
    }

    #[test]
    fn test_stream_drains_once_per_channel_set() {
        let conn = MemoryConnection::throttled("client", 5).shared();
        let frame = settings(vec![0, 1]);
        let mut stream =
            ReadoutStream::open(&frame, Some(conn.clone() as ConnectionRef), true).unwrap();
        let size = frame.chip_byte_size();
        assert_eq!(size, 16);
        assert_eq!(stream.write_binary_data_size(0), 16);

        let data = vec![1u8; 16];
        for channel in 0..2 {
            let mut offset = 0;
            while offset < data.len() {
                offset += stream.send_readout_data(channel, &data[offset..]).unwrap();
            }
        }
        assert!(stream.all_drained());
        assert_eq!(stream.drain_events(), 1);
        assert_eq!(stream.total_sent(), 32);
        // extra bytes are refused once drained
        assert_eq!(stream.send_readout_data(0, &[1, 2]).unwrap(), 0);
        assert_eq!(stream.drain_events(), 1);

        stream.close(true);
        let images = conn.take_finished_images();
        assert_eq!(images[0].total_bytes(), 32);
        assert_eq!(images[0].channels[1].header.channel, 1);
        assert_eq!(stream.statistics().unwrap().pixels, 16);
    }

    #[test]
    fn test_unknown_channel_is_protocol_violation() {
        let mut stream = ReadoutStream::open(&settings(vec![0]), None, false).unwrap();
        let err = stream.send_readout_data(1, &[0, 0]).unwrap_err();
        assert!(matches!(err, CamdError::ProtocolViolation(_)));
    }

    #[test]
    fn test_detached_stream_discards() {
        let conn: Arc<MemoryConnection> = MemoryConnection::new("gone").shared();
        let mut stream =
            ReadoutStream::open(&settings(vec![0]), Some(conn.clone() as ConnectionRef), false)
                .unwrap();
        assert!(stream.detach_connection().is_some());
        assert_eq!(stream.send_readout_data(0, &[0u8; 16]).unwrap(), 16);
        assert!(stream.all_drained());
        assert_eq!(conn.images()[0].total_bytes(), 0);
        assert!(stream.connection().is_none());
    }
}
