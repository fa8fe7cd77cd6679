// Copyright 2025 HEM Sp. z o.o.
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

use std::fmt;

use crate::errors::SinkError;

/// Connection state of the Bluetooth audio sink as reported by the device manager.
///
/// The coordinator only observes this value, it never drives it directly. It is polled with
/// `query_state()` and pushed through the state-changed listener.
#[repr(i32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// The device manager could not determine the state.
    #[default]
    Unknown = 0,
    /// No sink device is assigned to the manager.
    Unassigned = 1,
    /// A device is connected and may be acquired.
    Connected = 2,
    /// A device is connected but it is not a usable audio sink.
    ConnectedBadDevice = 3,
    /// A device is connected but playback to it is not permitted.
    ConnectedRestricted = 4,
    /// The previously connected device went away.
    Disconnected = 5,
    /// The device is acquired and idle.
    Ready = 6,
    /// The device is acquired and consuming audio.
    Streaming = 7,
}

impl DeviceState {
    /// Maps the manager's numeric state code. Unrecognised codes become `Unknown`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Unassigned,
            2 => Self::Connected,
            3 => Self::ConnectedBadDevice,
            4 => Self::ConnectedRestricted,
            5 => Self::Disconnected,
            6 => Self::Ready,
            7 => Self::Streaming,
            _ => Self::Unknown,
        }
    }

    /// True while the device is held by this host (acquired, idle or streaming).
    pub fn is_acquired(self) -> bool {
        matches!(self, Self::Ready | Self::Streaming)
    }

    /// True for connected devices that can never be played to.
    pub fn is_rejected(self) -> bool {
        matches!(self, Self::ConnectedBadDevice | Self::ConnectedRestricted)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Unassigned => "unassigned",
            Self::Connected => "connected",
            Self::ConnectedBadDevice => "connected (bad device)",
            Self::ConnectedRestricted => "connected (restricted)",
            Self::Disconnected => "disconnected",
            Self::Ready => "ready",
            Self::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Audio format negotiated with the sink device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    /// Transport frame rate in 1/100 Hz units.
    pub frame_rate_centihertz: u16,
    pub channels: u8,
    pub bytes_per_frame: u8,
    pub bytes_per_sample: u8,
}

impl AudioFormat {
    pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
    pub const DEFAULT_FRAME_RATE_CENTIHERTZ: u16 = 100 * 100;

    /// Sample resolution in bits.
    pub fn bits_per_sample(&self) -> u16 {
        u16::from(self.bytes_per_sample) * 8
    }

    /// Transport frame rate in Hz.
    pub fn frame_rate_hz(&self) -> f32 {
        f32::from(self.frame_rate_centihertz) / 100.0
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: Self::DEFAULT_SAMPLE_RATE,
            frame_rate_centihertz: Self::DEFAULT_FRAME_RATE_CENTIHERTZ,
            channels: 2,
            bytes_per_frame: 4,
            bytes_per_sample: 2,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {} bit, {:.2} Hz frames",
            self.sample_rate,
            self.channels,
            self.bits_per_sample(),
            self.frame_rate_hz()
        )
    }
}

/// Raw sample encoding of the pipeline stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    S16Be,
    S24Le,
    S32Le,
    F32Le,
}

/// Stream parameters handed over by the rendering pipeline on `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u8,
    pub bytes_per_frame: u8,
    pub bytes_per_sample: u8,
    /// Size in bytes of one ring buffer segment, i.e. one write.
    pub segment_size: u32,
}

/// Formats the sink device accepts: interleaved S16LE, 44.1 to 48 kHz, mono or stereo.
pub const SUPPORTED_SAMPLE_RATES: std::ops::RangeInclusive<u32> = 44_100..=48_000;
pub const SUPPORTED_CHANNELS: std::ops::RangeInclusive<u8> = 1..=2;

impl StreamSpec {
    /// Interleaved S16LE stream with a segment of `segment_size` bytes.
    pub fn s16le(sample_rate: u32, channels: u8, segment_size: u32) -> Self {
        Self {
            sample_format: SampleFormat::S16Le,
            sample_rate,
            channels,
            bytes_per_frame: channels.saturating_mul(2),
            bytes_per_sample: 2,
            segment_size,
        }
    }

    /// Validates the stream against the accepted capabilities and derives the device format.
    pub fn negotiate(&self) -> Result<AudioFormat, SinkError> {
        if self.sample_format != SampleFormat::S16Le {
            return Err(SinkError::UnsupportedFormat(format!(
                "sample format {:?} (only S16LE is accepted)",
                self.sample_format
            )));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(SinkError::UnsupportedFormat(format!("sample rate {} Hz", self.sample_rate)));
        }
        if self.bytes_per_sample == 0 || self.bytes_per_frame % self.bytes_per_sample != 0 {
            return Err(SinkError::UnsupportedFormat(format!(
                "{} bytes per frame with {} bytes per sample",
                self.bytes_per_frame, self.bytes_per_sample
            )));
        }
        let channels = self.bytes_per_frame / self.bytes_per_sample;
        if channels != self.channels || !SUPPORTED_CHANNELS.contains(&channels) {
            return Err(SinkError::UnsupportedFormat(format!(
                "{} channels ({} declared)",
                channels, self.channels
            )));
        }

        Ok(AudioFormat {
            sample_rate: self.sample_rate,
            frame_rate_centihertz: self.frame_rate_centihertz(),
            channels,
            bytes_per_frame: self.bytes_per_frame,
            bytes_per_sample: self.bytes_per_sample,
        })
    }

    /// Segments per second in 1/100 Hz units, saturated to the device field width.
    fn frame_rate_centihertz(&self) -> u16 {
        if self.segment_size == 0 {
            return AudioFormat::DEFAULT_FRAME_RATE_CENTIHERTZ;
        }
        let bytes_per_second = u64::from(self.sample_rate) * u64::from(self.bytes_per_frame);
        let centihertz = bytes_per_second * 100 / u64::from(self.segment_size);
        u16::try_from(centihertz).unwrap_or(u16::MAX)
    }
}
