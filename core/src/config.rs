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

use std::env;
use std::str::FromStr;

use log::warn;

use crate::definitions::AudioFormat;

pub const DEFAULT_CONNECTOR: &str = "/tmp/btaudiobuffer";
pub const DEFAULT_BUFFER_COUNT: u8 = 2;
pub const DEFAULT_EVENT_CAPACITY: usize = 32;

pub const ENV_CONNECTOR: &str = "BTAUDIOSINK_CONNECTOR";
pub const ENV_BUFFER_COUNT: &str = "BTAUDIOSINK_BUFFERS";
pub const ENV_EVENT_CAPACITY: &str = "BTAUDIOSINK_EVENT_CAPACITY";

/// Settings of one sink instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    /// Transport endpoint the device manager streams from.
    pub connector: String,
    /// Transport buffers requested on acquire.
    pub buffer_count: u8,
    /// Bound of the manager event queue.
    pub event_capacity: usize,
    /// Format used until the pipeline negotiates one.
    pub default_format: AudioFormat,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            connector: DEFAULT_CONNECTOR.to_string(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            default_format: AudioFormat::default(),
        }
    }
}

impl SinkConfig {
    /// Defaults overridden by the `BTAUDIOSINK_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(connector) = lookup(ENV_CONNECTOR).filter(|c| !c.is_empty()) {
            self.connector = connector;
        }
        if let Some(buffers) = parse_override(&lookup, ENV_BUFFER_COUNT) {
            self.buffer_count = buffers;
        }
        if let Some(capacity) = parse_override(&lookup, ENV_EVENT_CAPACITY) {
            self.event_capacity = capacity;
        }
        self
    }

    pub fn with_connector(mut self, connector: impl Into<String>) -> Self {
        self.connector = connector.into();
        self
    }

    pub fn with_buffer_count(mut self, buffer_count: u8) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }

    pub fn with_default_format(mut self, format: AudioFormat) -> Self {
        self.default_format = format;
        self
    }
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}
