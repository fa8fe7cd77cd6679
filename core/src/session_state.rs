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

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::definitions::AudioFormat;

/// Acquisition and playback intent of the single sink session.
///
/// Only the coordinator mutates it, always inside one critical section of [`SharedSession`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SessionState {
    /// Acquisition wanted while no device was connectable; retried on the next connect.
    pub acquire_requested: bool,
    /// Playback wanted while the device could not stream; retried on the next connect.
    pub playback_requested: bool,
    /// A reset must unblock the pipeline's write loop.
    pub reset_requested: bool,
    pub acquired: bool,
    pub playing: bool,
    pub format: AudioFormat,
    /// Bumped on every disconnect. A facade call that saw it change while the lock was released
    /// must not write its result back as current activity.
    pub disconnects: u64,
}

impl SessionState {
    pub fn with_format(format: AudioFormat) -> Self {
        Self { format, ..Default::default() }
    }
}

/// Read-only copy of the session taken under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub acquire_requested: bool,
    pub playback_requested: bool,
    pub reset_requested: bool,
    pub acquired: bool,
    pub playing: bool,
    pub format: AudioFormat,
}

impl From<&SessionState> for SessionSnapshot {
    fn from(state: &SessionState) -> Self {
        Self {
            acquire_requested: state.acquire_requested,
            playback_requested: state.playback_requested,
            reset_requested: state.reset_requested,
            acquired: state.acquired,
            playing: state.playing,
            format: state.format,
        }
    }
}

/// The session behind its one lock.
#[derive(Debug, Default)]
pub(crate) struct SharedSession {
    inner: Mutex<SessionState>,
}

impl SharedSession {
    pub fn new(format: AudioFormat) -> Self {
        Self { inner: Mutex::new(SessionState::with_format(format)) }
    }

    /// Enters the critical section. The state is plain flags, so a poisoned lock is still consistent.
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::from(&*self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_idle_with_given_format() {
        let format = AudioFormat { sample_rate: 44_100, ..Default::default() };
        let session = SharedSession::new(format);
        let snapshot = session.snapshot();
        assert!(!snapshot.acquired);
        assert!(!snapshot.playing);
        assert!(!snapshot.acquire_requested);
        assert!(!snapshot.playback_requested);
        assert!(!snapshot.reset_requested);
        assert_eq!(snapshot.format, format);
        assert_eq!(session.lock().disconnects, 0);
    }

    #[test]
    fn lock_survives_poisoning() {
        let session = std::sync::Arc::new(SharedSession::default());
        let poisoner = session.clone();
        let _ = std::thread::spawn(move || {
            let mut state = poisoner.lock();
            state.reset_requested = true;
            panic!("poison the session lock");
        })
        .join();
        assert!(session.snapshot().reset_requested);
    }
}
