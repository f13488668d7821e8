//! Exclusive ownership of the audio capture device.
//!
//! The microphone is held by at most one of the room microphone (pre-connect
//! buffering, then the published track) and turn recording (turn pipeline).
//! A second acquisition fails with `AudioError::DeviceBusy` instead of
//! queueing.

use std::sync::{Arc, Mutex};

use crate::error::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOwner {
    /// Held from pre-connect buffering until the room microphone is disabled
    RoomMicrophone,
    TurnRecording,
}

impl DeviceOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceOwner::RoomMicrophone => "room microphone",
            DeviceOwner::TurnRecording => "turn recording",
        }
    }
}

/// Shared arbiter handed to everything that opens the microphone.
#[derive(Debug, Clone, Default)]
pub struct DeviceArbiter {
    holder: Arc<Mutex<Option<DeviceOwner>>>,
}

impl DeviceArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the device for `owner`. The lease releases it on drop.
    pub fn acquire(&self, owner: DeviceOwner) -> Result<DeviceLease, AudioError> {
        let mut holder = self.holder.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = *holder {
            log::warn!(
                "Capture device requested by {} while held by {}",
                owner.as_str(),
                current.as_str()
            );
            return Err(AudioError::DeviceBusy {
                holder: current.as_str().to_string(),
            });
        }
        *holder = Some(owner);
        log::debug!("Capture device acquired by {}", owner.as_str());
        Ok(DeviceLease {
            arbiter: self.clone(),
            owner,
        })
    }

    pub fn holder(&self) -> Option<DeviceOwner> {
        *self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Proof of exclusive access to the capture device.
#[derive(Debug)]
pub struct DeviceLease {
    arbiter: DeviceArbiter,
    owner: DeviceOwner,
}

impl DeviceLease {
    pub fn owner(&self) -> DeviceOwner {
        self.owner
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut holder = self.arbiter.holder.lock().unwrap_or_else(|e| e.into_inner());
        if *holder == Some(self.owner) {
            *holder = None;
            log::debug!("Capture device released by {}", self.owner.as_str());
        }
    }
}
