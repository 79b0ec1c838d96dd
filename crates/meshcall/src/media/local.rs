//! Local media handle owned by a session

use super::engine::{LocalTrack, TrackKind};
use crate::config::FacingMode;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Captured local tracks sharing one stream id
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<dyn LocalTrack>>,
    stopped: AtomicBool,
}

impl LocalMedia {
    /// Wrap captured tracks
    pub fn new(stream_id: impl Into<String>, tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
            stopped: AtomicBool::new(false),
        }
    }

    /// Stream id announced to remote participants
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Every track
    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Enable or disable every audio track
    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.tracks_of(TrackKind::Audio) {
            track.set_enabled(enabled);
        }
    }

    /// True if there is an audio track and every audio track is enabled
    pub fn audio_enabled(&self) -> bool {
        let mut audio = self.tracks_of(TrackKind::Audio).peekable();
        audio.peek().is_some() && audio.all(|t| t.is_enabled())
    }

    /// Switch the first video track's camera
    ///
    /// # Errors
    ///
    /// `Error::Unsupported` if there is no video track or it cannot switch.
    pub fn switch_camera(&self) -> Result<FacingMode> {
        self.tracks_of(TrackKind::Video)
            .next()
            .ok_or_else(|| Error::Unsupported("no local video track".to_string()))?
            .switch_camera()
    }

    /// Stop every track; returns false if already stopped
    pub fn stop_all(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        for track in &self.tracks {
            debug!("Stopping local {} track {}", track.kind(), track.id());
            track.stop();
        }
        true
    }

    /// Whether [`LocalMedia::stop_all`] has run
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
