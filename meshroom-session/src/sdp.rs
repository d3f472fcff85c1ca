//! Session description bandwidth shaping
//!
//! Rewrites the text of an offer or answer so that a media section advertises
//! an application-specific bandwidth ceiling (`b=AS:<kbps>`). The transform is
//! line based and leaves every other line untouched.

use crate::types::TrackKind;
use std::sync::Arc;
use tracing::debug;

/// Cap the bandwidth of the `kind` media section of `sdp` at `bitrate_kbps`.
///
/// The bandwidth line goes right after the media line and any information
/// (`i=`) or connection (`c=`) lines that follow it. An existing bandwidth
/// line in the section is replaced rather than duplicated, so shaping twice
/// with the same rate is idempotent. A payload without the requested media
/// section is returned unchanged.
#[must_use]
pub fn set_media_bitrate(sdp: &str, bitrate_kbps: u32, kind: TrackKind) -> String {
    let mut lines: Vec<String> = sdp.split('\n').map(str::to_string).collect();
    let media_prefix = format!("m={}", kind.as_str());

    let Some(media_line) = lines.iter().position(|line| line.starts_with(&media_prefix)) else {
        debug!(media = %kind, "No media section to shape");
        return sdp.to_string();
    };

    let mut position = media_line + 1;
    while position < lines.len()
        && (lines[position].starts_with("i=") || lines[position].starts_with("c="))
    {
        position += 1;
    }

    let section_end = lines[position..]
        .iter()
        .position(|line| line.starts_with("m="))
        .map_or(lines.len(), |offset| position + offset);

    let existing = lines[position..section_end]
        .iter()
        .position(|line| line.starts_with("b="))
        .map(|offset| position + offset);

    let line_ending = if lines[media_line].ends_with('\r') { "\r" } else { "" };
    let bandwidth_line = format!("b=AS:{bitrate_kbps}{line_ending}");

    match existing {
        Some(index) => {
            debug!(media = %kind, line = index, bitrate_kbps, "Replacing bandwidth line");
            lines[index] = bandwidth_line;
        }
        None => {
            debug!(media = %kind, line = position, bitrate_kbps, "Inserting bandwidth line");
            lines.insert(position, bandwidth_line);
        }
    }

    lines.join("\n")
}

/// Shared rewrite applied to locally generated session descriptions
pub type SdpTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Configured bandwidth ceilings, in kbps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthCeilings {
    pub video_kbps: Option<u32>,
    pub audio_kbps: Option<u32>,
}

impl BandwidthCeilings {
    #[must_use]
    pub const fn new(video_kbps: Option<u32>, audio_kbps: Option<u32>) -> Self {
        Self {
            video_kbps,
            audio_kbps,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.video_kbps.is_none() && self.audio_kbps.is_none()
    }

    /// Shape video first, then audio
    #[must_use]
    pub fn apply(&self, sdp: &str) -> String {
        let mut shaped = sdp.to_string();
        if let Some(kbps) = self.video_kbps {
            shaped = set_media_bitrate(&shaped, kbps, TrackKind::Video);
        }
        if let Some(kbps) = self.audio_kbps {
            shaped = set_media_bitrate(&shaped, kbps, TrackKind::Audio);
        }
        shaped
    }

    /// Transform for connection options, or `None` when nothing is capped
    #[must_use]
    pub fn transform(&self) -> Option<SdpTransform> {
        if self.is_empty() {
            return None;
        }
        let ceilings = *self;
        Some(Arc::new(move |sdp: &str| ceilings.apply(sdp)))
    }
}
