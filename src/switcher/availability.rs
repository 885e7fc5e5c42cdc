use std::collections::HashMap;
use std::time::Instant;

use crate::switcher::types::{AvailableSource, ContextSnapshot, SourceId, StreamDescriptor};

/// Result of diffing a context snapshot against the previously-known set of
/// available sources.
#[derive(Debug, Default)]
pub struct AvailabilityDiff {
    pub added: Vec<AvailableSource>,
    pub removed: Vec<String>,
}

/// A pin is available iff it carries exactly one audio and one video stream.
/// Partial streams (video-only, audio-only) do not count.
pub fn complete_pair(streams: &[StreamDescriptor]) -> bool {
    streams.len() == 2
        && streams.iter().filter(|s| s.is_audio()).count() == 1
        && streams.iter().filter(|s| s.is_video()).count() == 1
}

/// Diffs `snapshot` against `previous`. Pure function of its inputs: feeding
/// the same snapshot twice yields an empty diff the second time. Resolution
/// and frame rate of added sources are read off the video descriptor;
/// `went_live_at` is stamped with `now`.
pub fn diff(
    previous: &HashMap<String, AvailableSource>,
    snapshot: &ContextSnapshot,
    now: Instant,
) -> AvailabilityDiff {
    let mut result = AvailabilityDiff::default();

    for (pin, streams) in snapshot {
        if !complete_pair(streams) || previous.contains_key(pin) {
            continue;
        }
        let Some(StreamDescriptor::Video {
            resolution,
            frame_rate,
        }) = streams.iter().find(|s| s.is_video())
        else {
            continue;
        };
        result.added.push(AvailableSource {
            source: SourceId::from_pin(pin),
            resolution: *resolution,
            frame_rate: *frame_rate,
            went_live_at: now,
        });
    }

    for pin in previous.keys() {
        let still_available = snapshot.get(pin).is_some_and(|s| complete_pair(s));
        if !still_available {
            result.removed.push(pin.clone());
        }
    }

    result
}
