/// Zero-shot candidates offered to the image classifier.
pub const CANDIDATE_LABELS: [&str; 5] = [
    "Screenshot of user watching a video",
    "screenshot of user playing a video game",
    "screenshot of user working",
    "screenshot of the home screen",
    "unknown",
];

/// Candidates that count as off-track.
pub const OFF_TRACK_LABELS: [&str; 3] = [
    "Screenshot of user watching a video",
    "screenshot of user playing a video game",
    "screenshot of the home screen",
];

pub fn is_off_track(label: &str) -> bool {
    OFF_TRACK_LABELS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(label))
}
