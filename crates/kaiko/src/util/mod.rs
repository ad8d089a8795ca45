pub mod http;
pub mod range;
pub mod retry;

use std::time::Duration;

/// Human readable bitrate, as shown next to representation ids.
pub fn format_bandwidth(bandwidth: u64) -> String {
    if bandwidth > 1_000_000 {
        format!("{:.2} Mbps", bandwidth as f64 / 1_000_000.)
    } else {
        format!("{:.1} kbps", bandwidth as f64 / 1_000.)
    }
}

/// `HH:MM:SS`, prefixed with a day count for recordings longer than a day.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let (days, rest) = (seconds / 86400, seconds % 86400);
    let clock = format!(
        "{:02}:{:02}:{:02}",
        rest / 3600,
        (rest % 3600) / 60,
        rest % 60
    );

    if days > 0 {
        format!("{days} day(s) {clock}")
    } else {
        clock
    }
}
