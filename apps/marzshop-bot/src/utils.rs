use chrono::{DateTime, Duration, Utc};

pub fn format_bytes_str(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Traffic quota for display; 0 is unlimited.
pub fn format_quota(bytes: i64) -> String {
    if bytes <= 0 {
        "Unlimited".to_string()
    } else {
        format_bytes_str(bytes as u64)
    }
}

pub fn format_date(ts: DateTime<Utc>) -> String {
    ts.format("%d.%m.%Y %H:%M UTC").to_string()
}

/// "3d 4h", "5h", or "less than an hour".
pub fn format_remaining(left: Duration) -> String {
    let hours = left.num_hours();
    if hours < 1 {
        return "less than an hour".to_string();
    }
    let (days, hours) = (hours / 24, hours % 24);
    match (days, hours) {
        (0, h) => format!("{}h", h),
        (d, 0) => format!("{}d", d),
        (d, h) => format!("{}d {}h", d, h),
    }
}

/// Percentage of `used` against `limit`, or `None` when unlimited.
pub fn usage_pct(used: i64, limit: i64) -> Option<f64> {
    (limit > 0).then(|| (used.max(0) as f64 / limit as f64) * 100.0)
}
