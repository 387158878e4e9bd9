use std::time::Duration;

// ----------------------------------------------------------------------------
// Declarations
// ----------------------------------------------------------------------------

/// Characters replaced in job names so they can be used as file names.
const RESERVED_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

/// Human readable duration: `850ms`, `2.3s`, `4m 12s`.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis < 1000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        let secs = d.as_secs();
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

/// Make a job name safe to use as the stem of its log file.
/// Whitespace and reserved path characters become `_`.
pub fn sanitize_job_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_whitespace() || RESERVED_NAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// `1 job`, `3 jobs`
pub fn pluralize(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}
