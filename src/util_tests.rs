//! Tests for util.rs

use crate::util::{format_duration, pluralize, sanitize_job_name};
use std::time::Duration;

#[test]
fn format_duration_milliseconds() {
    assert_eq!(format_duration(Duration::from_millis(0)), "0ms");
    assert_eq!(format_duration(Duration::from_millis(1)), "1ms");
    assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
    assert_eq!(format_duration(Duration::from_millis(999)), "999ms");
}

#[test]
fn format_duration_seconds() {
    assert_eq!(format_duration(Duration::from_millis(1000)), "1.0s");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    assert_eq!(format_duration(Duration::from_millis(45678)), "45.7s");
}

#[test]
fn format_duration_minutes() {
    assert_eq!(format_duration(Duration::from_secs(60)), "1m 0s");
    assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
    assert_eq!(format_duration(Duration::from_secs(3661)), "61m 1s");
}

#[test]
fn sanitize_replaces_spaces() {
    assert_eq!(sanitize_job_name("Blood network 07"), "Blood_network_07");
    assert_eq!(sanitize_job_name("  padded name  "), "padded_name");
}

#[test]
fn sanitize_replaces_path_characters() {
    assert_eq!(sanitize_job_name("../etc/passwd"), ".._etc_passwd");
    assert_eq!(sanitize_job_name(r"a\b:c*d?e"), "a_b_c_d_e");
    assert_eq!(sanitize_job_name("already_safe-name.v2"), "already_safe-name.v2");
}

#[test]
fn pluralize_counts() {
    assert_eq!(pluralize(1, "job"), "1 job");
    assert_eq!(pluralize(0, "job"), "0 jobs");
    assert_eq!(pluralize(4, "core"), "4 cores");
}
