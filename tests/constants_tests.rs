// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use rpicam::constants::{
    H264Level, H264Profile, MAX_STILLS_HEIGHT, MAX_STILLS_WIDTH, align_up,
};

#[test]
fn test_profile_values() {
    // Test that all profiles exist (Baseline, Main, High)
    assert_eq!(H264Profile::ALL.len(), 3);
    assert_eq!(H264Profile::default(), H264Profile::High);
}

#[test]
fn test_profile_names_parse_back() {
    for profile in H264Profile::ALL {
        let name = profile.display_name();
        assert!(!name.is_empty(), "Profile {:?} has empty display name", profile);
        assert_eq!(H264Profile::from_name(name), Some(profile));
    }
    assert_eq!(H264Profile::from_name("HIGH"), Some(H264Profile::High));
    assert_eq!(H264Profile::from_name("extended"), None);
}

#[test]
fn test_level_default() {
    assert_eq!(H264Level::default(), H264Level::Level4);
    assert_eq!(H264Level::Level4.to_string(), "4");
}

#[test]
fn test_still_buffer_alignment() {
    // Width pads to 32, height to 16
    assert_eq!(align_up(MAX_STILLS_WIDTH, 32), 2592);
    assert_eq!(align_up(MAX_STILLS_HEIGHT, 16), 1952);
    assert_eq!(align_up(1, 16), 16);
    assert_eq!(align_up(0, 16), 0);
}
