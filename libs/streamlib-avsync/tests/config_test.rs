// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::io::Write;

use streamlib_avsync::{AvSyncError, PlaybackMode, SeekTrickMode, SpeedRange, SyncConfig};

fn tuned() -> SyncConfig {
    SyncConfig {
        instance_id: "living-room".to_string(),
        playback_mode: PlaybackMode::Passthrough,
        seek_trick_mode: SeekTrickMode::IOnly,
        smooth_trick_speeds: vec![SpeedRange::new(0.25, 1.5), SpeedRange::new(1.5, 2.0)],
        pts_events_enabled: true,
        ..SyncConfig::default()
    }
}

#[test]
fn test_toml_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("avsync.toml");
    std::fs::write(&path, tuned().to_toml_string().unwrap()).unwrap();

    let loaded = SyncConfig::from_file(&path).unwrap();
    assert_eq!(loaded, tuned());
    assert_eq!(loaded.cadence_ms(), 1_000);
}

#[test]
fn test_yaml_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("avsync.yml");
    std::fs::write(&path, tuned().to_yaml_string().unwrap()).unwrap();

    assert_eq!(SyncConfig::from_file(&path).unwrap(), tuned());
}

#[test]
fn test_partial_json_file_uses_defaults() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(file, r#"{{ "tick_cadence_ms": 20, "configure_retry": {{ "max_attempts": 5 }} }}"#)
        .unwrap();

    let loaded = SyncConfig::from_file(file.path()).unwrap();
    assert_eq!(loaded.tick_cadence_ms, 20);
    assert_eq!(loaded.configure_retry.max_attempts, 5);
    assert_eq!(loaded.configure_retry.interval_ms, 100);
    assert_eq!(loaded.discontinuity_threshold_us, 500_000);
}

#[test]
fn test_invalid_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let inverted = dir.path().join("inverted.toml");
    std::fs::write(
        &inverted,
        "[[smooth_trick_speeds]]\nmin = 2.0\nmax = 0.5\n",
    )
    .unwrap();
    assert!(matches!(
        SyncConfig::from_file(&inverted),
        Err(AvSyncError::Configuration(_))
    ));

    let garbage = dir.path().join("garbage.yaml");
    std::fs::write(&garbage, "playback_mode: [not, a, mode]\n").unwrap();
    assert!(matches!(
        SyncConfig::from_file(&garbage),
        Err(AvSyncError::ConfigParse(_))
    ));

    let unknown = dir.path().join("avsync.ini");
    std::fs::write(&unknown, "x=1").unwrap();
    assert!(SyncConfig::from_file(&unknown).is_err());
}
