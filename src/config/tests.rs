//! Unit tests for configuration module
//!
//! Tests configuration parsing, validation, environment overrides and
//! edge cases in configuration handling.

use super::*;
use anyhow::Result;
use serial_test::serial;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_default_configuration_is_valid() {
    let config = SinkConfig::default();

    assert!(config.validate().is_ok());
    assert_eq!(config.window.fill_mode, FillMode::Fit);
    assert_eq!(config.window.layer, Layer::Normal);
    assert_eq!(config.window.alpha, 1.0);
    assert!(!config.display.sync_frame);
    assert_eq!(config.pool.limits(), PoolLimits::default());
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("wlsink.toml");

    let test_config = r#"
[display]
name = "wayland-1"
sync_frame = true

[window]
fill_mode = "crop"
layer = "top"
alpha = 0.75
render_rectangle = { x = 10, y = 20, width = 640, height = 360 }

[pool]
max_buffers = 6
"#;
    fs::write(&file_path, test_config)?;

    let config = SinkConfig::load(&file_path)?;
    assert_eq!(config.display.name.as_deref(), Some("wayland-1"));
    assert!(config.display.sync_frame);
    assert_eq!(config.window.fill_mode, FillMode::Crop);
    assert_eq!(config.window.layer, Layer::Top);
    assert_eq!(config.window.alpha, 0.75);
    assert_eq!(config.window.render_rectangle, Some(Rectangle::new(10, 20, 640, 360)));
    assert_eq!(config.pool.min_buffers, 2);
    assert_eq!(config.pool.max_buffers, 6);

    Ok(())
}

#[test]
fn test_partial_configuration_uses_defaults() -> Result<()> {
    let config: SinkConfig = toml::from_str("[window]\nfullscreen = true\n")?;
    assert!(config.window.fullscreen);
    assert_eq!(config.window.alpha, 1.0);
    assert_eq!(config.pool, PoolConfig::default());
    Ok(())
}

#[test]
fn test_invalid_alpha_rejected() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("bad_alpha.toml");
    fs::write(&file_path, "[window]\nalpha = 1.5\n")?;

    let err = SinkConfig::load(&file_path).unwrap_err();
    assert!(err.to_string().contains("alpha"));
    Ok(())
}

#[test]
fn test_invalid_pool_bounds_rejected() {
    let mut config = SinkConfig::default();
    config.pool.min_buffers = 8;
    config.pool.max_buffers = 2;
    assert!(config.validate().is_err());

    config.pool.min_buffers = 0;
    config.pool.max_buffers = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_single_buffer_pool_rejected() {
    let mut config = SinkConfig::default();
    config.pool.min_buffers = 1;
    config.pool.max_buffers = 1;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("max_buffers must be at least 2"));

    config.pool.max_buffers = 2;
    assert!(config.validate().is_ok());
}

#[test]
fn test_empty_render_rectangle_rejected() {
    let mut config = SinkConfig::default();
    config.window.render_rectangle = Some(Rectangle::new(0, 0, 0, 480));
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_fill_mode_fails_to_parse() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("bad_mode.toml");
    fs::write(&file_path, "[window]\nfill_mode = \"zoom\"\n")?;
    assert!(SinkConfig::load(&file_path).is_err());
    Ok(())
}

#[test]
fn test_missing_file_reports_path() {
    let err = SinkConfig::load("/nonexistent/wlsink.toml").unwrap_err();
    assert!(err.to_string().contains("/nonexistent/wlsink.toml"));
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("saved.toml");

    let mut config = SinkConfig::default();
    config.window.fill_mode = FillMode::Stretch;
    config.display.name = Some("/run/user/1000/wayland-0".into());
    config.save(&file_path)?;

    let reloaded = SinkConfig::load(&file_path)?;
    assert_eq!(reloaded, config);
    Ok(())
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var(ENV_SYNC_FRAME, "1");
    std::env::set_var(ENV_STRETCH, "1");
    let config = SinkConfig::from_env();
    std::env::remove_var(ENV_SYNC_FRAME);
    std::env::remove_var(ENV_STRETCH);

    assert!(config.display.sync_frame);
    assert_eq!(config.window.fill_mode, FillMode::Stretch);
}

#[test]
#[serial]
fn test_env_absent_keeps_file_values() {
    std::env::remove_var(ENV_SYNC_FRAME);
    std::env::remove_var(ENV_STRETCH);

    let mut config = SinkConfig::default();
    config.window.fill_mode = FillMode::Crop;
    config.apply_env();
    assert_eq!(config.window.fill_mode, FillMode::Crop);
    assert!(!config.display.sync_frame);
}
