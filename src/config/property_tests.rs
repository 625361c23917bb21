//! Property-based tests for configuration module
//!
//! These tests use proptest to generate random configurations and verify
//! validation invariants and TOML round-trips.

use super::*;
use proptest::prelude::*;

prop_compose! {
    fn valid_window_config()(
        fill_mode in prop_oneof![Just(FillMode::Stretch), Just(FillMode::Fit), Just(FillMode::Crop)],
        layer in prop_oneof![Just(Layer::Top), Just(Layer::Normal), Just(Layer::Bottom)],
        alpha in 0.0f64..=1.0,
        fullscreen in any::<bool>(),
        rect in proptest::option::of((-4096i32..4096, -4096i32..4096, 1i32..8192, 1i32..8192)),
    ) -> WindowConfig {
        WindowConfig {
            fill_mode,
            layer,
            alpha,
            fullscreen,
            render_rectangle: rect.map(|(x, y, width, height)| Rectangle::new(x, y, width, height)),
        }
    }
}

prop_compose! {
    fn valid_pool_config()(
        max_buffers in 2usize..16,
        min_fraction in 0.0f64..=1.0,
        release_timeout_ms in 1u64..10_000,
    ) -> PoolConfig {
        PoolConfig {
            min_buffers: (max_buffers as f64 * min_fraction) as usize,
            max_buffers,
            release_timeout_ms,
        }
    }
}

prop_compose! {
    fn valid_sink_config()(
        window in valid_window_config(),
        pool in valid_pool_config(),
        sync_frame in any::<bool>(),
        name in proptest::option::of("[a-z][a-z0-9-]{0,15}"),
    ) -> SinkConfig {
        SinkConfig {
            display: DisplayConfig { name, sync_frame },
            window,
            pool,
        }
    }
}

proptest! {
    #[test]
    fn generated_configs_validate(config in valid_sink_config()) {
        prop_assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_roundtrip_preserves_config(config in valid_sink_config()) {
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SinkConfig = toml::from_str(&text).unwrap();
        prop_assert_eq!(parsed.window.fill_mode, config.window.fill_mode);
        prop_assert_eq!(parsed.window.layer, config.window.layer);
        prop_assert_eq!(parsed.window.render_rectangle, config.window.render_rectangle);
        prop_assert_eq!(parsed.pool, config.pool);
        prop_assert_eq!(parsed.display, config.display);
    }

    #[test]
    fn out_of_range_alpha_is_rejected(alpha in prop_oneof![-10.0f64..-0.001, 1.001f64..10.0]) {
        let mut config = SinkConfig::default();
        config.window.alpha = alpha;
        prop_assert!(config.validate().is_err());
    }

    #[test]
    fn pool_limits_follow_config(pool in valid_pool_config()) {
        let limits = pool.limits();
        prop_assert_eq!(limits.min_buffers, pool.min_buffers);
        prop_assert_eq!(limits.max_buffers, pool.max_buffers);
        prop_assert_eq!(limits.release_timeout.as_millis() as u64, pool.release_timeout_ms);
    }
}
