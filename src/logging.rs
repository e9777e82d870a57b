//! Logging setup.
//!
//! Grounded on `system/writer/mod.rs`'s `writer_start`, simplified: the
//! teacher's tag-based UDP fan-out exists to feed a sibling admin process,
//! which has no counterpart here, so this collapses straight to the
//! `env_logger` tier, driven by the config's `loglevel` instead of a fixed
//! `RUST_LOG=info`.

use log::LevelFilter;

use crate::config::Config;

/// Maps the config's `loglevel` (0-5) onto a `log::LevelFilter`.
fn level_filter(loglevel: u8) -> LevelFilter {
    match loglevel {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs `env_logger` as the process-wide logging backend. `RUST_LOG`, if
/// set, takes precedence over the config's `loglevel`.
pub fn init(cfg: &Config) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level_filter(cfg.loglevel));
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    // A second call (e.g. under `#[tokio::test]`) is not an error here.
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_levels() {
        assert_eq!(level_filter(0), LevelFilter::Off);
        assert_eq!(level_filter(3), LevelFilter::Info);
        assert_eq!(level_filter(9), LevelFilter::Trace);
    }
}
