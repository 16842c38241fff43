use chrono::Local;
use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;
use std::str::FromStr;

/// Installs the global logger. `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str) {
    let fallback = LevelFilter::from_str(default_level).unwrap_or(LevelFilter::Info);

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter(None, fallback)
        // noisy html/http internals
        .filter_module("html5ever", LevelFilter::Warn)
        .filter_module("selectors", LevelFilter::Warn)
        .parse_env(Env::default());

    if builder.try_init().is_err() {
        log::debug!("Logger already initialized.");
        return;
    }

    log::info!("Logger initialized at level {}.", log::max_level());
}
