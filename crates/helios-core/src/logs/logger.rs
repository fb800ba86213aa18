//! `env_logger` configuration: a fixed-width "console" formatter for local
//! development, and a one-JSON-object-per-line formatter for production
//! ingestion, selected by `logging.format`.

use std::io::Write;

use env_logger::Builder;
use log::LevelFilter;

use crate::config::settings::LoggingConfig;

const LEVEL_FIELD_WIDTH: usize = 5;
const FILE_LINE_FIELD_WIDTH: usize = 28;

/// Strips ANSI escape sequences so fixed-width padding lines up even when
/// the terminal doesn't render color.
fn visible_len(s: &str) -> usize {
    let mut len = 0;
    let mut in_escape = false;
    for ch in s.chars() {
        if in_escape {
            if ch == 'm' {
                in_escape = false;
            }
            continue;
        }
        if ch == '\u{1b}' {
            in_escape = true;
            continue;
        }
        len += 1;
    }
    len
}

fn level_filter(level: &str) -> LevelFilter {
    match level {
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" | "fatal" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

/// Builds and installs the global logger per `logging.*` from the config
/// file. Call once at process startup, before any component is constructed.
pub fn configure_logger(cfg: &LoggingConfig) {
    let mut builder = Builder::new();
    builder.filter_level(level_filter(&cfg.level));

    let json = cfg.format == "json";
    let include_caller = cfg.include_caller;

    builder.format(move |buf, record| {
        if json {
            let line = serde_json::json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "level": record.level().to_string(),
                "target": record.target(),
                "message": record.args().to_string(),
                "file": if include_caller { record.file() } else { None },
                "line": if include_caller { record.line() } else { None },
            });
            writeln!(buf, "{line}")
        } else {
            let level = record.level().to_string();
            let padded_level = format!("{:<width$}", level, width = LEVEL_FIELD_WIDTH);

            let location = if include_caller {
                format!(
                    "{}:{}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0)
                )
            } else {
                record.target().to_string()
            };
            let padded_location = if visible_len(&location) < FILE_LINE_FIELD_WIDTH {
                format!(
                    "{}{}",
                    location,
                    " ".repeat(FILE_LINE_FIELD_WIDTH - visible_len(&location))
                )
            } else {
                location
            };

            writeln!(
                buf,
                "{} {} | {} | {}",
                chrono::Utc::now().to_rfc3339(),
                padded_level,
                padded_location,
                record.args()
            )
        }
    });

    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_len_ignores_ansi_codes() {
        assert_eq!(visible_len("\u{1b}[31mred\u{1b}[0m"), 3);
        assert_eq!(visible_len("plain"), 5);
    }

    #[test]
    fn level_filter_maps_known_levels() {
        assert_eq!(level_filter("debug"), LevelFilter::Debug);
        assert_eq!(level_filter("fatal"), LevelFilter::Error);
        assert_eq!(level_filter("nonsense"), LevelFilter::Info);
    }
}
