use crate::config::{LoggingConfig, Section};
use std::collections::HashMap;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

// Keeps the non-blocking console worker alive for the whole process.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

const DEFAULT_MAX_SIZE_MB: u64 = 100;

/// `None` means the sink is switched off for that target.
fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => None,
        _ => Some(LevelFilter::INFO),
    }
}

/// True if `target` is `prefix` itself or lives below it (`prefix::...`).
fn matches_target_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ================= rotating file sinks =================

type SharedRotate = Arc<Mutex<FileRotate<AppendTimestamp>>>;

#[derive(Clone)]
struct FileSink(SharedRotate);

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("log file writer poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("log file writer poisoned"))?
            .flush()
    }
}

/// Writes to the matched sink, or swallows the record when no sink applies.
struct MaybeSink(Option<FileSink>);

impl Write for MaybeSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.0 {
            Some(sink) => sink.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.0 {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

/// Routes records to per-target files; the longest matching prefix wins.
#[derive(Clone, Default)]
struct TargetRouter {
    fallback: Option<FileSink>,
    by_prefix: Vec<(String, FileSink)>,
}

impl TargetRouter {
    fn route(&self, target: &str) -> Option<FileSink> {
        self.by_prefix
            .iter()
            .filter(|(prefix, _)| matches_target_prefix(target, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, sink)| sink.clone())
            .or_else(|| self.fallback.clone())
    }

    fn is_empty(&self) -> bool {
        self.fallback.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for TargetRouter {
    type Writer = MaybeSink;

    fn make_writer(&'a self) -> Self::Writer {
        MaybeSink(self.fallback.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        MaybeSink(self.route(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn open_file_sink(section: &Section, base_dir: &Path) -> std::io::Result<FileSink> {
    let path = resolve_log_path(&section.file, base_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Prefer a file count when configured, otherwise retire by age.
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(
            i64::from(section.max_age_days.unwrap_or(1)),
        )),
    };
    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;

    let rotate = FileRotate::new(
        &path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );
    Ok(FileSink(Arc::new(Mutex::new(rotate))))
}

fn build_router(cfg: &LoggingConfig, base_dir: &Path) -> TargetRouter {
    let mut router = TargetRouter::default();
    for (name, section) in cfg {
        if section.file.trim().is_empty() {
            continue;
        }
        match open_file_sink(section, base_dir) {
            Ok(sink) if name == "default" => router.fallback = Some(sink),
            Ok(sink) => router.by_prefix.push((name.clone(), sink)),
            Err(e) => eprintln!(
                "Failed to open log file for '{}': {} ({})",
                name,
                resolve_log_path(&section.file, base_dir).display(),
                e
            ),
        }
    }
    router
}

// ================= per-sink targets =================

#[derive(Clone, Copy)]
enum Sink {
    Console,
    File,
}

impl Sink {
    /// Level this sink uses for `section`, `None` when the sink is inactive there.
    fn level(self, section: &Section) -> Option<LevelFilter> {
        match self {
            Sink::Console => parse_level(&section.console_level),
            Sink::File if section.file.trim().is_empty() => None,
            Sink::File => parse_level(&section.file_level),
        }
    }
}

fn build_targets(cfg: &LoggingConfig, sink: Sink, fallback_level: LevelFilter) -> Targets {
    let default_level = match cfg.get("default") {
        Some(section) => sink.level(section).unwrap_or(LevelFilter::OFF),
        None => fallback_level,
    };

    cfg.iter()
        .filter(|(name, _)| name.as_str() != "default")
        .fold(Targets::new().with_default(default_level), |targets, (name, section)| {
            match sink.level(section) {
                Some(level) => targets.with_target(name.clone(), level),
                None => targets,
            }
        })
}

// ================= public init =================

/// Installs the global subscriber: console (non-blocking stderr) plus JSON files
/// routed by target prefix. `RUST_LOG`, when set, caps both sinks.
pub fn init_logging_unified(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` *before* installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    if cfg.is_empty() {
        init_minimal();
        return;
    }

    let router = build_router(cfg, base_dir);
    let console_targets = build_targets(cfg, Sink::Console, LevelFilter::INFO);
    let file_targets = build_targets(cfg, Sink::File, LevelFilter::OFF);

    let env: Option<EnvFilter> = EnvFilter::try_from_default_env().ok();

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(nb_stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets);

    let file_layer = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_targets)
    });

    let _ = Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// Console-only INFO logging, honoring `RUST_LOG`.
pub fn init_minimal() {
    let env = EnvFilter::try_from_default_env().ok();
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(LevelFilter::INFO);

    let _ = Registry::default().with(env).with(fmt_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    fn section(console: &str, file: &str, file_level: &str) -> Section {
        Section {
            console_level: console.to_string(),
            file: file.to_string(),
            file_level: file_level.to_string(),
            max_age_days: None,
            max_backups: Some(1),
            max_size_mb: Some(1),
        }
    }

    #[test]
    fn prefix_matching_respects_path_boundaries() {
        assert!(matches_target_prefix("svckit", "svckit"));
        assert!(matches_target_prefix("svckit::components::runtime", "svckit::components"));
        assert!(!matches_target_prefix("svckit_bootstrap", "svckit"));
        assert!(!matches_target_prefix("svc", "svckit"));
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("loud"), Some(LevelFilter::INFO));
        assert_eq!(parse_level("off"), None);
    }

    #[test]
    fn targets_follow_sections() {
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".into(), section("warn", "", ""));
        cfg.insert("svckit::components".into(), section("trace", "logs/c.log", "debug"));
        cfg.insert("svckit::filter".into(), section("off", "", ""));

        let console = build_targets(&cfg, Sink::Console, LevelFilter::INFO);
        assert!(console.would_enable("svckit::components::runtime", &Level::TRACE));
        assert!(!console.would_enable("svckit::filter", &Level::ERROR));
        assert!(!console.would_enable("other", &Level::INFO));
        assert!(console.would_enable("other", &Level::WARN));

        let file = build_targets(&cfg, Sink::File, LevelFilter::OFF);
        assert!(file.would_enable("svckit::components", &Level::DEBUG));
        assert!(!file.would_enable("svckit::components", &Level::TRACE));
        assert!(!file.would_enable("other", &Level::ERROR));
    }

    #[test]
    fn router_prefers_longest_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".into(), section("info", "logs/all.log", "info"));
        cfg.insert("svckit".into(), section("info", "logs/core.log", "info"));
        cfg.insert("svckit::components".into(), section("info", "logs/comp.log", "info"));

        let router = build_router(&cfg, tmp.path());
        assert!(!router.is_empty());
        assert_eq!(router.by_prefix.len(), 2);

        let comp = router.route("svckit::components::runtime").unwrap();
        let expected = &router
            .by_prefix
            .iter()
            .find(|(p, _)| p == "svckit::components")
            .unwrap()
            .1;
        assert!(Arc::ptr_eq(&comp.0, &expected.0));

        let other = router.route("tokio::runtime").unwrap();
        assert!(Arc::ptr_eq(&other.0, &router.fallback.as_ref().unwrap().0));
        assert!(tmp.path().join("logs").is_dir());
    }
}
