use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target used for the optional rolling audit log (sync outcomes, dropped records).
pub const AUDIT_TARGET: &str = "ethica::audit";

static AUDIT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_console(filter);
}

fn install_console(filter: EnvFilter) {
    let fmt_layer = fmt::layer();
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));
    if std::env::var("ETHICA_AUDIT_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("ETHICA_AUDIT_LOG_DIR")
            .ok()
            .or_else(|| std::env::var("ETHICA_LOGS_DIR").ok())
            .unwrap_or_else(|| "logs".to_string());
        let prefix =
            std::env::var("ETHICA_AUDIT_LOG_PREFIX").unwrap_or_else(|_| "connector-audit".into());
        let rotation =
            std::env::var("ETHICA_AUDIT_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
        if std::fs::create_dir_all(&dir).is_err() {
            tracing::warn!(directory = %dir, "failed to create audit log directory");
        }
        let writer = match rotation.to_lowercase().as_str() {
            "hourly" => tracing_appender::rolling::hourly(&dir, &prefix),
            "minutely" => tracing_appender::rolling::minutely(&dir, &prefix),
            _ => tracing_appender::rolling::daily(&dir, &prefix),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = AUDIT_GUARD.set(guard);
        let targets = Targets::new().with_target(AUDIT_TARGET, tracing::Level::INFO);
        let audit_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(nb)
            .with_filter(targets);
        let subscriber = registry.with(audit_layer);
        let _ = subscriber.try_init();
    } else {
        let _ = registry.try_init();
    }
}
