// DANS : src/monitoring/logging.rs
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Installe le subscriber global. `format` vaut "json" (défaut) ou "pretty".
pub fn setup_logging(format: &str) {
    // On crée un filtre qui lit la variable RUST_LOG.
    // S'il n'est pas défini, il utilisera "info" par défaut.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);

    if format.eq_ignore_ascii_case("pretty") {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
}
