use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, Layer};

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(structured: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if structured {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_list(false)
                .flatten_event(true),
        );
    }

    Box::new(tracing_subscriber::fmt::layer().compact())
}

/// Install a global subscriber for applications that do not bring their own.
/// Compact text by default, one JSON object per event when `structured`.
pub fn setup_tracing(structured: bool) {
    let env_filter_layer = get_env_filter();
    let log_layer = get_log_layer(structured);
    let subscriber =
        tracing_subscriber::Registry::default().with(log_layer.with_filter(env_filter_layer));

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }
}
