use tracing::Level;
use tracing_subscriber::{
    EnvFilter, fmt::Layer, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Installs the global fmt subscriber. Only `portdrop` logs at `level`,
/// dependencies such as aya stay at `warn`.
pub fn init(level: Level) {
    let mut fmt_layer = Layer::new().with_ansi(std::env::var("NO_COLOR").is_err());

    match level {
        Level::DEBUG => fmt_layer = fmt_layer.with_file(true).with_line_number(true),
        Level::TRACE => {
            fmt_layer = fmt_layer
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
        }
        _ => {}
    }

    tracing_subscriber::registry()
        .with(EnvFilter::new(directives(level)))
        .with(fmt_layer)
        .init();
}

fn directives(level: Level) -> String {
    format!("warn,portdrop={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_scopes_level_to_crate() {
        assert_eq!(directives(Level::DEBUG), "warn,portdrop=DEBUG");
    }
}
