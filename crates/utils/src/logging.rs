//! Global `tracing` subscriber for the plugin binaries.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Crates of the gRPC transport, very chatty below `warn`.
const TRANSPORT_CRATES: [&str; 4] = ["h2", "hyper", "hyper_util", "tower"];

/// Install the global subscriber, logging to stderr.
///
/// Verbosity defaults to `info` and follows `RUST_LOG` when set.
pub fn init() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(build_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref()));

    registry().with(fmt_layer).init();
}

/// Parse `directives` leniently, then cap every transport crate the
/// directives do not mention explicitly.
fn build_filter(directives: Option<&str>) -> EnvFilter {
    let directives = directives.unwrap_or_default();
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives);

    for name in TRANSPORT_CRATES {
        if mentions(directives, name) {
            continue;
        }
        if let Ok(directive) = format!("{name}=warn").parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

fn mentions(directives: &str, target: &str) -> bool {
    directives
        .split(',')
        .filter_map(|d| d.trim().split_once('='))
        .any(|(t, _)| t == target)
}
