//! Logger construction.

use slog::{o, Drain, Logger};

/// Full-format terminal logger behind an async drain.
pub fn term_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).chan_size(1024).build().fuse();
    Logger::root(drain, o!())
}

/// Logger that drops every record; used by tests and embedders that
/// wire their own logging.
pub fn null_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
