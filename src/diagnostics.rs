//! Shared logger construction for tests, mirroring the compact-terminal,
//! async-wrapped, atomically-swappable drain stack used throughout.

#[cfg(test)]
pub(crate) fn test_logger() -> slog::Logger {
    use slog::Drain;

    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog_atomic::AtomicSwitch::new(drain).fuse();
    slog::Logger::root(drain, slog::o!())
}
