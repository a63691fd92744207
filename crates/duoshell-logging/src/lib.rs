// Logging module - diagnostic logging setup and session transcripts
pub mod transcript;

pub use transcript::SessionTranscript;

/// Install the `env_logger` backend for the `log` facade.
///
/// `RUST_LOG` wins when set; otherwise `verbose` selects between `debug` and
/// `info` for duoshell crates. Calling this twice is harmless.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "duoshell=debug,duoshell_core=debug,duoshell_terminal=debug"
    } else {
        "duoshell_core=info,duoshell_terminal=info"
    };

    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .format_timestamp_millis()
    .try_init();
}

/// Safely truncate a string to a maximum number of characters
pub fn safe_truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        // Reserve space for "..." suffix
        let trunc_chars = if max_chars >= 3 { max_chars - 3 } else { 0 };
        format!("{}...", s.chars().take(trunc_chars).collect::<String>())
    }
}
