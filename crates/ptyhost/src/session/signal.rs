//! Signal names as callers and exit notifications spell them.

use std::str::FromStr;

use nix::sys::signal::Signal;

/// Signal used when `kill` is called without one.
pub const DEFAULT_KILL_SIGNAL: Signal = Signal::SIGTERM;

/// Parses `SIGTERM`, `term`, `TERM` or a number like `9`.
///
/// `None`, empty and unknown names fall back to [`DEFAULT_KILL_SIGNAL`].
pub fn parse_signal(name: Option<&str>) -> Signal {
    let Some(raw) = name.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_KILL_SIGNAL;
    };

    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number).unwrap_or_else(|_| {
            tracing::warn!(signal = raw, "Unknown signal number, using SIGTERM");
            DEFAULT_KILL_SIGNAL
        });
    }

    let upper = raw.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };

    Signal::from_str(&full).unwrap_or_else(|_| {
        tracing::warn!(signal = raw, "Unknown signal name, using SIGTERM");
        DEFAULT_KILL_SIGNAL
    })
}

/// Name for a raw signal number, e.g. `SIGKILL` for 9.
pub fn signal_name(number: i32) -> String {
    Signal::try_from(number)
        .map(|signal| signal.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{number}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_sigterm() {
        assert_eq!(parse_signal(None), Signal::SIGTERM);
        assert_eq!(parse_signal(Some("")), Signal::SIGTERM);
        assert_eq!(parse_signal(Some("  ")), Signal::SIGTERM);
    }

    #[test]
    fn test_name_forms() {
        assert_eq!(parse_signal(Some("SIGKILL")), Signal::SIGKILL);
        assert_eq!(parse_signal(Some("kill")), Signal::SIGKILL);
        assert_eq!(parse_signal(Some("Hup")), Signal::SIGHUP);
        assert_eq!(parse_signal(Some("sigint")), Signal::SIGINT);
    }

    #[test]
    fn test_numeric_form() {
        assert_eq!(parse_signal(Some("9")), Signal::SIGKILL);
        assert_eq!(parse_signal(Some("15")), Signal::SIGTERM);
    }

    #[test]
    fn test_unknown_falls_back() {
        assert_eq!(parse_signal(Some("SIGNOPE")), Signal::SIGTERM);
        assert_eq!(parse_signal(Some("9999")), Signal::SIGTERM);
    }

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(Signal::SIGWINCH as i32), "SIGWINCH");
        assert_eq!(signal_name(0), "SIG0");
    }
}
