//! Engine configuration and the per-pattern flag string.
use displaydoc::Display;
use serde::{Deserialize, Serialize};

/// The search mode selected by the pattern flags.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Search forward from `last_index`; reset `last_index` afterwards.
    Default,
    /// Like default, but a match advances `last_index` past itself so
    /// repeated calls walk every match.
    Global,
    /// A single attempt exactly at `last_index`.
    Sticky,
}

/// The error type for an invalid flag string.
#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    #[error("unrecognized flag character '{0}', must be one or more of \"gypth\"")]
    /// Flag characters are limited to `g`, `y`, `p`, `t` and `h`.
    UnknownFlag(char),
    #[error("the 'h' flag (HTML trace output) must follow 't'")]
    /// HTML output is a refinement of the trace flag.
    HtmlWithoutTrace,
}

/// The decoded pattern flags.
///
/// Only one of `g` and `y` can be in effect; whichever appears first in
/// the flag string wins. An empty string selects the default mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    /// The search mode.
    pub mode: Mode,
    /// Use the partially-predictive parsing table.
    pub pppt: bool,
    /// Record a trace of every operator visit.
    pub trace: bool,
    /// Render the trace as HTML.
    pub trace_html: bool,
    source: String,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            mode: Mode::Default,
            pppt: false,
            trace: false,
            trace_html: false,
            source: String::new(),
        }
    }
}

impl Flags {
    /// Decode a flag string.
    ///
    /// # Errors
    ///
    /// Returns a [`FlagError`] for an unknown flag character or for `h`
    /// without a preceding `t`.
    pub fn parse(flags: &str) -> Result<Flags, FlagError> {
        let mut decoded = Flags {
            source: flags.to_string(),
            ..Flags::default()
        };
        for c in flags.chars() {
            match c {
                'g' => {
                    if decoded.mode == Mode::Default {
                        decoded.mode = Mode::Global;
                    }
                }
                'y' => {
                    if decoded.mode == Mode::Default {
                        decoded.mode = Mode::Sticky;
                    }
                }
                'p' => decoded.pppt = true,
                't' => decoded.trace = true,
                'h' => {
                    if decoded.trace {
                        decoded.trace_html = true;
                    } else {
                        return Err(FlagError::HtmlWithoutTrace);
                    }
                }
                other => return Err(FlagError::UnknownFlag(other)),
            }
        }
        Ok(decoded)
    }

    /// The original flag string.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// The engine configuration. This should suffice for most scenarios; the
/// per-pattern behavior lives in [`Flags`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Config {
    /// The name of the rule a match attempt starts from. `None` starts
    /// from the first rule of the pattern.
    pub start_rule: Option<String>,
    /// The maximum number of characters a look-behind may walk back from
    /// the current offset. The default is no limit.
    pub lookbehind_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_rule: None,
            lookbehind_limit: usize::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_of_g_and_y_wins() {
        assert_eq!(Flags::parse("gy").unwrap().mode, Mode::Global);
        assert_eq!(Flags::parse("yg").unwrap().mode, Mode::Sticky);
        assert_eq!(Flags::parse("").unwrap().mode, Mode::Default);
    }

    #[test]
    fn html_requires_trace() {
        assert!(matches!(
            Flags::parse("h"),
            Err(FlagError::HtmlWithoutTrace)
        ));
        let flags = Flags::parse("th").unwrap();
        assert!(flags.trace && flags.trace_html);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(matches!(Flags::parse("gx"), Err(FlagError::UnknownFlag('x'))));
    }
}
