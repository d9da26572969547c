//! The matcher driver: applies the parser to find matches over a source
//! according to a search mode, and exposes structured results.
//!
//! [`MatcherBase`] is generic over the alphabet character and works on
//! character slices; [`Matcher`] pins the alphabet to `u32` (Unicode
//! scalar values) and offers a `&str` surface, with offsets counted in
//! characters. One matcher owns exactly one compiled pattern at a time;
//! setting a new pattern replaces the old one and resets all state.
use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use crate::ast::{Ast, AstCallback, AstData, AstState, AstVerdict};
use crate::config::{Config, FlagError, Flags, Mode};
use crate::grammar::{Grammar, Target};
use crate::parser::{CallbackData, ParseError, ParseOutcome, Parser, ParserCallback};
use crate::phrase::{chars_of_str, string_from_chars, AlphabetChar, Phrase};
use crate::pppt::Pppt;
use crate::syntax::{self, PatternSyntaxError};
use crate::trace::Trace;

/// A matched phrase, extracted from the source: its offset and an owned
/// copy of its characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPhrase<C: AlphabetChar> {
    /// Offset of the phrase in the source, in characters.
    pub offset: usize,
    /// The phrase characters.
    pub chars: Vec<C>,
}

impl<C: AlphabetChar> MatchPhrase<C> {
    fn from_input(input: &[C], phrase: Phrase) -> Self {
        Self {
            offset: phrase.offset,
            chars: input[phrase.offset..phrase.end()].to_vec(),
        }
    }

    /// The phrase length in characters.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    /// True for the empty phrase.
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

impl MatchPhrase<u32> {
    /// The phrase as a string; invalid scalar values render as U+FFFD.
    pub fn as_string(&self) -> String {
        string_from_chars(&self.chars)
    }
}

impl MatchPhrase<u8> {
    /// The phrase bytes as a lossy UTF-8 string.
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.chars).into_owned()
    }
}

/// The captured phrases of one enabled rule or UDT, in the order they
/// occurred during the successful parse.
#[derive(Debug, Clone)]
pub struct RuleCaptures<C: AlphabetChar> {
    /// The rule or UDT name.
    pub name: String,
    /// The rule or UDT grammar index.
    pub index: usize,
    /// True if this entry is a UDT.
    pub is_udt: bool,
    /// The captured phrases; empty when the rule never matched.
    pub phrases: Vec<MatchPhrase<C>>,
}

/// The result of a successful match.
#[derive(Debug, Clone)]
pub struct MatchResult<C: AlphabetChar> {
    /// The matched phrase.
    pub matched: MatchPhrase<C>,
    /// The source before the match.
    pub left_context: MatchPhrase<C>,
    /// The source after the match.
    pub right_context: MatchPhrase<C>,
    /// One entry per enabled rule and UDT.
    pub rules: Vec<RuleCaptures<C>>,
    /// The cursor after this match attempt.
    pub last_index: usize,
    /// Parser node visits spent on the successful attempt.
    pub node_hits: usize,
    /// Deepest parse tree point of the successful attempt.
    pub max_tree_depth: usize,
}

impl<C: AlphabetChar> MatchResult<C> {
    /// The captures of the named rule or UDT, if it is enabled.
    pub fn captures(&self, name: &str) -> Option<&RuleCaptures<C>> {
        self.rules
            .iter()
            .find(|rc| rc.name.eq_ignore_ascii_case(name))
    }
}

/// A snapshot of the matcher's current state.
#[derive(Debug, Clone)]
pub struct Properties<C: AlphabetChar> {
    /// The original flag string.
    pub flags: String,
    /// The decoded search mode.
    pub mode: Mode,
    /// True if the PPPT flag is set.
    pub pppt: bool,
    /// True if the trace flag is set.
    pub trace: bool,
    /// True if the HTML trace flag is set.
    pub trace_html: bool,
    /// The pattern text; `None` when the pattern was set from a prebuilt
    /// grammar.
    pub pattern: Option<String>,
    /// The current cursor.
    pub last_index: usize,
    /// The source as handed to the last search; replacement does not
    /// rewrite it.
    pub original_source: Vec<C>,
    /// The current source; may differ from the original after a
    /// replacement.
    pub last_source: Vec<C>,
    /// The most recent matched phrase, if any.
    pub last_match: Option<MatchPhrase<C>>,
    /// Its left context.
    pub left_context: Option<MatchPhrase<C>>,
    /// Its right context.
    pub right_context: Option<MatchPhrase<C>>,
}

/// The error type for pattern definition.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("{0}")]
    /// The flag string is invalid.
    Flags(#[from] FlagError),
    #[error("{0}")]
    /// The pattern text did not compile.
    Syntax(#[from] PatternSyntaxError),
    #[error("start rule \"{0}\" is not a rule of the pattern")]
    /// The configured start rule must name a rule, not a UDT.
    UnknownStartRule(String),
    #[error("IO error: {0}")]
    /// Reading a pattern file failed.
    Io(#[from] std::io::Error),
}

/// The error type for search operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("no pattern has been set; define one with set_pattern_source() first")]
    /// Searching requires a pattern.
    NoPattern,
    #[error("the source phrase cannot be empty")]
    /// exec, test and replace require a non-empty source.
    EmptySource,
    #[error("UDT \"{0}\" referenced by the pattern has no callback bound")]
    /// Bind every UDT with define_udt() before searching.
    UdtNotDefined(String),
    #[error("{0}")]
    /// A fatal condition inside the parse.
    Parse(#[from] ParseError),
    #[error("captured phrase for \"{0}\" lies outside the source")]
    /// Internal consistency: the AST reported an impossible phrase.
    CaptureOutOfBounds(String),
}

/// The error type for replacement operations.
#[derive(Debug, thiserror::Error)]
pub enum ReplaceError {
    #[error("{0}")]
    /// The underlying search failed.
    Exec(#[from] ExecError),
    #[error("replacement error: '$' found at end of string - must be $$, $_, $&, $`, $' or $<rulename>")]
    /// A lone trailing escape character.
    TrailingEscape,
    #[error("replacement error: '$' followed by character {0:#x} - must be $$, $_, $&, $`, $' or $<rulename>")]
    /// An unrecognized escape.
    UnknownEscape(u64),
    #[error("replacement error: found \"$<\" but no closing '>'")]
    /// `$<` must be closed.
    UnterminatedName,
    #[error("replacement error: \"$<>\" carries no rule name")]
    /// `$<>` is not a capture reference.
    EmptyName,
    #[error("replacement error: \"{0}\" is not a rule or UDT name of the pattern")]
    /// `$<name>` must name a rule or UDT of the pattern.
    UnknownName(String),
}

/// The error type for enabling and disabling capture names.
#[derive(Debug, thiserror::Error)]
pub enum EnableError {
    #[error("no pattern has been set; define one with set_pattern_source() first")]
    /// Enabling names requires a pattern.
    NoPattern,
    #[error("the name list cannot be empty")]
    /// Pass one or more names, or `--all`.
    EmptyNames,
    #[error("\"{0}\" is not a rule or UDT name of the pattern")]
    /// Unknown names are rejected rather than ignored.
    UnknownName(String),
}

/// The error type for binding rule and UDT callbacks.
#[derive(Debug, thiserror::Error)]
pub enum CallbackBindError {
    #[error("no pattern has been set; define one with set_pattern_source() first")]
    /// Binding callbacks requires a pattern.
    NoPattern,
    #[error("\"{0}\" is not a UDT name of the pattern")]
    /// define_udt() must name a UDT.
    UnknownUdt(String),
    #[error("\"{0}\" is not a rule name of the pattern")]
    /// define_rule_callback() must name a rule.
    UnknownRule(String),
}

struct PatternState<C: AlphabetChar> {
    grammar: Arc<Grammar<C>>,
    pppt: Option<Pppt>,
    flags: Flags,
    pattern_text: Option<String>,
    start_rule: usize,
    enabled_rules: Vec<bool>,
    enabled_udts: Vec<bool>,
}

/// Accumulates captures while translating the AST of a successful parse.
struct CaptureAcc {
    rules: Vec<Vec<Phrase>>,
    udts: Vec<Vec<Phrase>>,
}

fn collect_capture<C: AlphabetChar>(data: &AstData<'_, C>, user: &mut dyn Any) -> AstVerdict {
    if data.state == AstState::Pre {
        if let Some(acc) = user.downcast_mut::<CaptureAcc>() {
            let phrase = Phrase::new(data.phrase_offset, data.phrase_length);
            match data.target {
                Target::Rule(r) => acc.rules[r].push(phrase),
                Target::Udt(u) => acc.udts[u].push(phrase),
            }
        }
    }
    AstVerdict::Ok
}

/// The generic phrase-matching engine over alphabet `C`.
pub struct MatcherBase<C: AlphabetChar> {
    config: Config,
    pattern: Option<PatternState<C>>,
    rule_callbacks: Vec<Option<ParserCallback<C>>>,
    udt_callbacks: Vec<Option<ParserCallback<C>>>,
    ast: Ast<C>,
    trace: Option<Trace>,
    source: Vec<C>,
    original_source: Vec<C>,
    last_index: usize,
    last_match: Option<MatchPhrase<C>>,
    last_left: Option<MatchPhrase<C>>,
    last_right: Option<MatchPhrase<C>>,
}

impl<C: AlphabetChar> Default for MatcherBase<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: AlphabetChar> MatcherBase<C> {
    /// An engine with no pattern and the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// An engine with no pattern and a custom configuration.
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            pattern: None,
            rule_callbacks: Vec::new(),
            udt_callbacks: Vec::new(),
            ast: Ast::new(0, 0),
            trace: None,
            source: Vec::new(),
            original_source: Vec::new(),
            last_index: 0,
            last_match: None,
            last_left: None,
            last_right: None,
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Compile an SABNF pattern and make it the engine's pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] for an invalid flag string or pattern.
    pub fn set_pattern_source(&mut self, pattern: &str, flags: &str) -> Result<(), PatternError> {
        let flags = Flags::parse(flags)?;
        let grammar = syntax::compile::<C>(pattern)?;
        self.install(Arc::new(grammar), flags, Some(pattern.to_string()))
    }

    /// Read an SABNF pattern from a file and make it the engine's pattern.
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::set_pattern_source`], plus I/O errors.
    pub fn set_pattern_file(
        &mut self,
        path: impl AsRef<Path>,
        flags: &str,
    ) -> Result<(), PatternError> {
        let text = std::fs::read_to_string(path)?;
        self.set_pattern_source(&text, flags)
    }

    /// Adopt an externally built grammar as the engine's pattern. The
    /// grammar may be shared read-only with other engines.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] for an invalid flag string or an
    /// unknown configured start rule.
    pub fn set_pattern_grammar(
        &mut self,
        grammar: Arc<Grammar<C>>,
        flags: &str,
    ) -> Result<(), PatternError> {
        let flags = Flags::parse(flags)?;
        self.install(grammar, flags, None)
    }

    fn install(
        &mut self,
        grammar: Arc<Grammar<C>>,
        flags: Flags,
        pattern_text: Option<String>,
    ) -> Result<(), PatternError> {
        let start_rule = match self.config.start_rule.as_deref() {
            None => 0,
            Some(name) => match grammar.lookup(name) {
                Some(Target::Rule(r)) => r,
                _ => return Err(PatternError::UnknownStartRule(name.to_string())),
            },
        };
        let pppt = if flags.pppt { Pppt::build(&grammar) } else { None };
        let rule_count = grammar.rule_count();
        let udt_count = grammar.udt_count();
        self.trace = if flags.trace {
            Some(Trace::new(flags.trace_html))
        } else {
            None
        };
        self.pattern = Some(PatternState {
            grammar,
            pppt,
            flags,
            pattern_text,
            start_rule,
            enabled_rules: vec![false; rule_count],
            enabled_udts: vec![false; udt_count],
        });
        self.rule_callbacks = (0..rule_count).map(|_| None).collect();
        self.udt_callbacks = (0..udt_count).map(|_| None).collect();
        self.ast = Ast::new(rule_count, udt_count);
        self.source.clear();
        self.original_source.clear();
        self.last_index = 0;
        self.last_match = None;
        self.last_left = None;
        self.last_right = None;
        Ok(())
    }

    /// Enable or disable phrase capture for rules and UDTs. `names` is a
    /// comma-separated list of case-insensitive names, or `--all` for
    /// everything. Capture is disabled for all names by default.
    ///
    /// # Errors
    ///
    /// Returns an [`EnableError`] when no pattern is set, the list is
    /// empty, or a name is unknown.
    pub fn enable(&mut self, names: &str, on: bool) -> Result<(), EnableError> {
        let Some(pattern) = self.pattern.as_mut() else {
            return Err(EnableError::NoPattern);
        };
        if names.trim().is_empty() {
            return Err(EnableError::EmptyNames);
        }
        for raw in names.split(',') {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            if name.eq_ignore_ascii_case("--all") {
                for e in pattern.enabled_rules.iter_mut() {
                    *e = on;
                }
                for e in pattern.enabled_udts.iter_mut() {
                    *e = on;
                }
                continue;
            }
            match pattern.grammar.lookup(name) {
                Some(Target::Rule(r)) => pattern.enabled_rules[r] = on,
                Some(Target::Udt(u)) => pattern.enabled_udts[u] = on,
                None => return Err(EnableError::UnknownName(name.to_string())),
            }
        }
        Ok(())
    }

    /// Bind the callback of a UDT. Every UDT of the pattern must be bound
    /// before the first search.
    ///
    /// # Errors
    ///
    /// Returns a [`CallbackBindError`] when no pattern is set or the name
    /// is not a UDT of the pattern.
    pub fn define_udt<F>(&mut self, name: &str, callback: F) -> Result<(), CallbackBindError>
    where
        F: FnMut(&mut CallbackData<'_, C>) + 'static,
    {
        let Some(pattern) = self.pattern.as_ref() else {
            return Err(CallbackBindError::NoPattern);
        };
        match pattern.grammar.lookup(name) {
            Some(Target::Udt(u)) => {
                self.udt_callbacks[u] = Some(Box::new(callback));
                Ok(())
            }
            _ => Err(CallbackBindError::UnknownUdt(name.to_string())),
        }
    }

    /// Bind a parse-time callback to a rule. The callback may override
    /// the rule's parse on the way down or up; most applications never
    /// need this.
    ///
    /// # Errors
    ///
    /// Returns a [`CallbackBindError`] when no pattern is set or the name
    /// is not a rule of the pattern.
    pub fn define_rule_callback<F>(
        &mut self,
        name: &str,
        callback: F,
    ) -> Result<(), CallbackBindError>
    where
        F: FnMut(&mut CallbackData<'_, C>) + 'static,
    {
        let Some(pattern) = self.pattern.as_ref() else {
            return Err(CallbackBindError::NoPattern);
        };
        match pattern.grammar.lookup(name) {
            Some(Target::Rule(r)) => {
                self.rule_callbacks[r] = Some(Box::new(callback));
                Ok(())
            }
            _ => Err(CallbackBindError::UnknownRule(name.to_string())),
        }
    }

    /// The cursor where the next search begins.
    pub fn last_index(&self) -> usize {
        self.last_index
    }

    /// Override the cursor. A cursor at or beyond the source end makes
    /// the next search report no match and reset the cursor to zero.
    pub fn set_last_index(&mut self, last_index: usize) {
        self.last_index = last_index;
    }

    /// The compiled grammar of the current pattern, if any.
    pub fn grammar(&self) -> Option<&Arc<Grammar<C>>> {
        self.pattern.as_ref().map(|p| &p.grammar)
    }

    /// The AST of the most recent successful `exec`. Records exist only
    /// for rules and UDTs that were enabled at the time.
    pub fn ast(&self) -> &Ast<C> {
        &self.ast
    }

    /// The trace of the most recent search, when the `t` flag is set.
    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    /// A snapshot of the matcher state.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::NoPattern`] before a pattern is set.
    pub fn properties(&self) -> Result<Properties<C>, ExecError> {
        let pattern = self.require_pattern()?;
        Ok(Properties {
            flags: pattern.flags.as_str().to_string(),
            mode: pattern.flags.mode,
            pppt: pattern.flags.pppt,
            trace: pattern.flags.trace,
            trace_html: pattern.flags.trace_html,
            pattern: pattern.pattern_text.clone(),
            last_index: self.last_index,
            original_source: self.original_source.clone(),
            last_source: self.source.clone(),
            last_match: self.last_match.clone(),
            left_context: self.last_left.clone(),
            right_context: self.last_right.clone(),
        })
    }

    /// Find the next match in `source` according to the pattern's mode.
    /// `Ok(None)` reports an ordinary no-match.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`] for a missing pattern, an empty source,
    /// unbound UDTs, or a fatal parse condition.
    pub fn exec(&mut self, source: &[C]) -> Result<Option<MatchResult<C>>, ExecError> {
        self.require_pattern()?;
        if source.is_empty() {
            return Err(ExecError::EmptySource);
        }
        self.check_udts_bound()?;
        self.clear_for_parse();
        self.source = source.to_vec();
        self.original_source = source.to_vec();
        self.init_ast_callbacks();
        let found = self.find();
        let result = match found {
            Ok(Some((begin, outcome))) => self.build_result(begin, &outcome).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        self.reset_ast_callbacks();
        result
    }

    /// Like [`MatcherBase::exec`] but reports only success or failure; no
    /// phrases are captured. Cursor handling is identical.
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::exec`].
    pub fn test(&mut self, source: &[C]) -> Result<bool, ExecError> {
        self.require_pattern()?;
        if source.is_empty() {
            return Err(ExecError::EmptySource);
        }
        self.check_udts_bound()?;
        self.clear_for_parse();
        self.source = source.to_vec();
        self.original_source = source.to_vec();
        Ok(self.find()?.is_some())
    }

    /// Replace matched phrases in `source` with `replacement`, expanding
    /// the `$` escapes described in the crate documentation. In default
    /// mode only the first match is replaced; in global or sticky mode
    /// every match found in that mode is. The cursor is reset to zero
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns a [`ReplaceError`] for search failures or malformed
    /// replacement escapes.
    pub fn replace(&mut self, source: &[C], replacement: &[C]) -> Result<Vec<C>, ReplaceError> {
        self.replace_impl(source, |this, result| {
            this.expand_replacement(replacement, result)
        })
    }

    /// Like [`MatcherBase::replace`], but each match's replacement comes
    /// from `replacer`, which sees the fully populated result and the
    /// current properties.
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::replace`], without the escape errors.
    pub fn replace_with<F>(&mut self, source: &[C], mut replacer: F) -> Result<Vec<C>, ReplaceError>
    where
        F: FnMut(&MatchResult<C>, &Properties<C>) -> Vec<C>,
    {
        self.replace_impl(source, move |this, result| {
            let properties = this.properties()?;
            Ok(replacer(result, &properties))
        })
    }

    /// Split `source` using matches as separators, in global-mode
    /// semantics regardless of the pattern flags. `limit = 0` means
    /// unlimited. Splitting disables all rule and UDT captures and resets
    /// the cursor.
    ///
    /// An empty separator match emits one one-character sub-phrase per
    /// step; a pattern that never matches yields the whole source as the
    /// only element; an empty source yields an empty array.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`] for a missing pattern, unbound UDTs, or a
    /// fatal parse condition.
    pub fn split(&mut self, source: &[C], limit: usize) -> Result<Vec<Vec<C>>, ExecError> {
        self.require_pattern()?;
        self.check_udts_bound()?;
        self.clear_for_parse();
        self.source = source.to_vec();
        self.original_source = source.to_vec();
        if let Some(pattern) = self.pattern.as_mut() {
            for e in pattern.enabled_rules.iter_mut() {
                *e = false;
            }
            for e in pattern.enabled_udts.iter_mut() {
                *e = false;
            }
        }
        self.last_index = 0;
        let mut remaining = if limit == 0 { usize::MAX } else { limit };
        let mut pieces: Vec<Vec<C>> = Vec::new();
        while remaining > 0 {
            let begin = self.last_index;
            match self.find_global_from(begin)? {
                Some((at, outcome)) => {
                    // an empty separator steps over exactly one character
                    let piece_len = if outcome.phrase_length > 0 {
                        at - begin
                    } else {
                        1
                    };
                    if piece_len > 0 {
                        pieces.push(self.source[begin..begin + piece_len].to_vec());
                    }
                    remaining -= 1;
                }
                None => {
                    if begin < self.source.len() {
                        pieces.push(self.source[begin..].to_vec());
                    }
                    break;
                }
            }
        }
        self.last_index = 0;
        Ok(pieces)
    }

    fn require_pattern(&self) -> Result<&PatternState<C>, ExecError> {
        self.pattern.as_ref().ok_or(ExecError::NoPattern)
    }

    fn check_udts_bound(&self) -> Result<(), ExecError> {
        let pattern = self.require_pattern()?;
        for (i, udt) in pattern.grammar.udts().iter().enumerate() {
            if self.udt_callbacks[i].is_none() {
                return Err(ExecError::UdtNotDefined(udt.name.clone()));
            }
        }
        Ok(())
    }

    fn clear_for_parse(&mut self) {
        self.source.clear();
        self.original_source.clear();
        self.last_match = None;
        self.last_left = None;
        self.last_right = None;
        if let Some(trace) = self.trace.as_mut() {
            trace.clear();
        }
    }

    fn init_ast_callbacks(&mut self) {
        let Some(pattern) = self.pattern.as_ref() else {
            return;
        };
        for (r, &enabled) in pattern.enabled_rules.iter().enumerate() {
            let callback = enabled.then_some(collect_capture::<C> as AstCallback<C>);
            self.ast.set_rule_callback(r, callback);
        }
        for (u, &enabled) in pattern.enabled_udts.iter().enumerate() {
            let callback = enabled.then_some(collect_capture::<C> as AstCallback<C>);
            self.ast.set_udt_callback(u, callback);
        }
    }

    fn reset_ast_callbacks(&mut self) {
        let Some(pattern) = self.pattern.as_ref() else {
            return;
        };
        for r in 0..pattern.grammar.rule_count() {
            self.ast.set_rule_callback(r, None);
        }
        for u in 0..pattern.grammar.udt_count() {
            self.ast.set_udt_callback(u, None);
        }
    }

    /// One parse attempt starting at `begin`.
    fn attempt(&mut self, begin: usize) -> Result<ParseOutcome, ExecError> {
        let Some(pattern) = self.pattern.as_ref() else {
            return Err(ExecError::NoPattern);
        };
        let mut parser = Parser::new(&pattern.grammar, &self.source);
        parser.set_lookbehind_limit(self.config.lookbehind_limit);
        if let Some(pppt) = pattern.pppt.as_ref() {
            parser.set_pppt(pppt);
        }
        parser.attach_ast(&mut self.ast);
        if let Some(trace) = self.trace.as_mut() {
            parser.attach_trace(trace);
        }
        parser.set_callbacks(&mut self.rule_callbacks, &mut self.udt_callbacks);
        Ok(parser.parse(pattern.start_rule, begin)?)
    }

    /// Scan forward from `begin` for the first matching start position,
    /// updating the cursor past the match on success.
    fn find_global_from(
        &mut self,
        begin: usize,
    ) -> Result<Option<(usize, ParseOutcome)>, ExecError> {
        let len = self.source.len();
        let mut at = begin;
        while at < len {
            let outcome = self.attempt(at)?;
            if outcome.matched() {
                // the +1 keeps empty matches from pinning the cursor
                self.last_index = at + outcome.phrase_length.max(1);
                return Ok(Some((at, outcome)));
            }
            at += 1;
        }
        Ok(None)
    }

    /// Mode dispatch around the scan, with the cursor rules of each mode.
    fn find(&mut self) -> Result<Option<(usize, ParseOutcome)>, ExecError> {
        if self.last_index >= self.source.len() {
            self.last_index = 0;
            return Ok(None);
        }
        let mode = self.require_pattern()?.flags.mode;
        match mode {
            Mode::Default => {
                let found = self.find_global_from(self.last_index)?;
                self.last_index = 0;
                Ok(found)
            }
            Mode::Global => match self.find_global_from(self.last_index)? {
                Some(hit) => Ok(Some(hit)),
                None => {
                    self.last_index = 0;
                    Ok(None)
                }
            },
            Mode::Sticky => {
                let begin = self.last_index;
                let outcome = self.attempt(begin)?;
                if outcome.matched() {
                    self.last_index = begin + outcome.phrase_length.max(1);
                    Ok(Some((begin, outcome)))
                } else {
                    self.last_index = 0;
                    Ok(None)
                }
            }
        }
    }

    fn build_result(
        &mut self,
        begin: usize,
        outcome: &ParseOutcome,
    ) -> Result<MatchResult<C>, ExecError> {
        let Some(pattern) = self.pattern.as_ref() else {
            return Err(ExecError::NoPattern);
        };
        let grammar = &pattern.grammar;
        let mut acc = CaptureAcc {
            rules: vec![Vec::new(); grammar.rule_count()],
            udts: vec![Vec::new(); grammar.udt_count()],
        };
        self.ast.translate(grammar, &self.source, &mut acc);

        let len = self.source.len();
        let end = begin + outcome.phrase_length;
        let matched = MatchPhrase::from_input(&self.source, Phrase::new(begin, outcome.phrase_length));
        let left = MatchPhrase::from_input(&self.source, Phrase::new(0, begin));
        let right = MatchPhrase::from_input(&self.source, Phrase::new(end, len - end));

        let mut rules = Vec::new();
        for (r, rule) in grammar.rules().iter().enumerate() {
            if !pattern.enabled_rules[r] {
                continue;
            }
            let mut phrases = Vec::with_capacity(acc.rules[r].len());
            for &phrase in acc.rules[r].iter() {
                if phrase.end() > len {
                    return Err(ExecError::CaptureOutOfBounds(rule.name.clone()));
                }
                phrases.push(MatchPhrase::from_input(&self.source, phrase));
            }
            rules.push(RuleCaptures {
                name: rule.name.clone(),
                index: r,
                is_udt: false,
                phrases,
            });
        }
        for (u, udt) in grammar.udts().iter().enumerate() {
            if !pattern.enabled_udts[u] {
                continue;
            }
            let mut phrases = Vec::with_capacity(acc.udts[u].len());
            for &phrase in acc.udts[u].iter() {
                if phrase.end() > len {
                    return Err(ExecError::CaptureOutOfBounds(udt.name.clone()));
                }
                phrases.push(MatchPhrase::from_input(&self.source, phrase));
            }
            rules.push(RuleCaptures {
                name: udt.name.clone(),
                index: u,
                is_udt: true,
                phrases,
            });
        }

        self.last_match = Some(matched.clone());
        self.last_left = Some(left.clone());
        self.last_right = Some(right.clone());
        Ok(MatchResult {
            matched,
            left_context: left,
            right_context: right,
            rules,
            last_index: self.last_index,
            node_hits: outcome.hit_count,
            max_tree_depth: outcome.max_tree_depth,
        })
    }

    fn replace_impl<F>(&mut self, source: &[C], mut make: F) -> Result<Vec<C>, ReplaceError>
    where
        F: FnMut(&MatcherBase<C>, &MatchResult<C>) -> Result<Vec<C>, ReplaceError>,
    {
        self.require_pattern()?;
        if source.is_empty() {
            return Err(ExecError::EmptySource.into());
        }
        self.check_udts_bound()?;
        self.clear_for_parse();
        self.source = source.to_vec();
        self.original_source = source.to_vec();
        self.init_ast_callbacks();
        let run = self.replace_loop(&mut make);
        self.reset_ast_callbacks();
        run?;
        self.last_index = 0;
        Ok(self.source.clone())
    }

    fn replace_loop<F>(&mut self, make: &mut F) -> Result<(), ReplaceError>
    where
        F: FnMut(&MatcherBase<C>, &MatchResult<C>) -> Result<Vec<C>, ReplaceError>,
    {
        let mode = self.require_pattern()?.flags.mode;
        loop {
            let Some((begin, outcome)) = self.find()? else {
                break;
            };
            let result = self.build_result(begin, &outcome)?;
            let expansion = make(self, &result)?;
            self.apply_replacement(&result, &expansion);
            if mode == Mode::Default {
                break;
            }
        }
        Ok(())
    }

    fn apply_replacement(&mut self, result: &MatchResult<C>, expansion: &[C]) {
        let start = result.matched.offset;
        let end = start + result.matched.len();
        self.source.splice(start..end, expansion.iter().copied());
        // shift the cursor and the stored right context by the growth
        let grow = expansion.len();
        let shrink = result.matched.len();
        self.last_index = (self.last_index + grow).saturating_sub(shrink);
        if let Some(right) = self.last_right.as_mut() {
            right.offset = (right.offset + grow).saturating_sub(shrink);
        }
    }

    /// Expand the `$` escapes of a replacement phrase against one result.
    fn expand_replacement(
        &self,
        raw: &[C],
        result: &MatchResult<C>,
    ) -> Result<Vec<C>, ReplaceError> {
        let mut out: Vec<C> = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            let c = raw[i];
            let v: u64 = c.into();
            if v != 0x24 {
                out.push(c);
                i += 1;
                continue;
            }
            let Some(&next) = raw.get(i + 1) else {
                return Err(ReplaceError::TrailingEscape);
            };
            let escape: u64 = next.into();
            match escape {
                // $$
                0x24 => {
                    out.push(next);
                    i += 2;
                }
                // $_
                0x5F => {
                    out.extend_from_slice(&self.original_source);
                    i += 2;
                }
                // $&
                0x26 => {
                    out.extend_from_slice(&result.matched.chars);
                    i += 2;
                }
                // $`
                0x60 => {
                    out.extend_from_slice(&result.left_context.chars);
                    i += 2;
                }
                // $'
                0x27 => {
                    out.extend_from_slice(&result.right_context.chars);
                    i += 2;
                }
                // $<name>
                0x3C => {
                    let mut j = i + 2;
                    let mut name = String::new();
                    let mut closed = false;
                    while let Some(&nc) = raw.get(j) {
                        let v: u64 = nc.into();
                        if v == 0x3E {
                            closed = true;
                            break;
                        }
                        match u32::try_from(v).ok().and_then(char::from_u32) {
                            Some(ch) => name.push(ch),
                            None => name.push(char::REPLACEMENT_CHARACTER),
                        }
                        j += 1;
                    }
                    if !closed {
                        return Err(ReplaceError::UnterminatedName);
                    }
                    if name.is_empty() {
                        return Err(ReplaceError::EmptyName);
                    }
                    let pattern = self.pattern.as_ref().ok_or(ExecError::NoPattern)?;
                    let Some(target) = pattern.grammar.lookup(&name) else {
                        return Err(ReplaceError::UnknownName(name));
                    };
                    let captured = result
                        .rules
                        .iter()
                        .find(|rc| match target {
                            Target::Rule(r) => !rc.is_udt && rc.index == r,
                            Target::Udt(u) => rc.is_udt && rc.index == u,
                        })
                        .and_then(|rc| rc.phrases.last());
                    if let Some(phrase) = captured {
                        out.extend_from_slice(&phrase.chars);
                    }
                    i = j + 1;
                }
                other => return Err(ReplaceError::UnknownEscape(other)),
            }
        }
        Ok(out)
    }
}

/// The string-facing matcher over the `u32` alphabet.
///
/// Sources are decoded to Unicode scalar values, so all offsets and
/// lengths count characters, not bytes.
pub struct Matcher {
    base: MatcherBase<u32>,
}

impl Matcher {
    /// Compile `pattern` with `flags` into a ready matcher.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] for an invalid flag string or pattern.
    pub fn new(pattern: &str, flags: &str) -> Result<Matcher, PatternError> {
        Self::with_config(pattern, flags, Config::default())
    }

    /// Like [`Matcher::new`] with a custom engine configuration.
    ///
    /// # Errors
    ///
    /// As [`Matcher::new`].
    pub fn with_config(pattern: &str, flags: &str, config: Config) -> Result<Matcher, PatternError> {
        let mut base = MatcherBase::with_config(config);
        base.set_pattern_source(pattern, flags)?;
        Ok(Self { base })
    }

    /// Find the next match in `source` according to the pattern's mode.
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::exec`].
    pub fn exec(&mut self, source: &str) -> Result<Option<MatchResult<u32>>, ExecError> {
        self.base.exec(&chars_of_str(source))
    }

    /// Report only whether the pattern matches in `source`.
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::test`].
    pub fn test(&mut self, source: &str) -> Result<bool, ExecError> {
        self.base.test(&chars_of_str(source))
    }

    /// Replace matches of the pattern in `source` with `replacement`.
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::replace`].
    pub fn replace(&mut self, source: &str, replacement: &str) -> Result<String, ReplaceError> {
        let replaced = self
            .base
            .replace(&chars_of_str(source), &chars_of_str(replacement))?;
        Ok(string_from_chars(&replaced))
    }

    /// Replace each match with the string returned by `replacer`.
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::replace_with`].
    pub fn replace_with<F>(&mut self, source: &str, mut replacer: F) -> Result<String, ReplaceError>
    where
        F: FnMut(&MatchResult<u32>, &Properties<u32>) -> String,
    {
        let replaced = self
            .base
            .replace_with(&chars_of_str(source), |result, properties| {
                chars_of_str(&replacer(result, properties))
            })?;
        Ok(string_from_chars(&replaced))
    }

    /// Split `source` on pattern matches; see [`MatcherBase::split`].
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::split`].
    pub fn split(&mut self, source: &str, limit: usize) -> Result<Vec<String>, ExecError> {
        let pieces = self.base.split(&chars_of_str(source), limit)?;
        Ok(pieces.iter().map(|p| string_from_chars(p)).collect())
    }

    /// See [`MatcherBase::enable`].
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::enable`].
    pub fn enable(&mut self, names: &str, on: bool) -> Result<(), EnableError> {
        self.base.enable(names, on)
    }

    /// See [`MatcherBase::define_udt`].
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::define_udt`].
    pub fn define_udt<F>(&mut self, name: &str, callback: F) -> Result<(), CallbackBindError>
    where
        F: FnMut(&mut CallbackData<'_, u32>) + 'static,
    {
        self.base.define_udt(name, callback)
    }

    /// The cursor where the next search begins.
    pub fn last_index(&self) -> usize {
        self.base.last_index()
    }

    /// Override the cursor; counted in characters.
    pub fn set_last_index(&mut self, last_index: usize) {
        self.base.set_last_index(last_index)
    }

    /// See [`MatcherBase::properties`].
    ///
    /// # Errors
    ///
    /// As [`MatcherBase::properties`].
    pub fn properties(&self) -> Result<Properties<u32>, ExecError> {
        self.base.properties()
    }

    /// The underlying generic engine.
    pub fn base(&self) -> &MatcherBase<u32> {
        &self.base
    }

    /// The underlying generic engine, mutably.
    pub fn base_mut(&mut self) -> &mut MatcherBase<u32> {
        &mut self.base
    }
}
