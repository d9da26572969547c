//! The parser core: a recursive-descent interpreter over the compiled
//! opcode array.
//!
//! One [`Parser`] is built per parse attempt. It keeps a small fixed set of
//! integers (offset, phrase length, tree depth, hit count, look-around
//! depth) and walks the opcode tree depth first, children in list order.
//! Every operator restores the offset on NOMATCH, so speculative progress
//! never leaks. Back-reference stacks and AST records are updated at rule
//! and operator boundaries; the optional PPPT short-circuits descent where
//! a one-character lookahead already decides the outcome.
use displaydoc::Display;

use crate::ast::Ast;
use crate::backref::Backref;
use crate::grammar::{BkrCase, BkrMode, Grammar, Opcode, OpcodeKind, Target};
use crate::phrase::{ascii_fold, AlphabetChar};
use crate::pppt::{Pppt, PpptVerdict};
use crate::trace::Trace;

/// The state of one operator evaluation.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchState {
    /// Evaluation has not produced a verdict yet; from a rule callback it
    /// means "no override, continue normal processing".
    Active,
    /// The node matched a phrase (possibly of length zero).
    Match,
    /// The node did not match; the offset has been restored.
    NoMatch,
}

/// What a completed parse attempt reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOutcome {
    /// [`MatchState::Match`] or [`MatchState::NoMatch`].
    pub state: MatchState,
    /// The matched phrase length; zero on NOMATCH.
    pub phrase_length: usize,
    /// The deepest point of the opcode tree walk.
    pub max_tree_depth: usize,
    /// The number of operator evaluations.
    pub hit_count: usize,
}

impl ParseOutcome {
    /// True if the attempt matched.
    pub fn matched(&self) -> bool {
        self.state == MatchState::Match
    }
}

/// The context handed to rule and UDT callbacks.
///
/// The in-fields describe the parse position: `input` is the sub-string
/// being parsed, `offset` the parser offset within it, `parser_state` and
/// `parser_phrase_length` the result of the normal parse when the callback
/// runs on the way up (and [`MatchState::Active`]/0 on the way down). The
/// callback writes its verdict into `state` and `phrase_length`; leaving
/// `state` as [`MatchState::Active`] means no override.
#[derive(Debug)]
pub struct CallbackData<'a, C: AlphabetChar> {
    /// The sub-string being parsed.
    pub input: &'a [C],
    /// The parser offset within `input` at node entry.
    pub offset: usize,
    /// The rule or UDT being evaluated.
    pub target: Target,
    /// The parser's own result so far.
    pub parser_state: MatchState,
    /// The parser's own phrase length so far.
    pub parser_phrase_length: usize,
    /// Out: the callback's verdict.
    pub state: MatchState,
    /// Out: the callback's phrase length.
    pub phrase_length: usize,
}

/// A rule or UDT callback bound to the engine. State travels in the
/// closure's captures.
pub type ParserCallback<C> = Box<dyn FnMut(&mut CallbackData<'_, C>)>;

/// The error type for fatal conditions inside a parse. Ordinary NOMATCH is
/// not an error.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("UDT \"{0}\" has no callback bound")]
    /// Every UDT must have a callback before parsing.
    UdtNotBound(String),
    #[error("UDT callback for \"{0}\" returned the ACTIVE state")]
    /// UDT callbacks must decide MATCH or NOMATCH.
    UdtCallbackActive(String),
    #[error("callback for \"{0}\" returned a phrase overrunning the input")]
    /// A callback phrase must end at or before the sub-string end.
    CallbackPhraseTooLong(String),
    #[error("callback for \"{0}\" returned an empty phrase but the rule or UDT cannot match empty")]
    /// Non-nullable rules and UDTs may not report `(MATCH, 0)`.
    EmptyPhrase(String),
    #[error("start rule index {0} is out of range")]
    /// The requested start rule does not exist.
    StartRuleOutOfRange(usize),
    #[error("sub-string begin {0} lies beyond the input")]
    /// The parse sub-range must start within the input.
    SubstringBeyondInput(usize),
    #[error("opcode index {0} is out of range")]
    /// Internal consistency: the opcode array was corrupted.
    OpcodeOutOfRange(usize),
    #[error("back-reference bookkeeping stack unexpectedly empty")]
    /// Internal consistency: checkpoint push/pop went unbalanced.
    EmptyBackrefStack,
    #[error("AST bookkeeping stack unexpectedly empty")]
    /// Internal consistency: AST open/close went unbalanced.
    EmptyAstStack,
}

/// The opcode interpreter for one parse attempt over one input.
pub struct Parser<'a, C: AlphabetChar> {
    grammar: &'a Grammar<C>,
    input: &'a [C],
    pppt: Option<&'a Pppt>,
    ast: Option<&'a mut Ast<C>>,
    trace: Option<&'a mut Trace>,
    rule_callbacks: Option<&'a mut [Option<ParserCallback<C>>]>,
    udt_callbacks: Option<&'a mut [Option<ParserCallback<C>>]>,
    bkru: Option<Backref<'a>>,
    bkrp: Option<Backref<'a>>,
    lookbehind_limit: usize,
    sub_begin: usize,
    sub_end: usize,
    offset: usize,
    phrase_length: usize,
    state: MatchState,
    tree_depth: usize,
    max_tree_depth: usize,
    hit_count: usize,
    in_lookaround: usize,
}

impl<'a, C: AlphabetChar> Parser<'a, C> {
    /// A parser over `input` for `grammar`. Back-reference stacks are
    /// created here when the grammar carries BKR opcodes.
    pub fn new(grammar: &'a Grammar<C>, input: &'a [C]) -> Self {
        let bkru = grammar
            .bkr_map(BkrMode::Universal)
            .map(|m| Backref::new(m, BkrMode::Universal));
        let bkrp = grammar
            .bkr_map(BkrMode::Parent)
            .map(|m| Backref::new(m, BkrMode::Parent));
        Self {
            grammar,
            input,
            pppt: None,
            ast: None,
            trace: None,
            rule_callbacks: None,
            udt_callbacks: None,
            bkru,
            bkrp,
            lookbehind_limit: usize::MAX,
            sub_begin: 0,
            sub_end: input.len(),
            offset: 0,
            phrase_length: 0,
            state: MatchState::Active,
            tree_depth: 0,
            max_tree_depth: 0,
            hit_count: 0,
            in_lookaround: 0,
        }
    }

    /// Bound the number of characters a look-behind may walk back.
    pub fn set_lookbehind_limit(&mut self, limit: usize) {
        self.lookbehind_limit = limit;
    }

    /// Attach a PPPT fast-path table. Results are identical with and
    /// without it.
    pub fn set_pppt(&mut self, pppt: &'a Pppt) {
        self.pppt = Some(pppt);
    }

    /// Attach an AST to collect records into. Cleared at parse start.
    pub fn attach_ast(&mut self, ast: &'a mut Ast<C>) {
        self.ast = Some(ast);
    }

    /// Attach a trace to observe every operator visit.
    pub fn attach_trace(&mut self, trace: &'a mut Trace) {
        self.trace = Some(trace);
    }

    /// Attach rule and UDT callback tables, indexed like the grammar's
    /// rule and UDT tables.
    pub fn set_callbacks(
        &mut self,
        rules: &'a mut [Option<ParserCallback<C>>],
        udts: &'a mut [Option<ParserCallback<C>>],
    ) {
        self.rule_callbacks = Some(rules);
        self.udt_callbacks = Some(udts);
    }

    /// Run one parse attempt of `start_rule` over the sub-range
    /// `[sub_begin, input.len())`.
    ///
    /// Look-behind may read characters before `sub_begin`; the anchors
    /// always refer to the full input bounds.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] on structural violations (callback
    /// protocol breaches, unbound UDTs, out-of-range indices). An
    /// unmatched input is an ordinary [`ParseOutcome`], not an error.
    pub fn parse(&mut self, start_rule: usize, sub_begin: usize) -> Result<ParseOutcome, ParseError> {
        if start_rule >= self.grammar.rule_count() {
            return Err(ParseError::StartRuleOutOfRange(start_rule));
        }
        if sub_begin > self.input.len() {
            return Err(ParseError::SubstringBeyondInput(sub_begin));
        }
        self.sub_begin = sub_begin;
        self.sub_end = self.input.len();
        self.offset = sub_begin;
        self.phrase_length = 0;
        self.state = MatchState::Active;
        self.tree_depth = 0;
        self.max_tree_depth = 0;
        self.hit_count = 0;
        self.in_lookaround = 0;
        if let Some(ast) = self.ast.as_deref_mut() {
            ast.clear();
        }
        // fresh capture stacks for this attempt
        let grammar = self.grammar;
        self.bkru = grammar
            .bkr_map(BkrMode::Universal)
            .map(|m| Backref::new(m, BkrMode::Universal));
        self.bkrp = grammar
            .bkr_map(BkrMode::Parent)
            .map(|m| Backref::new(m, BkrMode::Parent));

        self.hit_count += 1;
        self.tree_depth += 1;
        self.max_tree_depth = self.tree_depth;
        self.trace_down(OpcodeKind::Rnm);
        self.op_rnm(start_rule, None)?;
        self.trace_up(OpcodeKind::Rnm);
        self.tree_depth -= 1;

        Ok(ParseOutcome {
            state: self.state,
            phrase_length: self.phrase_length,
            max_tree_depth: self.max_tree_depth,
            hit_count: self.hit_count,
        })
    }

    fn trace_down(&mut self, kind: OpcodeKind) {
        let (depth, offset) = (self.tree_depth, self.offset);
        if let Some(trace) = self.trace.as_deref_mut() {
            trace.down(kind, depth, offset);
        }
    }

    fn trace_up(&mut self, kind: OpcodeKind) {
        let depth = self.tree_depth;
        let state = self.state;
        let length = self.phrase_length;
        let offset = self.offset - length;
        if let Some(trace) = self.trace.as_deref_mut() {
            trace.up(kind, depth, offset, state, length);
        }
    }

    fn pppt_lookup(&self, op_index: usize) -> Option<PpptVerdict> {
        let pppt = self.pppt?;
        if self.offset >= self.sub_end {
            return None;
        }
        match pppt.lookup(op_index, self.input[self.offset]) {
            PpptVerdict::Indeterminate => None,
            verdict => Some(verdict),
        }
    }

    fn run_op(&mut self, op_index: usize) -> Result<(), ParseError> {
        let op = self
            .grammar
            .opcode(op_index)
            .ok_or(ParseError::OpcodeOutOfRange(op_index))?;
        self.hit_count += 1;
        self.tree_depth += 1;
        if self.tree_depth > self.max_tree_depth {
            self.max_tree_depth = self.tree_depth;
        }
        let kind = op.kind();
        self.trace_down(kind);
        let predictable = matches!(
            kind,
            OpcodeKind::Alt
                | OpcodeKind::Cat
                | OpcodeKind::Rep
                | OpcodeKind::Trg
                | OpcodeKind::Tls
                | OpcodeKind::Tbs
        );
        if predictable {
            if let Some(verdict) = self.pppt_lookup(op_index) {
                match verdict {
                    PpptVerdict::Match1 => {
                        self.state = MatchState::Match;
                        self.offset += 1;
                        self.phrase_length = 1;
                    }
                    _ => {
                        self.state = MatchState::NoMatch;
                        self.phrase_length = 0;
                    }
                }
                self.trace_up(kind);
                self.tree_depth -= 1;
                return Ok(());
            }
        }
        match op {
            Opcode::Alt { children } => self.op_alt(children)?,
            Opcode::Cat { children } => self.op_cat(children)?,
            Opcode::Rep { min, max, child } => self.op_rep(min, max, child)?,
            Opcode::Rnm { rule } => self.op_rnm(rule, Some(op_index))?,
            Opcode::Trg { min, max } => self.op_trg(min, max),
            Opcode::Tls { lit } => self.op_tls(lit),
            Opcode::Tbs { lit } => self.op_tbs(lit),
            Opcode::Udt { udt } => self.op_udt(udt)?,
            Opcode::And { child } => self.op_lookahead(child, false)?,
            Opcode::Not { child } => self.op_lookahead(child, true)?,
            Opcode::Bka { child } => self.op_lookbehind(child, false)?,
            Opcode::Bkn { child } => self.op_lookbehind(child, true)?,
            Opcode::Bkr { target, mode, case } => self.op_bkr(target, mode, case),
            Opcode::Abg => {
                self.state = if self.offset == 0 {
                    MatchState::Match
                } else {
                    MatchState::NoMatch
                };
                self.phrase_length = 0;
            }
            Opcode::Aen => {
                self.state = if self.offset == self.input.len() {
                    MatchState::Match
                } else {
                    MatchState::NoMatch
                };
                self.phrase_length = 0;
            }
        }
        self.trace_up(kind);
        self.tree_depth -= 1;
        Ok(())
    }

    fn ast_op_open(&mut self) {
        if self.in_lookaround == 0 {
            if let Some(ast) = self.ast.as_deref_mut() {
                ast.op_open();
            }
        }
    }

    fn ast_op_close(&mut self) -> Result<(), ParseError> {
        if self.in_lookaround == 0 {
            let state = self.state;
            if let Some(ast) = self.ast.as_deref_mut() {
                ast.op_close(state)?;
            }
        }
        Ok(())
    }

    fn bkr_op_open(&mut self) -> Result<(), ParseError> {
        if let Some(b) = self.bkru.as_mut() {
            b.op_open()?;
        }
        if let Some(b) = self.bkrp.as_mut() {
            b.op_open()?;
        }
        Ok(())
    }

    fn bkr_op_close(&mut self) -> Result<(), ParseError> {
        let state = self.state;
        if let Some(b) = self.bkru.as_mut() {
            b.op_close(state)?;
        }
        if let Some(b) = self.bkrp.as_mut() {
            b.op_close(state)?;
        }
        Ok(())
    }

    fn bkr_lookaround_close(&mut self) -> Result<(), ParseError> {
        if let Some(b) = self.bkru.as_mut() {
            b.lookaround_close()?;
        }
        if let Some(b) = self.bkrp.as_mut() {
            b.lookaround_close()?;
        }
        Ok(())
    }

    fn op_alt(&mut self, children: (usize, usize)) -> Result<(), ParseError> {
        let grammar = self.grammar;
        for &child in grammar.children(children) {
            self.state = MatchState::Active;
            self.run_op(child)?;
            if self.state == MatchState::Match {
                break;
            }
        }
        Ok(())
    }

    fn op_cat(&mut self, children: (usize, usize)) -> Result<(), ParseError> {
        let grammar = self.grammar;
        let saved_offset = self.offset;
        self.ast_op_open();
        self.bkr_op_open()?;
        let mut total = 0;
        let mut matched = true;
        for &child in grammar.children(children) {
            self.state = MatchState::Active;
            self.run_op(child)?;
            if self.state == MatchState::NoMatch {
                matched = false;
                break;
            }
            total += self.phrase_length;
        }
        if matched {
            self.state = MatchState::Match;
            self.phrase_length = total;
        } else {
            self.state = MatchState::NoMatch;
            self.phrase_length = 0;
            self.offset = saved_offset;
        }
        self.bkr_op_close()?;
        self.ast_op_close()?;
        Ok(())
    }

    fn op_rep(&mut self, min: usize, max: usize, child: usize) -> Result<(), ParseError> {
        let saved_offset = self.offset;
        self.ast_op_open();
        self.bkr_op_open()?;
        if max == 0 {
            // zero repetitions allowed: match empty without touching the child
            self.state = MatchState::Match;
            self.phrase_length = 0;
            self.bkr_op_close()?;
            self.ast_op_close()?;
            return Ok(());
        }
        let mut count = 0;
        let mut total = 0;
        loop {
            self.ast_op_open();
            self.bkr_op_open()?;
            self.state = MatchState::Active;
            self.run_op(child)?;
            self.bkr_op_close()?;
            self.ast_op_close()?;
            if self.state == MatchState::Match && self.phrase_length == 0 {
                // an empty iteration ends the repetition successfully,
                // whatever min and max say
                self.offset = saved_offset + total;
                self.phrase_length = total;
                break;
            }
            if self.state == MatchState::NoMatch {
                if count >= min {
                    self.state = MatchState::Match;
                    self.offset = saved_offset + total;
                    self.phrase_length = total;
                } else {
                    self.offset = saved_offset;
                    self.phrase_length = 0;
                }
                break;
            }
            count += 1;
            total += self.phrase_length;
            if count >= max {
                self.offset = saved_offset + total;
                self.phrase_length = total;
                break;
            }
        }
        self.bkr_op_close()?;
        self.ast_op_close()?;
        Ok(())
    }

    fn has_rule_callback(&self, rule: usize) -> bool {
        self.rule_callbacks
            .as_deref()
            .map_or(false, |cbs| cbs[rule].is_some())
    }

    fn invoke_rule_callback(
        &mut self,
        rule: usize,
        entry_offset: usize,
        parser_state: MatchState,
        parser_phrase_length: usize,
    ) -> Result<(MatchState, usize), ParseError> {
        let input = self.input;
        let sub_begin = self.sub_begin;
        let sub_end = self.sub_end;
        let Some(callbacks) = self.rule_callbacks.as_deref_mut() else {
            return Ok((MatchState::Active, 0));
        };
        let Some(callback) = callbacks[rule].as_mut() else {
            return Ok((MatchState::Active, 0));
        };
        let mut data = CallbackData {
            input: &input[sub_begin..sub_end],
            offset: entry_offset.saturating_sub(sub_begin),
            target: Target::Rule(rule),
            parser_state,
            parser_phrase_length,
            state: MatchState::Active,
            phrase_length: 0,
        };
        callback(&mut data);
        Ok((data.state, data.phrase_length))
    }

    fn accept_callback(
        &mut self,
        target: Target,
        entry_offset: usize,
        state: MatchState,
        mut length: usize,
        nullable: bool,
    ) -> Result<(), ParseError> {
        if entry_offset + length > self.sub_end {
            return Err(ParseError::CallbackPhraseTooLong(
                self.grammar.target_name(target).to_string(),
            ));
        }
        if !nullable && state == MatchState::Match && length == 0 {
            return Err(ParseError::EmptyPhrase(
                self.grammar.target_name(target).to_string(),
            ));
        }
        if state == MatchState::NoMatch {
            length = 0;
        }
        self.state = state;
        self.offset = entry_offset + length;
        self.phrase_length = length;
        Ok(())
    }

    fn op_rnm(&mut self, rule: usize, op_index: Option<usize>) -> Result<(), ParseError> {
        let grammar = self.grammar;
        let rule_op = grammar.rules()[rule].op;
        let nullable = grammar.rules()[rule].nullable;
        let entry_offset = self.offset;
        if self.in_lookaround == 0 {
            if let Some(ast) = self.ast.as_deref_mut() {
                ast.rule_open(Target::Rule(rule), entry_offset);
            }
        }
        if let Some(b) = self.bkru.as_mut() {
            b.rule_open(rule);
        }
        if let Some(b) = self.bkrp.as_mut() {
            b.rule_open(rule);
        }

        let mut overridden = false;
        if self.has_rule_callback(rule) {
            // callback on the way down; MATCH or NOMATCH overrides the parse
            let (state, length) =
                self.invoke_rule_callback(rule, entry_offset, MatchState::Active, 0)?;
            if state != MatchState::Active {
                self.accept_callback(Target::Rule(rule), entry_offset, state, length, nullable)?;
                overridden = true;
            }
        }
        if !overridden {
            let mut decided = false;
            if let Some(opi) = op_index {
                if let Some(verdict) = self.pppt_lookup(opi) {
                    match verdict {
                        PpptVerdict::Match1 => {
                            self.state = MatchState::Match;
                            self.offset += 1;
                            self.phrase_length = 1;
                        }
                        _ => {
                            self.state = MatchState::NoMatch;
                            self.phrase_length = 0;
                        }
                    }
                    decided = true;
                }
            }
            if !decided {
                self.state = MatchState::Active;
                self.run_op(rule_op)?;
            }
            if self.has_rule_callback(rule) {
                // callback on the way up; again a non-ACTIVE return overrides
                let parser_state = self.state;
                let parser_length = self.phrase_length;
                let (state, length) =
                    self.invoke_rule_callback(rule, entry_offset, parser_state, parser_length)?;
                if state != MatchState::Active {
                    self.accept_callback(Target::Rule(rule), entry_offset, state, length, nullable)?;
                }
            }
        }

        let state = self.state;
        let phrase_offset = self.offset - self.phrase_length;
        let phrase_length = self.phrase_length;
        if let Some(b) = self.bkru.as_mut() {
            b.rule_close(rule, state, phrase_offset, phrase_length)?;
        }
        if let Some(b) = self.bkrp.as_mut() {
            b.rule_close(rule, state, phrase_offset, phrase_length)?;
        }
        if self.in_lookaround == 0 {
            if let Some(ast) = self.ast.as_deref_mut() {
                ast.rule_close(Target::Rule(rule), state, phrase_offset, phrase_length)?;
            }
        }
        Ok(())
    }

    fn op_udt(&mut self, udt: usize) -> Result<(), ParseError> {
        let grammar = self.grammar;
        let nullable = grammar.udts()[udt].nullable;
        let entry_offset = self.offset;
        if self.in_lookaround == 0 {
            if let Some(ast) = self.ast.as_deref_mut() {
                ast.rule_open(Target::Udt(udt), entry_offset);
            }
        }

        let input = self.input;
        let sub_begin = self.sub_begin;
        let sub_end = self.sub_end;
        let callback = self
            .udt_callbacks
            .as_deref_mut()
            .and_then(|cbs| cbs[udt].as_mut());
        let Some(callback) = callback else {
            return Err(ParseError::UdtNotBound(grammar.udts()[udt].name.clone()));
        };
        let mut data = CallbackData {
            input: &input[sub_begin..sub_end],
            offset: entry_offset.saturating_sub(sub_begin),
            target: Target::Udt(udt),
            parser_state: MatchState::Active,
            parser_phrase_length: 0,
            state: MatchState::Active,
            phrase_length: 0,
        };
        callback(&mut data);
        if data.state == MatchState::Active {
            return Err(ParseError::UdtCallbackActive(
                grammar.udts()[udt].name.clone(),
            ));
        }
        self.accept_callback(
            Target::Udt(udt),
            entry_offset,
            data.state,
            data.phrase_length,
            nullable,
        )?;

        let state = self.state;
        let phrase_offset = self.offset - self.phrase_length;
        let phrase_length = self.phrase_length;
        if let Some(b) = self.bkru.as_mut() {
            b.udt_close(udt, state, phrase_offset, phrase_length);
        }
        if let Some(b) = self.bkrp.as_mut() {
            b.udt_close(udt, state, phrase_offset, phrase_length);
        }
        if self.in_lookaround == 0 {
            if let Some(ast) = self.ast.as_deref_mut() {
                ast.rule_close(Target::Udt(udt), state, phrase_offset, phrase_length)?;
            }
        }
        Ok(())
    }

    fn op_trg(&mut self, min: C, max: C) {
        self.state = MatchState::NoMatch;
        self.phrase_length = 0;
        if self.offset < self.sub_end {
            let c = self.input[self.offset];
            if c >= min && c <= max {
                self.state = MatchState::Match;
                self.offset += 1;
                self.phrase_length = 1;
            }
        }
    }

    fn op_tls(&mut self, lit: (usize, usize)) {
        let literal = self.grammar.literal(lit);
        let len = literal.len();
        if self.offset + len > self.sub_end {
            self.state = MatchState::NoMatch;
            self.phrase_length = 0;
            return;
        }
        // the stored literal is pre-folded; fold the input side only
        let matched = self.input[self.offset..self.offset + len]
            .iter()
            .zip(literal)
            .all(|(&c, &l)| ascii_fold(c) == l);
        if matched {
            self.state = MatchState::Match;
            self.offset += len;
            self.phrase_length = len;
        } else {
            self.state = MatchState::NoMatch;
            self.phrase_length = 0;
        }
    }

    fn op_tbs(&mut self, lit: (usize, usize)) {
        let literal = self.grammar.literal(lit);
        let len = literal.len();
        if self.offset + len > self.sub_end
            || &self.input[self.offset..self.offset + len] != literal
        {
            self.state = MatchState::NoMatch;
            self.phrase_length = 0;
            return;
        }
        self.state = MatchState::Match;
        self.offset += len;
        self.phrase_length = len;
    }

    fn op_lookahead(&mut self, child: usize, negate: bool) -> Result<(), ParseError> {
        let saved_offset = self.offset;
        self.ast_op_open();
        self.bkr_op_open()?;
        self.in_lookaround += 1;
        self.state = MatchState::Active;
        self.run_op(child)?;
        self.in_lookaround -= 1;
        if negate {
            self.state = match self.state {
                MatchState::Match => MatchState::NoMatch,
                _ => MatchState::Match,
            };
        }
        self.offset = saved_offset;
        self.phrase_length = 0;
        self.bkr_lookaround_close()?;
        self.ast_op_close()?;
        Ok(())
    }

    fn op_lookbehind(&mut self, child: usize, negate: bool) -> Result<(), ParseError> {
        self.ast_op_open();
        self.bkr_op_open()?;
        self.in_lookaround += 1;
        self.look_back(child)?;
        self.in_lookaround -= 1;
        if negate {
            self.state = match self.state {
                MatchState::Match => MatchState::NoMatch,
                _ => MatchState::Match,
            };
        }
        self.bkr_lookaround_close()?;
        self.ast_op_close()?;
        Ok(())
    }

    /// Scan candidate look-behind lengths k = 0, 1, ... up to the limit;
    /// a hit is the first k whose child matches with length exactly k.
    fn look_back(&mut self, child: usize) -> Result<(), ParseError> {
        let saved_offset = self.offset;
        let saved_begin = self.sub_begin;
        let saved_end = self.sub_end;
        let max_back = saved_offset.min(self.lookbehind_limit);
        self.sub_begin = saved_offset;
        self.sub_end = saved_offset;
        let mut found = false;
        for k in 0..=max_back {
            self.offset = saved_offset - k;
            self.state = MatchState::Active;
            self.run_op(child)?;
            if self.state == MatchState::Match && self.phrase_length == k {
                found = true;
                break;
            }
        }
        self.sub_begin = saved_begin;
        self.sub_end = saved_end;
        self.offset = saved_offset;
        self.phrase_length = 0;
        self.state = if found {
            MatchState::Match
        } else {
            MatchState::NoMatch
        };
        Ok(())
    }

    fn op_bkr(&mut self, target: Target, mode: BkrMode, case: BkrCase) {
        self.state = MatchState::NoMatch;
        self.phrase_length = 0;
        let frame = match mode {
            BkrMode::Universal => self.bkru.as_ref().and_then(|b| b.fetch(target)),
            BkrMode::Parent => self.bkrp.as_ref().and_then(|b| b.fetch(target)),
        };
        let Some((phrase_offset, phrase_length)) = frame else {
            return;
        };
        if self.offset + phrase_length > self.sub_end {
            return;
        }
        let candidate = &self.input[self.offset..self.offset + phrase_length];
        let captured = &self.input[phrase_offset..phrase_offset + phrase_length];
        let equal = match case {
            BkrCase::Sensitive => candidate == captured,
            BkrCase::Insensitive => candidate
                .iter()
                .zip(captured)
                .all(|(&a, &b)| ascii_fold(a) == ascii_fold(b)),
        };
        if equal {
            self.state = MatchState::Match;
            self.offset += phrase_length;
            self.phrase_length = phrase_length;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{GrammarBuilder, REP_INFINITE};

    fn literal_grammar(lit: &[u8]) -> Grammar<u8> {
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let op = b.tls(lit);
        b.set_rule_root(s, op);
        b.finish().unwrap()
    }

    #[test]
    fn literal_match_in_substring() {
        let g = literal_grammar(b"abc");
        let input = b"xxabcyy".to_vec();
        let mut p = Parser::new(&g, &input);
        let outcome = p.parse(0, 2).unwrap();
        assert!(outcome.matched());
        assert_eq!(outcome.phrase_length, 3);
        let mut p = Parser::new(&g, &input);
        assert!(!p.parse(0, 1).unwrap().matched());
    }

    #[test]
    fn rep_over_nullable_child_terminates() {
        // s = *""
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let empty = b.tls(b"");
        let rep = b.rep(0, REP_INFINITE, empty);
        b.set_rule_root(s, rep);
        let g = b.finish().unwrap();
        let input = b"abc".to_vec();
        let mut p = Parser::new(&g, &input);
        let outcome = p.parse(0, 0).unwrap();
        assert!(outcome.matched());
        assert_eq!(outcome.phrase_length, 0);
    }

    #[test]
    fn anchors_use_full_input_bounds() {
        // s = %^ "abc" %$
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let abg = b.abg();
        let lit = b.tls(b"abc");
        let aen = b.aen();
        let cat = b.cat(&[abg, lit, aen]);
        b.set_rule_root(s, cat);
        let g = b.finish().unwrap();
        let input = b"abc".to_vec();
        assert!(Parser::new(&g, &input).parse(0, 0).unwrap().matched());
        let input = b"xabc".to_vec();
        // the sub-range starts at 1, but ABG wants absolute offset 0
        assert!(!Parser::new(&g, &input).parse(0, 1).unwrap().matched());
    }

    #[test]
    fn lookbehind_scans_to_the_exact_length() {
        // s = (&& "ab") "c"
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let behind = b.tls(b"ab");
        let bka = b.bka(behind);
        let c = b.tls(b"c");
        let cat = b.cat(&[bka, c]);
        b.set_rule_root(s, cat);
        let g = b.finish().unwrap();
        let input = b"abc".to_vec();
        assert!(Parser::new(&g, &input).parse(0, 2).unwrap().matched());
        let input = b"xbc".to_vec();
        assert!(!Parser::new(&g, &input).parse(0, 2).unwrap().matched());
    }

    #[test]
    fn udt_without_callback_is_fatal() {
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let u = b.add_udt("u_digits", false);
        let op = b.udt_op(u);
        b.set_rule_root(s, op);
        let g = b.finish().unwrap();
        let input = b"123".to_vec();
        let mut p = Parser::new(&g, &input);
        assert!(matches!(p.parse(0, 0), Err(ParseError::UdtNotBound(_))));
    }
}
