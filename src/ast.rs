//! The AST subsystem: a linear record buffer written during parsing and
//! walked afterwards with user callbacks.
//!
//! While parsing, entry to a recorded rule or UDT appends a PRE record and
//! its successful exit appends the matching POST, back-patching the phrase
//! length and the sibling indices onto the PRE. A failed subtree truncates
//! the buffer back to the length captured at its entry, so the buffer never
//! holds speculative records once the parse returns. Whether a node is
//! recorded at all depends only on whether a callback is registered for it
//! at parse time; the callbacks themselves run later, in
//! [`Ast::translate`], and may be rebound between translations.
use std::any::Any;

use displaydoc::Display;

use crate::grammar::{Grammar, Target};
use crate::parser::{MatchState, ParseError};
use crate::phrase::{AlphabetChar, UNDEFINED};

/// Which side of a rule activation a record describes.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AstState {
    /// Written at entry to the rule or UDT.
    Pre,
    /// Written at its successful exit.
    Post,
}

/// A translation callback's directive to the walker.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AstVerdict {
    /// Continue with the next record.
    Ok,
    /// From a PRE record: jump to the sibling POST, pruning the subtree.
    Skip,
}

/// One AST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AstRecord {
    /// The rule or UDT this record belongs to.
    pub target: Target,
    /// Offset of the matched phrase in the full input.
    pub phrase_offset: usize,
    /// Length of the matched phrase. Back-patched onto the PRE when the
    /// POST is written.
    pub phrase_length: usize,
    /// PRE or POST.
    pub state: AstState,
    /// This record's own index.
    pub this_index: usize,
    /// The sibling record's index: a PRE points at its POST and the POST
    /// back at its PRE.
    pub that_index: usize,
}

/// The view of one record handed to a translation callback.
#[derive(Debug)]
pub struct AstData<'a, C: AlphabetChar> {
    /// The rule or UDT name.
    pub name: &'a str,
    /// The rule or UDT this record belongs to.
    pub target: Target,
    /// The full input the records index into.
    pub input: &'a [C],
    /// Offset of the matched phrase.
    pub phrase_offset: usize,
    /// Length of the matched phrase.
    pub phrase_length: usize,
    /// PRE or POST.
    pub state: AstState,
}

/// A translation callback. `user_data` is whatever the caller handed to
/// [`Ast::translate`]; downcast it to recover the concrete type.
pub type AstCallback<C> = fn(&AstData<'_, C>, &mut dyn Any) -> AstVerdict;

/// The AST record buffer and its per-rule/per-UDT callback table.
pub struct Ast<C: AlphabetChar> {
    rule_callbacks: Vec<Option<AstCallback<C>>>,
    udt_callbacks: Vec<Option<AstCallback<C>>>,
    records: Vec<AstRecord>,
    open_stack: Vec<usize>,
    that_stack: Vec<usize>,
}

impl<C: AlphabetChar> Ast<C> {
    /// An empty AST sized for a grammar's rule and UDT tables.
    pub fn new(rule_count: usize, udt_count: usize) -> Self {
        Self {
            rule_callbacks: vec![None; rule_count],
            udt_callbacks: vec![None; udt_count],
            records: Vec::new(),
            open_stack: Vec::new(),
            that_stack: Vec::new(),
        }
    }

    /// Drop all records; callbacks stay bound.
    pub fn clear(&mut self) {
        self.records.clear();
        self.open_stack.clear();
        self.that_stack.clear();
    }

    /// Bind or unbind the translation callback of a rule. A rule is
    /// recorded during parsing iff a callback is bound at parse time.
    ///
    /// # Panics
    ///
    /// Panics if the rule index is out of range.
    pub fn set_rule_callback(&mut self, rule: usize, callback: Option<AstCallback<C>>) {
        self.rule_callbacks[rule] = callback;
    }

    /// Bind or unbind the translation callback of a UDT.
    ///
    /// # Panics
    ///
    /// Panics if the UDT index is out of range.
    pub fn set_udt_callback(&mut self, udt: usize, callback: Option<AstCallback<C>>) {
        self.udt_callbacks[udt] = callback;
    }

    /// The records of the last successful parse, in parse order.
    pub fn records(&self) -> &[AstRecord] {
        &self.records
    }

    fn callback_for(&self, target: Target) -> Option<AstCallback<C>> {
        match target {
            Target::Rule(r) => self.rule_callbacks[r],
            Target::Udt(u) => self.udt_callbacks[u],
        }
    }

    fn drop_from(&mut self, mark: usize) {
        while self.that_stack.last().map_or(false, |&i| i >= mark) {
            self.that_stack.pop();
        }
        self.records.truncate(mark);
    }

    pub(crate) fn rule_open(&mut self, target: Target, offset: usize) {
        let mark = self.records.len();
        self.open_stack.push(mark);
        if self.callback_for(target).is_none() {
            return;
        }
        let this_index = self.records.len();
        self.that_stack.push(this_index);
        self.records.push(AstRecord {
            target,
            phrase_offset: offset,
            phrase_length: UNDEFINED,
            state: AstState::Pre,
            this_index,
            that_index: UNDEFINED,
        });
    }

    pub(crate) fn rule_close(
        &mut self,
        target: Target,
        state: MatchState,
        offset: usize,
        length: usize,
    ) -> Result<(), ParseError> {
        let mark = self.open_stack.pop().ok_or(ParseError::EmptyAstStack)?;
        if state != MatchState::Match {
            self.drop_from(mark);
            return Ok(());
        }
        if self.callback_for(target).is_none() {
            return Ok(());
        }
        let pre = self.that_stack.pop().ok_or(ParseError::EmptyAstStack)?;
        let this_index = self.records.len();
        self.records.push(AstRecord {
            target,
            phrase_offset: offset,
            phrase_length: length,
            state: AstState::Post,
            this_index,
            that_index: pre,
        });
        let pre_record = self.records.get_mut(pre).ok_or(ParseError::EmptyAstStack)?;
        pre_record.phrase_length = length;
        pre_record.that_index = this_index;
        Ok(())
    }

    pub(crate) fn op_open(&mut self) {
        self.open_stack.push(self.records.len());
    }

    pub(crate) fn op_close(&mut self, state: MatchState) -> Result<(), ParseError> {
        let mark = self.open_stack.pop().ok_or(ParseError::EmptyAstStack)?;
        if state == MatchState::NoMatch {
            self.drop_from(mark);
        }
        Ok(())
    }

    /// Walk the records in order, invoking the bound callback of each
    /// record's rule or UDT. A PRE callback returning [`AstVerdict::Skip`]
    /// jumps the walk to the sibling POST. Multiple translations of the
    /// same buffer are permitted; rebind callbacks between them as needed.
    pub fn translate(&self, grammar: &Grammar<C>, input: &[C], user_data: &mut dyn Any) {
        let mut i = 0;
        while i < self.records.len() {
            let record = self.records[i];
            let mut verdict = AstVerdict::Ok;
            if let Some(callback) = self.callback_for(record.target) {
                let data = AstData {
                    name: grammar.target_name(record.target),
                    target: record.target,
                    input,
                    phrase_offset: record.phrase_offset,
                    phrase_length: record.phrase_length,
                    state: record.state,
                };
                verdict = callback(&data, user_data);
            }
            if record.state == AstState::Pre
                && verdict == AstVerdict::Skip
                && record.that_index != UNDEFINED
            {
                i = record.that_index;
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &AstData<'_, u8>, _: &mut dyn Any) -> AstVerdict {
        AstVerdict::Ok
    }

    #[test]
    fn pre_and_post_are_siblings() {
        let mut ast = Ast::<u8>::new(1, 0);
        ast.set_rule_callback(0, Some(noop));
        ast.rule_open(Target::Rule(0), 2);
        ast.rule_close(Target::Rule(0), MatchState::Match, 2, 3).unwrap();
        let records = ast.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].state, AstState::Pre);
        assert_eq!(records[0].phrase_length, 3);
        assert_eq!(records[0].that_index, 1);
        assert_eq!(records[1].state, AstState::Post);
        assert_eq!(records[1].that_index, 0);
    }

    #[test]
    fn nomatch_unwinds_speculative_records() {
        let mut ast = Ast::<u8>::new(2, 0);
        ast.set_rule_callback(0, Some(noop));
        ast.set_rule_callback(1, Some(noop));
        ast.rule_open(Target::Rule(0), 0);
        ast.rule_open(Target::Rule(1), 0);
        ast.rule_close(Target::Rule(1), MatchState::Match, 0, 1).unwrap();
        ast.rule_close(Target::Rule(0), MatchState::NoMatch, 0, 0).unwrap();
        assert!(ast.records().is_empty());
    }

    #[test]
    fn unrecorded_rules_leave_no_trace() {
        let mut ast = Ast::<u8>::new(2, 0);
        ast.set_rule_callback(1, Some(noop));
        ast.rule_open(Target::Rule(0), 0);
        ast.rule_open(Target::Rule(1), 0);
        ast.rule_close(Target::Rule(1), MatchState::Match, 0, 2).unwrap();
        ast.rule_close(Target::Rule(0), MatchState::Match, 0, 2).unwrap();
        assert_eq!(ast.records().len(), 2);
        assert!(ast.records().iter().all(|r| r.target == Target::Rule(1)));
    }
}
