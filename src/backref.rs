//! Back-reference bookkeeping: capture stacks, checkpoints, and the
//! single-expansion syntax tree (SEST) analysis.
//!
//! One [`BkrMap`] per mode is derived from the grammar at build time: it
//! assigns a capture-stack index to every back-referenced rule and UDT and
//! flags every rule whose expansion can reach one. During a parse one
//! [`Backref`] per mode maintains the stacks. Rules and composite operators
//! checkpoint the stack lengths on entry and truncate back to them when the
//! node fails, keeping captures consistent with matched text. In parent
//! mode a rule that can reach a back-referenced target also pushes a
//! placeholder frame on every stack at entry; the target's successful exit
//! fills every placeholder still on its own stack.
use tinyvec::TinyVec;

use crate::grammar::{BkrMode, Opcode, Target};
use crate::parser::{MatchState, ParseError};
use crate::phrase::{AlphabetChar, UNDEFINED};

/// One captured frame: phrase offset and length into the full input.
pub(crate) type BkrFrame = (usize, usize);

type CheckPoint = TinyVec<[usize; 8]>;

/// Grammar-derived back-reference analysis for one mode.
#[derive(Debug, Clone)]
pub(crate) struct BkrMap {
    /// Per rule: the capture stack index, if the rule is back-referenced.
    rule_stack: Vec<Option<usize>>,
    /// Per UDT: the capture stack index, if the UDT is back-referenced.
    udt_stack: Vec<Option<usize>>,
    /// Per rule: true if the rule's expansion reaches a back-referenced
    /// rule or UDT. Rules without the flag skip all checkpoint work.
    rule_has: Vec<bool>,
    /// Number of capture stacks.
    count: usize,
}

impl BkrMap {
    /// Analyze the opcode array for one back-reference mode. Returns
    /// `None` when the grammar carries no BKR of that mode.
    pub(crate) fn build<C: AlphabetChar>(
        opcodes: &[Opcode<C>],
        child_lists: &[usize],
        rule_count: usize,
        udt_count: usize,
        rule_roots: &[usize],
        mode: BkrMode,
    ) -> Option<BkrMap> {
        let mut rule_stack: Vec<Option<usize>> = vec![None; rule_count];
        let mut udt_stack: Vec<Option<usize>> = vec![None; udt_count];
        let mut count = 0;
        for op in opcodes.iter() {
            if let Opcode::Bkr {
                target,
                mode: m,
                ..
            } = *op
            {
                if m != mode {
                    continue;
                }
                match target {
                    Target::Rule(r) => {
                        if rule_stack[r].is_none() {
                            rule_stack[r] = Some(count);
                            count += 1;
                        }
                    }
                    Target::Udt(u) => {
                        if udt_stack[u].is_none() {
                            udt_stack[u] = Some(count);
                            count += 1;
                        }
                    }
                }
            }
        }
        if count == 0 {
            return None;
        }

        // SEST scan: which rules and UDTs each rule's own tree references
        let mut direct_rules: Vec<Vec<usize>> = vec![Vec::new(); rule_count];
        let mut direct_hit = vec![false; rule_count];
        for (r, &root) in rule_roots.iter().enumerate() {
            walk_ops(opcodes, child_lists, root, &mut |op| match *op {
                Opcode::Rnm { rule } => direct_rules[r].push(rule),
                Opcode::Udt { udt } => {
                    if udt_stack[udt].is_some() {
                        direct_hit[r] = true;
                    }
                }
                _ => {}
            });
        }

        // transitive closure through rule references
        let mut rule_has = vec![false; rule_count];
        loop {
            let mut changed = false;
            for r in 0..rule_count {
                if rule_has[r] {
                    continue;
                }
                let reaches = direct_hit[r]
                    || direct_rules[r]
                        .iter()
                        .any(|&t| rule_stack[t].is_some() || rule_has[t]);
                if reaches {
                    rule_has[r] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        Some(BkrMap {
            rule_stack,
            udt_stack,
            rule_has,
            count,
        })
    }
}

fn walk_ops<C: AlphabetChar>(
    opcodes: &[Opcode<C>],
    child_lists: &[usize],
    root: usize,
    f: &mut impl FnMut(&Opcode<C>),
) {
    let mut stack = vec![root];
    while let Some(op) = stack.pop() {
        let op = &opcodes[op];
        f(op);
        match *op {
            Opcode::Alt { children } | Opcode::Cat { children } => {
                stack.extend_from_slice(&child_lists[children.0..children.1]);
            }
            Opcode::Rep { child, .. }
            | Opcode::And { child }
            | Opcode::Not { child }
            | Opcode::Bka { child }
            | Opcode::Bkn { child } => stack.push(child),
            _ => {}
        }
    }
}

/// Runtime capture stacks for one back-reference mode of one parse attempt.
#[derive(Debug)]
pub(crate) struct Backref<'g> {
    map: &'g BkrMap,
    mode: BkrMode,
    stacks: Vec<Vec<BkrFrame>>,
    checkpoints: Vec<CheckPoint>,
    open_rules: Vec<bool>,
}

impl<'g> Backref<'g> {
    pub(crate) fn new(map: &'g BkrMap, mode: BkrMode) -> Self {
        Self {
            map,
            mode,
            stacks: vec![Vec::new(); map.count],
            checkpoints: Vec::new(),
            open_rules: Vec::new(),
        }
    }

    fn snapshot(&self) -> CheckPoint {
        self.stacks.iter().map(|s| s.len()).collect()
    }

    fn restore(&mut self, checkpoint: &CheckPoint) {
        for (stack, &len) in self.stacks.iter_mut().zip(checkpoint.iter()) {
            stack.truncate(len);
        }
    }

    fn fill_placeholders(&mut self, stack: usize, offset: usize, length: usize) {
        for frame in self.stacks[stack].iter_mut() {
            if frame.0 == UNDEFINED {
                *frame = (offset, length);
            }
        }
    }

    pub(crate) fn rule_open(&mut self, rule: usize) {
        let is = self.map.rule_stack[rule].is_some();
        let has = self.map.rule_has[rule];
        if has || is {
            let checkpoint = self.snapshot();
            self.checkpoints.push(checkpoint);
        }
        if self.mode == BkrMode::Parent && has {
            // pending captures for the targets this rule instance may match
            for stack in self.stacks.iter_mut() {
                stack.push((UNDEFINED, UNDEFINED));
            }
        }
        self.open_rules.push(has);
    }

    pub(crate) fn rule_close(
        &mut self,
        rule: usize,
        state: MatchState,
        offset: usize,
        length: usize,
    ) -> Result<(), ParseError> {
        let is = self.map.rule_stack[rule].is_some();
        let has = self.map.rule_has[rule];
        if has || is {
            let checkpoint = self
                .checkpoints
                .pop()
                .ok_or(ParseError::EmptyBackrefStack)?;
            match self.mode {
                // universal captures survive the rule that produced them
                BkrMode::Universal => {
                    if state != MatchState::Match {
                        self.restore(&checkpoint);
                    }
                }
                // parent captures never outlive the enclosing instance
                BkrMode::Parent => self.restore(&checkpoint),
            }
        }
        if state == MatchState::Match {
            if let Some(stack) = self.map.rule_stack[rule] {
                match self.mode {
                    BkrMode::Universal => self.stacks[stack].push((offset, length)),
                    BkrMode::Parent => self.fill_placeholders(stack, offset, length),
                }
            }
        }
        self.open_rules.pop().ok_or(ParseError::EmptyBackrefStack)?;
        Ok(())
    }

    pub(crate) fn udt_close(&mut self, udt: usize, state: MatchState, offset: usize, length: usize) {
        if state != MatchState::Match {
            return;
        }
        if let Some(stack) = self.map.udt_stack[udt] {
            match self.mode {
                BkrMode::Universal => self.stacks[stack].push((offset, length)),
                BkrMode::Parent => self.fill_placeholders(stack, offset, length),
            }
        }
    }

    pub(crate) fn op_open(&mut self) -> Result<(), ParseError> {
        let &open = self.open_rules.last().ok_or(ParseError::EmptyBackrefStack)?;
        if open {
            let checkpoint = self.snapshot();
            self.checkpoints.push(checkpoint);
        }
        Ok(())
    }

    pub(crate) fn op_close(&mut self, state: MatchState) -> Result<(), ParseError> {
        let &open = self.open_rules.last().ok_or(ParseError::EmptyBackrefStack)?;
        if open {
            let checkpoint = self
                .checkpoints
                .pop()
                .ok_or(ParseError::EmptyBackrefStack)?;
            if state == MatchState::NoMatch {
                self.restore(&checkpoint);
            }
        }
        Ok(())
    }

    /// Close for look-around wrappers: captures made while looking around
    /// are discarded whether or not the child matched.
    pub(crate) fn lookaround_close(&mut self) -> Result<(), ParseError> {
        let &open = self.open_rules.last().ok_or(ParseError::EmptyBackrefStack)?;
        if open {
            let checkpoint = self
                .checkpoints
                .pop()
                .ok_or(ParseError::EmptyBackrefStack)?;
            self.restore(&checkpoint);
        }
        Ok(())
    }

    /// The currently visible capture for `target`, if any. A parent-mode
    /// placeholder that was never filled counts as no capture.
    pub(crate) fn fetch(&self, target: Target) -> Option<BkrFrame> {
        let stack = match target {
            Target::Rule(r) => self.map.rule_stack[r]?,
            Target::Udt(u) => self.map.udt_stack[u]?,
        };
        let &frame = self.stacks[stack].last()?;
        if frame.0 == UNDEFINED {
            None
        } else {
            Some(frame)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{BkrCase, GrammarBuilder};

    // tag = open close ; open = name ; close = \name ; name = "a"
    fn tag_grammar() -> crate::grammar::Grammar<u8> {
        let mut b = GrammarBuilder::<u8>::new();
        let tag = b.add_rule("tag");
        let open = b.add_rule("open");
        let close = b.add_rule("close");
        let name = b.add_rule("name");
        let open_ref = b.rnm(open);
        let close_ref = b.rnm(close);
        let cat = b.cat(&[open_ref, close_ref]);
        b.set_rule_root(tag, cat);
        let name_ref = b.rnm(name);
        b.set_rule_root(open, name_ref);
        let bkr = b.bkr(Target::Rule(name), BkrMode::Universal, BkrCase::Sensitive);
        b.set_rule_root(close, bkr);
        let a = b.tls(b"a");
        b.set_rule_root(name, a);
        b.finish().unwrap()
    }

    #[test]
    fn sest_flags_reach_the_target_transitively() {
        let g = tag_grammar();
        let map = g.bkr_map(BkrMode::Universal).unwrap();
        // name itself is the target
        assert!(map.rule_stack[3].is_some());
        // tag and open reach name through their trees; close holds only the BKR
        assert!(map.rule_has[0]);
        assert!(map.rule_has[1]);
        assert!(!map.rule_has[2]);
        assert_eq!(map.count, 1);
    }

    #[test]
    fn checkpoints_restore_on_nomatch() {
        let g = tag_grammar();
        let map = g.bkr_map(BkrMode::Universal).unwrap();
        let mut bkr = Backref::new(map, BkrMode::Universal);
        bkr.rule_open(0);
        bkr.rule_open(3);
        bkr.rule_close(3, MatchState::Match, 0, 1).unwrap();
        assert_eq!(bkr.fetch(Target::Rule(3)), Some((0, 1)));
        bkr.rule_close(0, MatchState::NoMatch, 0, 0).unwrap();
        assert_eq!(bkr.fetch(Target::Rule(3)), None);
    }

    #[test]
    fn parent_mode_fills_placeholders() {
        let mut b = GrammarBuilder::<u8>::new();
        let tag = b.add_rule("tag");
        let name = b.add_rule("name");
        let name_ref = b.rnm(name);
        let bkr = b.bkr(Target::Rule(name), BkrMode::Parent, BkrCase::Sensitive);
        let cat = b.cat(&[name_ref, bkr]);
        b.set_rule_root(tag, cat);
        let a = b.tls(b"a");
        b.set_rule_root(name, a);
        let g = b.finish().unwrap();
        let map = g.bkr_map(BkrMode::Parent).unwrap();

        let mut bkr = Backref::new(map, BkrMode::Parent);
        bkr.rule_open(0); // pushes a placeholder
        assert_eq!(bkr.fetch(Target::Rule(1)), None);
        bkr.rule_open(1);
        bkr.rule_close(1, MatchState::Match, 2, 3).unwrap();
        assert_eq!(bkr.fetch(Target::Rule(1)), Some((2, 3)));
        // the enclosing instance discards its frame on exit either way
        bkr.rule_close(0, MatchState::Match, 0, 5).unwrap();
        assert_eq!(bkr.fetch(Target::Rule(1)), None);
    }
}
