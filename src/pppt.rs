//! The partially-predictive parsing table (PPPT): a one-character
//! lookahead oracle consulted before descending into an opcode.
//!
//! Each (opcode, character) cell holds one of three verdicts packed into
//! two bits: *definitely matches with length one*, *definitely does not
//! match*, or *indeterminate* (descend normally). The builder derives the
//! table from FIRST-set analysis over the grammar's character range.
//! Verdicts are deliberately conservative: a NOMATCH verdict is only
//! emitted where first-character analysis fully decides the node, and a
//! MATCH verdict only for single-character terminals, so taking the fast
//! path can never change match results, captures or AST records.
use fixedbitset_stack::FixedBitSet;

use crate::grammar::{Grammar, Opcode};
use crate::phrase::AlphabetChar;

/// Keep the table under sixteen million cells; grammars over wide
/// alphabets fall back to plain descent.
const MAX_TABLE_CELLS: usize = 1 << 24;

const CELL_INDETERMINATE: u8 = 0;
const CELL_NOMATCH: u8 = 1;
const CELL_MATCH1: u8 = 2;

/// The verdict of one table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpptVerdict {
    /// The lookahead does not decide this node; descend normally.
    Indeterminate,
    /// The node cannot match here.
    NoMatch,
    /// The node matches exactly one character here.
    Match1,
}

fn decode(cell: u8) -> PpptVerdict {
    match cell {
        CELL_NOMATCH => PpptVerdict::NoMatch,
        CELL_MATCH1 => PpptVerdict::Match1,
        _ => PpptVerdict::Indeterminate,
    }
}

/// The bit-packed lookahead table.
#[derive(Debug, Clone)]
pub struct Pppt {
    char_min: u64,
    char_max: u64,
    row_len: usize,
    /// Two bits per (opcode, character) cell.
    cells: Vec<u8>,
    /// One verdict per opcode for characters outside the tabled range.
    outside: Vec<u8>,
}

impl Pppt {
    /// Build the table for a grammar. Returns `None` when the grammar has
    /// no terminals to predict from, or when the character range would
    /// make the table unreasonably large.
    pub fn build<C: AlphabetChar>(grammar: &Grammar<C>) -> Option<Pppt> {
        let (char_min, char_max) = char_range(grammar)?;
        let row_len = (char_max - char_min + 1) as usize;
        let op_count = grammar.opcode_count();
        if row_len.saturating_mul(op_count) > MAX_TABLE_CELLS {
            log::warn!(
                "PPPT skipped: {} opcodes over a character range of {} would need too large a table",
                op_count,
                row_len
            );
            return None;
        }

        let builder = Builder::converge(grammar, char_min, row_len);
        let mut cells = vec![0u8; (op_count * row_len + 3) / 4];
        let mut outside = vec![CELL_INDETERMINATE; op_count];
        for op in 0..op_count {
            let certain = builder.op_certain(op);
            let nullable = grammar.op_nullable(op);
            let first = builder.op_first(op);
            if certain && !nullable {
                outside[op] = CELL_NOMATCH;
            }
            for i in 0..row_len {
                let verdict = if certain && !nullable && !first.contains(i) {
                    CELL_NOMATCH
                } else {
                    match grammar.opcode(op) {
                        Some(Opcode::Trg { .. }) => CELL_MATCH1,
                        Some(Opcode::Tls { lit }) if lit.1 - lit.0 == 1 => CELL_MATCH1,
                        Some(Opcode::Tbs { lit }) if lit.1 - lit.0 == 1 => CELL_MATCH1,
                        _ => CELL_INDETERMINATE,
                    }
                };
                // reaching the terminal arms above means the character is
                // in the op's first set, so a single-character terminal
                // matches outright
                set_cell(&mut cells, op * row_len + i, verdict);
            }
        }
        Some(Pppt {
            char_min,
            char_max,
            row_len,
            cells,
            outside,
        })
    }

    /// The verdict for descending into `op` with lookahead character `c`.
    pub fn lookup<C: AlphabetChar>(&self, op: usize, c: C) -> PpptVerdict {
        if op >= self.outside.len() {
            return PpptVerdict::Indeterminate;
        }
        let v: u64 = c.into();
        if v < self.char_min || v > self.char_max {
            return decode(self.outside[op]);
        }
        let idx = op * self.row_len + (v - self.char_min) as usize;
        decode(get_cell(&self.cells, idx))
    }
}

fn set_cell(cells: &mut [u8], idx: usize, verdict: u8) {
    cells[idx >> 2] |= verdict << ((idx & 3) * 2);
}

fn get_cell(cells: &[u8], idx: usize) -> u8 {
    (cells[idx >> 2] >> ((idx & 3) * 2)) & 0b11
}

/// The character range the grammar's terminals can begin with. TLS
/// literals contribute both cases of each ASCII letter, since the input
/// side is folded during the compare.
fn char_range<C: AlphabetChar>(grammar: &Grammar<C>) -> Option<(u64, u64)> {
    let mut min = u64::MAX;
    let mut max = 0u64;
    let mut any = false;
    let mut note = |v: u64| {
        min = min.min(v);
        max = max.max(v);
        any = true;
    };
    for op in grammar.opcodes().iter() {
        match *op {
            Opcode::Trg { min: lo, max: hi } => {
                note(lo.into());
                note(hi.into());
            }
            Opcode::Tls { lit } => {
                for &c in grammar.literal(lit) {
                    let v: u64 = c.into();
                    note(v);
                    if (0x61..=0x7A).contains(&v) {
                        note(v - 0x20);
                    }
                }
            }
            Opcode::Tbs { lit } => {
                for &c in grammar.literal(lit) {
                    note(c.into());
                }
            }
            _ => {}
        }
    }
    if any {
        Some((min, max))
    } else {
        None
    }
}

/// Converged per-rule FIRST sets and certainty flags.
struct Builder<'g, C: AlphabetChar> {
    grammar: &'g Grammar<C>,
    char_min: u64,
    row_len: usize,
    rule_first: Vec<FixedBitSet>,
    rule_certain: Vec<bool>,
}

impl<'g, C: AlphabetChar> Builder<'g, C> {
    fn converge(grammar: &'g Grammar<C>, char_min: u64, row_len: usize) -> Self {
        let rule_count = grammar.rule_count();

        // certainty: strip rules whose expansion needs more than
        // first-character analysis, until stable
        let mut rule_certain = vec![true; rule_count];
        loop {
            let mut changed = false;
            for r in 0..rule_count {
                if !rule_certain[r] {
                    continue;
                }
                if !certain_of(grammar, grammar.rules()[r].op, &rule_certain) {
                    rule_certain[r] = false;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        // FIRST sets: grow until stable
        let mut rule_first = vec![FixedBitSet::with_capacity(row_len); rule_count];
        loop {
            let mut changed = false;
            for r in 0..rule_count {
                let first = first_of(grammar, grammar.rules()[r].op, &rule_first, char_min, row_len);
                let before = rule_first[r].count_ones(..);
                rule_first[r].union_with(&first);
                if rule_first[r].count_ones(..) != before {
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        Self {
            grammar,
            char_min,
            row_len,
            rule_first,
            rule_certain,
        }
    }

    fn op_certain(&self, op: usize) -> bool {
        certain_of(self.grammar, op, &self.rule_certain)
    }

    fn op_first(&self, op: usize) -> FixedBitSet {
        first_of(self.grammar, op, &self.rule_first, self.char_min, self.row_len)
    }
}

fn certain_of<C: AlphabetChar>(grammar: &Grammar<C>, op: usize, rule_certain: &[bool]) -> bool {
    match grammar.opcodes()[op] {
        Opcode::Trg { .. } | Opcode::Tls { .. } | Opcode::Tbs { .. } => true,
        Opcode::Alt { children } | Opcode::Cat { children } => grammar
            .children(children)
            .iter()
            .all(|&c| certain_of(grammar, c, rule_certain)),
        Opcode::Rep { child, .. } => certain_of(grammar, child, rule_certain),
        Opcode::Rnm { rule } => rule_certain[rule],
        _ => false,
    }
}

fn first_of<C: AlphabetChar>(
    grammar: &Grammar<C>,
    op: usize,
    rule_first: &[FixedBitSet],
    char_min: u64,
    row_len: usize,
) -> FixedBitSet {
    let mut set = FixedBitSet::with_capacity(row_len);
    let mut note = |set: &mut FixedBitSet, v: u64| {
        let idx = v.wrapping_sub(char_min) as usize;
        if idx < row_len {
            set.insert(idx);
        }
    };
    match grammar.opcodes()[op] {
        Opcode::Trg { min, max } => {
            let (lo, hi): (u64, u64) = (min.into(), max.into());
            for v in lo..=hi {
                note(&mut set, v);
            }
        }
        Opcode::Tls { lit } => {
            if let Some(&c) = grammar.literal(lit).first() {
                let v: u64 = c.into();
                note(&mut set, v);
                if (0x61..=0x7A).contains(&v) {
                    note(&mut set, v - 0x20);
                }
            }
        }
        Opcode::Tbs { lit } => {
            if let Some(&c) = grammar.literal(lit).first() {
                note(&mut set, c.into());
            }
        }
        Opcode::Alt { children } => {
            for &c in grammar.children(children) {
                set.union_with(&first_of(grammar, c, rule_first, char_min, row_len));
            }
        }
        Opcode::Cat { children } => {
            for &c in grammar.children(children) {
                set.union_with(&first_of(grammar, c, rule_first, char_min, row_len));
                if !grammar.op_nullable(c) {
                    break;
                }
            }
        }
        Opcode::Rep { child, .. } => {
            set.union_with(&first_of(grammar, child, rule_first, char_min, row_len));
        }
        Opcode::Rnm { rule } => {
            set.union_with(&rule_first[rule]);
        }
        _ => {}
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::GrammarBuilder;

    #[test]
    fn terminal_rows_are_fully_resolved() {
        // s = %d48-57
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let digit = b.trg(b'0', b'9');
        b.set_rule_root(s, digit);
        let g = b.finish().unwrap();
        let t = Pppt::build(&g).unwrap();
        assert_eq!(t.lookup(digit, b'5'), PpptVerdict::Match1);
        assert_eq!(t.lookup(digit, b'0'), PpptVerdict::Match1);
        assert_eq!(t.lookup(digit, b'a'), PpptVerdict::NoMatch);
    }

    #[test]
    fn tls_rows_cover_both_cases() {
        // s = "ab"
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let lit = b.tls(b"ab");
        b.set_rule_root(s, lit);
        let g = b.finish().unwrap();
        let t = Pppt::build(&g).unwrap();
        assert_eq!(t.lookup(lit, b'a'), PpptVerdict::Indeterminate);
        assert_eq!(t.lookup(lit, b'A'), PpptVerdict::Indeterminate);
        assert_eq!(t.lookup(lit, b'x'), PpptVerdict::NoMatch);
    }

    #[test]
    fn nullable_nodes_never_claim_nomatch() {
        // s = *"a"
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let a = b.tls(b"a");
        let rep = b.rep(0, crate::grammar::REP_INFINITE, a);
        b.set_rule_root(s, rep);
        let g = b.finish().unwrap();
        let t = Pppt::build(&g).unwrap();
        assert_eq!(t.lookup(rep, b'z'), PpptVerdict::Indeterminate);
        assert_eq!(t.lookup(a, b'z'), PpptVerdict::NoMatch);
    }
}
