//! The compiled grammar: a flat opcode array plus rule and UDT descriptors.
//!
//! A grammar is produced either by the SABNF pattern compiler in
//! [`syntax`](crate::syntax) or directly through [`GrammarBuilder`] when the
//! opcode array is built externally. Either way the shape is the same: one
//! `Vec` of tagged opcodes forming a tree through stored child indices, a
//! shared pool of child-index lists, and a shared pool of literal
//! characters. The flat layout keeps iteration cache friendly and leaves no
//! owned-child graphs to manage.
use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashMap;

use crate::backref::BkrMap;
use crate::phrase::AlphabetChar;
use crate::utils;

/// The distinguished `max` value of a repetition with no upper bound.
pub const REP_INFINITE: usize = usize::MAX;

/// A reference to a named non-terminal: either a rule or a UDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// A rule, by rule index.
    Rule(usize),
    /// A user-defined terminal, by UDT index.
    Udt(usize),
}

/// Back-reference capture visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BkrMode {
    /// The most recent match of the target anywhere in the parse so far.
    Universal,
    /// The most recent match of the target within the currently open
    /// instance of an enclosing rule that refers to the target.
    Parent,
}

/// Back-reference character comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BkrCase {
    /// Exact character compare.
    Sensitive,
    /// ASCII letters compare case-folded.
    Insensitive,
}

/// The tag of an opcode variant, used by the trace and display helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[allow(missing_docs)]
pub enum OpcodeKind {
    #[strum(serialize = "ALT")]
    Alt,
    #[strum(serialize = "CAT")]
    Cat,
    #[strum(serialize = "REP")]
    Rep,
    #[strum(serialize = "RNM")]
    Rnm,
    #[strum(serialize = "TRG")]
    Trg,
    #[strum(serialize = "TLS")]
    Tls,
    #[strum(serialize = "TBS")]
    Tbs,
    #[strum(serialize = "UDT")]
    Udt,
    #[strum(serialize = "AND")]
    And,
    #[strum(serialize = "NOT")]
    Not,
    #[strum(serialize = "BKA")]
    Bka,
    #[strum(serialize = "BKN")]
    Bkn,
    #[strum(serialize = "BKR")]
    Bkr,
    #[strum(serialize = "ABG")]
    Abg,
    #[strum(serialize = "AEN")]
    Aen,
}

/// One node of the compiled grammar.
///
/// Composites store `(begin, end)` ranges into the grammar's child-index
/// pool; literals store `(begin, end)` ranges into the literal character
/// pool. TLS literals are stored pre-folded to lower case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode<C: AlphabetChar> {
    /// Ordered choice; the first matching child wins.
    Alt {
        /// Range of child opcode indices in the child-index pool.
        children: (usize, usize),
    },
    /// Concatenation of all children, in list order.
    Cat {
        /// Range of child opcode indices in the child-index pool.
        children: (usize, usize),
    },
    /// Greedy repetition of the child between `min` and `max` times.
    Rep {
        /// Minimum number of child matches.
        min: usize,
        /// Maximum number of child matches; [`REP_INFINITE`] for no bound.
        max: usize,
        /// The child opcode index.
        child: usize,
    },
    /// Invoke a named rule.
    Rnm {
        /// The rule index.
        rule: usize,
    },
    /// Single-character match if `min <= c <= max`.
    Trg {
        /// Inclusive lower bound.
        min: C,
        /// Inclusive upper bound.
        max: C,
    },
    /// Case-insensitive literal, pre-folded to lower case.
    Tls {
        /// Range into the literal character pool.
        lit: (usize, usize),
    },
    /// Case-sensitive literal.
    Tbs {
        /// Range into the literal character pool.
        lit: (usize, usize),
    },
    /// Invoke a user-defined terminal.
    Udt {
        /// The UDT index.
        udt: usize,
    },
    /// Positive lookahead over the child; always zero length.
    And {
        /// The child opcode index.
        child: usize,
    },
    /// Negative lookahead over the child; always zero length.
    Not {
        /// The child opcode index.
        child: usize,
    },
    /// Positive lookbehind over the child; always zero length.
    Bka {
        /// The child opcode index.
        child: usize,
    },
    /// Negative lookbehind over the child; always zero length.
    Bkn {
        /// The child opcode index.
        child: usize,
    },
    /// Match the phrase most recently captured by the target.
    Bkr {
        /// The back-referenced rule or UDT.
        target: Target,
        /// Capture visibility.
        mode: BkrMode,
        /// Character comparison.
        case: BkrCase,
    },
    /// Anchor: matches empty exactly at input offset zero.
    Abg,
    /// Anchor: matches empty exactly at the input end.
    Aen,
}

impl<C: AlphabetChar> Opcode<C> {
    /// The variant tag of this opcode.
    pub fn kind(&self) -> OpcodeKind {
        match self {
            Opcode::Alt { .. } => OpcodeKind::Alt,
            Opcode::Cat { .. } => OpcodeKind::Cat,
            Opcode::Rep { .. } => OpcodeKind::Rep,
            Opcode::Rnm { .. } => OpcodeKind::Rnm,
            Opcode::Trg { .. } => OpcodeKind::Trg,
            Opcode::Tls { .. } => OpcodeKind::Tls,
            Opcode::Tbs { .. } => OpcodeKind::Tbs,
            Opcode::Udt { .. } => OpcodeKind::Udt,
            Opcode::And { .. } => OpcodeKind::And,
            Opcode::Not { .. } => OpcodeKind::Not,
            Opcode::Bka { .. } => OpcodeKind::Bka,
            Opcode::Bkn { .. } => OpcodeKind::Bkn,
            Opcode::Bkr { .. } => OpcodeKind::Bkr,
            Opcode::Abg => OpcodeKind::Abg,
            Opcode::Aen => OpcodeKind::Aen,
        }
    }
}

/// A named rule of the grammar.
#[derive(Debug, Clone)]
pub struct Rule {
    /// The rule name as written in the pattern.
    pub name: String,
    /// The root opcode index of the rule's tree.
    pub op: usize,
    /// True if the rule can match the empty phrase.
    pub nullable: bool,
}

/// A user-defined terminal of the grammar.
#[derive(Debug, Clone)]
pub struct Udt {
    /// The UDT name as written in the pattern.
    pub name: String,
    /// True if the UDT callback is permitted to return an empty match.
    pub nullable: bool,
}

/// The error type for errors in [`Grammar`] construction.
#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("the grammar defines no rules")]
    /// A grammar must carry at least one rule.
    EmptyGrammar,
    #[error("rule \"{0}\" has no opcode tree")]
    /// A declared rule was never given a root opcode.
    UndefinedRuleRoot(String),
    #[error("opcode index {0} is out of range")]
    /// A child or root index points outside the opcode array.
    OpcodeOutOfRange(usize),
    #[error("opcode {0} has an empty child list")]
    /// ALT and CAT require at least one child.
    EmptyChildList(usize),
    #[error("opcode {0} has a child list outside the child-index pool")]
    /// A composite's child range is not a valid pool slice.
    ChildListOutOfRange(usize),
    #[error("opcode {0} has a literal outside the literal pool")]
    /// A terminal's literal range is not a valid pool slice.
    LiteralOutOfRange(usize),
    #[error("opcode {0} repeats with minimum {1} greater than maximum {2}")]
    /// REP requires `min <= max`.
    InvalidRepetition(usize, usize, usize),
    #[error("opcode {0} references rule index {1} which does not exist")]
    /// RNM or BKR names a rule index beyond the rule table.
    RuleIndexOutOfRange(usize, usize),
    #[error("opcode {0} references UDT index {1} which does not exist")]
    /// UDT or BKR names a UDT index beyond the UDT table.
    UdtIndexOutOfRange(usize, usize),
    #[error("the opcode tree of rule \"{0}\" is cyclic")]
    /// Opcode child indices must form a tree below each rule.
    CyclicOpcodes(String),
}

/// The compiled grammar consumed by the parser.
///
/// Grammars are immutable once built; wrap one in an [`Arc`] to share it
/// read-only between engine instances.
#[derive(Clone)]
pub struct Grammar<C: AlphabetChar> {
    opcodes: Vec<Opcode<C>>,
    child_lists: Vec<usize>,
    literals: Vec<C>,
    rules: Vec<Rule>,
    udts: Vec<Udt>,
    names: AHashMap<String, Target>,
    bkru_map: Option<BkrMap>,
    bkrp_map: Option<BkrMap>,
}

impl<C: AlphabetChar> Grammar<C> {
    #[inline]
    /// Get the opcode at `index`, if any.
    pub fn opcode(&self, index: usize) -> Option<Opcode<C>> {
        self.opcodes.get(index).copied()
    }

    #[inline]
    /// The child opcode indices of a composite, given its stored range.
    pub fn children(&self, range: (usize, usize)) -> &[usize] {
        &self.child_lists[range.0..range.1]
    }

    #[inline]
    /// The characters of a literal, given its stored range.
    pub fn literal(&self, range: (usize, usize)) -> &[C] {
        &self.literals[range.0..range.1]
    }

    #[inline]
    /// The rule table.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    #[inline]
    /// The UDT table.
    pub fn udts(&self) -> &[Udt] {
        &self.udts
    }

    #[inline]
    /// Number of rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    #[inline]
    /// Number of UDTs.
    pub fn udt_count(&self) -> usize {
        self.udts.len()
    }

    #[inline]
    /// Total number of opcodes.
    pub fn opcode_count(&self) -> usize {
        self.opcodes.len()
    }

    /// Case-insensitive lookup of a rule or UDT by name.
    pub fn lookup(&self, name: &str) -> Option<Target> {
        self.names.get(&name.to_ascii_lowercase()).copied()
    }

    /// The display name of a target.
    pub fn target_name(&self, target: Target) -> &str {
        match target {
            Target::Rule(i) => &self.rules[i].name,
            Target::Udt(i) => &self.udts[i].name,
        }
    }

    #[inline]
    pub(crate) fn opcodes(&self) -> &[Opcode<C>] {
        &self.opcodes
    }

    #[inline]
    pub(crate) fn bkr_map(&self, mode: BkrMode) -> Option<&BkrMap> {
        match mode {
            BkrMode::Universal => self.bkru_map.as_ref(),
            BkrMode::Parent => self.bkrp_map.as_ref(),
        }
    }

    pub(crate) fn op_nullable(&self, op: usize) -> bool {
        op_nullable_of(
            &self.opcodes,
            &self.child_lists,
            op,
            &|r| self.rules[r].nullable,
            &|u| self.udts[u].nullable,
        )
    }

    /// An SABNF-flavored rendition of one opcode subtree.
    pub fn display_op(&self, op: usize) -> String {
        fn wrap(s: String, inner: OpcodeKind) -> String {
            match inner {
                OpcodeKind::Alt | OpcodeKind::Cat => format!("({s})"),
                _ => s,
            }
        }
        match self.opcodes[op] {
            Opcode::Alt { children } => self
                .children(children)
                .iter()
                .map(|&c| self.display_op(c))
                .collect::<Vec<_>>()
                .join(" / "),
            Opcode::Cat { children } => self
                .children(children)
                .iter()
                .map(|&c| {
                    let kind = self.opcodes[c].kind();
                    wrap(self.display_op(c), kind)
                })
                .collect::<Vec<_>>()
                .join(" "),
            Opcode::Rep { min, max, child } => {
                let kind = self.opcodes[child].kind();
                let body = wrap(self.display_op(child), kind);
                if max == REP_INFINITE {
                    if min == 0 {
                        format!("*{body}")
                    } else {
                        format!("{min}*{body}")
                    }
                } else if min == max {
                    format!("{min}{body}")
                } else {
                    format!("{min}*{max}{body}")
                }
            }
            Opcode::Rnm { rule } => self.rules[rule].name.clone(),
            Opcode::Trg { min, max } => {
                format!("%d{}-{}", min.into(), max.into())
            }
            Opcode::Tls { lit } => {
                format!("\"{}\"", utils::display_literal(self.literal(lit)))
            }
            Opcode::Tbs { lit } => {
                let body = self
                    .literal(lit)
                    .iter()
                    .map(|&c| c.into().to_string())
                    .collect::<Vec<_>>()
                    .join(".");
                format!("%d{body}")
            }
            Opcode::Udt { udt } => self.udts[udt].name.clone(),
            Opcode::And { child } => format!("&{}", self.display_op(child)),
            Opcode::Not { child } => format!("!{}", self.display_op(child)),
            Opcode::Bka { child } => format!("&&{}", self.display_op(child)),
            Opcode::Bkn { child } => format!("!!{}", self.display_op(child)),
            Opcode::Bkr { target, mode, case } => {
                let case = match case {
                    BkrCase::Insensitive => "%i",
                    BkrCase::Sensitive => "%s",
                };
                let mode = match mode {
                    BkrMode::Universal => "%u",
                    BkrMode::Parent => "%p",
                };
                format!("\\{case}{mode}{}", self.target_name(target))
            }
            Opcode::Abg => "%^".to_string(),
            Opcode::Aen => "%$".to_string(),
        }
    }
}

impl<C: AlphabetChar> Debug for Grammar<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut rules = String::new();
        for rule in self.rules.iter() {
            rules.push_str(&format!("{} = {}\n", rule.name, self.display_op(rule.op)));
        }
        f.debug_struct("Grammar")
            .field("rules", &rules.into_boxed_str())
            .field(
                "udts",
                &self.udts.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
            )
            .field("opcode_count", &self.opcodes.len())
            .finish()
    }
}

fn op_nullable_of<C: AlphabetChar>(
    opcodes: &[Opcode<C>],
    child_lists: &[usize],
    op: usize,
    rule_nullable: &dyn Fn(usize) -> bool,
    udt_nullable: &dyn Fn(usize) -> bool,
) -> bool {
    match opcodes[op] {
        Opcode::Alt { children } => child_lists[children.0..children.1]
            .iter()
            .any(|&c| op_nullable_of(opcodes, child_lists, c, rule_nullable, udt_nullable)),
        Opcode::Cat { children } => child_lists[children.0..children.1]
            .iter()
            .all(|&c| op_nullable_of(opcodes, child_lists, c, rule_nullable, udt_nullable)),
        Opcode::Rep { min, child, .. } => {
            min == 0 || op_nullable_of(opcodes, child_lists, child, rule_nullable, udt_nullable)
        }
        Opcode::Rnm { rule } => rule_nullable(rule),
        Opcode::Trg { .. } => false,
        Opcode::Tls { lit } | Opcode::Tbs { lit } => lit.0 == lit.1,
        Opcode::Udt { udt } => udt_nullable(udt),
        Opcode::And { .. }
        | Opcode::Not { .. }
        | Opcode::Bka { .. }
        | Opcode::Bkn { .. }
        | Opcode::Abg
        | Opcode::Aen => true,
        // the referenced capture may be the empty phrase
        Opcode::Bkr { .. } => true,
    }
}

/// Incrementally builds a [`Grammar`].
///
/// Opcodes are added bottom-up: children first, so their indices can be
/// handed to the composite that owns them. Rules may be declared before
/// their root opcode exists; [`GrammarBuilder::finish`] checks that every
/// declared rule received a root, validates the opcode ABI, and computes
/// the per-rule nullability attribute by fixed-point iteration.
pub struct GrammarBuilder<C: AlphabetChar> {
    opcodes: Vec<Opcode<C>>,
    child_lists: Vec<usize>,
    literals: Vec<C>,
    rules: Vec<(String, Option<usize>)>,
    udts: Vec<(String, bool)>,
}

impl<C: AlphabetChar> Default for GrammarBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: AlphabetChar> GrammarBuilder<C> {
    /// An empty builder.
    pub fn new() -> Self {
        Self {
            opcodes: Vec::new(),
            child_lists: Vec::new(),
            literals: Vec::new(),
            rules: Vec::new(),
            udts: Vec::new(),
        }
    }

    fn push(&mut self, op: Opcode<C>) -> usize {
        self.opcodes.push(op);
        self.opcodes.len() - 1
    }

    fn push_children(&mut self, children: &[usize]) -> (usize, usize) {
        let beg = self.child_lists.len();
        self.child_lists.extend_from_slice(children);
        (beg, self.child_lists.len())
    }

    /// Declare a rule and return its index. The root opcode is set later
    /// with [`GrammarBuilder::set_rule_root`].
    pub fn add_rule(&mut self, name: &str) -> usize {
        self.rules.push((name.to_string(), None));
        self.rules.len() - 1
    }

    /// Attach the root opcode of a declared rule.
    ///
    /// # Panics
    ///
    /// Panics if the rule index has not been declared.
    pub fn set_rule_root(&mut self, rule: usize, op: usize) {
        self.rules[rule].1 = Some(op);
    }

    /// Declare a UDT and return its index.
    pub fn add_udt(&mut self, name: &str, nullable: bool) -> usize {
        self.udts.push((name.to_string(), nullable));
        self.udts.len() - 1
    }

    /// Ordered choice over the given child opcodes.
    pub fn alt(&mut self, children: &[usize]) -> usize {
        let children = self.push_children(children);
        self.push(Opcode::Alt { children })
    }

    /// Concatenation of the given child opcodes.
    pub fn cat(&mut self, children: &[usize]) -> usize {
        let children = self.push_children(children);
        self.push(Opcode::Cat { children })
    }

    /// Repetition of `child` between `min` and `max` times.
    pub fn rep(&mut self, min: usize, max: usize, child: usize) -> usize {
        self.push(Opcode::Rep { min, max, child })
    }

    /// Reference to a rule.
    pub fn rnm(&mut self, rule: usize) -> usize {
        self.push(Opcode::Rnm { rule })
    }

    /// Terminal range `min <= c <= max`.
    pub fn trg(&mut self, min: C, max: C) -> usize {
        self.push(Opcode::Trg { min, max })
    }

    /// Case-insensitive literal; ASCII letters are folded to lower case
    /// here so the parser can compare folded input directly.
    pub fn tls(&mut self, chars: &[C]) -> usize {
        let beg = self.literals.len();
        self.literals
            .extend(chars.iter().map(|&c| crate::phrase::ascii_fold(c)));
        let lit = (beg, self.literals.len());
        self.push(Opcode::Tls { lit })
    }

    /// Case-sensitive literal.
    pub fn tbs(&mut self, chars: &[C]) -> usize {
        let beg = self.literals.len();
        self.literals.extend_from_slice(chars);
        let lit = (beg, self.literals.len());
        self.push(Opcode::Tbs { lit })
    }

    /// Reference to a UDT.
    pub fn udt_op(&mut self, udt: usize) -> usize {
        self.push(Opcode::Udt { udt })
    }

    /// Positive lookahead over `child`.
    pub fn and(&mut self, child: usize) -> usize {
        self.push(Opcode::And { child })
    }

    /// Negative lookahead over `child`.
    pub fn not(&mut self, child: usize) -> usize {
        self.push(Opcode::Not { child })
    }

    /// Positive lookbehind over `child`.
    pub fn bka(&mut self, child: usize) -> usize {
        self.push(Opcode::Bka { child })
    }

    /// Negative lookbehind over `child`.
    pub fn bkn(&mut self, child: usize) -> usize {
        self.push(Opcode::Bkn { child })
    }

    /// Back reference to `target` with the given mode and case handling.
    pub fn bkr(&mut self, target: Target, mode: BkrMode, case: BkrCase) -> usize {
        self.push(Opcode::Bkr { target, mode, case })
    }

    /// The input-begin anchor.
    pub fn abg(&mut self) -> usize {
        self.push(Opcode::Abg)
    }

    /// The input-end anchor.
    pub fn aen(&mut self) -> usize {
        self.push(Opcode::Aen)
    }

    /// Validate the opcode ABI, compute nullability, and build the grammar.
    ///
    /// # Errors
    ///
    /// Returns a [`GrammarError`] describing the first ABI violation found.
    pub fn finish(self) -> Result<Grammar<C>, GrammarError> {
        if self.rules.is_empty() {
            return Err(GrammarError::EmptyGrammar);
        }
        let op_count = self.opcodes.len();
        for (name, root) in self.rules.iter() {
            let root = root.ok_or_else(|| GrammarError::UndefinedRuleRoot(name.clone()))?;
            if root >= op_count {
                return Err(GrammarError::OpcodeOutOfRange(root));
            }
        }
        for (i, op) in self.opcodes.iter().enumerate() {
            match *op {
                Opcode::Alt { children } | Opcode::Cat { children } => {
                    if children.0 > children.1 || children.1 > self.child_lists.len() {
                        return Err(GrammarError::ChildListOutOfRange(i));
                    }
                    if children.0 == children.1 {
                        return Err(GrammarError::EmptyChildList(i));
                    }
                    for &c in &self.child_lists[children.0..children.1] {
                        if c >= op_count {
                            return Err(GrammarError::OpcodeOutOfRange(c));
                        }
                    }
                }
                Opcode::Rep { min, max, child } => {
                    if min > max {
                        return Err(GrammarError::InvalidRepetition(i, min, max));
                    }
                    if child >= op_count {
                        return Err(GrammarError::OpcodeOutOfRange(child));
                    }
                }
                Opcode::And { child }
                | Opcode::Not { child }
                | Opcode::Bka { child }
                | Opcode::Bkn { child } => {
                    if child >= op_count {
                        return Err(GrammarError::OpcodeOutOfRange(child));
                    }
                }
                Opcode::Rnm { rule } => {
                    if rule >= self.rules.len() {
                        return Err(GrammarError::RuleIndexOutOfRange(i, rule));
                    }
                }
                Opcode::Udt { udt } => {
                    if udt >= self.udts.len() {
                        return Err(GrammarError::UdtIndexOutOfRange(i, udt));
                    }
                }
                Opcode::Bkr { target, .. } => match target {
                    Target::Rule(r) if r >= self.rules.len() => {
                        return Err(GrammarError::RuleIndexOutOfRange(i, r));
                    }
                    Target::Udt(u) if u >= self.udts.len() => {
                        return Err(GrammarError::UdtIndexOutOfRange(i, u));
                    }
                    _ => {}
                },
                Opcode::Tls { lit } | Opcode::Tbs { lit } => {
                    if lit.0 > lit.1 || lit.1 > self.literals.len() {
                        return Err(GrammarError::LiteralOutOfRange(i));
                    }
                }
                Opcode::Trg { .. } | Opcode::Abg | Opcode::Aen => {}
            }
        }
        self.check_acyclic()?;

        // fixed point over the rule nullability attribute
        let udt_nullable: Vec<bool> = self.udts.iter().map(|(_, n)| *n).collect();
        let roots: Vec<usize> = self.rules.iter().map(|(_, r)| r.unwrap_or(0)).collect();
        let mut rule_nullable = vec![false; self.rules.len()];
        loop {
            let mut changed = false;
            for i in 0..self.rules.len() {
                if rule_nullable[i] {
                    continue;
                }
                let rn = rule_nullable.clone();
                if op_nullable_of(
                    &self.opcodes,
                    &self.child_lists,
                    roots[i],
                    &|r| rn[r],
                    &|u| udt_nullable[u],
                ) {
                    rule_nullable[i] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let rules: Vec<Rule> = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, (name, _))| Rule {
                name: name.clone(),
                op: roots[i],
                nullable: rule_nullable[i],
            })
            .collect();
        let udts: Vec<Udt> = self
            .udts
            .iter()
            .map(|(name, nullable)| Udt {
                name: name.clone(),
                nullable: *nullable,
            })
            .collect();
        let mut names = AHashMap::default();
        for (i, rule) in rules.iter().enumerate() {
            names.insert(rule.name.to_ascii_lowercase(), Target::Rule(i));
        }
        for (i, udt) in udts.iter().enumerate() {
            names.insert(udt.name.to_ascii_lowercase(), Target::Udt(i));
        }
        let bkru_map = BkrMap::build(
            &self.opcodes,
            &self.child_lists,
            rules.len(),
            udts.len(),
            &roots,
            BkrMode::Universal,
        );
        let bkrp_map = BkrMap::build(
            &self.opcodes,
            &self.child_lists,
            rules.len(),
            udts.len(),
            &roots,
            BkrMode::Parent,
        );
        Ok(Grammar {
            opcodes: self.opcodes,
            child_lists: self.child_lists,
            literals: self.literals,
            rules,
            udts,
            names,
            bkru_map,
            bkrp_map,
        })
    }

    fn check_acyclic(&self) -> Result<(), GrammarError> {
        // 0 = unvisited, 1 = on the current path, 2 = done
        let mut state = vec![0u8; self.opcodes.len()];
        for (name, root) in self.rules.iter() {
            let root = root.unwrap_or(0);
            if !self.acyclic_walk(root, &mut state) {
                return Err(GrammarError::CyclicOpcodes(name.clone()));
            }
        }
        Ok(())
    }

    fn acyclic_walk(&self, op: usize, state: &mut [u8]) -> bool {
        if state[op] == 2 {
            return true;
        }
        if state[op] == 1 {
            return false;
        }
        state[op] = 1;
        let ok = match self.opcodes[op] {
            Opcode::Alt { children } | Opcode::Cat { children } => self.child_lists
                [children.0..children.1]
                .iter()
                .all(|&c| self.acyclic_walk(c, state)),
            Opcode::Rep { child, .. }
            | Opcode::And { child }
            | Opcode::Not { child }
            | Opcode::Bka { child }
            | Opcode::Bkn { child } => self.acyclic_walk(child, state),
            _ => true,
        };
        state[op] = 2;
        ok
    }
}

/// Convenience for sharing a freshly built grammar between engines.
pub fn into_shared<C: AlphabetChar>(grammar: Grammar<C>) -> Arc<Grammar<C>> {
    Arc::new(grammar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_missing_root() {
        let mut b = GrammarBuilder::<u8>::new();
        b.add_rule("s");
        assert!(matches!(b.finish(), Err(GrammarError::UndefinedRuleRoot(_))));
    }

    #[test]
    fn nullability_fixed_point() {
        // s = *"a" t ; t = "" / "b"
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let t = b.add_rule("t");
        let a = b.tls(b"a");
        let rep = b.rep(0, REP_INFINITE, a);
        let t_ref = b.rnm(t);
        let cat = b.cat(&[rep, t_ref]);
        b.set_rule_root(s, cat);
        let empty = b.tls(b"");
        let bee = b.tls(b"b");
        let alt = b.alt(&[empty, bee]);
        b.set_rule_root(t, alt);
        let g = b.finish().unwrap();
        assert!(g.rules()[0].nullable);
        assert!(g.rules()[1].nullable);
    }

    #[test]
    fn tls_is_folded() {
        let mut b = GrammarBuilder::<u8>::new();
        let s = b.add_rule("s");
        let lit = b.tls(b"AbC");
        b.set_rule_root(s, lit);
        let g = b.finish().unwrap();
        match g.opcode(lit).unwrap() {
            Opcode::Tls { lit } => assert_eq!(g.literal(lit), b"abc"),
            _ => panic!("expected TLS"),
        }
    }
}
