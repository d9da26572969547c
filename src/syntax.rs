//! The SABNF pattern compiler: pattern text in, compiled [`Grammar`] out.
//!
//! The accepted dialect is ABNF (RFC 5234 shape) plus the superset
//! operators the engine interprets:
//!
//! | Form | Meaning |
//! |---|---|
//! | `name = body`, `name =/ body` | rule definition, incremental alternative |
//! | `a / b` | alternation |
//! | `a b` | concatenation |
//! | `n*m e`, `*e`, `n e` | repetition |
//! | `(a b)`, `[a b]` | group, option |
//! | `"abc"`, `%i"abc"` | case-insensitive literal |
//! | `%s"abc"` | case-sensitive literal |
//! | `%d48-57`, `%x30-39`, `%b0-1` | terminal range |
//! | `%d97.98.99` | case-sensitive terminal string |
//! | `&e`, `!e` | positive/negative lookahead |
//! | `&&e`, `!!e` | positive/negative lookbehind |
//! | `%^`, `%$` | input begin/end anchors |
//! | `\name`, `\%s%pname` | back reference (`%i %u` are the defaults) |
//! | `u_name`, `e_name` | UDT reference (`e_` may match empty) |
//! | `; comment` | comment to end of line |
//!
//! Rule names are case-insensitive; a line starting with white space
//! continues the previous rule. Rules may be defined in any order.
use ahash::AHashMap;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char as ch, digit1, hex_digit1, one_of, space0, space1},
    combinator::{all_consuming, map, map_res, opt, recognize, value},
    error::{convert_error, VerboseError},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    Finish, IResult,
};

use crate::grammar::{
    BkrCase, BkrMode, Grammar, GrammarBuilder, GrammarError, Target, REP_INFINITE,
};
use crate::phrase::AlphabetChar;

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// The error type for errors in SABNF pattern compilation.
#[derive(Debug, thiserror::Error)]
pub enum PatternSyntaxError {
    #[error("SABNF syntax error in \"{text}\": {message}")]
    /// A rule definition did not parse.
    Rule {
        /// The offending logical rule line.
        text: String,
        /// What the parser expected.
        message: String,
    },
    #[error("SABNF syntax error: {0}")]
    /// The pattern's line structure is broken.
    Malformed(String),
    #[error("the pattern defines no rules")]
    /// An empty pattern cannot match anything.
    EmptyPattern,
    #[error("rule \"{0}\" is defined more than once; use \"=/\" for incremental alternatives")]
    /// Plain redefinition of a rule.
    DuplicateRule(String),
    #[error("incremental alternative \"=/\" for rule \"{0}\" which has no prior definition")]
    /// `=/` requires an existing rule.
    IncrementalUndefined(String),
    #[error("\"{0}\" is not a defined rule or a UDT name")]
    /// Referenced names must be defined rules or carry a UDT prefix.
    UndefinedRule(String),
    #[error("character {0:#x} does not fit the alphabet width")]
    /// Terminal characters are bounded by the alphabet character type.
    CharOutOfRange(u64),
    #[error("terminal range minimum {0:#x} exceeds maximum {1:#x}")]
    /// `%dLO-HI` requires `LO <= HI`.
    EmptyRange(u64, u64),
    #[error("repetition minimum {0} exceeds maximum {1}")]
    /// `n*m` requires `n <= m`.
    InvalidRepeat(usize, usize),
    #[error("{0}")]
    /// The lowered opcode array failed ABI validation.
    Grammar(#[from] GrammarError),
}

#[derive(Debug, Clone)]
enum Node {
    Alt(Vec<Node>),
    Cat(Vec<Node>),
    Rep {
        min: usize,
        max: usize,
        node: Box<Node>,
    },
    Ref(String),
    Tls(Vec<u64>),
    Tbs(Vec<u64>),
    Trg(u64, u64),
    And(Box<Node>),
    Not(Box<Node>),
    Bka(Box<Node>),
    Bkn(Box<Node>),
    Bkr {
        name: String,
        mode: BkrMode,
        case: BkrCase,
    },
    Abg,
    Aen,
}

/// Compile an SABNF pattern into a grammar over alphabet `C`.
///
/// # Errors
///
/// Returns a [`PatternSyntaxError`] for malformed pattern text, undefined
/// or duplicate names, characters beyond the alphabet width, or an opcode
/// tree that fails ABI validation.
pub fn compile<C: AlphabetChar>(pattern: &str) -> Result<Grammar<C>, PatternSyntaxError> {
    let chunks = logical_rules(pattern)?;
    let mut parsed = Vec::with_capacity(chunks.len());
    for chunk in chunks.iter() {
        match rule_def(chunk.as_str()).finish() {
            Ok((_, def)) => parsed.push(def),
            Err(e) => {
                return Err(PatternSyntaxError::Rule {
                    text: chunk.clone(),
                    message: convert_error(chunk.as_str(), e),
                })
            }
        }
    }

    let mut display_names: Vec<String> = Vec::new();
    let mut rule_index: AHashMap<String, usize> = AHashMap::default();
    let mut bodies: Vec<Vec<Node>> = Vec::new();
    for (name, incremental, body) in parsed {
        let key = name.to_ascii_lowercase();
        match rule_index.get(&key) {
            Some(&i) => {
                if incremental {
                    bodies[i].push(body);
                } else {
                    return Err(PatternSyntaxError::DuplicateRule(name));
                }
            }
            None => {
                if incremental {
                    return Err(PatternSyntaxError::IncrementalUndefined(name));
                }
                rule_index.insert(key, display_names.len());
                display_names.push(name);
                bodies.push(vec![body]);
            }
        }
    }

    let mut builder = GrammarBuilder::<C>::new();
    let rule_ids: Vec<usize> = display_names.iter().map(|n| builder.add_rule(n)).collect();
    let mut lowerer = Lowerer {
        builder,
        rule_index: &rule_index,
        udt_index: AHashMap::default(),
    };
    for (i, mut alternatives) in bodies.into_iter().enumerate() {
        let node = match alternatives.len() {
            1 => alternatives.swap_remove(0),
            _ => Node::Alt(alternatives),
        };
        let op = lowerer.lower(&node)?;
        lowerer.builder.set_rule_root(rule_ids[i], op);
    }
    Ok(lowerer.builder.finish()?)
}

/// Split the pattern into logical rule lines: comments stripped (a `;`
/// outside quotes), blank lines dropped, continuation lines (leading white
/// space) joined onto the rule they continue.
fn logical_rules(pattern: &str) -> Result<Vec<String>, PatternSyntaxError> {
    let mut chunks: Vec<String> = Vec::new();
    for raw in pattern.lines() {
        let line = strip_comment(raw);
        if line.trim().is_empty() {
            continue;
        }
        let continues = line.starts_with(|c: char| c.is_whitespace());
        if continues {
            match chunks.last_mut() {
                Some(chunk) => {
                    chunk.push(' ');
                    chunk.push_str(line.trim());
                }
                None => {
                    return Err(PatternSyntaxError::Malformed(format!(
                        "continuation line \"{}\" precedes any rule definition",
                        line.trim()
                    )))
                }
            }
        } else {
            chunks.push(line.trim_end().to_string());
        }
    }
    if chunks.is_empty() {
        return Err(PatternSyntaxError::EmptyPattern);
    }
    Ok(chunks)
}

fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            ';' if !in_quote => return &line[..i],
            _ => {}
        }
    }
    line
}

fn rule_name(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
    ))(input)
}

fn number(input: &str) -> PResult<'_, usize> {
    map_res(digit1, |s: &str| s.parse::<usize>())(input)
}

fn dec_u64(input: &str) -> PResult<'_, u64> {
    map_res(digit1, |s: &str| u64::from_str_radix(s, 10))(input)
}

fn hex_u64(input: &str) -> PResult<'_, u64> {
    map_res(hex_digit1, |s: &str| u64::from_str_radix(s, 16))(input)
}

fn bin_u64(input: &str) -> PResult<'_, u64> {
    map_res(take_while1(|c| c == '0' || c == '1'), |s: &str| {
        u64::from_str_radix(s, 2)
    })(input)
}

fn repeat(input: &str) -> PResult<'_, (usize, usize)> {
    alt((
        map(
            tuple((opt(number), ch('*'), opt(number))),
            |(min, _, max)| (min.unwrap_or(0), max.unwrap_or(REP_INFINITE)),
        ),
        map(number, |n| (n, n)),
    ))(input)
}

fn quoted(input: &str) -> PResult<'_, Vec<u64>> {
    map(
        delimited(ch('"'), take_while(|c| c != '"'), ch('"')),
        |s: &str| s.chars().map(|c| c as u64).collect(),
    )(input)
}

fn term_with<'a>(
    num: fn(&'a str) -> PResult<'a, u64>,
    input: &'a str,
) -> PResult<'a, Node> {
    let (input, first) = num(input)?;
    if let Ok((rest, _)) = ch::<_, VerboseError<&str>>('-')(input) {
        let (rest, second) = num(rest)?;
        return Ok((rest, Node::Trg(first, second)));
    }
    let (input, more) = many0(preceded(ch('.'), num))(input)?;
    let mut chars = vec![first];
    chars.extend(more);
    Ok((input, Node::Tbs(chars)))
}

fn dec_term(input: &str) -> PResult<'_, Node> {
    let (input, _) = one_of("dD")(input)?;
    term_with(dec_u64, input)
}

fn hex_term(input: &str) -> PResult<'_, Node> {
    let (input, _) = one_of("xX")(input)?;
    term_with(hex_u64, input)
}

fn bin_term(input: &str) -> PResult<'_, Node> {
    let (input, _) = one_of("bB")(input)?;
    term_with(bin_u64, input)
}

fn terminal(input: &str) -> PResult<'_, Node> {
    preceded(ch('%'), alt((dec_term, hex_term, bin_term)))(input)
}

fn bkr_modifier(input: &str) -> PResult<'_, &str> {
    alt((tag("%i"), tag("%s"), tag("%u"), tag("%p")))(input)
}

fn bkr(input: &str) -> PResult<'_, Node> {
    let (mut input, _) = ch('\\')(input)?;
    let mut mode = BkrMode::Universal;
    let mut case = BkrCase::Insensitive;
    while let Ok((rest, modifier)) = bkr_modifier(input) {
        match modifier {
            "%i" => case = BkrCase::Insensitive,
            "%s" => case = BkrCase::Sensitive,
            "%u" => mode = BkrMode::Universal,
            _ => mode = BkrMode::Parent,
        }
        input = rest;
    }
    let (input, name) = rule_name(input)?;
    Ok((
        input,
        Node::Bkr {
            name: name.to_string(),
            mode,
            case,
        },
    ))
}

fn group(input: &str) -> PResult<'_, Node> {
    delimited(
        terminated(ch('('), space0),
        alternation,
        preceded(space0, ch(')')),
    )(input)
}

fn option(input: &str) -> PResult<'_, Node> {
    map(
        delimited(
            terminated(ch('['), space0),
            alternation,
            preceded(space0, ch(']')),
        ),
        |node| Node::Rep {
            min: 0,
            max: 1,
            node: Box::new(node),
        },
    )(input)
}

fn element(input: &str) -> PResult<'_, Node> {
    alt((
        map(preceded(tag("&&"), element), |n| Node::Bka(Box::new(n))),
        map(preceded(tag("!!"), element), |n| Node::Bkn(Box::new(n))),
        map(preceded(ch('&'), element), |n| Node::And(Box::new(n))),
        map(preceded(ch('!'), element), |n| Node::Not(Box::new(n))),
        value(Node::Abg, tag("%^")),
        value(Node::Aen, tag("%$")),
        map(preceded(tag("%s"), quoted), Node::Tbs),
        map(preceded(tag("%i"), quoted), Node::Tls),
        terminal,
        map(quoted, Node::Tls),
        group,
        option,
        bkr,
        map(rule_name, |n| Node::Ref(n.to_string())),
    ))(input)
}

fn repetition(input: &str) -> PResult<'_, Node> {
    map(pair(opt(repeat), element), |(rep, el)| match rep {
        Some((min, max)) => Node::Rep {
            min,
            max,
            node: Box::new(el),
        },
        None => el,
    })(input)
}

fn concatenation(input: &str) -> PResult<'_, Node> {
    map(
        pair(repetition, many0(preceded(space1, repetition))),
        |(first, mut rest)| {
            if rest.is_empty() {
                first
            } else {
                let mut nodes = vec![first];
                nodes.append(&mut rest);
                Node::Cat(nodes)
            }
        },
    )(input)
}

fn alternation(input: &str) -> PResult<'_, Node> {
    map(
        pair(
            concatenation,
            many0(preceded(delimited(space0, ch('/'), space0), concatenation)),
        ),
        |(first, mut rest)| {
            if rest.is_empty() {
                first
            } else {
                let mut nodes = vec![first];
                nodes.append(&mut rest);
                Node::Alt(nodes)
            }
        },
    )(input)
}

fn rule_def(input: &str) -> PResult<'_, (String, bool, Node)> {
    map(
        all_consuming(tuple((
            delimited(space0, rule_name, space0),
            alt((tag("=/"), tag("="))),
            delimited(space0, alternation, space0),
        ))),
        |(name, defined_as, body)| (name.to_string(), defined_as == "=/", body),
    )(input)
}

fn is_udt_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("u_") || lower.starts_with("e_")
}

struct Lowerer<'a, C: AlphabetChar> {
    builder: GrammarBuilder<C>,
    rule_index: &'a AHashMap<String, usize>,
    udt_index: AHashMap<String, usize>,
}

impl<'a, C: AlphabetChar> Lowerer<'a, C> {
    fn lower(&mut self, node: &Node) -> Result<usize, PatternSyntaxError> {
        match node {
            Node::Alt(children) => {
                let ids = children
                    .iter()
                    .map(|c| self.lower(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.builder.alt(&ids))
            }
            Node::Cat(children) => {
                let ids = children
                    .iter()
                    .map(|c| self.lower(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.builder.cat(&ids))
            }
            Node::Rep { min, max, node } => {
                if min > max {
                    return Err(PatternSyntaxError::InvalidRepeat(*min, *max));
                }
                let child = self.lower(node)?;
                Ok(self.builder.rep(*min, *max, child))
            }
            Node::Ref(name) => {
                let key = name.to_ascii_lowercase();
                if let Some(&rule) = self.rule_index.get(&key) {
                    Ok(self.builder.rnm(rule))
                } else if is_udt_name(name) {
                    let udt = self.udt(name);
                    Ok(self.builder.udt_op(udt))
                } else {
                    Err(PatternSyntaxError::UndefinedRule(name.clone()))
                }
            }
            Node::Tls(chars) => {
                let chars = self.convert(chars)?;
                Ok(self.builder.tls(&chars))
            }
            Node::Tbs(chars) => {
                let chars = self.convert(chars)?;
                Ok(self.builder.tbs(&chars))
            }
            Node::Trg(lo, hi) => {
                if lo > hi {
                    return Err(PatternSyntaxError::EmptyRange(*lo, *hi));
                }
                let lo = C::try_from(*lo).map_err(|_| PatternSyntaxError::CharOutOfRange(*lo))?;
                let hi = C::try_from(*hi).map_err(|_| PatternSyntaxError::CharOutOfRange(*hi))?;
                Ok(self.builder.trg(lo, hi))
            }
            Node::And(node) => {
                let child = self.lower(node)?;
                Ok(self.builder.and(child))
            }
            Node::Not(node) => {
                let child = self.lower(node)?;
                Ok(self.builder.not(child))
            }
            Node::Bka(node) => {
                let child = self.lower(node)?;
                Ok(self.builder.bka(child))
            }
            Node::Bkn(node) => {
                let child = self.lower(node)?;
                Ok(self.builder.bkn(child))
            }
            Node::Bkr { name, mode, case } => {
                let key = name.to_ascii_lowercase();
                let target = if let Some(&rule) = self.rule_index.get(&key) {
                    Target::Rule(rule)
                } else if is_udt_name(name) {
                    Target::Udt(self.udt(name))
                } else {
                    return Err(PatternSyntaxError::UndefinedRule(name.clone()));
                };
                Ok(self.builder.bkr(target, *mode, *case))
            }
            Node::Abg => Ok(self.builder.abg()),
            Node::Aen => Ok(self.builder.aen()),
        }
    }

    fn udt(&mut self, name: &str) -> usize {
        let key = name.to_ascii_lowercase();
        if let Some(&udt) = self.udt_index.get(&key) {
            return udt;
        }
        let nullable = key.starts_with("e_");
        let udt = self.builder.add_udt(name, nullable);
        self.udt_index.insert(key, udt);
        udt
    }

    fn convert(&self, chars: &[u64]) -> Result<Vec<C>, PatternSyntaxError> {
        chars
            .iter()
            .map(|&v| C::try_from(v).map_err(|_| PatternSyntaxError::CharOutOfRange(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Opcode;

    #[test]
    fn literal_rule() {
        let g = compile::<u8>("S = \"abc\"\n").unwrap();
        assert_eq!(g.rule_count(), 1);
        assert_eq!(g.rules()[0].name, "S");
        assert!(!g.rules()[0].nullable);
    }

    #[test]
    fn alternation_concatenation_and_repetition() {
        let g = compile::<u8>("s = 1*(a / b) %d46\na = \"x\"\nb = %s\"Y\"\n").unwrap();
        assert_eq!(g.rule_count(), 3);
        let root = g.rules()[0].op;
        assert!(matches!(g.opcode(root), Some(Opcode::Cat { .. })));
    }

    #[test]
    fn continuation_lines_and_comments() {
        let g = compile::<u8>(
            "s = \"a\" ; trailing comment\n    / \"b\" ; another\nt = \"; not a comment\"\n",
        )
        .unwrap();
        assert_eq!(g.rule_count(), 2);
        let root = g.rules()[0].op;
        assert!(matches!(g.opcode(root), Some(Opcode::Alt { .. })));
    }

    #[test]
    fn incremental_alternatives() {
        let g = compile::<u8>("s = \"a\"\ns =/ \"b\"\n").unwrap();
        let root = g.rules()[0].op;
        assert!(matches!(g.opcode(root), Some(Opcode::Alt { .. })));
        assert!(matches!(
            compile::<u8>("s = \"a\"\ns = \"b\"\n"),
            Err(PatternSyntaxError::DuplicateRule(_))
        ));
        assert!(matches!(
            compile::<u8>("s =/ \"a\"\n"),
            Err(PatternSyntaxError::IncrementalUndefined(_))
        ));
    }

    #[test]
    fn terminal_forms() {
        let g = compile::<u8>("s = %d48-57 %x41.42 %b0-1\n").unwrap();
        let root = g.rules()[0].op;
        let Some(Opcode::Cat { children }) = g.opcode(root) else {
            panic!("expected CAT");
        };
        let kids = g.children(children).to_vec();
        assert!(matches!(g.opcode(kids[0]), Some(Opcode::Trg { .. })));
        match g.opcode(kids[1]) {
            Some(Opcode::Tbs { lit }) => assert_eq!(g.literal(lit), b"AB"),
            other => panic!("expected TBS, got {other:?}"),
        }
    }

    #[test]
    fn udt_and_backref_names() {
        let g = compile::<u8>("s = u_num \\%s%ps\n").unwrap();
        assert_eq!(g.udt_count(), 1);
        assert_eq!(g.udts()[0].name, "u_num");
        assert!(!g.udts()[0].nullable);
        let g = compile::<u8>("s = e_opt\n").unwrap();
        assert!(g.udts()[0].nullable);
    }

    #[test]
    fn undefined_names_are_rejected() {
        assert!(matches!(
            compile::<u8>("s = missing\n"),
            Err(PatternSyntaxError::UndefinedRule(_))
        ));
    }

    #[test]
    fn characters_must_fit_the_alphabet() {
        assert!(matches!(
            compile::<u8>("s = %d256\n"),
            Err(PatternSyntaxError::CharOutOfRange(_))
        ));
        assert!(compile::<u16>("s = %d256\n").is_ok());
    }

    #[test]
    fn rule_names_are_case_insensitive() {
        let g = compile::<u8>("Start = inner\nINNER = \"x\"\n").unwrap();
        assert_eq!(g.rule_count(), 2);
        assert!(g.lookup("start").is_some());
        assert!(g.lookup("Inner").is_some());
    }
}
