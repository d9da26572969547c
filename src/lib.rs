/*!
# sabnfex

This crate provides a regex-like phrase-matching engine whose patterns are
ABNF/SABNF grammars instead of regex syntax. Given a grammar describing a
language and an input string, it locates matching sub-phrases, reports
their positions, captures the sub-phrases of named rules, optionally
replaces matches, and optionally splits the input using matches as
separators. Here is a quick example of how this crate works:

```rust
use sabnfex::Matcher;

// a word of letters, captured by the rule that matched it
let pattern = r#"
word  = 1*alpha
alpha = %d65-90 / %d97-122
"#;
let mut matcher = Matcher::new(pattern, "g").unwrap();
matcher.enable("word", true).unwrap();

let result = matcher.exec("one two three").unwrap().unwrap();
assert_eq!(result.matched.as_string(), "one");
assert_eq!(result.matched.offset, 0);
let result = matcher.exec("one two three").unwrap().unwrap();
assert_eq!(result.matched.as_string(), "two");
assert_eq!(result.captures("word").unwrap().phrases[0].as_string(), "two");

// replacement with capture references
let mut matcher = Matcher::new(pattern, "g").unwrap();
assert_eq!(
    matcher.replace("one two", "<$&>").unwrap(),
    "<one> <two>"
);

// split on separators
let mut matcher = Matcher::new("sep = 1*%d32\n", "").unwrap();
assert_eq!(
    matcher.split("one two  three", 0).unwrap(),
    vec!["one", "two", "three"]
);
```

# Overview

The primary types in this crate are [`Matcher`] and [`MatcherBase`].
[`Matcher`] works on `&str` sources with offsets counted in characters;
[`MatcherBase`] is the same engine, generic over the alphabet character
width (`u8`, `u16`, `u32` or `u64`), working on character slices. The most
important methods are:

- [`Matcher::new`]: compile an SABNF pattern and a flag string into a
  ready matcher. [`MatcherBase::set_pattern_source`],
  [`MatcherBase::set_pattern_file`] and
  [`MatcherBase::set_pattern_grammar`] define or replace the pattern of an
  existing engine.
- [`Matcher::exec`]: find the next match and its captures.
  [`Matcher::test`] reports only success or failure.
- [`Matcher::replace`] / [`Matcher::replace_with`]: rebuild the source
  with matches substituted.
- [`Matcher::split`]: split the source using matches as separators.

# Flags

| Flag | Meaning |
|---|---|
| (empty) | default mode: search from `last_index`, then reset it |
| `g` | global mode: a match advances `last_index` past itself |
| `y` | sticky mode: the match must start exactly at `last_index` |
| `p` | use the partially-predictive parsing table |
| `t` | record a trace of the parse |
| `h` | render the trace as HTML (must follow `t`) |

Only one of `g` and `y` can be in effect; whichever appears first wins.
Any other character is an error.

# Pattern syntax

Patterns are SABNF: ABNF (RFC 5234 shape) plus superset operators. See
[`syntax`] for the complete dialect. The highlights:

- `"abc"` matches case-insensitively; `%s"abc"` case-sensitively;
  `%d48-57` matches one character in a range.
- `&e` / `!e` are zero-length lookahead, `&&e` / `!!e` zero-length
  lookbehind, `%^` / `%$` anchor to the absolute input begin and end.
- `\name` matches the phrase most recently captured by rule `name`.
  Modifiers select case handling (`%i`/`%s`) and visibility mode
  (`%u` universal / `%p` parent). Parent mode sees only captures made
  within the currently open instance of the enclosing rule, which is what
  nested start/end tag matching needs.
- Names beginning `u_` or `e_` are user-defined terminals (UDTs): hooks
  into host code, bound with [`Matcher::define_udt`]. An `e_` UDT may
  match the empty phrase.

# Replacement escapes

Within a replacement string, `$` introduces an escape: `$$` a literal
dollar, `$_` the whole original source, `$&` the matched phrase, `` $` ``
the left context, `$'` the right context, and `$<name>` the last phrase
captured by the named rule or UDT (empty if it captured nothing). Anything
else after `$` is an error.

# Concurrency

One engine instance is strictly single-threaded: a parse is a plain
recursive walk with no suspension points. Separate engine instances are
independent; a compiled [`Grammar`](grammar::Grammar) can be shared
read-only between them through an `Arc`. There is no built-in timeout; a
host wishing to bound execution supplies a UDT that checks a deadline and
reports NOMATCH to unwind. Callbacks must not re-enter the engine they
were called from.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod ast;
mod backref;
pub mod config;
pub mod grammar;
pub mod matcher;
pub mod parser;
pub mod phrase;
pub mod pppt;
pub mod syntax;
pub mod trace;
mod utils;
pub use config::{Config, Flags, Mode};
pub use matcher::{MatchPhrase, MatchResult, Matcher, MatcherBase, Properties, RuleCaptures};
pub use parser::{CallbackData, MatchState, ParseOutcome};
pub use phrase::AlphabetChar;
