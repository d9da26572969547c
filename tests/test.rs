#[cfg(test)]
mod tests {
    use sabnfex::ast::AstState;
    use sabnfex::matcher::{EnableError, ExecError, PatternError, ReplaceError};
    use sabnfex::parser::ParseError;
    use sabnfex::{CallbackData, Config, MatchResult, MatchState, Matcher, MatcherBase};

    const TAG_SENSITIVE: &str = "tag   = open [tag] close\n\
                                 open  = \"<\" name \">\"\n\
                                 close = \"</\" \\%sname \">\"\n\
                                 name  = 1*(%d65-90 / %d97-122)\n";

    const TAG_INSENSITIVE: &str = "tag   = open [tag] close\n\
                                   open  = \"<\" name \">\"\n\
                                   close = \"</\" \\name \">\"\n\
                                   name  = 1*(%d65-90 / %d97-122)\n";

    const TAG_PARENT: &str = "tag   = open [tag] close\n\
                              open  = \"<\" name \">\"\n\
                              close = \"</\" \\%s%pname \">\"\n\
                              name  = 1*(%d65-90 / %d97-122)\n";

    fn matched_str(result: &MatchResult<u32>) -> String {
        result.matched.as_string()
    }

    #[test]
    fn exact_literal_default_mode() {
        let mut matcher = Matcher::new("S = \"abc\"\n", "").unwrap();
        let result = matcher.exec("xxabcyy").unwrap().unwrap();
        assert_eq!(result.matched.offset, 2);
        assert_eq!(result.matched.len(), 3);
        assert_eq!(matched_str(&result), "abc");
        assert_eq!(result.left_context.as_string(), "xx");
        assert_eq!(result.right_context.as_string(), "yy");
        // no cursor advance in default mode: the second call is identical
        let again = matcher.exec("xxabcyy").unwrap().unwrap();
        assert_eq!(again.matched.offset, 2);
        assert_eq!(again.matched.len(), 3);
        assert_eq!(matcher.last_index(), 0);
    }

    #[test]
    fn global_mode_walks_every_match() {
        let mut matcher = Matcher::new("W = \"abc\"\n", "g").unwrap();
        let source = "abcXabcXabc";
        let offsets: Vec<usize> = (0..3)
            .map(|_| matcher.exec(source).unwrap().unwrap().matched.offset)
            .collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert!(matcher.exec(source).unwrap().is_none());
        assert_eq!(matcher.last_index(), 0);
    }

    #[test]
    fn sticky_mode_requires_the_cursor_position() {
        let mut matcher = Matcher::new("W = \"abc\"\n", "y").unwrap();
        assert_eq!(matcher.exec("abcabc").unwrap().unwrap().matched.offset, 0);
        assert_eq!(matcher.last_index(), 3);
        assert_eq!(matcher.exec("abcabc").unwrap().unwrap().matched.offset, 3);
        assert!(matcher.exec("abcabc").unwrap().is_none());
        assert_eq!(matcher.last_index(), 0);
        // sticky fails off-position even though a match exists further on
        let mut matcher = Matcher::new("W = \"abc\"\n", "y").unwrap();
        assert!(matcher.exec("xabc").unwrap().is_none());
    }

    #[test]
    fn set_last_index_overrides_the_start() {
        let mut matcher = Matcher::new("W = \"abc\"\n", "g").unwrap();
        matcher.set_last_index(1);
        let result = matcher.exec("abcXabc").unwrap().unwrap();
        assert_eq!(result.matched.offset, 4);
        // a cursor beyond the source is an ordinary no-match
        let mut matcher = Matcher::new("W = \"abc\"\n", "g").unwrap();
        matcher.set_last_index(100);
        assert!(matcher.exec("abc").unwrap().is_none());
        assert_eq!(matcher.last_index(), 0);
    }

    #[test]
    fn test_agrees_with_exec() {
        for source in ["xxabcyy", "no match here", "abc"] {
            let mut a = Matcher::new("S = \"abc\"\n", "").unwrap();
            let mut b = Matcher::new("S = \"abc\"\n", "").unwrap();
            assert_eq!(a.test(source).unwrap(), b.exec(source).unwrap().is_some());
        }
    }

    #[test]
    fn captures_report_enabled_rules_only() {
        let pattern = "P = a / b\na = \"abc\"\nb = \"xyz\"\n";
        let mut matcher = Matcher::new(pattern, "").unwrap();
        matcher.enable("a", true).unwrap();
        let result = matcher.exec("--xyz--abc--").unwrap().unwrap();
        // b matched but is not enabled, so only the a entry exists, empty
        assert_eq!(result.rules.len(), 1);
        assert_eq!(result.rules[0].name, "a");
        assert!(result.rules[0].phrases.is_empty());
        assert_eq!(matched_str(&result), "xyz");

        let mut matcher = Matcher::new(pattern, "").unwrap();
        matcher.enable("--all", true).unwrap();
        let result = matcher.exec("--abc--").unwrap().unwrap();
        let a = result.captures("a").unwrap();
        assert_eq!(a.phrases.len(), 1);
        assert_eq!(a.phrases[0].as_string(), "abc");
        assert_eq!(a.phrases[0].offset, 2);
    }

    #[test]
    fn enable_rejects_unknown_names() {
        let mut matcher = Matcher::new("S = \"abc\"\n", "").unwrap();
        assert!(matches!(
            matcher.enable("nosuch", true),
            Err(EnableError::UnknownName(_))
        ));
        assert!(matches!(matcher.enable("  ", true), Err(EnableError::EmptyNames)));
        matcher.enable("s", true).unwrap(); // names are case-insensitive
    }

    #[test]
    fn replace_with_capture_reference() {
        let pattern = "P = a / b\na = \"abc\"\nb = \"xyz\"\n";
        let mut matcher = Matcher::new(pattern, "g").unwrap();
        matcher.enable("a", true).unwrap();
        let replaced = matcher.replace("-abc-xyz-", "($<a>)").unwrap();
        assert_eq!(replaced, "-(abc)-()-");
    }

    #[test]
    fn replace_identity_and_contexts() {
        let mut matcher = Matcher::new("W = 1*(%d97-122)\n", "g").unwrap();
        assert_eq!(matcher.replace("one two", "$&").unwrap(), "one two");
        let mut matcher = Matcher::new("W = \"mid\"\n", "").unwrap();
        assert_eq!(matcher.replace("A mid Z", "[$`|$']").unwrap(), "A [A | Z] Z");
        let mut matcher = Matcher::new("W = \"mid\"\n", "").unwrap();
        assert_eq!(matcher.replace("A mid Z", "$_").unwrap(), "A A mid Z Z");
    }

    #[test]
    fn replace_every_character_with_a_dollar() {
        let mut matcher = Matcher::new("any = %d0-1114111\n", "g").unwrap();
        let replaced = matcher.replace("abc", "$$").unwrap();
        assert_eq!(replaced, "$$$");
        assert_eq!(replaced.chars().count(), 3);
    }

    #[test]
    fn replace_rejects_malformed_escapes() {
        let mut matcher = Matcher::new("S = \"abc\"\n", "").unwrap();
        assert!(matches!(
            matcher.replace("abc", "x$"),
            Err(ReplaceError::TrailingEscape)
        ));
        assert!(matches!(
            matcher.replace("abc", "$q"),
            Err(ReplaceError::UnknownEscape(_))
        ));
        assert!(matches!(
            matcher.replace("abc", "$<S"),
            Err(ReplaceError::UnterminatedName)
        ));
        assert!(matches!(
            matcher.replace("abc", "$<>"),
            Err(ReplaceError::EmptyName)
        ));
        assert!(matches!(
            matcher.replace("abc", "$<nosuch>"),
            Err(ReplaceError::UnknownName(_))
        ));
    }

    #[test]
    fn replace_with_a_function() {
        let mut matcher = Matcher::new("W = 1*(%d97-122)\n", "g").unwrap();
        let replaced = matcher
            .replace_with("one two", |result, properties| {
                assert!(!properties.last_source.is_empty());
                result.matched.as_string().to_uppercase()
            })
            .unwrap();
        assert_eq!(replaced, "ONE TWO");
    }

    #[test]
    fn backreference_universal_case_sensitive() {
        let mut matcher = Matcher::new(TAG_SENSITIVE, "").unwrap();
        let result = matcher.exec("<div><div></div></div>").unwrap().unwrap();
        assert_eq!(result.matched.offset, 0);
        assert_eq!(result.matched.len(), 22);
        // the closing name must equal the captured name exactly
        assert!(matcher.exec("<Div></div>").unwrap().is_none());
        let mut matcher = Matcher::new(TAG_INSENSITIVE, "").unwrap();
        let result = matcher.exec("<Div></div>").unwrap().unwrap();
        assert_eq!(result.matched.len(), 11);
    }

    #[test]
    fn backreference_parent_mode_pairs_nested_tags() {
        let mut matcher = Matcher::new(TAG_PARENT, "").unwrap();
        let result = matcher.exec("<a><b></b></a>").unwrap().unwrap();
        assert_eq!(result.matched.offset, 0);
        assert_eq!(result.matched.len(), 14);
        // interleaved close tags cannot pair with their own opens
        assert!(matcher.exec("<a><b></a></b>").unwrap().is_none());
    }

    #[test]
    fn split_on_separators() {
        let pattern = "sep = *sp \";\" *sp\nsp  = %d32\n";
        let mut matcher = Matcher::new(pattern, "").unwrap();
        let pieces = matcher.split("one   ;   two;three", 0).unwrap();
        assert_eq!(pieces, vec!["one", "two", "three"]);
        assert_eq!(matcher.last_index(), 0);
    }

    #[test]
    fn split_boundary_behavior() {
        // an empty separator emits one sub-phrase per character
        let mut matcher = Matcher::new("S = \"\"\n", "").unwrap();
        assert_eq!(matcher.split("word", 0).unwrap(), vec!["w", "o", "r", "d"]);
        // a pattern that never matches yields the whole source
        let mut matcher = Matcher::new("S = \"@\"\n", "").unwrap();
        assert_eq!(matcher.split("word", 0).unwrap(), vec!["word"]);
        // an empty source yields an empty array
        let mut matcher = Matcher::new("S = \"@\"\n", "").unwrap();
        assert!(matcher.split("", 0).unwrap().is_empty());
        // the limit caps the number of separators consumed
        let mut matcher = Matcher::new("S = \";\"\n", "").unwrap();
        assert_eq!(matcher.split("a;b;c", 1).unwrap(), vec!["a"]);
    }

    #[test]
    fn split_reconstructs_the_source() {
        let pattern = "sep = *sp \";\" *sp\nsp  = %d32\n";
        let source = "one   ;   two;three;";
        let mut matcher = Matcher::new(pattern, "").unwrap();
        let pieces = matcher.split(source, 0).unwrap();
        let mut separators = Vec::new();
        let mut finder = Matcher::new(pattern, "g").unwrap();
        while let Some(result) = finder.exec(source).unwrap() {
            separators.push((result.matched.offset, result.matched.as_string()));
        }
        let mut rebuilt = String::new();
        let mut piece_iter = pieces.iter();
        let mut cursor = 0;
        for (offset, sep) in separators.iter() {
            if *offset > cursor {
                rebuilt.push_str(piece_iter.next().unwrap());
            }
            rebuilt.push_str(sep);
            cursor = offset + sep.chars().count();
        }
        for piece in piece_iter {
            rebuilt.push_str(piece);
        }
        assert_eq!(rebuilt, source);
    }

    #[test]
    fn pppt_results_match_plain_descent() {
        let pattern = "P = a / b\na = \"abc\"\nb = 1*%d48-57\n";
        for source in ["--abc--", "x123y", "nothing to see", "9"] {
            let mut plain = Matcher::new(pattern, "g").unwrap();
            plain.enable("--all", true).unwrap();
            let mut predicted = Matcher::new(pattern, "gp").unwrap();
            predicted.enable("--all", true).unwrap();
            loop {
                let a = plain.exec(source).unwrap();
                let b = predicted.exec(source).unwrap();
                match (a, b) {
                    (None, None) => break,
                    (Some(a), Some(b)) => {
                        assert_eq!(a.matched.offset, b.matched.offset);
                        assert_eq!(a.matched.chars, b.matched.chars);
                        for (ra, rb) in a.rules.iter().zip(b.rules.iter()) {
                            assert_eq!(ra.name, rb.name);
                            assert_eq!(
                                ra.phrases.iter().map(|p| p.offset).collect::<Vec<_>>(),
                                rb.phrases.iter().map(|p| p.offset).collect::<Vec<_>>()
                            );
                        }
                    }
                    (a, b) => panic!("pppt divergence: {a:?} vs {b:?}"),
                }
            }
        }
    }

    #[test]
    fn flags_are_validated() {
        assert!(matches!(
            Matcher::new("S = \"a\"\n", "q"),
            Err(PatternError::Flags(_))
        ));
        assert!(matches!(
            Matcher::new("S = \"a\"\n", "h"),
            Err(PatternError::Flags(_))
        ));
        assert!(Matcher::new("S = \"a\"\n", "gpth").is_ok());
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(
            Matcher::new("S = \"a\" / \n", ""),
            Err(PatternError::Syntax(_))
        ));
        assert!(matches!(
            Matcher::new("", ""),
            Err(PatternError::Syntax(_))
        ));
    }

    #[test]
    fn empty_source_is_an_input_error() {
        let mut matcher = Matcher::new("S = \"a\"\n", "").unwrap();
        assert!(matches!(matcher.exec(""), Err(ExecError::EmptySource)));
        assert!(matches!(matcher.test(""), Err(ExecError::EmptySource)));
        assert!(matches!(
            matcher.replace("", "x"),
            Err(ReplaceError::Exec(ExecError::EmptySource))
        ));
    }

    #[test]
    fn udt_drives_the_match() {
        let pattern = "S = \"#\" u_digits\n";
        let mut matcher = Matcher::new(pattern, "").unwrap();
        // searching before the UDT is bound is a setup error
        assert!(matches!(
            matcher.exec("#123"),
            Err(ExecError::UdtNotDefined(_))
        ));
        matcher
            .define_udt("u_digits", |data: &mut CallbackData<'_, u32>| {
                let mut length = 0;
                while data.offset + length < data.input.len()
                    && (0x30..=0x39).contains(&data.input[data.offset + length])
                {
                    length += 1;
                }
                if length > 0 {
                    data.state = MatchState::Match;
                    data.phrase_length = length;
                } else {
                    data.state = MatchState::NoMatch;
                }
            })
            .unwrap();
        let result = matcher.exec("xx#123yy").unwrap().unwrap();
        assert_eq!(result.matched.offset, 2);
        assert_eq!(matched_str(&result), "#123");
        assert!(matcher.exec("#abc").unwrap().is_none());
    }

    #[test]
    fn udt_captures_are_reported_with_rule_captures() {
        let pattern = "S = \"#\" u_digits\n";
        let mut matcher = Matcher::new(pattern, "").unwrap();
        matcher
            .define_udt("u_digits", |data: &mut CallbackData<'_, u32>| {
                let mut length = 0;
                while data.offset + length < data.input.len()
                    && (0x30..=0x39).contains(&data.input[data.offset + length])
                {
                    length += 1;
                }
                if length > 0 {
                    data.state = MatchState::Match;
                    data.phrase_length = length;
                } else {
                    data.state = MatchState::NoMatch;
                }
            })
            .unwrap();
        matcher.enable("u_digits", true).unwrap();
        let result = matcher.exec("#2048").unwrap().unwrap();
        let captures = result.captures("u_digits").unwrap();
        assert!(captures.is_udt);
        assert_eq!(captures.phrases[0].as_string(), "2048");
    }

    #[test]
    fn callback_protocol_violations_are_fatal() {
        let mut matcher = Matcher::new("S = \"abc\"\n", "").unwrap();
        matcher
            .base_mut()
            .define_rule_callback("S", |data: &mut CallbackData<'_, u32>| {
                if data.parser_state == MatchState::Active {
                    // claim an empty match from a rule that cannot be empty
                    data.state = MatchState::Match;
                    data.phrase_length = 0;
                }
            })
            .unwrap();
        assert!(matches!(
            matcher.exec("abc"),
            Err(ExecError::Parse(ParseError::EmptyPhrase(_)))
        ));
    }

    #[test]
    fn anchors_pin_the_match_to_the_input_bounds() {
        let mut matcher = Matcher::new("S = %^ \"abc\" %$\n", "").unwrap();
        assert!(matcher.test("abc").unwrap());
        assert!(!matcher.test("xabc").unwrap());
        assert!(!matcher.test("abcx").unwrap());
    }

    #[test]
    fn lookbehind_honors_the_configured_limit() {
        let pattern = "S = &&\"abc\" \"d\"\n";
        let mut unlimited = Matcher::new(pattern, "").unwrap();
        let result = unlimited.exec("abcd").unwrap().unwrap();
        assert_eq!(result.matched.offset, 3);
        assert_eq!(matched_str(&result), "d");
        let config = Config {
            lookbehind_limit: 2,
            ..Config::default()
        };
        let mut limited = Matcher::with_config(pattern, "", config).unwrap();
        assert!(limited.exec("abcd").unwrap().is_none());
    }

    #[test]
    fn negative_lookahead_excludes_matches() {
        // a run of letters not followed by a digit
        let mut matcher = Matcher::new("S = \"ab\" !%d48-57\n", "g").unwrap();
        assert!(matcher.exec("ab1").unwrap().is_none());
        let result = matcher.exec("abX").unwrap().unwrap();
        assert_eq!(result.matched.offset, 0);
    }

    #[test]
    fn rep_over_a_nullable_child_terminates() {
        let mut matcher = Matcher::new("S = *[\"a\"] \"b\"\n", "").unwrap();
        assert!(matcher.test("b").unwrap());
        assert!(matcher.test("aab").unwrap());
    }

    #[test]
    fn properties_reflect_the_engine_state() {
        let mut matcher = Matcher::new("S = \"abc\"\n", "gt").unwrap();
        matcher.exec("xxabcyy").unwrap().unwrap();
        let properties = matcher.properties().unwrap();
        assert_eq!(properties.flags, "gt");
        assert_eq!(properties.mode, sabnfex::Mode::Global);
        assert!(properties.trace && !properties.trace_html && !properties.pppt);
        assert_eq!(
            sabnfex::phrase::string_from_chars(&properties.last_source),
            "xxabcyy"
        );
        assert_eq!(properties.last_match.unwrap().as_string(), "abc");
        assert_eq!(properties.left_context.unwrap().as_string(), "xx");
        assert_eq!(properties.right_context.unwrap().as_string(), "yy");
        assert_eq!(properties.last_index, 5);
        assert_eq!(properties.pattern.as_deref(), Some("S = \"abc\"\n"));
    }

    #[test]
    fn trace_records_the_walk() {
        let mut matcher = Matcher::new("S = \"abc\"\n", "t").unwrap();
        matcher.exec("xabc").unwrap().unwrap();
        let trace = matcher.base().trace().unwrap();
        assert!(!trace.events().is_empty());
        assert!(trace.render().contains("TLS"));
        let mut matcher = Matcher::new("S = \"abc\"\n", "th").unwrap();
        matcher.exec("abc").unwrap().unwrap();
        assert!(matcher.base().trace().unwrap().render().starts_with("<table>"));
    }

    #[test]
    fn ast_records_pair_pre_and_post() {
        let mut matcher = Matcher::new(TAG_PARENT, "").unwrap();
        matcher.enable("--all", true).unwrap();
        matcher.exec("<a><b></b></a>").unwrap().unwrap();
        let records = matcher.base().ast().records();
        assert!(!records.is_empty());
        for record in records.iter().filter(|r| r.state == AstState::Pre) {
            let post = &records[record.that_index];
            assert_eq!(post.state, AstState::Post);
            assert_eq!(post.that_index, record.this_index);
            assert_eq!(post.phrase_length, record.phrase_length);
            assert!(record.phrase_offset + record.phrase_length <= 14);
        }
    }

    #[test]
    fn byte_alphabet_engine_works_on_byte_slices() {
        let mut base = MatcherBase::<u8>::new();
        base.set_pattern_source("S = \"abc\"\n", "").unwrap();
        let result = base.exec(b"xxabcyy").unwrap().unwrap();
        assert_eq!(result.matched.offset, 2);
        assert_eq!(result.matched.as_string(), "abc");
        // a character beyond the byte alphabet is a pattern error
        assert!(matches!(
            MatcherBase::<u8>::new().set_pattern_source("S = %d900\n", ""),
            Err(PatternError::Syntax(_))
        ));
    }

    #[test]
    fn prebuilt_grammars_can_be_shared() {
        use std::sync::Arc;
        let grammar = Arc::new(sabnfex::syntax::compile::<u32>("S = \"abc\"\n").unwrap());
        let mut first = MatcherBase::<u32>::new();
        first
            .set_pattern_grammar(Arc::clone(&grammar), "g")
            .unwrap();
        let mut second = MatcherBase::<u32>::new();
        second.set_pattern_grammar(grammar, "").unwrap();
        let source: Vec<u32> = "xabc".chars().map(|c| c as u32).collect();
        assert!(first.exec(&source).unwrap().is_some());
        assert!(second.exec(&source).unwrap().is_some());
    }

    #[test]
    fn searching_without_a_pattern_is_a_setup_error() {
        let mut base = MatcherBase::<u32>::new();
        let source: Vec<u32> = vec![97];
        assert!(matches!(base.exec(&source), Err(ExecError::NoPattern)));
        assert!(matches!(base.properties(), Err(ExecError::NoPattern)));
    }
}
