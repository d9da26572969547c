//! An observational trace of the parser's walk through the opcode tree.
//!
//! When the `t` flag is set the engine records one event per operator
//! visit, down and up, and forwards each to the [`log`] facade at trace
//! level. The recorded events render as an indented text map of the parse
//! or, with the `h` flag, as an HTML table. Tracing never changes match
//! results.
use std::fmt::{self, Display};

use crate::grammar::OpcodeKind;
use crate::parser::MatchState;

/// One operator visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    /// The operator visited.
    pub kind: OpcodeKind,
    /// Tree depth of the visit.
    pub depth: usize,
    /// Phrase offset: the current offset going down, the matched phrase
    /// offset coming up.
    pub offset: usize,
    /// `None` going down; the state and phrase length coming up.
    pub result: Option<(MatchState, usize)>,
}

/// The recorded trace of the most recent parse attempts.
#[derive(Debug, Clone)]
pub struct Trace {
    events: Vec<TraceEvent>,
    html: bool,
}

impl Trace {
    pub(crate) fn new(html: bool) -> Self {
        Self {
            events: Vec::new(),
            html,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }

    pub(crate) fn down(&mut self, kind: OpcodeKind, depth: usize, offset: usize) {
        log::trace!("{:indent$}{kind}: offset {offset}", "", indent = depth);
        self.events.push(TraceEvent {
            kind,
            depth,
            offset,
            result: None,
        });
    }

    pub(crate) fn up(
        &mut self,
        kind: OpcodeKind,
        depth: usize,
        offset: usize,
        state: MatchState,
        length: usize,
    ) {
        log::trace!(
            "{:indent$}{kind}: {state}: ({offset}, {length})",
            "",
            indent = depth
        );
        self.events.push(TraceEvent {
            kind,
            depth,
            offset,
            result: Some((state, length)),
        });
    }

    /// The recorded events, in visit order.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// True when the `h` flag selected HTML rendering.
    pub fn is_html(&self) -> bool {
        self.html
    }

    /// Render the trace as text or HTML, per the flags.
    pub fn render(&self) -> String {
        if self.html {
            self.render_html()
        } else {
            self.render_text()
        }
    }

    fn render_text(&self) -> String {
        let mut out = String::new();
        for event in self.events.iter() {
            for _ in 0..event.depth {
                out.push(' ');
            }
            match event.result {
                None => out.push_str(&format!("|-{}: offset {}\n", event.kind, event.offset)),
                Some((state, length)) => out.push_str(&format!(
                    "'-{}: {}: ({}, {})\n",
                    event.kind, state, event.offset, length
                )),
            }
        }
        out
    }

    fn render_html(&self) -> String {
        let mut out = String::from(
            "<table>\n<tr><th>depth</th><th>op</th><th>dir</th><th>state</th>\
             <th>offset</th><th>length</th></tr>\n",
        );
        for event in self.events.iter() {
            let (dir, state, length) = match event.result {
                None => ("down", String::new(), String::new()),
                Some((state, length)) => ("up", state.to_string(), length.to_string()),
            };
            out.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                event.depth, event.kind, dir, state, event.offset, length
            ));
        }
        out.push_str("</table>\n");
        out
    }
}

impl Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_pair_down_and_up() {
        let mut trace = Trace::new(false);
        trace.down(OpcodeKind::Tls, 1, 0);
        trace.up(OpcodeKind::Tls, 1, 0, MatchState::Match, 3);
        assert_eq!(trace.events().len(), 2);
        assert!(trace.render().contains("TLS"));
        trace.clear();
        assert!(trace.events().is_empty());
    }

    #[test]
    fn html_rendering_is_a_table() {
        let mut trace = Trace::new(true);
        trace.down(OpcodeKind::Alt, 1, 0);
        trace.up(OpcodeKind::Alt, 1, 0, MatchState::NoMatch, 0);
        let html = trace.render();
        assert!(html.starts_with("<table>"));
        assert!(html.contains("<td>ALT</td>"));
    }
}
