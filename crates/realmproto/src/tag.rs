//! Output tag scanner.
//!
//! The worker emits one interleaved character stream; addressing is
//! carried in-band by a tiny tag language:
//!
//! - `<$t NNN>` ... `</$t>`: route to the player with session id NNN
//!   (nesting pushes/pops a target stack),
//! - `<$a>` ... `</$a>`: route to the Announcer (broadcast),
//! - `<$b SPEC>`: transfer the current target player per SPEC,
//! - `<$d INFO>`: mark the current target player
//!   disambiguation-pending with INFO.
//!
//! Anything else that merely looks like a tag is passed through
//! verbatim once the match fails (longest-prefix fallback). The
//! scanner works byte-at-a-time because output can switch target
//! mid-line; it never buffers whole lines.

/// Upper bound on a candidate tag, argument included. A "tag" longer
/// than this cannot be one of ours, so we bail to literal output.
const MAX_TAG_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAction {
    /// One literal output byte for the current target.
    Emit(u8),
    /// `<$t NNN>`: push player session id NNN as the target.
    PushTarget(i32),
    /// `<$a>`: push the Announcer (broadcast) target.
    PushAnnouncer,
    /// `</$t>` or `</$a>`: restore the previous target.
    PopTarget,
    /// `<$b SPEC>`: transfer the current target player. The spec is
    /// raw; parse with [`crate::worker::TransferSpec`].
    Transfer(String),
    /// `<$d INFO>`: the current target player's next input line is
    /// preceded by a silent replay of INFO.
    Disambiguate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Target,
    Transfer,
    Disambig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Text,
    /// `<`
    Lt,
    /// `<$`
    Dollar,
    /// `<$t`, `<$b` or `<$d`; the space before the argument is next.
    NeedSpace(Kind),
    /// Collecting the argument up to `>`.
    Arg(Kind),
    /// `<$a`; `>` is next.
    AnnouncerOpen,
    /// `</`
    Slash,
    /// `</$`
    SlashDollar,
    /// `</$t` or `</$a`; `>` is next.
    Close,
}

#[derive(Debug)]
pub struct TagScanner {
    state: State,
    /// Raw bytes consumed since the opening `<`, replayed verbatim on
    /// a failed match.
    pending: Vec<u8>,
    arg: String,
}

impl Default for TagScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TagScanner {
    pub fn new() -> Self {
        Self {
            state: State::Text,
            pending: Vec::new(),
            arg: String::new(),
        }
    }

    /// Feed one byte; returns the actions it produced.
    pub fn push(&mut self, b: u8) -> Vec<TagAction> {
        let mut out = Vec::new();
        self.step(b, &mut out);
        out
    }

    /// Feed a chunk; convenience over [`Self::push`].
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<TagAction> {
        let mut out = Vec::new();
        for &b in chunk {
            self.step(b, &mut out);
        }
        out
    }

    /// Flush any partial tag as literal output (stream end).
    pub fn finish(&mut self) -> Vec<TagAction> {
        let mut out = Vec::new();
        self.bail(&mut out);
        out
    }

    fn step(&mut self, b: u8, out: &mut Vec<TagAction>) {
        if self.state != State::Text && self.pending.len() >= MAX_TAG_LEN {
            self.bail(out);
        }

        match self.state {
            State::Text => {
                if b == b'<' {
                    self.pending.push(b);
                    self.state = State::Lt;
                } else {
                    out.push(TagAction::Emit(b));
                }
            }
            State::Lt => match b {
                b'$' => self.advance(b, State::Dollar),
                b'/' => self.advance(b, State::Slash),
                _ => self.reject(b, out),
            },
            State::Dollar => match b {
                b't' => self.advance(b, State::NeedSpace(Kind::Target)),
                b'b' => self.advance(b, State::NeedSpace(Kind::Transfer)),
                b'd' => self.advance(b, State::NeedSpace(Kind::Disambig)),
                b'a' => self.advance(b, State::AnnouncerOpen),
                _ => self.reject(b, out),
            },
            State::NeedSpace(kind) => match b {
                b' ' => {
                    self.arg.clear();
                    self.advance(b, State::Arg(kind));
                }
                _ => self.reject(b, out),
            },
            State::Arg(kind) => match b {
                b'>' => {
                    let action = self.close_arg(kind);
                    match action {
                        Some(a) => {
                            out.push(a);
                            self.accept();
                        }
                        None => self.reject(b, out),
                    }
                }
                b'<' => self.reject(b, out),
                _ => {
                    if kind == Kind::Target && !(b.is_ascii_digit() || b == b'-') {
                        self.reject(b, out);
                    } else {
                        self.pending.push(b);
                        self.arg.push(b as char);
                    }
                }
            },
            State::AnnouncerOpen => match b {
                b'>' => {
                    out.push(TagAction::PushAnnouncer);
                    self.accept();
                }
                _ => self.reject(b, out),
            },
            State::Slash => match b {
                b'$' => self.advance(b, State::SlashDollar),
                _ => self.reject(b, out),
            },
            State::SlashDollar => match b {
                b't' | b'a' => self.advance(b, State::Close),
                _ => self.reject(b, out),
            },
            State::Close => match b {
                b'>' => {
                    out.push(TagAction::PopTarget);
                    self.accept();
                }
                _ => self.reject(b, out),
            },
        }
    }

    fn close_arg(&mut self, kind: Kind) -> Option<TagAction> {
        match kind {
            Kind::Target => {
                let sid: i32 = self.arg.parse().ok()?;
                Some(TagAction::PushTarget(sid))
            }
            Kind::Transfer => {
                if self.arg.trim().is_empty() {
                    return None;
                }
                Some(TagAction::Transfer(self.arg.trim().to_string()))
            }
            Kind::Disambig => Some(TagAction::Disambiguate(self.arg.clone())),
        }
    }

    fn advance(&mut self, b: u8, next: State) {
        self.pending.push(b);
        self.state = next;
    }

    fn accept(&mut self) {
        self.pending.clear();
        self.arg.clear();
        self.state = State::Text;
    }

    /// Longest-prefix fallback: everything consumed so far was not a
    /// tag after all. Replay it literally, then reprocess `b` from
    /// `Text` (it may itself open a new tag).
    fn reject(&mut self, b: u8, out: &mut Vec<TagAction>) {
        self.bail(out);
        self.step(b, out);
    }

    fn bail(&mut self, out: &mut Vec<TagAction>) {
        for &p in &self.pending {
            out.push(TagAction::Emit(p));
        }
        self.pending.clear();
        self.arg.clear();
        self.state = State::Text;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> Vec<TagAction> {
        let mut s = TagScanner::new();
        let mut out = s.push_chunk(input);
        out.extend(s.finish());
        out
    }

    fn text_of(actions: &[TagAction]) -> String {
        let bytes: Vec<u8> = actions
            .iter()
            .filter_map(|a| match a {
                TagAction::Emit(b) => Some(*b),
                _ => None,
            })
            .collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn routes_targeted_text() {
        let got = run(b"<$t 5>hi</$t>");
        assert_eq!(
            got,
            vec![
                TagAction::PushTarget(5),
                TagAction::Emit(b'h'),
                TagAction::Emit(b'i'),
                TagAction::PopTarget,
            ]
        );
    }

    #[test]
    fn negative_session_ids_parse() {
        let got = run(b"<$t -3></$t>");
        assert_eq!(got[0], TagAction::PushTarget(-3));
    }

    #[test]
    fn announcer_brackets_text() {
        let got = run(b"<$a>hi</$a>");
        assert_eq!(got.first(), Some(&TagAction::PushAnnouncer));
        assert_eq!(got.last(), Some(&TagAction::PopTarget));
        assert_eq!(text_of(&got), "hi");
    }

    #[test]
    fn unknown_tag_passes_through_verbatim() {
        let got = run(b"<$x>");
        assert_eq!(text_of(&got), "<$x>");
        assert!(got.iter().all(|a| matches!(a, TagAction::Emit(_))));
    }

    #[test]
    fn plain_angle_brackets_pass_through() {
        assert_eq!(text_of(&run(b"a < b > c")), "a < b > c");
        assert_eq!(text_of(&run(b"<html>")), "<html>");
    }

    #[test]
    fn nested_tags_emit_balanced_pushes_and_pops() {
        let got = run(b"<$a>all<$t 2>just you</$t>more</$a>");
        let pushes = got
            .iter()
            .filter(|a| matches!(a, TagAction::PushTarget(_) | TagAction::PushAnnouncer))
            .count();
        let pops = got
            .iter()
            .filter(|a| matches!(a, TagAction::PopTarget))
            .count();
        assert_eq!(pushes, 2);
        assert_eq!(pops, 2);
    }

    #[test]
    fn transfer_and_disambiguation_carry_arguments() {
        let got = run(b"<$b side@lobby>");
        assert_eq!(got, vec![TagAction::Transfer("side@lobby".into())]);

        let got = run(b"<$d which lamp do you mean>");
        assert_eq!(
            got,
            vec![TagAction::Disambiguate("which lamp do you mean".into())]
        );
    }

    #[test]
    fn bad_target_number_falls_back_to_literal() {
        assert_eq!(text_of(&run(b"<$t 1x2>")), "<$t 1x2>");
        assert_eq!(text_of(&run(b"<$t >")), "<$t >");
        assert_eq!(text_of(&run(b"<$t ->")), "<$t ->");
    }

    #[test]
    fn split_across_pushes_still_matches() {
        let mut s = TagScanner::new();
        let mut out = Vec::new();
        out.extend(s.push_chunk(b"<$t"));
        assert!(out.is_empty());
        out.extend(s.push_chunk(b" 12"));
        out.extend(s.push_chunk(b">ok</"));
        out.extend(s.push_chunk(b"$t>"));
        assert_eq!(out[0], TagAction::PushTarget(12));
        assert_eq!(text_of(&out), "ok");
        assert_eq!(out.last(), Some(&TagAction::PopTarget));
    }

    #[test]
    fn lt_inside_candidate_reopens_tag() {
        // "<$t <$a>" : the first prefix fails at '<', which must then
        // start a fresh (valid) announcer tag.
        let got = run(b"<$t <$a>");
        assert_eq!(text_of(&got), "<$t ");
        assert_eq!(got.last(), Some(&TagAction::PushAnnouncer));
    }

    #[test]
    fn truncated_tag_flushes_on_finish() {
        let mut s = TagScanner::new();
        let mut out = s.push_chunk(b"end<$t 9");
        out.extend(s.finish());
        assert_eq!(text_of(&out), "end<$t 9");
    }

    #[test]
    fn oversized_candidate_bails_to_literal() {
        let mut input = b"<$b ".to_vec();
        input.extend(std::iter::repeat(b'a').take(300));
        let got = run(&input);
        assert!(got.iter().all(|a| matches!(a, TagAction::Emit(_))));
        assert_eq!(got.len(), input.len());
    }
}
