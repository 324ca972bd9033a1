//! Line-oriented lexical scan of scene source.
//!
//! The scan understands just enough of the scripting language to tell code
//! from comments and string literals, track bracket nesting, and group
//! physical lines into logical ones. Both the sanitizer and the static syntax
//! check work from its output instead of pattern-matching raw text.

#[derive(Debug, Clone)]
pub struct ScannedLine {
    pub raw: String,
    /// Leading whitespace width, tabs rounded up to the next multiple of 8.
    pub indent: usize,
    /// Code with comments removed and string contents elided (quotes kept).
    pub code: String,
    /// True when the line continues an earlier logical line: open brackets,
    /// a trailing backslash, or a multi-line string.
    pub continuation: bool,
}

impl ScannedLine {
    pub fn is_blank(&self) -> bool {
        self.code.trim().is_empty()
    }

    /// A line that starts a new logical statement.
    pub fn is_logical_start(&self) -> bool {
        !self.continuation && !self.is_blank()
    }

    pub fn first_word(&self) -> &str {
        first_word(&self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub line: usize,
    pub content: String,
    pub triple: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexIssue {
    UnterminatedString { line: usize },
    UnclosedBracket { open: char, line: usize },
    UnexpectedClose { close: char, line: usize },
    MismatchedBracket { open: char, close: char, line: usize },
}

#[derive(Debug, Clone, Default)]
pub struct Scan {
    pub lines: Vec<ScannedLine>,
    pub literals: Vec<Literal>,
    pub issues: Vec<LexIssue>,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Code,
    Str { quote: char, triple: bool },
}

pub fn scan(source: &str) -> Scan {
    let mut out = Scan::default();
    let mut state = State::Code;
    let mut brackets: Vec<(char, usize)> = Vec::new();
    let mut literal = String::new();
    let mut literal_line = 0usize;
    let mut backslash_continues = false;

    for (idx, raw_line) in source.split('\n').enumerate() {
        let raw_line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let continuation =
            matches!(state, State::Str { .. }) || !brackets.is_empty() || backslash_continues;
        backslash_continues = false;

        let chars: Vec<char> = raw_line.chars().collect();
        let mut code = String::new();
        let mut i = 0usize;
        while i < chars.len() {
            let c = chars[i];
            match state {
                State::Code => match c {
                    '#' => break,
                    '"' | '\'' => {
                        let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                        let width = if triple { 3 } else { 1 };
                        for _ in 0..width {
                            code.push(c);
                        }
                        i += width;
                        state = State::Str { quote: c, triple };
                        literal.clear();
                        literal_line = idx + 1;
                        continue;
                    }
                    '(' | '[' | '{' => {
                        brackets.push((c, idx + 1));
                        code.push(c);
                    }
                    ')' | ']' | '}' => {
                        match brackets.pop() {
                            Some((open, _)) if closer_for(open) == c => {}
                            Some((open, _)) => out.issues.push(LexIssue::MismatchedBracket {
                                open,
                                close: c,
                                line: idx + 1,
                            }),
                            None => out.issues.push(LexIssue::UnexpectedClose {
                                close: c,
                                line: idx + 1,
                            }),
                        }
                        code.push(c);
                    }
                    '\\' if i + 1 == chars.len() => {
                        backslash_continues = true;
                    }
                    _ => code.push(c),
                },
                State::Str { quote, triple } => {
                    if c == '\\' {
                        literal.push(c);
                        if let Some(next) = chars.get(i + 1) {
                            literal.push(*next);
                        }
                        i += 2;
                        continue;
                    }
                    let closes = c == quote
                        && (!triple
                            || (chars.get(i + 1) == Some(&quote)
                                && chars.get(i + 2) == Some(&quote)));
                    if closes {
                        let width = if triple { 3 } else { 1 };
                        for _ in 0..width {
                            code.push(quote);
                        }
                        i += width;
                        out.literals.push(Literal {
                            line: literal_line,
                            content: std::mem::take(&mut literal),
                            triple,
                        });
                        state = State::Code;
                        continue;
                    }
                    literal.push(c);
                }
            }
            i += 1;
        }

        match state {
            State::Str { triple: true, .. } => literal.push('\n'),
            State::Str { triple: false, .. } => {
                // A trailing backslash inside a short string joins the next line.
                if raw_line.ends_with('\\') {
                    literal.push('\n');
                } else {
                    out.issues
                        .push(LexIssue::UnterminatedString { line: literal_line });
                    literal.clear();
                    state = State::Code;
                }
            }
            State::Code => {}
        }

        out.lines.push(ScannedLine {
            raw: raw_line.to_string(),
            indent: indent_width(raw_line),
            code,
            continuation,
        });
    }

    if let State::Str { .. } = state {
        out.issues
            .push(LexIssue::UnterminatedString { line: literal_line });
    }
    for (open, line) in brackets {
        out.issues.push(LexIssue::UnclosedBracket { open, line });
    }

    out
}

/// Code of the logical line starting at `start`, with continuation lines
/// appended, and the index one past its last physical line.
pub fn logical_code(lines: &[ScannedLine], start: usize) -> (String, usize) {
    let mut code = lines[start].code.clone();
    let mut end = start + 1;
    while end < lines.len() && lines[end].continuation {
        code.push(' ');
        code.push_str(lines[end].code.trim());
        end += 1;
    }
    (code, end)
}

/// Exclusive end of the block opened by the header at `header`: the next
/// logical line indented at or below the header, with trailing blank lines
/// left outside the block.
pub fn block_end(lines: &[ScannedLine], header: usize) -> usize {
    let indent = lines[header].indent;
    let (_, mut idx) = logical_code(lines, header);
    let mut last_content = idx;
    while idx < lines.len() {
        let line = &lines[idx];
        if line.is_logical_start() && line.indent <= indent {
            break;
        }
        if !line.is_blank() || line.continuation {
            last_content = idx + 1;
        }
        idx += 1;
    }
    last_content
}

pub fn first_word(code: &str) -> &str {
    let trimmed = code.trim_start();
    let end = trimmed
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}

pub fn indent_width(raw: &str) -> usize {
    let mut width = 0usize;
    for c in raw.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            _ => break,
        }
    }
    width
}

fn closer_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}
