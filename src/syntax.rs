//! Cheap static checks run before any render time is spent.

use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::scan::{self, LexIssue, ScannedLine};

const BLOCK_KEYWORDS: &[&str] = &[
    "class", "def", "if", "elif", "else", "for", "while", "with", "try", "except", "finally",
    "async",
];

/// Open a block only when the line is a header (`match x:`); otherwise they
/// are ordinary names.
const SOFT_BLOCK_KEYWORDS: &[&str] = &["match", "case"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyntaxIssue {
    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },
    #[error("line {line}: '{open}' was never closed")]
    UnclosedBracket { open: char, line: usize },
    #[error("line {line}: unmatched '{close}'")]
    UnexpectedClose { close: char, line: usize },
    #[error("line {line}: closing '{close}' does not match '{open}'")]
    MismatchedBracket { open: char, close: char, line: usize },
    #[error("line {line}: expected ':' after '{keyword}' statement")]
    MissingColon { keyword: String, line: usize },
    #[error("line {line}: expected an indented block")]
    ExpectedIndent { line: usize },
    #[error("line {line}: unexpected indent")]
    UnexpectedIndent { line: usize },
    #[error("line {line}: unindent does not match any outer indentation level")]
    InconsistentDedent { line: usize },
    #[error("external syntax check failed: {0}")]
    External(String),
}

impl From<LexIssue> for SyntaxIssue {
    fn from(issue: LexIssue) -> Self {
        match issue {
            LexIssue::UnterminatedString { line } => SyntaxIssue::UnterminatedString { line },
            LexIssue::UnclosedBracket { open, line } => SyntaxIssue::UnclosedBracket { open, line },
            LexIssue::UnexpectedClose { close, line } => {
                SyntaxIssue::UnexpectedClose { close, line }
            }
            LexIssue::MismatchedBracket { open, close, line } => {
                SyntaxIssue::MismatchedBracket { open, close, line }
            }
        }
    }
}

/// Structural validity: balanced brackets, terminated strings, block headers
/// ending in `:` and followed by an indented body, consistent indentation.
/// Returns the first problem found.
pub fn check(source: &str) -> Result<(), SyntaxIssue> {
    let scanned = scan::scan(source);
    if let Some(issue) = scanned.issues.into_iter().next() {
        return Err(issue.into());
    }
    check_blocks(&scanned.lines)
}

fn check_blocks(lines: &[ScannedLine]) -> Result<(), SyntaxIssue> {
    let mut levels = vec![0usize];
    let mut pending_block: Option<usize> = None;
    let mut idx = 0usize;

    while idx < lines.len() {
        let line = &lines[idx];
        if !line.is_logical_start() {
            idx += 1;
            continue;
        }
        let number = idx + 1;
        let current = *levels.last().unwrap_or(&0);

        if let Some(header_line) = pending_block.take() {
            if line.indent <= current {
                return Err(SyntaxIssue::ExpectedIndent { line: header_line });
            }
            levels.push(line.indent);
        } else if line.indent > current {
            return Err(SyntaxIssue::UnexpectedIndent { line: number });
        } else if line.indent < current {
            while levels.last().is_some_and(|level| *level > line.indent) {
                levels.pop();
            }
            if levels.last() != Some(&line.indent) {
                return Err(SyntaxIssue::InconsistentDedent { line: number });
            }
        }

        let (code, end) = scan::logical_code(lines, idx);
        let keyword = line.first_word();
        if BLOCK_KEYWORDS.contains(&keyword) && is_block_header(keyword, &code) {
            match header_colon(&code) {
                Some(pos) if code[pos + 1..].trim().is_empty() => pending_block = Some(number),
                Some(_) => {}
                None => {
                    return Err(SyntaxIssue::MissingColon {
                        keyword: keyword.to_string(),
                        line: number,
                    });
                }
            }
        } else if SOFT_BLOCK_KEYWORDS.contains(&keyword)
            && let Some(pos) = header_colon(&code)
            && code[pos + 1..].trim().is_empty()
            && opens_soft_block(keyword, &code[..pos])
        {
            pending_block = Some(number);
        }
        idx = end;
    }

    match pending_block {
        Some(line) => Err(SyntaxIssue::ExpectedIndent { line }),
        None => Ok(()),
    }
}

/// `match x:` has a subject after the keyword; `match: int` and
/// `match = {}` do not.
fn opens_soft_block(keyword: &str, head: &str) -> bool {
    let subject = head.trim_start()[keyword.len()..].trim();
    !subject.is_empty() && !subject.starts_with('=') && !subject.starts_with('.')
}

/// `async` only opens a block in front of `def`, `for` or `with`.
fn is_block_header(keyword: &str, code: &str) -> bool {
    if keyword != "async" {
        return true;
    }
    let rest = code.trim_start()["async".len()..].trim_start();
    matches!(scan::first_word(rest), "def" | "for" | "with")
}

/// Byte offset of the block colon: the first `:` outside brackets that is
/// neither part of `:=` nor the end of a lambda parameter list.
fn header_colon(code: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut lambdas = 0usize;
    let bytes = code.as_bytes();
    for (pos, ch) in code.char_indices() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ':' if depth == 0 => {
                // `:=` is an assignment expression, not a block colon.
                if bytes.get(pos + 1) == Some(&b'=') {
                    continue;
                }
                if lambdas > 0 {
                    lambdas -= 1;
                    continue;
                }
                return Some(pos);
            }
            'l' if depth == 0 && code[pos..].starts_with("lambda") => {
                let before = code[..pos].chars().last();
                let after = code[pos + "lambda".len()..].chars().next();
                let bounded = |c: Option<char>| c.is_none_or(|c| !(c.is_alphanumeric() || c == '_'));
                if bounded(before) && bounded(after) {
                    lambdas += 1;
                }
            }
            _ => {}
        }
    }
    None
}

/// Runs a configured external checker (e.g. `python3 -m py_compile`) with
/// the file path appended.
pub fn check_external(command: &[String], file: &Path) -> Result<(), SyntaxIssue> {
    let Some((program, args)) = command.split_first() else {
        return Ok(());
    };
    let output = Command::new(program)
        .args(args)
        .arg(file)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| SyntaxIssue::External(format!("failed to spawn '{program}': {err}")))?;
    if output.status.success() {
        Ok(())
    } else {
        let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if detail.is_empty() {
            detail = format!("exit status {:?}", output.status.code());
        }
        Err(SyntaxIssue::External(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_scene() {
        let source = "from manim import *\n\nclass Demo(Scene):\n    \"\"\"Doc.\"\"\"\n    def construct(self):\n        items = [\n            Circle(),\n        ]\n        if items: self.add(*items)\n        f = lambda x: x\n        self.play(Create(items[0]))\n\n\nif __name__ == '__main__':\n    Demo().render()\n";
        assert_eq!(check(source), Ok(()));
    }

    #[test]
    fn rejects_missing_colon() {
        let err = check("class Demo(Scene)\n    pass\n").unwrap_err();
        assert_eq!(
            err,
            SyntaxIssue::MissingColon {
                keyword: "class".into(),
                line: 1
            }
        );
    }

    #[test]
    fn rejects_header_without_body() {
        assert_eq!(
            check("def construct(self):\n\nx = 1\n"),
            Err(SyntaxIssue::ExpectedIndent { line: 1 })
        );
        assert_eq!(
            check("def construct(self):\n"),
            Err(SyntaxIssue::ExpectedIndent { line: 1 })
        );
    }

    #[test]
    fn rejects_indentation_errors() {
        assert_eq!(
            check("x = 1\n    y = 2\n"),
            Err(SyntaxIssue::UnexpectedIndent { line: 2 })
        );
        assert_eq!(
            check("if x:\n        a = 1\n    b = 2\n"),
            Err(SyntaxIssue::InconsistentDedent { line: 3 })
        );
    }

    #[test]
    fn rejects_lexical_errors() {
        assert!(matches!(
            check("self.play(Write(t)\n"),
            Err(SyntaxIssue::UnclosedBracket { open: '(', .. })
        ));
        assert!(matches!(
            check("t = Text('oops)\n"),
            Err(SyntaxIssue::UnterminatedString { line: 1 })
        ));
    }

    #[test]
    fn walrus_and_slices_are_not_headers() {
        assert_eq!(check("if (n := 3):\n    pass\nx = y[1:2]\n"), Ok(()));
        assert_eq!(check("while n := next_value():\n    pass\n"), Ok(()));
    }

    #[test]
    fn match_statements_open_blocks() {
        let source = "match command.split():\n    case [\"go\", direction]:\n        move(direction)\n    case _:\n        pass\n";
        assert_eq!(check(source), Ok(()));
        assert_eq!(check("match x:\n    case 1:\n        pass\n"), Ok(()));
        assert_eq!(check("match x:\n    case 1: pass\n"), Ok(()));
        assert_eq!(
            check("match x:\ny = 1\n"),
            Err(SyntaxIssue::ExpectedIndent { line: 1 })
        );
    }

    #[test]
    fn match_and_case_remain_plain_names() {
        assert_eq!(check("match = re.match(p, s)\ncase = 3\nmatch.group(0)\n"), Ok(()));
        assert_eq!(check("match: int = 1\n"), Ok(()));
    }
}
