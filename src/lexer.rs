//! Lexical analysis for the shell's input line.
//!
//! The lexer is deliberately small: words are separated by whitespace, and a
//! handful of operators are split out of the surrounding text even when no
//! whitespace separates them (`ls 2>/dev/null` gives `ls`, `2>`, `/dev/null`).
//! Quote characters have no special meaning here; consumers that care about
//! quoting (like `export` or `cd`) strip quotes themselves.

use std::fmt;

/// One command invocation: the command name at index 0, followed by its arguments.
pub type ArgumentVector = Vec<String>;

/// The commands of one input line, split on top-level `;`.
pub type CommandGroup = Vec<ArgumentVector>;

/// Operators recognised by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Command separator, `;`.
    Separator,
    /// The pipe operator, `|`.
    Pipe,
    /// Output redirection, `>`.
    RedirectOut,
    /// Appending output redirection, `>>`.
    Append,
    /// Input redirection, `<`.
    RedirectIn,
    /// Input redirection written as `<<`.
    HereIn,
    /// Descriptor-prefixed output redirection such as `2>` or `2>>`.
    Descriptor { fd: u8, append: bool },
}

impl Operator {
    /// Classify a whole string as an operator, if it is one.
    ///
    /// Used by stages after lexing, which only see plain strings.
    pub fn parse(text: &str) -> Option<Self> {
        let chars: Vec<char> = text.chars().collect();
        match match_operator(&chars, 0) {
            Some((op, len)) if len == chars.len() => Some(op),
            _ => None,
        }
    }

    /// Textual form of the operator, exactly as it would be lexed.
    pub fn as_string(&self) -> String {
        match self {
            Operator::Separator => ";".to_string(),
            Operator::Pipe => "|".to_string(),
            Operator::RedirectOut => ">".to_string(),
            Operator::Append => ">>".to_string(),
            Operator::RedirectIn => "<".to_string(),
            Operator::HereIn => "<<".to_string(),
            Operator::Descriptor { fd, append } => {
                format!("{}{}", fd, if *append { ">>" } else { ">" })
            }
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// A lexical unit: either a word or an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    Operator(Operator),
}

impl Token {
    /// Text of the token as it appears in an argument vector.
    pub fn into_text(self) -> String {
        match self {
            Token::Word(w) => w,
            Token::Operator(op) => op.as_string(),
        }
    }

    fn is_separator(&self) -> bool {
        matches!(self, Token::Operator(Operator::Separator))
    }
}

/// Longest operator starting at `pos`, together with its length in chars.
fn match_operator(input: &[char], pos: usize) -> Option<(Operator, usize)> {
    let at = |i: usize| input.get(pos + i).copied();
    match at(0)? {
        ';' => Some((Operator::Separator, 1)),
        '|' => Some((Operator::Pipe, 1)),
        '>' if at(1) == Some('>') => Some((Operator::Append, 2)),
        '>' => Some((Operator::RedirectOut, 1)),
        '<' if at(1) == Some('<') => Some((Operator::HereIn, 2)),
        '<' => Some((Operator::RedirectIn, 1)),
        c if c.is_ascii_digit() && at(1) == Some('>') => {
            let fd = c.to_digit(10)? as u8;
            let append = at(2) == Some('>');
            Some((Operator::Descriptor { fd, append }, if append { 3 } else { 2 }))
        }
        _ => None,
    }
}

struct Scanner {
    input: Vec<char>,
    pos: usize,
    buffer: String,
    out: Vec<Token>,
}

impl Scanner {
    fn new(line: &str) -> Self {
        Scanner {
            input: line.chars().collect(),
            pos: 0,
            buffer: String::new(),
            out: Vec::new(),
        }
    }

    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.out.push(Token::Word(std::mem::take(&mut self.buffer)));
        }
    }

    fn make_tokens(mut self) -> Vec<Token> {
        while let Some(&ch) = self.input.get(self.pos) {
            if ch.is_whitespace() {
                self.flush();
                self.pos += 1;
            } else if let Some((op, len)) = match_operator(&self.input, self.pos) {
                self.flush();
                self.out.push(Token::Operator(op));
                self.pos += len;
            } else {
                self.buffer.push(ch);
                self.pos += 1;
            }
        }
        self.flush();
        self.out
    }
}

fn lowercase_name(argv: &mut ArgumentVector) {
    if let Some(name) = argv.first_mut() {
        *name = name.to_lowercase();
    }
}

/// Split a raw line into classified tokens.
pub fn lex(line: &str) -> Vec<Token> {
    Scanner::new(line).make_tokens()
}

/// Turn a raw line into a single argument vector.
///
/// Operators are kept as separate elements. Only the first element is
/// lower-cased; arguments, operators and paths keep their original casing.
///
/// ```
/// use flux_shell::lexer::tokenize;
/// assert_eq!(tokenize("LS -R"), vec!["ls", "-R"]);
/// ```
pub fn tokenize(line: &str) -> ArgumentVector {
    let mut argv: ArgumentVector = lex(line).into_iter().map(Token::into_text).collect();
    lowercase_name(&mut argv);
    argv
}

/// Split a raw line into the commands separated by `;`.
///
/// Leading, trailing and repeated separators never produce empty commands.
pub fn split_commands(line: &str) -> CommandGroup {
    let mut group = CommandGroup::new();
    let mut current = ArgumentVector::new();

    for token in lex(line) {
        if token.is_separator() {
            if !current.is_empty() {
                group.push(std::mem::take(&mut current));
            }
        } else {
            current.push(token.into_text());
        }
    }
    if !current.is_empty() {
        group.push(current);
    }

    for argv in group.iter_mut() {
        lowercase_name(argv);
    }
    group
}

/// Drop one leading and one trailing `"`, for consumers that accept quoted values.
pub fn strip_quotes(word: &str) -> &str {
    let word = word.strip_prefix('"').unwrap_or(word);
    word.strip_suffix('"').unwrap_or(word)
}
