//! Go `text/template` syntax on top of the Jinja engine.
//!
//! Templates written for Go (`{{ .config.name }}`, `{{ index .config "a" | default "" }}`,
//! `range`/`with`/`if` blocks, `$` variables) are translated into Jinja source
//! which is then rendered by [`crate::template`]. The template data is the
//! initial dot and is always reachable as `$`.

use crate::template::TemplateError;

/// Variable the template data is bound to in translated templates.
pub(crate) const ROOT: &str = "__root";

const KEYWORDS: &[&str] = &["if", "else", "end", "range", "with", "define", "template", "block", "break", "continue"];

fn err(msg: impl Into<String>) -> TemplateError {
    TemplateError(msg.into())
}

/// True when some action in `source` only makes sense as Go template syntax.
pub fn is_go_template(source: &str) -> bool {
    match actions(source) {
        Ok(actions) => actions.iter().any(|a| looks_like_go(a.body)),
        Err(_) => false,
    }
}

fn looks_like_go(body: &str) -> bool {
    if body.starts_with("/*") {
        return true;
    }
    let first = body.split(|c: char| c.is_whitespace() || c == '(').next().unwrap_or_default();
    if KEYWORDS.contains(&first) {
        return true;
    }
    let mut quote = None;
    let mut prev = ' ';
    for c in body.chars() {
        match quote {
            Some(q) if c == q && prev != '\\' => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' | '`' => quote = Some(c),
                '.' | '$' if prev.is_whitespace() || prev == '(' => return true,
                _ => {}
            },
        }
        prev = c;
    }
    false
}

/// Translates Go template `source` into Jinja source.
pub fn translate(source: &str) -> Result<String, TemplateError> {
    let mut t = Translator {
        out: String::with_capacity(source.len()),
        frames: Vec::new(),
        dots: vec![ROOT.to_string()],
        next_dot: 0,
    };
    let mut pos = 0;
    for action in actions(source)? {
        t.text(&source[pos..action.start]);
        t.action(&action)?;
        pos = action.end;
    }
    t.text(&source[pos..]);
    if let Some(frame) = t.frames.last() {
        return Err(err(format!("unexpected EOF: {{{{ {} }}}} is never closed", frame.block.keyword())));
    }
    Ok(t.out)
}

struct Action<'a> {
    start: usize,
    end: usize,
    body: &'a str,
    trim_left: bool,
    trim_right: bool,
}

fn actions(source: &str) -> Result<Vec<Action<'_>>, TemplateError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(off) = source[pos..].find("{{") {
        let start = pos + off;
        let mut inner = start + 2;
        let trim_left = source[inner..].starts_with('-') && source[inner + 1..].starts_with(char::is_whitespace);
        if trim_left {
            inner += 1;
        }
        let close = find_close(source, inner).ok_or_else(|| err(format!("unclosed action at byte {}", start)))?;
        let raw = &source[inner..close];
        let trim_right = raw.ends_with('-') && raw[..raw.len() - 1].ends_with(char::is_whitespace);
        let body = if trim_right { &raw[..raw.len() - 1] } else { raw };
        out.push(Action { start, end: close + 2, body: body.trim(), trim_left, trim_right });
        pos = close + 2;
    }
    Ok(out)
}

/// Index of the `}}` ending the action whose body starts at `from`.
fn find_close(source: &str, from: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            q @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() && bytes[i] != q {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = source[i + 2..].find("*/").map(|o| i + 2 + o + 1)?;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// `.a.b`; the bare dot has an empty path.
    Field(Vec<String>),
    /// `.a.b` directly after a closing parenthesis.
    Chain(Vec<String>),
    /// `$name.a.b`; `$` alone has an empty name.
    Var(String, Vec<String>),
    Str(String),
    Number(String),
    Ident(String),
    Open,
    Close,
    Pipe,
    Comma,
    Declare,
    Assign,
}

fn read_ident(chars: &[char], i: &mut usize) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.get(*i) {
        if !(c.is_alphanumeric() || c == '_') {
            break;
        }
        name.push(c);
        *i += 1;
    }
    name
}

fn read_path(chars: &[char], i: &mut usize) -> Vec<String> {
    let mut path = Vec::new();
    while chars.get(*i) == Some(&'.') {
        *i += 1;
        let name = read_ident(chars, i);
        if name.is_empty() {
            break;
        }
        path.push(name);
    }
    path
}

fn number(literal: &str) -> Result<String, TemplateError> {
    let clean = literal.replace('_', "");
    let (sign, digits) = match clean.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", clean.strip_prefix('+').unwrap_or(&clean)),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        if let Ok(n) = i64::from_str_radix(hex, 16) {
            return Ok(format!("{}{}", sign, n));
        }
    } else if digits.parse::<i64>().is_ok() || digits.parse::<f64>().is_ok() {
        return Ok(format!("{}{}", sign, digits));
    }
    Err(err(format!("bad number syntax: {:?}", literal)))
}

fn tokenize(body: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = body.chars().collect();
    let digit_at = |i: usize| chars.get(i).is_some_and(|c| c.is_ascii_digit());
    let mut tokens = Vec::new();
    let mut i = 0;
    while let Some(&c) = chars.get(i) {
        match c {
            c if c.is_whitespace() => i += 1,
            '(' | ')' | '|' | ',' | '=' => {
                tokens.push(match c {
                    '(' => Token::Open,
                    ')' => Token::Close,
                    '|' => Token::Pipe,
                    ',' => Token::Comma,
                    _ => Token::Assign,
                });
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Declare);
                i += 2;
            }
            '.' if !digit_at(i + 1) => {
                let after_close = i > 0 && chars[i - 1] == ')';
                let path = read_path(&chars, &mut i);
                tokens.push(if after_close { Token::Chain(path) } else { Token::Field(path) });
            }
            '$' => {
                i += 1;
                let name = read_ident(&chars, &mut i);
                let path = read_path(&chars, &mut i);
                tokens.push(Token::Var(name, path));
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated quoted string")),
                        Some('"') => break,
                        Some('\\') => {
                            s.push(match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some('r') => '\r',
                                Some(&e) if matches!(e, '\\' | '"' | '\'') => e,
                                other => return Err(err(format!("unknown escape sequence \\{}", other.unwrap_or(&' ')))),
                            });
                            i += 2;
                        }
                        Some(&c) => {
                            s.push(c);
                            i += 1;
                        }
                    }
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '`' => {
                let start = i + 1;
                let len = chars[start..].iter().position(|&c| c == '`').ok_or_else(|| err("unterminated raw quoted string"))?;
                tokens.push(Token::Str(chars[start..start + len].iter().collect()));
                i = start + len + 1;
            }
            c if c.is_ascii_digit() || (matches!(c, '-' | '+' | '.') && digit_at(i + 1)) => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_')) {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(number(&literal)?));
            }
            c if c.is_alphabetic() || c == '_' => tokens.push(Token::Ident(read_ident(&chars, &mut i))),
            other => return Err(err(format!("unexpected {:?} in action", other))),
        }
    }
    Ok(tokens)
}

fn quote(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

fn variable(name: &str) -> String {
    if name.is_empty() {
        ROOT.to_string()
    } else {
        format!("__var_{}", name)
    }
}

fn access(base: &str, path: &[String]) -> String {
    let mut out = base.to_string();
    for key in path {
        out.push('[');
        out.push_str(&quote(key));
        out.push(']');
    }
    out
}

/// `$a, $b :=` at the start of `tokens`, with the tokens that follow it.
fn declaration(tokens: &[Token]) -> Option<(Vec<String>, &[Token])> {
    let mut names = Vec::new();
    let mut i = 0;
    loop {
        match tokens.get(i) {
            Some(Token::Var(name, path)) if path.is_empty() && !name.is_empty() => names.push(name.clone()),
            _ => return None,
        }
        match tokens.get(i + 1) {
            Some(Token::Comma) => i += 2,
            Some(Token::Declare | Token::Assign) => return Some((names, &tokens[i + 2..])),
            _ => return None,
        }
    }
}

/// Go builtins without a function of the same name are Jinja operators.
fn call(name: &str, args: Vec<String>) -> Result<String, TemplateError> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(err(format!("wrong number of args for {}: want {} got {}", name, n, args.len())))
        }
    };
    Ok(match name {
        "and" | "or" if !args.is_empty() => format!("({})", args.join(&format!(" {} ", name))),
        "not" => {
            arity(1)?;
            format!("(not {})", args[0])
        }
        "eq" if args.len() >= 2 => {
            let alternatives: Vec<String> = args[1..].iter().map(|a| format!("{} == {}", args[0], a)).collect();
            format!("({})", alternatives.join(" or "))
        }
        "ne" | "lt" | "le" | "gt" | "ge" => {
            arity(2)?;
            let op = match name {
                "ne" => "!=",
                "lt" => "<",
                "le" => "<=",
                "gt" => ">",
                _ => ">=",
            };
            format!("({} {} {})", args[0], op, args[1])
        }
        "len" => {
            arity(1)?;
            format!("({} | length)", args[0])
        }
        "and" | "or" | "eq" => return Err(err(format!("missing arguments for {}", name))),
        _ => format!("{}({})", name, args.join(", ")),
    })
}

enum Term {
    Func(String),
    Expr(String),
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    dot: &'t str,
}

impl<'t> Parser<'t> {
    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        let hit = self.peek() == Some(token);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn pipeline(&mut self) -> Result<String, TemplateError> {
        let first = self.command()?;
        let mut value = self.apply(first, None)?;
        while self.eat(&Token::Pipe) {
            let next = self.command()?;
            value = self.apply(next, Some(value))?;
        }
        Ok(value)
    }

    fn command(&mut self) -> Result<Vec<Term>, TemplateError> {
        let mut terms = Vec::new();
        while let Some(token) = self.peek() {
            if matches!(token, Token::Pipe | Token::Close) {
                break;
            }
            terms.push(self.term()?);
        }
        if terms.is_empty() {
            return Err(err("missing value for command"));
        }
        Ok(terms)
    }

    fn term(&mut self) -> Result<Term, TemplateError> {
        let token = self.peek().ok_or_else(|| err("unexpected end of action"))?;
        self.pos += 1;
        Ok(match token {
            Token::Field(path) => Term::Expr(access(self.dot, path)),
            Token::Var(name, path) => Term::Expr(access(&variable(name), path)),
            Token::Str(s) => Term::Expr(quote(s)),
            Token::Number(n) => Term::Expr(n.clone()),
            Token::Ident(name) => match name.as_str() {
                "true" | "false" => Term::Expr(name.clone()),
                "nil" => Term::Expr("none".into()),
                _ => Term::Func(name.clone()),
            },
            Token::Open => {
                let inner = self.pipeline()?;
                if !self.eat(&Token::Close) {
                    return Err(err("unclosed left paren"));
                }
                let expr = format!("({})", inner);
                match self.peek() {
                    Some(Token::Chain(path)) => {
                        self.pos += 1;
                        Term::Expr(access(&expr, path))
                    }
                    _ => Term::Expr(expr),
                }
            }
            other => return Err(err(format!("unexpected {:?} in operand", other))),
        })
    }

    /// One command of a pipeline; `piped` is the result of the previous one.
    fn apply(&self, terms: Vec<Term>, piped: Option<String>) -> Result<String, TemplateError> {
        let mut terms = terms.into_iter();
        match terms.next() {
            Some(Term::Func(name)) => {
                let mut args = terms
                    .map(|t| match t {
                        Term::Func(f) => call(&f, Vec::new()),
                        Term::Expr(e) => Ok(e),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                args.extend(piped);
                call(&name, args)
            }
            Some(Term::Expr(expr)) if terms.len() == 0 && piped.is_none() => Ok(expr),
            Some(Term::Expr(expr)) => Err(err(format!("can't give argument to non-function {}", expr))),
            None => Err(err("empty command")),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Block {
    If,
    Range,
    With,
}

impl Block {
    fn keyword(self) -> &'static str {
        match self {
            Block::If => "if",
            Block::Range => "range",
            Block::With => "with",
        }
    }
}

struct Frame {
    block: Block,
    /// The block pushed a dot that is still in effect.
    scoped_dot: bool,
}

struct Translator {
    out: String,
    frames: Vec<Frame>,
    dots: Vec<String>,
    next_dot: usize,
}

impl Translator {
    fn dot(&self) -> &str {
        self.dots.last().map(String::as_str).unwrap_or(ROOT)
    }

    fn fresh_dot(&mut self) -> String {
        self.next_dot += 1;
        format!("__dot{}", self.next_dot)
    }

    fn text(&mut self, text: &str) {
        if text.contains("{%") || text.contains("{#") || text.ends_with('{') {
            self.out.push_str("{% raw %}");
            self.out.push_str(text);
            self.out.push_str("{% endraw %}");
        } else {
            self.out.push_str(text);
        }
    }

    fn emit(&mut self, statement: bool, trim_left: bool, body: &str, trim_right: bool) {
        let (open, close) = if statement { ("{%", "%}") } else { ("{{", "}}") };
        self.out.push_str(open);
        if trim_left {
            self.out.push('-');
        }
        self.out.push(' ');
        self.out.push_str(body);
        self.out.push(' ');
        if trim_right {
            self.out.push('-');
        }
        self.out.push_str(close);
    }

    fn tag(&mut self, a: &Action<'_>, body: &str) {
        self.emit(true, a.trim_left, body, a.trim_right);
    }

    fn expression(&self, tokens: &[Token]) -> Result<String, TemplateError> {
        if tokens.is_empty() {
            return Err(err("missing value for command"));
        }
        let mut parser = Parser { tokens, pos: 0, dot: self.dot() };
        let value = parser.pipeline()?;
        match tokens.get(parser.pos) {
            Some(extra) => Err(err(format!("unexpected {:?} in action", extra))),
            None => Ok(value),
        }
    }

    fn action(&mut self, a: &Action<'_>) -> Result<(), TemplateError> {
        if a.body.starts_with("/*") {
            if !a.body.ends_with("*/") {
                return Err(err("comment ends before closing delimiter"));
            }
            if a.trim_left || a.trim_right {
                self.emit(false, a.trim_left, "''", a.trim_right);
            }
            return Ok(());
        }
        let tokens = tokenize(a.body)?;
        match tokens.split_first() {
            Some((Token::Ident(kw), rest)) if KEYWORDS.contains(&kw.as_str()) => self.keyword(a, kw, rest),
            _ => self.plain(a, &tokens),
        }
    }

    fn plain(&mut self, a: &Action<'_>, tokens: &[Token]) -> Result<(), TemplateError> {
        if let Some((names, rest)) = declaration(tokens) {
            let [name] = names.as_slice() else {
                return Err(err("too many declarations in command"));
            };
            let value = self.expression(rest)?;
            self.tag(a, &format!("set {} = {}", variable(name), value));
            return Ok(());
        }
        let value = self.expression(tokens)?;
        self.emit(false, a.trim_left, &value, a.trim_right);
        Ok(())
    }

    fn keyword(&mut self, a: &Action<'_>, kw: &str, rest: &[Token]) -> Result<(), TemplateError> {
        match kw {
            "if" => {
                let cond = self.expression(rest)?;
                self.tag(a, &format!("if {}", cond));
                self.frames.push(Frame { block: Block::If, scoped_dot: false });
            }
            "range" => {
                let (names, source) = declaration(rest).unwrap_or((Vec::new(), rest));
                let source = self.expression(source)?;
                let (head, dot) = match names.as_slice() {
                    [] => {
                        let dot = self.fresh_dot();
                        (format!("for {} in __go_values({})", dot, source), dot)
                    }
                    [elem] => {
                        let dot = variable(elem);
                        (format!("for {} in __go_values({})", dot, source), dot)
                    }
                    [key, elem] => {
                        let dot = variable(elem);
                        (format!("for {}, {} in __go_pairs({})", variable(key), dot, source), dot)
                    }
                    _ => return Err(err("too many declarations in range")),
                };
                self.tag(a, &head);
                self.dots.push(dot);
                self.frames.push(Frame { block: Block::Range, scoped_dot: true });
            }
            "with" => {
                let (names, source) = declaration(rest).unwrap_or((Vec::new(), rest));
                let source = self.expression(source)?;
                let dot = match names.as_slice() {
                    [] => self.fresh_dot(),
                    [name] => variable(name),
                    _ => return Err(err("too many declarations in with")),
                };
                self.emit(true, a.trim_left, &format!("with {} = {}", dot, source), false);
                self.emit(true, false, &format!("if {}", dot), a.trim_right);
                self.dots.push(dot);
                self.frames.push(Frame { block: Block::With, scoped_dot: true });
            }
            "else" => {
                let frame = self.frames.last_mut().ok_or_else(|| err("unexpected {{else}}"))?;
                if frame.scoped_dot {
                    frame.scoped_dot = false;
                    self.dots.pop();
                }
                let block = frame.block;
                match rest.split_first() {
                    None => self.tag(a, "else"),
                    Some((Token::Ident(next), cond)) if next == "if" && block != Block::Range => {
                        let cond = self.expression(cond)?;
                        self.tag(a, &format!("elif {}", cond));
                    }
                    Some(_) => return Err(err(format!("unsupported {{{{else}}}} form in {{{{{}}}}}", block.keyword()))),
                }
            }
            "end" => {
                if !rest.is_empty() {
                    return Err(err("unexpected operand after {{end}}"));
                }
                let frame = self.frames.pop().ok_or_else(|| err("unexpected {{end}}"))?;
                if frame.scoped_dot {
                    self.dots.pop();
                }
                match frame.block {
                    Block::If => self.tag(a, "endif"),
                    Block::Range => self.tag(a, "endfor"),
                    Block::With => {
                        self.emit(true, a.trim_left, "endif", false);
                        self.emit(true, false, "endwith", a.trim_right);
                    }
                }
            }
            other => return Err(err(format!("{{{{{}}}}} is not supported", other))),
        }
        Ok(())
    }
}
