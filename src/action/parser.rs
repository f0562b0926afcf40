//! Lexical parser for the two action-call shapes of spec §4.5:
//! `do(action="<verb>", <kwargs>)` and `finish(message="<text>")`.
//!
//! This is deliberately NOT an expression evaluator (spec §9 "Dynamic-call
//! parsing" design note) — just a hand-rolled tokenizer, character-by-
//! character with explicit depth/quote tracking, recognizing a fixed
//! grammar and rejecting anything else as `MalformedResponse`.

use super::types::{Action, RelPoint};
use crate::errors::AgentError;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Point(i32, i32),
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(text: &str) -> Self {
        Self { chars: text.chars().collect(), pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn expect(&mut self, expected: char) -> Result<(), AgentError> {
        self.skip_ws();
        if self.bump() == Some(expected) {
            Ok(())
        } else {
            Err(malformed(format!("expected '{expected}'")))
        }
    }

    fn parse_ident(&mut self) -> Option<String> {
        self.skip_ws();
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        if self.pos == start {
            None
        } else {
            Some(self.chars[start..self.pos].iter().collect())
        }
    }

    fn parse_string(&mut self) -> Result<String, AgentError> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(malformed("unterminated string")),
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => return Err(malformed("unterminated escape")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_int(&mut self) -> Result<i32, AgentError> {
        self.skip_ws();
        let start = self.pos;
        if matches!(self.peek(), Some('-')) {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(malformed("expected integer"));
        }
        self.chars[start..self.pos]
            .iter()
            .collect::<String>()
            .parse()
            .map_err(|_| malformed("invalid integer"))
    }

    fn parse_point(&mut self) -> Result<(i32, i32), AgentError> {
        self.expect('[')?;
        let x = self.parse_int()?;
        self.skip_ws();
        self.expect(',')?;
        let y = self.parse_int()?;
        self.skip_ws();
        self.expect(']')?;
        Ok((x, y))
    }

    fn parse_value(&mut self) -> Result<Value, AgentError> {
        self.skip_ws();
        match self.peek() {
            Some('"') => Ok(Value::Str(self.parse_string()?)),
            Some('[') => {
                let (x, y) = self.parse_point()?;
                Ok(Value::Point(x, y))
            }
            _ => Err(malformed("expected string or [x,y] value")),
        }
    }

    fn parse_kwargs(&mut self) -> Result<HashMap<String, Value>, AgentError> {
        let mut kwargs = HashMap::new();
        self.skip_ws();
        if self.peek() == Some(')') {
            return Ok(kwargs);
        }
        loop {
            let key = self.parse_ident().ok_or_else(|| malformed("expected kwarg name"))?;
            self.expect('=')?;
            let value = self.parse_value()?;
            kwargs.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                    self.skip_ws();
                }
                Some(')') => break,
                _ => return Err(malformed("expected ',' or ')'")),
            }
        }
        Ok(kwargs)
    }
}

fn malformed(msg: impl Into<String>) -> AgentError {
    AgentError::MalformedResponse(msg.into())
}

fn take_str(kwargs: &HashMap<String, Value>, key: &str) -> Result<String, AgentError> {
    match kwargs.get(key) {
        Some(Value::Str(s)) => Ok(s.clone()),
        Some(_) => Err(malformed(format!("kwarg '{key}' must be a string"))),
        None => Err(malformed(format!("missing required kwarg '{key}'"))),
    }
}

fn take_point(kwargs: &HashMap<String, Value>, key: &str) -> Result<RelPoint, AgentError> {
    match kwargs.get(key) {
        Some(Value::Point(x, y)) => Ok(RelPoint::new(*x, *y)),
        Some(_) => Err(malformed(format!("kwarg '{key}' must be [x,y]"))),
        None => Err(malformed(format!("missing required kwarg '{key}'"))),
    }
}

/// Parses `"N seconds"`-style durations. Leading numeric portion (int or
/// decimal) is read; trailing unit text is ignored.
fn parse_duration(text: &str) -> Result<Duration, AgentError> {
    let numeric: String = text
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let seconds: f64 = numeric.parse().map_err(|_| malformed(format!("invalid duration: {text}")))?;
    Ok(Duration::from_millis((seconds * 1000.0) as u64))
}

pub fn parse(action_text: &str) -> Result<Action, AgentError> {
    let text = action_text.trim();
    let mut lexer = Lexer::new(text);
    let name = lexer.parse_ident().ok_or_else(|| malformed("expected a function call"))?;
    lexer.expect('(')?;
    let kwargs = lexer.parse_kwargs()?;
    lexer.expect(')')?;
    lexer.skip_ws();
    if !lexer.at_end() {
        return Err(malformed("trailing characters after call"));
    }

    match name.as_str() {
        "finish" => Ok(Action::Finish { message: take_str(&kwargs, "message")? }),
        "do" => {
            let verb = take_str(&kwargs, "action")?;
            match verb.as_str() {
                "Launch" => Ok(Action::Launch { app: take_str(&kwargs, "app")? }),
                "Tap" => Ok(Action::Tap {
                    point: take_point(&kwargs, "element")?,
                    sensitive_message: kwargs.get("message").and_then(|v| match v {
                        Value::Str(s) => Some(s.clone()),
                        _ => None,
                    }),
                }),
                "DoubleTap" => Ok(Action::DoubleTap { point: take_point(&kwargs, "element")? }),
                "LongPress" => Ok(Action::LongPress { point: take_point(&kwargs, "element")? }),
                "Swipe" => Ok(Action::Swipe {
                    start: take_point(&kwargs, "start")?,
                    end: take_point(&kwargs, "end")?,
                }),
                "Type" => Ok(Action::Type { text: take_str(&kwargs, "text")? }),
                "Back" => Ok(Action::Back),
                "Home" => Ok(Action::Home),
                "Wait" => Ok(Action::Wait { duration: parse_duration(&take_str(&kwargs, "duration")?)? }),
                "TakeOver" => Ok(Action::TakeOver { message: take_str(&kwargs, "message")? }),
                other => Err(malformed(format!("unknown verb: {other}"))),
            }
        }
        other => Err(malformed(format!("unknown call: {other}"))),
    }
}
