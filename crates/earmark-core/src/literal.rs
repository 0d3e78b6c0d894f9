use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LiteralError {
    #[error("Unexpected end of input at position {0}")]
    UnexpectedEnd(usize),
    #[error("Unexpected character '{found}' at position {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("Unknown word '{word}' at position {offset}")]
    UnknownWord { word: String, offset: usize },
    #[error("Invalid number '{text}' at position {offset}")]
    InvalidNumber { text: String, offset: usize },
    #[error("Invalid escape sequence at position {0}")]
    InvalidEscape(usize),
    #[error("Dictionary key at position {0} is not a string")]
    NonStringKey(usize),
    #[error("Trailing characters after value at position {0}")]
    TrailingInput(usize),
}

pub type LiteralResult<T> = Result<T, LiteralError>;

/// Parse a permissive literal into JSON.
///
/// Accepts strict JSON plus the relaxations seen in exported store dumps:
/// single-quoted strings, capitalized `True`/`False`/`None` constants, and
/// trailing commas inside containers. Positions in errors count characters,
/// not bytes.
pub fn parse(input: &str) -> LiteralResult<Value> {
    let mut reader = Reader::new(input);
    reader.skip_whitespace();
    let value = reader.read_value()?;
    reader.skip_whitespace();
    if reader.peek().is_some() {
        return Err(LiteralError::TrailingInput(reader.pos));
    }
    Ok(value)
}

struct Reader {
    chars: Vec<char>,
    pos: usize,
}

impl Reader {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
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

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> LiteralResult<()> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(LiteralError::UnexpectedChar {
                found: c,
                offset: self.pos - 1,
            }),
            None => Err(LiteralError::UnexpectedEnd(self.pos)),
        }
    }

    fn read_value(&mut self) -> LiteralResult<Value> {
        match self.peek() {
            Some('{') => self.read_dict(),
            Some('[') => self.read_list(),
            Some('\'' | '"') => self.read_string().map(Value::String),
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() => self.read_number(),
            Some(c) if c.is_alphabetic() => self.read_word(),
            Some(c) => Err(LiteralError::UnexpectedChar {
                found: c,
                offset: self.pos,
            }),
            None => Err(LiteralError::UnexpectedEnd(self.pos)),
        }
    }

    fn read_dict(&mut self) -> LiteralResult<Value> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('}') => {
                    self.pos += 1;
                    break;
                }
                Some('\'' | '"') => {}
                Some(_) => return Err(LiteralError::NonStringKey(self.pos)),
                None => return Err(LiteralError::UnexpectedEnd(self.pos)),
            }
            let key = self.read_string()?;
            self.skip_whitespace();
            self.expect(':')?;
            self.skip_whitespace();
            let value = self.read_value()?;
            map.insert(key, value);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some('}') => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    return Err(LiteralError::UnexpectedChar {
                        found: c,
                        offset: self.pos,
                    })
                }
                None => return Err(LiteralError::UnexpectedEnd(self.pos)),
            }
        }
        Ok(Value::Object(map))
    }

    fn read_list(&mut self) -> LiteralResult<Value> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(']') => {
                    self.pos += 1;
                    break;
                }
                None => return Err(LiteralError::UnexpectedEnd(self.pos)),
                Some(_) => {}
            }
            items.push(self.read_value()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(']') => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    return Err(LiteralError::UnexpectedChar {
                        found: c,
                        offset: self.pos,
                    })
                }
                None => return Err(LiteralError::UnexpectedEnd(self.pos)),
            }
        }
        Ok(Value::Array(items))
    }

    fn read_string(&mut self) -> LiteralResult<String> {
        let quote = match self.bump() {
            Some(c @ ('\'' | '"')) => c,
            Some(c) => {
                return Err(LiteralError::UnexpectedChar {
                    found: c,
                    offset: self.pos - 1,
                })
            }
            None => return Err(LiteralError::UnexpectedEnd(self.pos)),
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => break,
                Some('\\') => out.push(self.read_escape()?),
                Some(c) => out.push(c),
                None => return Err(LiteralError::UnexpectedEnd(self.pos)),
            }
        }
        Ok(out)
    }

    fn read_escape(&mut self) -> LiteralResult<char> {
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('0') => Ok('\0'),
            Some('u') => self.read_hex_escape(4),
            Some('x') => self.read_hex_escape(2),
            // Quotes, backslashes, and anything unrecognized pass through.
            Some(c) => Ok(c),
            None => Err(LiteralError::UnexpectedEnd(self.pos)),
        }
    }

    fn read_hex_escape(&mut self, digits: usize) -> LiteralResult<char> {
        let start = self.pos;
        let mut code = 0u32;
        for _ in 0..digits {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or(LiteralError::InvalidEscape(start))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or(LiteralError::InvalidEscape(start))
    }

    fn read_number(&mut self) -> LiteralResult<Value> {
        let start = self.pos;
        let mut text = String::new();
        if matches!(self.peek(), Some('-' | '+')) {
            if self.peek() == Some('-') {
                text.push('-');
            }
            self.pos += 1;
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
        {
            // '+'/'-' only continue a number right after an exponent marker.
            if matches!(self.peek(), Some('+' | '-'))
                && !matches!(text.chars().last(), Some('e' | 'E'))
            {
                break;
            }
            text.push(self.chars[self.pos]);
            self.pos += 1;
        }
        let invalid = || LiteralError::InvalidNumber {
            text: text.clone(),
            offset: start,
        };
        if text.contains(['.', 'e', 'E']) {
            let parsed: f64 = text.parse().map_err(|_| invalid())?;
            let number = Number::from_f64(parsed).ok_or_else(invalid)?;
            Ok(Value::Number(number))
        } else {
            let parsed: i64 = text.parse().map_err(|_| invalid())?;
            Ok(Value::Number(Number::from(parsed)))
        }
    }

    fn read_word(&mut self) -> LiteralResult<Value> {
        let start = self.pos;
        let mut word = String::new();
        while self.peek().is_some_and(char::is_alphabetic) {
            word.push(self.chars[self.pos]);
            self.pos += 1;
        }
        match word.as_str() {
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            "None" | "null" => Ok(Value::Null),
            _ => Err(LiteralError::UnknownWord {
                word,
                offset: start,
            }),
        }
    }
}
