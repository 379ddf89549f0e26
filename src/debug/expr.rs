//! Expression evaluation
//!
//! A small C-like integer expression language used for trace stop
//! conditions, breakpoint-tracking register expressions and the examine
//! view: `$rax+0x10`, `*($rsp+8)`, `main+4`, `$rcx == 3 && $zf`.
//! Arithmetic wraps at 64 bits; comparisons yield 0 or 1.

use thiserror::Error;

use crate::analysis::loader::SymbolTable;
use crate::core::memory::AddressSpace;
use crate::debug::types::RegisterState;

/// Expression errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Unknown register ${0}")]
    UnknownRegister(String),

    #[error("No symbol \"{0}\" in current context")]
    UnknownSymbol(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Cannot access memory at address {0:#x}")]
    Unreadable(u64),
}

/// Name resolution for an expression
pub trait ExprContext {
    fn register(&self, name: &str) -> Option<u64>;

    fn symbol(&self, name: &str) -> Option<u64>;

    /// Pointer-sized load used by the `*` operator
    fn read_word(&self, _address: u64) -> Option<u64> {
        None
    }
}

/// Resolution against the inferior; registers are only available while
/// it is stopped
pub struct TargetContext<'a> {
    pub registers: Option<&'a RegisterState>,
    pub memory: &'a dyn AddressSpace,
    pub symbols: &'a SymbolTable,
}

impl ExprContext for TargetContext<'_> {
    fn register(&self, name: &str) -> Option<u64> {
        self.registers?.get(name)
    }

    fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.lookup(name)
    }

    fn read_word(&self, address: u64) -> Option<u64> {
        self.memory.read_u64(address)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(u64),
    Register(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

const OPERATORS: [&str; 21] = [
    "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+", "-", "*", "/", "%", "&", "|", "^",
    "<", ">", "!", "~", "=",
];

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let is_ident = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@');

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == '$' {
            let start = i + 1;
            i = start;
            while i < chars.len() && is_ident(chars[i]) {
                i += 1;
            }
            if i == start {
                return Err(ExprError::Syntax("register name expected after '$'".into()));
            }
            tokens.push(Token::Register(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Number(parse_number(&text)?));
        } else if is_ident(c) {
            let start = i;
            while i < chars.len() && is_ident(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| ExprError::Syntax(format!("unexpected character '{}'", c)))?;
            if *op == "=" {
                return Err(ExprError::Syntax("assignment is not supported".into()));
            }
            tokens.push(Token::Op(op));
            i += op.len();
        }
    }
    Ok(tokens)
}

/// Parse `0x`-prefixed hex or decimal
pub fn parse_number(text: &str) -> Result<u64, ExprError> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|_| ExprError::Syntax(format!("invalid number \"{}\"", text)))
}

fn binding_power(op: &str) -> Option<u8> {
    Some(match op {
        "||" => 1,
        "&&" => 2,
        "|" => 3,
        "^" => 4,
        "&" => 5,
        "==" | "!=" => 6,
        "<" | "<=" | ">" | ">=" => 7,
        "<<" | ">>" => 8,
        "+" | "-" => 9,
        "*" | "/" | "%" => 10,
        _ => return None,
    })
}

const UNARY_POWER: u8 = 11;

struct Parser<'a, C: ExprContext + ?Sized> {
    tokens: Vec<Token>,
    position: usize,
    context: &'a C,
}

impl<C: ExprContext + ?Sized> Parser<'_, C> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expression(&mut self, min_power: u8) -> Result<u64, ExprError> {
        let mut lhs = self.prefix()?;

        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let Some(power) = binding_power(op) else {
                return Err(ExprError::Syntax(format!("unexpected '{}'", op)));
            };
            if power <= min_power {
                break;
            }
            self.position += 1;
            let rhs = self.expression(power)?;
            lhs = apply(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<u64, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::Register(name)) => self
                .context
                .register(&name)
                .ok_or(ExprError::UnknownRegister(name)),
            Some(Token::Ident(name)) => self
                .context
                .symbol(&name)
                .ok_or(ExprError::UnknownSymbol(name)),
            Some(Token::LParen) => {
                let value = self.expression(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(ExprError::Syntax("missing ')'".into())),
                }
            }
            Some(Token::Op(op)) => {
                let operand = self.expression(UNARY_POWER)?;
                match op {
                    "-" => Ok(operand.wrapping_neg()),
                    "+" => Ok(operand),
                    "!" => Ok((operand == 0) as u64),
                    "~" => Ok(!operand),
                    "*" => self
                        .context
                        .read_word(operand)
                        .ok_or(ExprError::Unreadable(operand)),
                    other => Err(ExprError::Syntax(format!("unexpected '{}'", other))),
                }
            }
            Some(Token::RParen) => Err(ExprError::Syntax("unexpected ')'".into())),
            None => Err(ExprError::Syntax("unexpected end of expression".into())),
        }
    }
}

fn apply(op: &str, lhs: u64, rhs: u64) -> Result<u64, ExprError> {
    Ok(match op {
        "+" => lhs.wrapping_add(rhs),
        "-" => lhs.wrapping_sub(rhs),
        "*" => lhs.wrapping_mul(rhs),
        "/" => lhs.checked_div(rhs).ok_or(ExprError::DivisionByZero)?,
        "%" => lhs.checked_rem(rhs).ok_or(ExprError::DivisionByZero)?,
        "&" => lhs & rhs,
        "|" => lhs | rhs,
        "^" => lhs ^ rhs,
        "<<" => u32::try_from(rhs).ok().and_then(|shift| lhs.checked_shl(shift)).unwrap_or(0),
        ">>" => u32::try_from(rhs).ok().and_then(|shift| lhs.checked_shr(shift)).unwrap_or(0),
        "==" => (lhs == rhs) as u64,
        "!=" => (lhs != rhs) as u64,
        "<" => (lhs < rhs) as u64,
        "<=" => (lhs <= rhs) as u64,
        ">" => (lhs > rhs) as u64,
        ">=" => (lhs >= rhs) as u64,
        "&&" => (lhs != 0 && rhs != 0) as u64,
        "||" => (lhs != 0 || rhs != 0) as u64,
        other => return Err(ExprError::Syntax(format!("unknown operator '{}'", other))),
    })
}

/// Evaluate `input` against `context`
pub fn evaluate<C: ExprContext + ?Sized>(input: &str, context: &C) -> Result<u64, ExprError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExprError::Syntax("empty expression".into()));
    }
    let mut parser = Parser {
        tokens,
        position: 0,
        context,
    };
    let value = parser.expression(0)?;
    if parser.position < parser.tokens.len() {
        return Err(ExprError::Syntax("trailing input".into()));
    }
    Ok(value)
}

/// Evaluate a condition; any non-zero value holds
pub fn condition_holds<C: ExprContext + ?Sized>(input: &str, context: &C) -> Result<bool, ExprError> {
    evaluate(input, context).map(|value| value != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fixed {
        registers: HashMap<&'static str, u64>,
        symbols: HashMap<&'static str, u64>,
        words: HashMap<u64, u64>,
    }

    impl ExprContext for Fixed {
        fn register(&self, name: &str) -> Option<u64> {
            self.registers.get(name).copied()
        }
        fn symbol(&self, name: &str) -> Option<u64> {
            self.symbols.get(name).copied()
        }
        fn read_word(&self, address: u64) -> Option<u64> {
            self.words.get(&address).copied()
        }
    }

    fn context() -> Fixed {
        Fixed {
            registers: HashMap::from([("rax", 0x10), ("rcx", 3)]),
            symbols: HashMap::from([("main", 0x401000), ("puts@plt", 0x401030)]),
            words: HashMap::from([(0x18, 0xdead)]),
        }
    }

    #[test]
    fn test_precedence_and_registers() {
        let ctx = context();
        assert_eq!(evaluate("$rax+2*4", &ctx), Ok(0x18));
        assert_eq!(evaluate("($rax+2)*4", &ctx), Ok(0x48));
        assert_eq!(evaluate("main+0x4", &ctx), Ok(0x401004));
        assert_eq!(evaluate("puts@plt", &ctx), Ok(0x401030));
        assert_eq!(evaluate("-1", &ctx), Ok(u64::MAX));
        assert_eq!(evaluate("1 << 4 | 1", &ctx), Ok(0x11));
    }

    #[test]
    fn test_oversized_shifts_clear_the_value() {
        let ctx = context();
        assert_eq!(evaluate("1 << 0x100000000", &ctx), Ok(0));
        assert_eq!(evaluate("0x8000 >> 0x100000001", &ctx), Ok(0));
        assert_eq!(evaluate("1 << 64", &ctx), Ok(0));
        assert_eq!(evaluate("1 << 63", &ctx), Ok(1 << 63));
    }

    #[test]
    fn test_conditions() {
        let ctx = context();
        assert_eq!(condition_holds("$rcx == 3", &ctx), Ok(true));
        assert_eq!(condition_holds("$rcx == 3 && $rax < 0x10", &ctx), Ok(false));
        assert_eq!(condition_holds("!$rcx || $rax >= 16", &ctx), Ok(true));
    }

    #[test]
    fn test_dereference() {
        let ctx = context();
        assert_eq!(evaluate("*($rax+8)", &ctx), Ok(0xdead));
        assert_eq!(evaluate("*0x20", &ctx), Err(ExprError::Unreadable(0x20)));
    }

    #[test]
    fn test_errors() {
        let ctx = context();
        assert_eq!(
            evaluate("$rzz", &ctx),
            Err(ExprError::UnknownRegister("rzz".into()))
        );
        assert_eq!(
            evaluate("nowhere+1", &ctx),
            Err(ExprError::UnknownSymbol("nowhere".into()))
        );
        assert_eq!(evaluate("4/0", &ctx), Err(ExprError::DivisionByZero));
        assert!(matches!(evaluate("(1+2", &ctx), Err(ExprError::Syntax(_))));
        assert!(matches!(evaluate("", &ctx), Err(ExprError::Syntax(_))));
        assert!(matches!(evaluate("0xzz", &ctx), Err(ExprError::Syntax(_))));
        assert!(matches!(evaluate("$rax = 1", &ctx), Err(ExprError::Syntax(_))));
    }
}
