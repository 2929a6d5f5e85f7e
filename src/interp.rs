use crate::{*, error::*, types::*, expr::*};
use std::{collections::HashMap, ops::Range};

// Turns expression text into a typed value. The view-rule pipeline only talks to this trait: root expressions,
// array(N) sizes and wrap() substitutions all go through it.
pub trait ExpressionEvaluator: Send + Sync {
    fn eval(&self, text: &str, cx: &mut EvalContext) -> Result<Value>;
}

// Small expression language for watches: variables, integer literals, field access, indexing, pointer arithmetic, casts.
// Variables are bound up front (in a debugger, they'd come from the current stack frame's debug info).
#[derive(Default)]
pub struct WatchInterpreter {
    pub variables: HashMap<String, Value>,
}

impl WatchInterpreter {
    pub fn new() -> Self { Self::default() }

    pub fn add_variable(&mut self, name: &str, v: Value) { self.variables.insert(name.to_string(), v); }
}

impl ExpressionEvaluator for WatchInterpreter {
    fn eval(&self, text: &str, cx: &mut EvalContext) -> Result<Value> {
        let expr = parse_watch_expression(text)?;
        eval_expression(&expr, expr.root, &self.variables, cx)
    }
}

pub struct Expression {
    ast: Vec<ASTNode>,
    root: ASTIdx,
}

pub fn parse_watch_expression(s: &str) -> Result<Expression> {
    let mut lex = Lexer {input: InputStream {input: s, pos: 0}, next_tokens: Vec::new()};
    let mut expr = Expression {ast: Vec::new(), root: ASTIdx(0)};
    let root = parse_expression(&mut lex, &mut expr, Precedence::Weakest, 0)?;
    expr.root = root;
    let (r, t) = lex.peek(1)?;
    if !t.is_eof() {
        return err!(Syntax, "unexpected {:?} after expression at {}", t, r.start);
    }
    Ok(expr)
}

// Make expression suitable for appending things like "[5]" or ".foo" to it. Used for building child rows' expressions.
pub fn adjust_expression_for_appending_child_path(expr_str: &str) -> String {
    let parentheses = match parse_watch_expression(expr_str) {
        Ok(expr) => match &expr.ast[expr.root.0].a {
            AST::Literal(_) | AST::Variable(_) | AST::Field {..} | AST::Index => false,
            AST::UnaryOperator(_) | AST::BinaryOperator(_) | AST::TypeCast(_) => true,
        }
        Err(_) => true,
    };
    if parentheses {
        format!("({})", expr_str)
    } else {
        expr_str.to_string()
    }
}

pub fn child_path_field(parent: &str, field: &str) -> String { format!("{}.{}", adjust_expression_for_appending_child_path(parent), field) }
pub fn child_path_index(parent: &str, idx: usize) -> String { format!("{}[{}]", adjust_expression_for_appending_child_path(parent), idx) }
pub fn child_path_deref(parent: &str) -> String { format!("*{}", adjust_expression_for_appending_child_path(parent)) }

// Expression for an object at a fixed address, e.g. a linked list node that has no path from the root expression.
pub fn expression_for_address(addr: usize, type_name: &str) -> String { format!("*(0x{:x} as *{})", addr, type_name) }

fn eval_expression(expr: &Expression, node_idx: ASTIdx, vars: &HashMap<String, Value>, cx: &mut EvalContext) -> Result<Value> {
    let node = &expr.ast[node_idx.0];
    let b = cx.types.builtins();
    Ok(match &node.a {
        AST::Literal(x) => Value::blob(ValueBlob::new(*x), b.i64_),
        AST::Variable(name) => match vars.get(name) {
            Some(v) => v.clone(),
            None => return err!(NoVariable, "no variable '{}'", name),
        }
        AST::Field {name, arrow} => {
            let mut v = eval_expression(expr, node.children[0], vars, cx)?;
            // '.' auto-dereferences pointers, '->' requires one.
            if *arrow || cx.types.get(v.type_).t.as_pointer().is_some() {
                v = deref_pointer(&v, &cx.types, &mut cx.memory)?;
            }
            let field = match &cx.types.get(v.type_).t {
                Type::Struct(s) => match s.field_by_name(name) {
                    Some(f) => f.clone(),
                    None => return err!(NoVariable, "no field '{}' in {}", name, cx.types.type_name(v.type_)),
                }
                _ => return err!(TypeMismatch, "can't get field '{}' of {}", name, cx.types.type_name(v.type_)),
            };
            let val = get_struct_field(&v.val, &field, &cx.types, &mut cx.memory)?;
            Value {val, type_: field.type_}
        }
        AST::Index => {
            let base = eval_expression(expr, node.children[0], vars, cx)?;
            let idx_val = eval_expression(expr, node.children[1], vars, cx)?;
            let idx = read_integer(&idx_val, false, &cx.types, &mut cx.memory)?;
            index_value(&base, idx, cx)?
        }
        AST::UnaryOperator(op) => {
            let v = eval_expression(expr, node.children[0], vars, cx)?;
            match op {
                UnaryOperator::Deref if cx.types.get(v.type_).t.is_composite() && cx.types.element_layout(v.type_).is_some() => index_value(&v, 0, cx)?,
                UnaryOperator::Deref => deref_pointer(&v, &cx.types, &mut cx.memory)?,
                UnaryOperator::AddrOf => match v.val.addr() {
                    Some(a) => Value::blob(ValueBlob::new(a), cx.types.add_pointer(v.type_)),
                    None => return err!(TypeMismatch, "can't take address of a temporary value"),
                }
                UnaryOperator::Neg => {
                    let x = read_integer(&v, false, &cx.types, &mut cx.memory)? as i64;
                    Value::blob(ValueBlob::new(x.wrapping_neg() as usize), b.i64_)
                }
            }
        }
        AST::BinaryOperator(op) => {
            let lhs = eval_expression(expr, node.children[0], vars, cx)?;
            let rhs = eval_expression(expr, node.children[1], vars, cx)?;
            eval_binary_operator(*op, &lhs, &rhs, cx)?
        }
        AST::TypeCast(type_text) => {
            let v = eval_expression(expr, node.children[0], vars, cx)?;
            let t = cx.types.parse_type_name(type_text)?;
            cast_value(v, t, cx)?
        }
    })
}

fn element_address(base: &Value, idx: usize, cx: &mut EvalContext) -> Result<(usize, TypeIdx)> {
    let (elem, stride) = match cx.types.element_layout(base.type_) {
        Some(x) => x,
        None => return err!(TypeMismatch, "can't index {}", cx.types.type_name(base.type_)),
    };
    let start = match &cx.types.get(base.type_).t {
        Type::Array(a) => {
            if a.flags.contains(ArrayFlags::LEN_KNOWN) && idx >= a.len {
                return err!(Runtime, "index out of bounds: {} >= {}", idx, a.len);
            }
            match base.val.addr() {
                Some(addr) => addr,
                None => return err!(NotImplemented, "indexing arrays without address"),
            }
        }
        Type::Slice(_) => {
            let (ptr, len) = read_slice(base, &mut cx.memory)?;
            if idx >= len {
                return err!(Runtime, "index out of bounds: {} >= {}", idx, len);
            }
            ptr
        }
        _ => read_integer(base, false, &cx.types, &mut cx.memory)?,
    };
    Ok((start.wrapping_add(idx.wrapping_mul(stride)), elem))
}

fn index_value(base: &Value, idx: usize, cx: &mut EvalContext) -> Result<Value> {
    let (addr, elem) = element_address(base, idx, cx)?;
    Ok(Value::at(addr, elem))
}

fn eval_binary_operator(op: BinaryOperator, lhs: &Value, rhs: &Value, cx: &mut EvalContext) -> Result<Value> {
    let i64_ = cx.types.builtins().i64_;
    let lhs_ptr = cx.types.get(lhs.type_).t.as_pointer().is_some();
    let rhs_ptr = cx.types.get(rhs.type_).t.as_pointer().is_some();
    let a = read_integer(lhs, false, &cx.types, &mut cx.memory)?;
    let b = read_integer(rhs, false, &cx.types, &mut cx.memory)?;
    match (op, lhs_ptr, rhs_ptr) {
        (BinaryOperator::Add, true, false) | (BinaryOperator::Sub, true, false) => {
            let (_, stride) = cx.types.element_layout(lhs.type_).unwrap_or((i64_, 1));
            let off = b.wrapping_mul(stride.max(1));
            let r = if op == BinaryOperator::Add { a.wrapping_add(off) } else { a.wrapping_sub(off) };
            return Ok(Value::blob(ValueBlob::new(r), lhs.type_));
        }
        (BinaryOperator::Add, false, true) => {
            let (_, stride) = cx.types.element_layout(rhs.type_).unwrap_or((i64_, 1));
            return Ok(Value::blob(ValueBlob::new(b.wrapping_add(a.wrapping_mul(stride.max(1)))), rhs.type_));
        }
        (BinaryOperator::Sub, true, true) => {
            let (_, stride) = cx.types.element_layout(lhs.type_).unwrap_or((i64_, 1));
            let d = (a.wrapping_sub(b) as i64) / stride.max(1) as i64;
            return Ok(Value::blob(ValueBlob::new(d as usize), i64_));
        }
        (_, false, false) => (),
        _ => return err!(TypeMismatch, "invalid pointer arithmetic"),
    }
    let (a, b) = (a as i64, b as i64);
    let r = match op {
        BinaryOperator::Add => a.wrapping_add(b),
        BinaryOperator::Sub => a.wrapping_sub(b),
        BinaryOperator::Mul => a.wrapping_mul(b),
        BinaryOperator::Div | BinaryOperator::Rem if b == 0 => return err!(Runtime, "division by zero"),
        BinaryOperator::Div => a.wrapping_div(b),
        BinaryOperator::Rem => a.wrapping_rem(b),
    };
    Ok(Value::blob(ValueBlob::new(r as usize), i64_))
}

// `x as T`. Integer and pointer conversions convert the value; anything else reinterprets the memory.
pub fn cast_value(v: Value, t: TypeIdx, cx: &mut EvalContext) -> Result<Value> {
    let (from, to) = (cx.types.get(v.type_), cx.types.get(t));
    let from_scalar = from.t.is_integral() || from.t.as_pointer().is_some();
    let to_scalar = to.t.is_integral() || to.t.as_pointer().is_some();
    if from_scalar && to_scalar {
        let size = to.size;
        let mut x = read_integer(&v, false, &cx.types, &mut cx.memory)?;
        if size < 8 {
            x &= (1usize << (size * 8) as u32) - 1;
        }
        return Ok(Value::blob(ValueBlob::new(x), t));
    }
    match v.val {
        AddrOrValueBlob::Addr(_) => Ok(Value {val: v.val, type_: t}),
        AddrOrValueBlob::Blob(b) if b.len() >= to.size => Ok(Value::blob(b, t)),
        AddrOrValueBlob::Blob(b) => err!(TypeMismatch, "can't cast {}-byte value to {}", b.len(), cx.types.type_name(t)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOperator {
    Neg,
    Deref,
    AddrOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Copy, Debug)]
struct ASTIdx(usize);

#[derive(Debug)]
enum AST {
    Literal(usize),
    Variable(String),
    Field {name: String, arrow: bool},
    Index, // a[i]
    UnaryOperator(UnaryOperator),
    BinaryOperator(BinaryOperator),
    TypeCast(String), // x as T
}

struct ASTNode {
    range: Range<usize>,
    children: Vec<ASTIdx>,
    a: AST,
}

struct InputStream<'a> {
    input: &'a str,
    pos: usize,
}
impl<'a> InputStream<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }
    fn eat(&mut self) -> Option<char> {
        let r = self.peek();
        if let Some(c) = r {
            self.pos += c.len_utf8();
        }
        r
    }
    fn eat_if_eq(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.eat();
            true
        } else {
            false
        }
    }
    fn eat_while(&mut self, f: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !f(c) {
                break;
            }
            self.eat();
        }
        &self.input[start..self.pos]
    }
}

#[derive(Debug, Clone)]
enum Token {
    BinaryOperator(BinaryOperator), // '*' and '-' are also unary; the parser decides by position
    Ampersand,
    Arrow, // ->
    Char(char), // . , ; ( ) [ ]
    Literal(usize),
    Identifier(String),
    Eof,
}
impl Token {
    fn is_eof(&self) -> bool { match self { Self::Eof => true, _ => false } }
    fn is_char(&self, c: char) -> bool { match self { Self::Char(x) if *x == c => true, _ => false } }
    fn is_keyword(&self, word: &str) -> bool { match self { Self::Identifier(s) if s == word => true, _ => false } }
}

struct Lexer<'a> {
    input: InputStream<'a>,
    next_tokens: Vec<(Range<usize>, Token)>,
}
impl<'a> Lexer<'a> {
    // peek(1) to get next token without consuming it, peek(2) for second-next, etc
    fn peek(&mut self, n: usize) -> Result<(Range<usize>, &Token)> {
        loop {
            if self.next_tokens.len() >= n {
                let (r, t) = &self.next_tokens[n-1];
                return Ok((r.clone(), t));
            }
            let start = self.input.pos;
            let c = match self.input.eat() {
                None => return Ok((start..start, &Token::Eof)),
                Some(c) => c };
            let token = match c {
                ' ' | '\t' | '\n' | '\r' => continue,
                '+' => Token::BinaryOperator(BinaryOperator::Add),
                '-' => if self.input.eat_if_eq('>') { Token::Arrow } else { Token::BinaryOperator(BinaryOperator::Sub) },
                '*' => Token::BinaryOperator(BinaryOperator::Mul),
                '/' => Token::BinaryOperator(BinaryOperator::Div),
                '%' => Token::BinaryOperator(BinaryOperator::Rem),
                '&' => Token::Ampersand,
                '.' | ',' | ';' | '(' | ')' | '[' | ']' => Token::Char(c),
                '0'..='9' => {
                    let mut radix = 10u32;
                    let mut digits_start = start;
                    if c == '0' {
                        for (p, r) in [('x', 16), ('b', 2), ('o', 8)] {
                            if self.input.eat_if_eq(p) {
                                radix = r;
                                digits_start = self.input.pos;
                                break;
                            }
                        }
                    }
                    self.input.eat_while(|c| c.is_ascii_alphanumeric() || c == '_');
                    let digits: String = self.input.input[digits_start..self.input.pos].chars().filter(|c| *c != '_').collect();
                    if digits.is_empty() {
                        return err!(Syntax, "expected digits at {}", self.input.pos);
                    }
                    match usize::from_str_radix(&digits, radix) {
                        Ok(v) => Token::Literal(v),
                        Err(_) => return err!(Syntax, "bad integer literal at {}: '{}'", start, &self.input.input[start..self.input.pos]),
                    }
                }
                'a'..='z' | 'A'..='Z' | '_' => {
                    self.input.eat_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
                    Token::Identifier(self.input.input[start..self.input.pos].to_string())
                }
                x => return err!(Syntax, "unexpected character at {}: '{}'", start, x),
            };
            self.next_tokens.push((start..self.input.pos, token));
        }
    }

    fn eat(&mut self) -> Result<(Range<usize>, Token)> {
        let (r, _) = self.peek(1)?;
        if self.next_tokens.is_empty() {
            return Ok((r, Token::Eof));
        }
        Ok(self.next_tokens.remove(0))
    }

    fn expect_char(&mut self, c: char) -> Result<Range<usize>> {
        let (r, t) = self.eat()?;
        if !t.is_char(c) {
            return err!(Syntax, "expected '{}', found {:?} at {}", c, t, r.start);
        }
        Ok(r)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Weakest,
    Add, // + -
    Mul, // * / %
    TypeCast, // x as i64
    Unary, // -x, &v, *p
    Postfix, // a[i], a.b, a->b
}

fn binary_operator_precedence(op: BinaryOperator) -> Precedence {
    match op {
        BinaryOperator::Add | BinaryOperator::Sub => Precedence::Add,
        BinaryOperator::Mul | BinaryOperator::Div | BinaryOperator::Rem => Precedence::Mul,
    }
}

const MAX_NESTING: usize = 256;

fn add_node(expr: &mut Expression, range: Range<usize>, children: Vec<ASTIdx>, a: AST) -> ASTIdx {
    expr.ast.push(ASTNode {range, children, a});
    ASTIdx(expr.ast.len() - 1)
}

fn parse_expression(lex: &mut Lexer, expr: &mut Expression, outer_precedence: Precedence, depth: usize) -> Result<ASTIdx> {
    if depth > MAX_NESTING {
        return err!(Syntax, "expression too deeply nested");
    }
    let (range, token) = lex.eat()?;
    let mut lhs = match token {
        Token::Literal(v) => add_node(expr, range, vec![], AST::Literal(v)),
        Token::Identifier(s) => add_node(expr, range, vec![], AST::Variable(s)),
        Token::Char('(') => {
            let inner = parse_expression(lex, expr, Precedence::Weakest, depth + 1)?;
            lex.expect_char(')')?;
            inner
        }
        Token::BinaryOperator(BinaryOperator::Mul) | Token::BinaryOperator(BinaryOperator::Sub) | Token::Ampersand => {
            let op = match token {
                Token::BinaryOperator(BinaryOperator::Mul) => UnaryOperator::Deref,
                Token::BinaryOperator(_) => UnaryOperator::Neg,
                _ => UnaryOperator::AddrOf,
            };
            let operand = parse_expression(lex, expr, Precedence::Unary, depth + 1)?;
            let end = expr.ast[operand.0].range.end;
            add_node(expr, range.start..end, vec![operand], AST::UnaryOperator(op))
        }
        t => return err!(Syntax, "unexpected {:?} at {}", t, range.start),
    };

    loop {
        let t = lex.peek(1)?.1.clone();
        let start = expr.ast[lhs.0].range.start;
        match t {
            Token::Char('.') | Token::Arrow => {
                let arrow = !t.is_char('.');
                lex.eat()?;
                let (r, name) = lex.eat()?;
                let name = match name {
                    Token::Identifier(s) => s,
                    t => return err!(Syntax, "expected field name, found {:?} at {}", t, r.start),
                };
                lhs = add_node(expr, start..r.end, vec![lhs], AST::Field {name, arrow});
            }
            Token::Char('[') => {
                lex.eat()?;
                let idx = parse_expression(lex, expr, Precedence::Weakest, depth + 1)?;
                let end = lex.expect_char(']')?.end;
                lhs = add_node(expr, start..end, vec![lhs, idx], AST::Index);
            }
            Token::Identifier(_) if t.is_keyword("as") => {
                if outer_precedence >= Precedence::TypeCast {
                    break;
                }
                lex.eat()?;
                let type_start = lex.peek(1)?.0.start;
                let type_end = parse_type(lex, depth + 1)?;
                let type_text = lex.input.input[type_start..type_end].to_string();
                lhs = add_node(expr, start..type_end, vec![lhs], AST::TypeCast(type_text));
            }
            Token::BinaryOperator(op) => {
                let prec = binary_operator_precedence(op);
                if prec <= outer_precedence {
                    break;
                }
                lex.eat()?;
                let rhs = parse_expression(lex, expr, prec, depth + 1)?;
                let end = expr.ast[rhs.0].range.end;
                lhs = add_node(expr, start..end, vec![lhs, rhs], AST::BinaryOperator(op));
            }
            _ => break,
        }
    }
    Ok(lhs)
}

// Type syntax: `name`, `*T`, `[T; N]`. Only validates the shape; the text is resolved by Types::parse_type_name.
// Returns the end offset of the type in the input.
fn parse_type(lex: &mut Lexer, depth: usize) -> Result<usize> {
    if depth > MAX_NESTING {
        return err!(Syntax, "type too deeply nested");
    }
    let (r, t) = lex.eat()?;
    match t {
        Token::BinaryOperator(BinaryOperator::Mul) => parse_type(lex, depth + 1),
        Token::Char('[') => {
            parse_type(lex, depth + 1)?;
            lex.expect_char(';')?;
            match lex.eat()? {
                (_, Token::Literal(_)) => (),
                (r, t) => return err!(Syntax, "expected array length, found {:?} at {}", t, r.start),
            }
            Ok(lex.expect_char(']')?.end)
        }
        Token::Identifier(s) if s == "struct" || s == "const" => parse_type(lex, depth + 1),
        Token::Identifier(_) => Ok(r.end),
        t => err!(Syntax, "expected type, found {:?} at {}", t, r.start),
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, interp::*, testing::*};

    fn eval_int(f: &Fixture, text: &str) -> Result<i64> {
        let mut cx = f.cx();
        let v = cx.eval_expression(text)?;
        Ok(read_integer(&v, false, &cx.types, &mut cx.memory)? as i64)
    }

    #[test]
    fn arithmetic_and_paths() {
        let f = Fixture::new();
        assert_eq!(eval_int(&f, "1 + 2 * 3").unwrap(), 7);
        assert_eq!(eval_int(&f, "(1 + 2) * 3").unwrap(), 9);
        assert_eq!(eval_int(&f, "0x10 - 0b11 % 2").unwrap(), 15);
        assert_eq!(eval_int(&f, "-7 / 2").unwrap(), -3);
        assert_eq!(eval_int(&f, "0o17").unwrap(), 15);
        assert!(eval_int(&f, "1 / 0").unwrap_err().code() == Some(ErrorCode::Runtime));

        assert_eq!(eval_int(&f, "pt.y").unwrap(), -4);
        assert_eq!(eval_int(&f, "outer.b.c").unwrap(), 6);
        assert_eq!(eval_int(&f, "arr_ptr[2]").unwrap(), 30);
        assert_eq!(eval_int(&f, "*(arr_ptr + 3)").unwrap(), 40);
        assert_eq!(eval_int(&f, "head->next->val").unwrap(), 2);
        assert_eq!(eval_int(&f, "head.next.val").unwrap(), 2);
        assert_eq!(eval_int(&f, "(*(0x3010 as *Node)).val").unwrap(), 2);
        assert_eq!(eval_int(&f, "&pt.y").unwrap(), 0x1004);
        assert_eq!(eval_int(&f, "flag as u8").unwrap(), 0x78);
        assert_eq!(eval_int(&f, "(arr_ptr as *[i32; 4])[0][1]").unwrap(), 20);
        assert!(eval_int(&f, "*flag").unwrap_err().is_type_mismatch());

        assert!(eval_int(&f, "nope").unwrap_err().code() == Some(ErrorCode::NoVariable));
        assert!(eval_int(&f, "pt.z").is_err());
        assert!(eval_int(&f, "1 +").unwrap_err().code() == Some(ErrorCode::Syntax));
        assert!(eval_int(&f, "(1").is_err());
        assert!(eval_int(&f, "1 2").is_err());

        assert_eq!(adjust_expression_for_appending_child_path("a.b"), "a.b");
        assert_eq!(adjust_expression_for_appending_child_path("*p"), "(*p)");
        assert_eq!(adjust_expression_for_appending_child_path("p + 1"), "(p + 1)");
        assert_eq!(child_path_index("arr_ptr", 2), "arr_ptr[2]");
        assert_eq!(child_path_field("*head", "val"), "(*head).val");
        assert_eq!(child_path_deref("*p"), "*(*p)");
        assert_eq!(expression_for_address(0x3010, "Node"), "*(0x3010 as *Node)");
    }

    #[test]
    fn parser_never_panics() {
        let alphabet: Vec<char> = "ab01x*&-+/%()[].;->as Node ".chars().collect();
        for _ in 0..2000 {
            let len = rand::random::<usize>() % 16;
            let s: String = (0..len).map(|_| alphabet[rand::random::<usize>() % alphabet.len()]).collect();
            let _ = parse_watch_expression(&s);
        }
    }
}
