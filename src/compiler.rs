use std::rc::Rc;

use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::scanner::Scanner;
use crate::table::Table;
use crate::token::{Token, TokenType};
use crate::value::{FunctionObj, Obj, Value};

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

/// Tags naming which parse method a `ParseRule` should dispatch to, since
/// stable Rust can't stash bound `fn(&mut Self, ...)` pointers in a `const`
/// table.
#[derive(Clone, Copy)]
enum ParseFn {
    Grouping,
    Unary,
    Binary,
    Number,
    StringLit,
    Literal,
    Variable,
    And,
    Or,
    Call,
    None,
}

struct ParseRule {
    prefix: ParseFn,
    infix: ParseFn,
    precedence: Precedence,
}

fn get_rule(typ: TokenType) -> ParseRule {
    use Precedence as P;
    let (prefix, infix, precedence) = match typ {
        TokenType::LeftParen => (ParseFn::Grouping, ParseFn::Call, P::Call),
        TokenType::Minus => (ParseFn::Unary, ParseFn::Binary, P::Term),
        TokenType::Plus => (ParseFn::None, ParseFn::Binary, P::Term),
        TokenType::Slash => (ParseFn::None, ParseFn::Binary, P::Factor),
        TokenType::Star => (ParseFn::None, ParseFn::Binary, P::Factor),
        TokenType::Bang => (ParseFn::Unary, ParseFn::None, P::None),
        TokenType::BangEqual => (ParseFn::None, ParseFn::Binary, P::Equality),
        TokenType::EqualEqual => (ParseFn::None, ParseFn::Binary, P::Equality),
        TokenType::Greater => (ParseFn::None, ParseFn::Binary, P::Comparison),
        TokenType::GreaterEqual => (ParseFn::None, ParseFn::Binary, P::Comparison),
        TokenType::Less => (ParseFn::None, ParseFn::Binary, P::Comparison),
        TokenType::LessEqual => (ParseFn::None, ParseFn::Binary, P::Comparison),
        TokenType::Identifier => (ParseFn::Variable, ParseFn::None, P::None),
        TokenType::String => (ParseFn::StringLit, ParseFn::None, P::None),
        TokenType::Number => (ParseFn::Number, ParseFn::None, P::None),
        TokenType::And => (ParseFn::None, ParseFn::And, P::And),
        TokenType::Or => (ParseFn::None, ParseFn::Or, P::Or),
        TokenType::False | TokenType::True | TokenType::Nil => (ParseFn::Literal, ParseFn::None, P::None),
        _ => (ParseFn::None, ParseFn::None, P::None),
    };
    ParseRule { prefix, infix, precedence }
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

struct Upvalue {
    index: u8,
    is_local: bool,
}

#[derive(PartialEq)]
enum FunctionKind {
    Script,
    Function,
}

/// Per-function compilation state. The compiler keeps a stack of these, one
/// pushed per nested `fun`, tracking the current function being compiled.
struct FunctionScope<'src> {
    name: Option<Rc<str>>,
    arity: u8,
    chunk: Chunk,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl<'src> FunctionScope<'src> {
    fn new(name: Option<Rc<str>>, kind: FunctionKind) -> Self {
        // Slot 0 is reserved for the VM's own use: the running closure.
        let locals = vec![Local { name: "", depth: 0, is_captured: false }];
        FunctionScope {
            name,
            arity: 0,
            chunk: Chunk::new(),
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    strings: &'src mut Table,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    scopes: Vec<FunctionScope<'src>>,
}

pub fn compile(source: &str, strings: &mut Table) -> Result<FunctionObj, Vec<CompileError>> {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        strings,
        current: Token { typ: TokenType::Error, lexeme: "", line: 0 },
        previous: Token { typ: TokenType::Error, lexeme: "", line: 0 },
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        scopes: vec![FunctionScope::new(None, FunctionKind::Script)],
    };

    compiler.advance();
    while !compiler.matches(TokenType::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenType::Eof, "Expect end of expression.");

    let (function, _upvalues) = compiler.end_function();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(function)
    }
}

impl<'src> Compiler<'src> {
    fn scope(&self) -> &FunctionScope<'src> {
        self.scopes.last().unwrap()
    }

    fn scope_mut(&mut self) -> &mut FunctionScope<'src> {
        self.scopes.last_mut().unwrap()
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.scope_mut().chunk
    }

    // ---- token stream -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn consume(&mut self, typ: TokenType, message: &str) {
        if self.current.typ == typ {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if !self.check(typ) {
            return false;
        }
        self.advance();
        true
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let text = if token.typ == TokenType::Eof {
            format!("Error at end: {}", message)
        } else if token.typ == TokenType::Error {
            message.to_string()
        } else {
            format!("Error at '{}': {}", token.lexeme, message)
        };
        self.errors.push(CompileError { line: token.line, message: text });
        self.had_error = true;
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.typ != TokenType::Eof {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            match self.current.typ {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- byte emission --------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk_mut().write_op(op, line);
    }

    fn emit_ops(&mut self, a: OpCode, b: u8) {
        self.emit_op(a);
        self.emit_byte(b);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        self.chunk_mut().write_constant(value, line);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk_mut().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.chunk_mut();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_mut().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn end_function(&mut self) -> (FunctionObj, Vec<Upvalue>) {
        self.emit_return();
        let scope = self.scopes.pop().unwrap();
        let function = FunctionObj {
            arity: scope.arity,
            upvalue_count: scope.upvalues.len(),
            chunk: scope.chunk,
            name: scope.name,
        };
        (function, scope.upvalues)
    }

    // ---- scopes, locals, upvalues --------------------------------------

    fn begin_scope(&mut self) {
        self.scope_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.scope_mut().scope_depth -= 1;
        let depth = self.scope().scope_depth;
        while let Some(local) = self.scope().locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.scope().locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.scope_mut().locals.pop();
        }
    }

    fn declare_variable(&mut self) {
        if self.scope().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.scope().scope_depth;
        let mut duplicate = false;
        for local in self.scope().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.scope().locals.len() > u8::MAX as usize {
            self.error("Too many local variables in function.");
            return;
        }
        self.scope_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.scope().scope_depth == 0 {
            return;
        }
        let depth = self.scope().scope_depth;
        self.scope_mut().locals.last_mut().unwrap().depth = depth;
    }

    fn resolve_local(scope: &FunctionScope<'src>, name: &str) -> Option<Result<u8, ()>> {
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Some(Err(()));
                }
                return Some(Ok(i as u8));
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str) -> Option<u8> {
        if scope_idx == 0 {
            return None;
        }
        let enclosing_idx = scope_idx - 1;

        match Self::resolve_local(&self.scopes[enclosing_idx], name) {
            Some(Ok(local_idx)) => {
                self.scopes[enclosing_idx].locals[local_idx as usize].is_captured = true;
                return Some(self.add_upvalue(scope_idx, local_idx, true));
            }
            Some(Err(())) => {
                self.error("Can't read local variable in its own initializer.");
                return None;
            }
            None => {}
        }

        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing_idx, name) {
            return Some(self.add_upvalue(scope_idx, upvalue_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, scope_idx: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &self.scopes[scope_idx].upvalues;
        for (i, up) in upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() > u8::MAX as usize {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.scopes[scope_idx].upvalues.push(Upvalue { index, is_local });
        (self.scopes[scope_idx].upvalues.len() - 1) as u8
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.strings.intern(name);
        let value = Value::Obj(Rc::new(Obj::Str(interned)));
        let index = self.chunk_mut().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    // ---- declarations and statements ------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect function name.");
        let name = self.previous.lexeme;
        let global = self.declare_variable_for_fn(name);
        self.mark_initialized();
        self.function(name, FunctionKind::Function);
        self.define_variable(global);
    }

    fn declare_variable_for_fn(&mut self, name: &str) -> u8 {
        self.declare_variable();
        if self.scope().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name)
    }

    fn function(&mut self, name: &str, kind: FunctionKind) {
        let interned_name = self.strings.intern(name);
        self.scopes.push(FunctionScope::new(Some(interned_name), kind));
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                if self.scope().arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.scope_mut().arity += 1;
                self.consume(TokenType::Identifier, "Expect parameter name.");
                let param_name = self.previous.lexeme;
                self.declare_variable();
                self.mark_initialized_param(param_name);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let index = self
            .chunk_mut()
            .add_constant(Value::Obj(Rc::new(Obj::Function(Rc::new(function)))));
        let function_index = if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            0
        } else {
            index as u8
        };
        self.emit_ops(OpCode::Closure, function_index);
        for upvalue in &upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn mark_initialized_param(&mut self, _param_name: &str) {
        self.mark_initialized();
    }

    fn var_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect variable name.");
        let name = self.previous.lexeme;
        let global = self.declare_variable_for_fn(name);

        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn define_variable(&mut self, global: u8) {
        if self.scope().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    fn statement(&mut self) {
        if self.matches(TokenType::Print) {
            self.print_statement();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.scope().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_mut().code.len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_mut().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    // ---- expressions (Pratt parser) -------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let rule = get_rule(self.previous.typ);
        if matches!(rule.prefix, ParseFn::None) {
            self.error("Expect expression.");
            return;
        }
        let can_assign = precedence <= Precedence::Assignment;
        self.call_parse_fn(rule.prefix, can_assign);

        while precedence <= get_rule(self.current.typ).precedence {
            self.advance();
            let rule = get_rule(self.previous.typ);
            self.call_parse_fn(rule.infix, can_assign);
        }

        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn call_parse_fn(&mut self, kind: ParseFn, can_assign: bool) {
        match kind {
            ParseFn::Grouping => self.grouping(),
            ParseFn::Unary => self.unary(),
            ParseFn::Binary => self.binary(),
            ParseFn::Number => self.number(),
            ParseFn::StringLit => self.string(),
            ParseFn::Literal => self.literal(),
            ParseFn::Variable => self.variable(can_assign),
            ParseFn::And => self.and(),
            ParseFn::Or => self.or(),
            ParseFn::Call => self.call(),
            ParseFn::None => {}
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let interned = self.strings.intern(text);
        self.emit_constant(Value::Obj(Rc::new(Obj::Str(interned))));
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_type = self.previous.typ;
        self.parse_precedence(Precedence::Unary);
        match op_type {
            TokenType::Minus => self.emit_op(OpCode::Negate),
            TokenType::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let op_type = self.previous.typ;
        let rule = get_rule(op_type);
        self.parse_precedence(rule.precedence.next());
        match op_type {
            TokenType::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenType::EqualEqual => self.emit_op(OpCode::Equal),
            TokenType::Greater => self.emit_op(OpCode::Greater),
            TokenType::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenType::Less => self.emit_op(OpCode::Less),
            TokenType::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn literal(&mut self) {
        match self.previous.typ {
            TokenType::False => self.emit_op(OpCode::False),
            TokenType::True => self.emit_op(OpCode::True),
            TokenType::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_ops(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let scope_idx = self.scopes.len() - 1;
        let (get_op, set_op, arg) = match Self::resolve_local(&self.scopes[scope_idx], name) {
            Some(Ok(idx)) => (OpCode::GetLocal, OpCode::SetLocal, idx),
            Some(Err(())) => {
                self.error("Can't read local variable in its own initializer.");
                (OpCode::GetLocal, OpCode::SetLocal, 0)
            }
            None => match self.resolve_upvalue(scope_idx, name) {
                Some(idx) => (OpCode::GetUpvalue, OpCode::SetUpvalue, idx),
                None => {
                    let idx = self.identifier_constant(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, idx)
                }
            },
        };

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled(source: &str) -> FunctionObj {
        let mut strings = Table::new();
        compile(source, &mut strings).expect("expected successful compilation")
    }

    fn errors_for(source: &str) -> Vec<CompileError> {
        let mut strings = Table::new();
        compile(source, &mut strings).expect_err("expected a compile error")
    }

    #[test]
    fn arithmetic_precedence_emits_multiply_before_add() {
        let function = compiled("1 + 2 * 3;");
        assert_eq!(
            function.chunk.code,
            vec![
                OpCode::Constant as u8, 0,
                OpCode::Constant as u8, 1,
                OpCode::Constant as u8, 2,
                OpCode::Multiply as u8,
                OpCode::Add as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn global_declaration_emits_define_global() {
        let function = compiled("var a = 1;");
        assert!(function.chunk.code.contains(&(OpCode::DefineGlobal as u8)));
    }

    #[test]
    fn local_read_emits_get_local_not_get_global() {
        let function = compiled("{ var a = 1; print a; }");
        assert!(function.chunk.code.contains(&(OpCode::GetLocal as u8)));
        assert!(!function.chunk.code.contains(&(OpCode::GetGlobal as u8)));
    }

    fn find_function_constant(chunk: &Chunk) -> Rc<FunctionObj> {
        chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Obj(obj) => match obj.as_ref() {
                    Obj::Function(f) => Some(Rc::clone(f)),
                    _ => None,
                },
                _ => None,
            })
            .expect("expected a nested function constant")
    }

    #[test]
    fn closure_over_enclosing_local_emits_get_upvalue() {
        let source = "fun outer() { var x = 1; fun inner() { return x; } return inner; }";
        let function = compiled(source);
        let outer = find_function_constant(&function.chunk);
        let inner = find_function_constant(&outer.chunk);
        assert!(inner.chunk.code.contains(&(OpCode::GetUpvalue as u8)));
    }

    #[test]
    fn long_constant_pool_falls_back_to_constant_long() {
        let prints: String = (0..300).map(|i| format!("print {};\n", i)).collect();
        let function = compiled(&prints);
        assert!(function.chunk.code.contains(&(OpCode::ConstantLong as u8)));
    }

    #[test]
    fn reading_local_in_its_own_initializer_is_a_compile_error() {
        let errors = errors_for("{ var a = a; }");
        assert!(errors.iter().any(|e| e.message.contains("Can't read local variable in its own initializer.")));
    }

    #[test]
    fn unterminated_block_reports_an_error() {
        let errors = errors_for("fun f( { }");
        assert!(!errors.is_empty());
    }
}
