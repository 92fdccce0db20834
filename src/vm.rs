use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use crate::chunk::OpCode;
use crate::error::RuntimeError;
use crate::natives;
use crate::table::Table;
use crate::value::{ClosureObj, FunctionObj, NativeFn, Obj, Upvalue, Value};

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: Rc<ClosureObj>,
    ip: usize,
    slots_base: usize,
}

/// The stack machine: one operand stack shared by every call frame, a
/// table of global bindings, a string-interning set shared with the
/// compiler, and the list of upvalues still pointing into live stack slots.
pub struct Vm {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    pub globals: Table,
    pub strings: Table,
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Builds a VM that writes `print` output to `output` instead of stdout;
    /// used by tests to capture the values a program prints.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            strings: Table::new(),
            open_upvalues: Vec::new(),
            output,
        };
        natives::define_all(&mut vm);
        vm
    }

    pub fn define_native(&mut self, name: &'static str, arity: u8, function: fn(&[Value]) -> Result<Value, String>) {
        let interned = self.strings.intern(name);
        let native = Value::Obj(Rc::new(Obj::Native(Rc::new(NativeFn { name, arity, function }))));
        self.globals.set(interned, native);
    }

    pub fn interpret(&mut self, function: FunctionObj) -> Result<(), RuntimeError> {
        let closure = Rc::new(ClosureObj { function: Rc::new(function), upvalues: Vec::new() });
        self.stack.push(Value::Obj(Rc::new(Obj::Closure(Rc::clone(&closure)))));
        self.call(closure, 0).map_err(|msg| self.runtime_error(msg))?;
        self.run().map_err(|msg| self.runtime_error(msg))
    }

    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = &frame.closure.function;
            let line = function.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
            match function.name.as_deref() {
                Some(name) => trace.push(format!("[line {}] in {}()", line, name)),
                None => trace.push(format!("[line {}] in script", line)),
            }
        }
        self.stack.clear();
        self.frames.clear();
        RuntimeError { message, trace }
    }

    // ---- stack helpers ---------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        let len = self.stack.len();
        &self.stack[len - 1 - distance]
    }

    // ---- upvalues ---------------------------------------------------------

    fn capture_upvalue(&mut self, location: usize) -> Rc<RefCell<Upvalue>> {
        for existing in &self.open_upvalues {
            if let Upvalue::Open(loc) = *existing.borrow() {
                if loc == location {
                    return Rc::clone(existing);
                }
            }
        }
        let upvalue = Rc::new(RefCell::new(Upvalue::Open(location)));
        self.open_upvalues.push(Rc::clone(&upvalue));
        upvalue
    }

    fn close_upvalues(&mut self, last: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|upvalue| {
            let location = match *upvalue.borrow() {
                Upvalue::Open(loc) => loc,
                Upvalue::Closed(_) => return false,
            };
            if location < last {
                return true;
            }
            let value = stack[location].clone();
            *upvalue.borrow_mut() = Upvalue::Closed(value);
            false
        });
    }

    // ---- calls --------------------------------------------------------

    fn call(&mut self, closure: Rc<ClosureObj>, arg_count: u8) -> Result<(), String> {
        if arg_count != closure.function.arity {
            return Err(format!(
                "Expected {} arguments, but got {}.",
                closure.function.arity, arg_count
            ));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slots_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots_base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), String> {
        match &callee {
            Value::Obj(obj) => match obj.as_ref() {
                Obj::Closure(closure) => self.call(Rc::clone(closure), arg_count),
                Obj::Native(native) => {
                    if arg_count != native.arity {
                        return Err(format!(
                            "Expected {} arguments, but got {}.",
                            native.arity, arg_count
                        ));
                    }
                    let start = self.stack.len() - arg_count as usize;
                    let result = (native.function)(&self.stack[start..]);
                    self.stack.truncate(start - 1);
                    match result {
                        Ok(value) => {
                            self.push(value);
                            Ok(())
                        }
                        Err(message) => Err(message),
                    }
                }
                _ => Err("Can only call functions and classes.".to_string()),
            },
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    // ---- the executor loop ----------------------------------------------

    fn run(&mut self) -> Result<(), String> {
        loop {
            #[cfg(feature = "debug-execution")]
            self.trace_stack();

            let op = self.read_op()?;

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let value = self.read_constant_long();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slots_base;
                    self.push(self.stack[base + slot].clone());
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slots_base;
                    self.stack[base + slot] = self.peek(0).clone();
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    match self.globals.get(&name) {
                        Some(value) => self.push(value),
                        None => return Err(format!("Undefined variable '{}'.", name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let value = self.peek(0).clone();
                    if self.globals.set(Rc::clone(&name), value) {
                        self.globals.delete(&name);
                        return Err(format!("Undefined variable '{}'.", name));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = Rc::clone(&self.current_frame().closure.upvalues[slot]);
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(location) => self.stack[*location].clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0).clone();
                    let upvalue = Rc::clone(&self.current_frame().closure.upvalues[slot]);
                    let location = match &*upvalue.borrow() {
                        Upvalue::Open(location) => Some(*location),
                        Upvalue::Closed(_) => None,
                    };
                    match location {
                        Some(location) => self.stack[location] = value,
                        None => *upvalue.borrow_mut() = Upvalue::Closed(value),
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_comparison(|a, b| a > b)?,
                OpCode::Less => self.binary_comparison(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number(|a, b| a - b)?,
                OpCode::Multiply => self.binary_number(|a, b| a * b)?,
                OpCode::Divide => self.binary_number(|a, b| a / b)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.peek(0).as_number().ok_or_else(|| "Operand must be a number.".to_string())?;
                    self.pop();
                    self.push(Value::Number(-value));
                }
                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.output, "{}", value);
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    self.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.current_frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize).clone();
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => {
                    let value = self.read_constant();
                    let function = match value {
                        Value::Obj(obj) => match obj.as_ref() {
                            Obj::Function(f) => Rc::clone(f),
                            _ => unreachable!("Closure operand must be a function constant"),
                        },
                        _ => unreachable!("Closure operand must be a function constant"),
                    };
                    let upvalue_count = function.upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.current_frame().slots_base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(Rc::clone(&self.current_frame().closure.upvalues[index]));
                        }
                    }
                    let closure = ClosureObj { function, upvalues };
                    self.push(Value::Obj(Rc::new(Obj::Closure(Rc::new(closure)))));
                }
                OpCode::CloseUpvalue => {
                    let last = self.stack.len() - 1;
                    self.close_upvalues(last);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slots_base = self.current_frame().slots_base;
                    self.close_upvalues(slots_base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(slots_base);
                    self.push(result);
                }
            }
        }
    }

    #[cfg(feature = "debug-execution")]
    fn trace_stack(&self) {
        print!("          ");
        for value in &self.stack {
            print!("[ {} ]", value);
        }
        println!();
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.closure.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_op(&mut self) -> Result<OpCode, String> {
        let byte = self.read_byte();
        OpCode::try_from(byte).map_err(|b| format!("Unknown opcode {}.", b))
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.current_frame().closure.function.chunk.constants[index].clone()
    }

    fn read_constant_long(&mut self) -> Value {
        let hi = self.read_byte() as usize;
        let mid = self.read_byte() as usize;
        let lo = self.read_byte() as usize;
        let index = (hi << 16) | (mid << 8) | lo;
        self.current_frame().closure.function.chunk.constants[index].clone()
    }

    fn read_string_constant(&mut self) -> Rc<str> {
        match self.read_constant() {
            Value::Obj(obj) => match obj.as_ref() {
                Obj::Str(s) => Rc::clone(s),
                _ => unreachable!("identifier constant must be a string"),
            },
            _ => unreachable!("identifier constant must be a string"),
        }
    }

    fn binary_number(&mut self, op: fn(f64, f64) -> f64) -> Result<(), String> {
        let b = self.peek(0).as_number().ok_or_else(|| "Operands must be numbers.".to_string())?;
        let a = self.peek(1).as_number().ok_or_else(|| "Operands must be numbers.".to_string())?;
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_comparison(&mut self, op: fn(f64, f64) -> bool) -> Result<(), String> {
        let b = self.peek(0).as_number().ok_or_else(|| "Operands must be numbers.".to_string())?;
        let a = self.peek(1).as_number().ok_or_else(|| "Operands must be numbers.".to_string())?;
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    /// `+` is the one operator overloaded by runtime type: two numbers
    /// add, two strings concatenate (and the result is interned like any
    /// other string), anything else is a type error.
    fn add(&mut self) -> Result<(), String> {
        match (self.peek(0), self.peek(1)) {
            (Value::Number(_), Value::Number(_)) => self.binary_number(|a, b| a + b),
            (Value::Obj(b), Value::Obj(a)) => match (b.as_ref(), a.as_ref()) {
                (Obj::Str(b), Obj::Str(a)) => {
                    let concatenated = format!("{}{}", a, b);
                    let interned = self.strings.intern(&concatenated);
                    self.pop();
                    self.pop();
                    self.push(Value::Obj(Rc::new(Obj::Str(interned))));
                    Ok(())
                }
                _ => Err("Operands must be two numbers or two strings.".to_string()),
            },
            _ => Err("Operands must be two numbers or two strings.".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;

    fn run(vm: &mut Vm, source: &str) -> Result<(), RuntimeError> {
        let function = compiler::compile(source, &mut vm.strings).expect("expected successful compilation");
        vm.interpret(function)
    }

    #[test]
    fn stack_is_empty_after_a_well_typed_statement() {
        let mut vm = Vm::new();
        run(&mut vm, "var a = 1 + 2 * 3;").unwrap();
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn equal_byte_strings_intern_to_the_same_object() {
        let mut vm = Vm::new();
        run(&mut vm, r#"var a = "foo" + "bar"; var b = "foobar";"#).unwrap();
        let a = vm.globals.get(&vm.strings.intern("a")).unwrap();
        let b = vm.globals.get(&vm.strings.intern("b")).unwrap();
        match (a, b) {
            (Value::Obj(a), Value::Obj(b)) => match (a.as_ref(), b.as_ref()) {
                (Obj::Str(a), Obj::Str(b)) => assert!(Rc::ptr_eq(a, b)),
                _ => panic!("expected both globals to be strings"),
            },
            _ => panic!("expected both globals to be objects"),
        }
    }

    #[test]
    fn closure_observes_final_value_of_captured_local_after_return() {
        let mut vm = Vm::new();
        let source = "fun makeCounter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
                       var c = makeCounter(); c(); c(); var last = c();";
        run(&mut vm, source).unwrap();
        let last = vm.globals.get(&vm.strings.intern("last")).unwrap();
        assert_eq!(last, Value::Number(3.0));
    }

    #[test]
    fn open_upvalues_stay_sorted_by_decreasing_location() {
        let mut vm = Vm::new();
        let source = "fun outer() { var a = 1; var b = 2; fun f() { return a + b; } return f; } outer();";
        run(&mut vm, source).unwrap();
        let locations: Vec<usize> = vm
            .open_upvalues
            .iter()
            .map(|u| match *u.borrow() {
                Upvalue::Open(loc) => loc,
                Upvalue::Closed(_) => usize::MAX,
            })
            .collect();
        let mut sorted = locations.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(locations, sorted);
    }

    #[test]
    fn calling_undefined_global_is_a_runtime_error_naming_script_frame() {
        let mut vm = Vm::new();
        let err = run(&mut vm, "print a;").unwrap_err();
        assert!(err.message.contains("Undefined variable 'a'."));
        assert_eq!(err.trace, vec!["[line 1] in script".to_string()]);
    }

    #[test]
    fn runtime_error_inside_a_function_names_the_function_frame() {
        let mut vm = Vm::new();
        let err = run(&mut vm, "fun f() { return 1 + \"a\"; } f();").unwrap_err();
        assert!(err.trace.iter().any(|line| line.contains("in f()")));
    }

    #[test]
    fn stack_is_cleared_after_a_runtime_error() {
        let mut vm = Vm::new();
        let _ = run(&mut vm, "print a;");
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn calling_with_wrong_arity_reports_expected_and_actual_counts() {
        let mut vm = Vm::new();
        let err = run(&mut vm, "fun f(a){} f();").unwrap_err();
        assert!(err.message.contains("Expected 1 arguments, but got 0."));
    }
}
