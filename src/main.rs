mod chunk;
mod compiler;
mod debug;
mod error;
mod natives;
mod scanner;
mod table;
mod token;
mod value;
mod vm;

use std::env;
use std::fs;
use std::process::ExitCode;

use rustyline::error::ReadlineError;
use rustyline::Editor;

use error::RuntimeError;
use vm::Vm;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: loxrs [path]");
            ExitCode::from(exitcode::USAGE as u8)
        }
    }
}

fn repl() -> ExitCode {
    let mut vm = Vm::new();
    let mut editor = Editor::<()>::new();

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                editor.add_history_entry(line.as_str());
                if let Err(InterpretError::Runtime(err)) = interpret(&mut vm, &line) {
                    report_runtime_error(&err);
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Readline error: {}", err);
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path);
            return ExitCode::from(exitcode::IOERR as u8);
        }
    };

    let mut vm = Vm::new();
    match interpret(&mut vm, &source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile) => ExitCode::from(exitcode::DATAERR as u8),
        Err(InterpretError::Runtime(err)) => {
            report_runtime_error(&err);
            ExitCode::from(exitcode::SOFTWARE as u8)
        }
    }
}

enum InterpretError {
    Compile,
    Runtime(RuntimeError),
}

fn interpret(vm: &mut Vm, source: &str) -> Result<(), InterpretError> {
    let function = compiler::compile(source, &mut vm.strings).map_err(|errors| {
        for error in &errors {
            eprintln!("{}", error);
        }
        InterpretError::Compile
    })?;

    #[cfg(feature = "debug-bytecode")]
    debug::disassemble_chunk(&function.chunk, function.name.as_deref().unwrap_or("script"));

    vm.interpret(function).map_err(InterpretError::Runtime)
}

fn report_runtime_error(err: &RuntimeError) {
    eprint!("{}", err);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<(), InterpretError> {
        let mut vm = Vm::new();
        interpret(&mut vm, source)
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

    impl std::io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run_captured(source: &str) -> (Result<(), InterpretError>, String) {
        let buffer = SharedBuffer::default();
        let mut vm = Vm::with_output(Box::new(buffer.clone()));
        let result = interpret(&mut vm, source);
        let output = String::from_utf8(buffer.0.borrow().clone()).expect("valid utf8 output");
        (result, output)
    }

    #[test]
    fn runs_arithmetic_and_prints() {
        assert!(run("print 1 + 2 * 3;").is_ok());
    }

    #[test]
    fn closures_capture_by_reference() {
        let source = r#"
            fun makeCounter() {
                var count = 0;
                fun counter() {
                    count = count + 1;
                    return count;
                }
                return counter;
            }
            var counter = makeCounter();
            print counter();
            print counter();
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        match run("print nope;") {
            Err(InterpretError::Runtime(_)) => {}
            other => panic!("expected runtime error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn unterminated_block_is_a_compile_error() {
        match run("fun f( { }") {
            Err(InterpretError::Compile) => {}
            other => panic!("expected compile error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn adding_number_and_string_is_a_runtime_error() {
        match run("print 1 + \"a\";") {
            Err(InterpretError::Runtime(_)) => {}
            other => panic!("expected runtime error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn e2e_arithmetic_precedence() {
        let (result, output) = run_captured("print 1 + 2 * 3;");
        assert!(result.is_ok());
        assert_eq!(output, "7\n");
    }

    #[test]
    fn e2e_string_concatenation() {
        let (result, output) = run_captured(r#"var a = "foo"; var b = "bar"; print a + b;"#);
        assert!(result.is_ok());
        assert_eq!(output, "foobar\n");
    }

    #[test]
    fn e2e_for_loop_accumulates() {
        let source = "var sum = 0; for (var i = 1; i <= 3; i = i + 1) { sum = sum + i; } print sum;";
        let (result, output) = run_captured(source);
        assert!(result.is_ok());
        assert_eq!(output, "6\n");
    }

    #[test]
    fn e2e_counter_closure_retains_state_across_calls() {
        let source = "fun makeCounter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
                       var c = makeCounter(); print c(); print c(); print c();";
        let (result, output) = run_captured(source);
        assert!(result.is_ok());
        assert_eq!(output, "1\n2\n3\n");
    }

    #[test]
    fn e2e_falseyness_of_nil_false_and_zero() {
        let (result, output) = run_captured("print !(nil); print !false; print !0;");
        assert!(result.is_ok());
        assert_eq!(output, "true\ntrue\nfalse\n");
    }

    #[test]
    fn e2e_if_else_branch_selection() {
        let (result, output) = run_captured(r#"var x = 2; if (x == 2) print "yes"; else print "no";"#);
        assert!(result.is_ok());
        assert_eq!(output, "yes\n");
    }

    #[test]
    fn e2e_undefined_global_reports_name() {
        match run("print a;") {
            Err(InterpretError::Runtime(err)) => {
                assert!(err.to_string().contains("Undefined variable 'a'."));
            }
            other => panic!("expected runtime error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn e2e_adding_number_and_string_reports_type_error() {
        match run("1 + \"a\";") {
            Err(InterpretError::Runtime(err)) => {
                assert!(err.to_string().contains("Operands must be two numbers or two strings."));
            }
            other => panic!("expected runtime error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn e2e_calling_function_with_wrong_arity_reports_counts() {
        match run("fun f(a){} f();") {
            Err(InterpretError::Runtime(err)) => {
                assert!(err.to_string().contains("Expected 1 arguments, but got 0."));
            }
            other => panic!("expected runtime error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn e2e_reading_local_in_its_own_initializer_is_a_compile_error() {
        match run("{ var a = a; }") {
            Err(InterpretError::Compile) => {}
            other => panic!("expected compile error, got {:?}", other.is_ok()),
        }
    }
}
