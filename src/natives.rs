use std::io::{self, BufRead};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;
use crate::vm::Vm;

/// Registers every native (host-implemented) function into the VM's
/// globals table.
pub fn define_all(vm: &mut Vm) {
    vm.define_native("clock", 0, clock);
    vm.define_native("read_number", 0, read_number);
}

fn clock(_args: &[Value]) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "System clock is before the Unix epoch.".to_string())?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

/// Reads one line from stdin and parses it as a number; any I/O failure or
/// unparseable input yields `0` rather than a runtime error.
fn read_number(_args: &[Value]) -> Result<Value, String> {
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return Ok(Value::Number(0.0));
    }
    Ok(Value::Number(line.trim().parse::<f64>().unwrap_or(0.0)))
}
