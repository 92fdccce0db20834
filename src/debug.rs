#![cfg(feature = "debug-bytecode")]

use crate::chunk::{Chunk, OpCode};

/// Prints every instruction in `chunk`, labeled with the given name. Gated
/// behind a `debug-bytecode` cargo feature rather than a runtime flag.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines[offset]);
    }

    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(unknown) => {
            println!("Unknown opcode {}", unknown);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset),
        OpCode::ConstantLong => constant_long_instruction("OP_CONSTANT_LONG", chunk, offset),
        OpCode::Nil => simple_instruction("OP_NIL", offset),
        OpCode::True => simple_instruction("OP_TRUE", offset),
        OpCode::False => simple_instruction("OP_FALSE", offset),
        OpCode::Pop => simple_instruction("OP_POP", offset),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset),
        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset),
        OpCode::Greater => simple_instruction("OP_GREATER", offset),
        OpCode::Less => simple_instruction("OP_LESS", offset),
        OpCode::Add => simple_instruction("OP_ADD", offset),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset),
        OpCode::Not => simple_instruction("OP_NOT", offset),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset),
        OpCode::Print => simple_instruction("OP_PRINT", offset),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        OpCode::Return => simple_instruction("OP_RETURN", offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{:<16} {:4}", name, slot);
    offset + 2
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    println!("{:<16} {:4} '{}'", name, index, chunk.constants[index]);
    offset + 2
}

fn constant_long_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let hi = chunk.code[offset + 1] as usize;
    let mid = chunk.code[offset + 2] as usize;
    let lo = chunk.code[offset + 3] as usize;
    let index = (hi << 16) | (mid << 8) | lo;
    println!("{:<16} {:4} '{}'", name, index, chunk.constants[index]);
    offset + 4
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let hi = chunk.code[offset + 1] as u16;
    let lo = chunk.code[offset + 2] as u16;
    let jump = ((hi << 8) | lo) as i32;
    let target = offset as i32 + 3 + sign * jump;
    println!("{:<16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let index = chunk.code[offset] as usize;
    offset += 1;
    println!("{:<16} {:4} '{}'", "OP_CLOSURE", index, chunk.constants[index]);

    let upvalue_count = match &chunk.constants[index] {
        crate::value::Value::Obj(obj) => match obj.as_ref() {
            crate::value::Obj::Function(f) => f.upvalue_count,
            _ => 0,
        },
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        println!(
            "{:04}    |                     {} {}",
            offset,
            if is_local != 0 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
