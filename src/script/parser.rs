//! Script byte code → operations

use super::opcodes::*;
use super::ScriptError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub opcode: u8,
    /// Pushed bytes for data-push opcodes, empty otherwise
    pub data: Vec<u8>,
    /// Offset just past this operation in the script
    pub end: usize,
}

/// Decode the operation starting at `position`. `None` at the end of the script.
pub fn read_operation(script: &[u8], position: usize) -> Option<Result<Operation, ScriptError>> {
    let opcode = *script.get(position)?;
    let mut cursor = position + 1;

    let length = match opcode {
        0x01..=OP_PUSHBYTES_75 => opcode as usize,
        OP_PUSHDATA1 | OP_PUSHDATA2 | OP_PUSHDATA4 => {
            let width = match opcode {
                OP_PUSHDATA1 => 1,
                OP_PUSHDATA2 => 2,
                _ => 4,
            };
            let Some(prefix) = script.get(cursor..cursor + width) else {
                return Some(Err(ScriptError::TruncatedPush(position)));
            };
            cursor += width;
            prefix
                .iter()
                .rev()
                .fold(0usize, |length, byte| (length << 8) | *byte as usize)
        }
        _ => 0,
    };

    let Some(data) = cursor.checked_add(length).and_then(|end| script.get(cursor..end)) else {
        return Some(Err(ScriptError::TruncatedPush(position)));
    };
    Some(Ok(Operation {
        opcode,
        data: data.to_vec(),
        end: cursor + length,
    }))
}

pub fn parse_script(script: &[u8]) -> Result<Vec<Operation>, ScriptError> {
    let mut operations = Vec::new();
    let mut position = 0;
    while let Some(operation) = read_operation(script, position) {
        let operation = operation?;
        position = operation.end;
        operations.push(operation);
    }
    Ok(operations)
}

pub fn is_push_only(script: &[u8]) -> bool {
    match parse_script(script) {
        Ok(operations) => operations.iter().all(|operation| is_push(operation.opcode)),
        Err(_) => false,
    }
}

/// Smallest push encoding of `data`
pub fn push_data(data: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(data.len() + 5);
    match data.len() {
        length if length < OP_PUSHDATA1 as usize => script.push(length as u8),
        length if length <= 0xff => {
            script.push(OP_PUSHDATA1);
            script.push(length as u8);
        }
        length if length <= 0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(length as u16).to_le_bytes());
        }
        length => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(length as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
    script
}

/// Push encoding of a number the way scripts are assembled: OP_0, OP_1NEGATE
/// and OP_1..OP_16 for small values, a data push otherwise
pub fn push_number(value: i64) -> Vec<u8> {
    match value {
        0 => vec![OP_0],
        -1 => vec![OP_1NEGATE],
        1..=16 => vec![OP_1 + (value as u8) - 1],
        _ => push_data(&super::num::encode_num(value)),
    }
}

/// Remove every occurrence of `pattern` that starts on an operation boundary
pub fn find_and_delete(script: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return script.to_vec();
    }

    let mut result = Vec::with_capacity(script.len());
    let mut position = 0;
    let mut copied_from = 0;
    loop {
        result.extend_from_slice(&script[copied_from..position]);
        while script[position..].starts_with(pattern) {
            position += pattern.len();
        }
        copied_from = position;
        match read_operation(script, position) {
            Some(Ok(operation)) => position = operation.end,
            _ => break,
        }
    }
    result.extend_from_slice(&script[copied_from..]);
    result
}

/// Drop OP_CODESEPARATOR operations, keeping every other byte as-is
pub fn remove_codeseparators(script: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(script.len());
    let mut position = 0;
    while let Some(Ok(operation)) = read_operation(script, position) {
        if operation.opcode != OP_CODESEPARATOR {
            result.extend_from_slice(&script[position..operation.end]);
        }
        position = operation.end;
    }
    result.extend_from_slice(&script[position..]);
    result
}
