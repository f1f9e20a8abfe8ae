//! Stack machine executing one script against a shared stack

use bitcoin_hashes::{sha1, Hash as BitcoinHash};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use super::num::{cast_to_bool, decode_num, encode_num, minimally_encode, DEFAULT_MAX_NUM_SIZE, LOCKTIME_MAX_NUM_SIZE};
use super::opcodes::*;
use super::parser::{find_and_delete, parse_script, push_data, Operation};
use super::signature::*;
use super::{ScriptContext, ScriptError, ScriptFlags};
use crate::constants::*;
use crate::serialization::double_sha256;

type StackItem = Vec<u8>;

pub struct Interpreter<'a> {
    flags: ScriptFlags,
    context: &'a ScriptContext<'a>,
    pub stack: Vec<StackItem>,
    alt_stack: Vec<StackItem>,
}

/// Per-script execution state
struct Frame<'s> {
    script: &'s [u8],
    conditions: Vec<bool>,
    op_count: usize,
    /// Start of the signed script code (after the last OP_CODESEPARATOR)
    code_start: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(flags: ScriptFlags, context: &'a ScriptContext<'a>, stack: Vec<StackItem>) -> Self {
        Self {
            flags,
            context,
            stack,
            alt_stack: Vec::new(),
        }
    }

    /// EvalScript
    ///
    /// 1. Reject oversized scripts and malformed pushes up front
    /// 2. For each operation: enforce push size, operation count and disabled
    ///    opcodes whether or not the branch executes
    /// 3. Execute pushes and opcodes on live branches; flow control always runs
    /// 4. Enforce the combined stack limit after every operation
    /// 5. Every conditional opened by the script must be closed by it
    pub fn evaluate(&mut self, script: &[u8]) -> Result<(), ScriptError> {
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptSize);
        }
        let operations = parse_script(script)?;
        self.alt_stack.clear();

        let mut frame = Frame {
            script,
            conditions: Vec::new(),
            op_count: 0,
            code_start: 0,
        };

        for operation in &operations {
            let opcode = operation.opcode;
            let executing = frame.conditions.iter().all(|condition| *condition);

            if operation.data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            if opcode > OP_16 {
                frame.op_count += 1;
                if frame.op_count > MAX_SCRIPT_OPS {
                    return Err(ScriptError::OpCount);
                }
            }
            if is_disabled(opcode, self.flags.monolith_opcodes) {
                return Err(ScriptError::DisabledOpcode(opcode));
            }

            if executing && opcode <= OP_PUSHDATA4 {
                self.stack.push(operation.data.clone());
            } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
                self.execute(operation, executing, &mut frame)?;
            }

            if self.stack.len() + self.alt_stack.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackSize);
            }
        }

        if !frame.conditions.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    fn execute(&mut self, operation: &Operation, executing: bool, frame: &mut Frame<'_>) -> Result<(), ScriptError> {
        let opcode = operation.opcode;
        match opcode {
            // OP_1NEGATE, OP_1..OP_16 - push small numbers
            OP_1NEGATE => self.stack.push(encode_num(-1)),
            OP_1..=OP_16 => self.stack.push(encode_num((opcode - OP_1 + 1) as i64)),

            OP_NOP | OP_NOP1 | OP_NOP4..=OP_NOP10 => {}

            // OP_CHECKLOCKTIMEVERIFY - NOP2 until BIP65
            OP_CHECKLOCKTIMEVERIFY => {
                if self.flags.check_locktime {
                    let lock_time = decode_num(self.top(1)?, LOCKTIME_MAX_NUM_SIZE)?;
                    if lock_time < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    if !self.check_lock_time(lock_time) {
                        return Err(ScriptError::UnsatisfiedLockTime);
                    }
                }
            }

            // OP_CHECKSEQUENCEVERIFY - NOP3 until BIP112
            OP_CHECKSEQUENCEVERIFY => {
                if self.flags.check_sequence {
                    let sequence = decode_num(self.top(1)?, LOCKTIME_MAX_NUM_SIZE)?;
                    if sequence < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 == 0 && !self.check_sequence(sequence) {
                        return Err(ScriptError::UnsatisfiedLockTime);
                    }
                }
            }

            OP_IF | OP_NOTIF => {
                let mut value = false;
                if executing {
                    value = cast_to_bool(&self.pop()?);
                    if opcode == OP_NOTIF {
                        value = !value;
                    }
                }
                frame.conditions.push(value);
            }
            OP_ELSE => {
                let last = frame
                    .conditions
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *last = !*last;
            }
            OP_ENDIF => {
                frame.conditions.pop().ok_or(ScriptError::UnbalancedConditional)?;
            }

            OP_VERIFY => {
                if !cast_to_bool(&self.pop()?) {
                    return Err(ScriptError::Verify);
                }
            }
            OP_RETURN => return Err(ScriptError::OpReturn),

            // Stack operations
            OP_TOALTSTACK => {
                let item = self.pop()?;
                self.alt_stack.push(item);
            }
            OP_FROMALTSTACK => {
                let item = self.alt_stack.pop().ok_or(ScriptError::InvalidAltstackOperation)?;
                self.stack.push(item);
            }
            OP_2DROP => {
                self.require(2)?;
                self.stack.truncate(self.stack.len() - 2);
            }
            OP_2DUP => {
                self.require(2)?;
                let len = self.stack.len();
                self.stack.extend_from_within(len - 2..);
            }
            OP_3DUP => {
                self.require(3)?;
                let len = self.stack.len();
                self.stack.extend_from_within(len - 3..);
            }
            OP_2OVER => {
                self.require(4)?;
                let len = self.stack.len();
                self.stack.extend_from_within(len - 4..len - 2);
            }
            OP_2ROT => {
                self.require(6)?;
                let len = self.stack.len();
                let moved: Vec<StackItem> = self.stack.drain(len - 6..len - 4).collect();
                self.stack.extend(moved);
            }
            OP_2SWAP => {
                self.require(4)?;
                let len = self.stack.len();
                self.stack.swap(len - 4, len - 2);
                self.stack.swap(len - 3, len - 1);
            }
            OP_IFDUP => {
                let top = self.top(1)?.clone();
                if cast_to_bool(&top) {
                    self.stack.push(top);
                }
            }
            OP_DEPTH => self.stack.push(encode_num(self.stack.len() as i64)),
            OP_DROP => {
                self.pop()?;
            }
            OP_DUP => {
                let top = self.top(1)?.clone();
                self.stack.push(top);
            }
            OP_NIP => {
                self.require(2)?;
                let len = self.stack.len();
                self.stack.remove(len - 2);
            }
            OP_OVER => {
                let second = self.top(2)?.clone();
                self.stack.push(second);
            }
            OP_PICK | OP_ROLL => {
                self.require(2)?;
                let depth = self.pop_num()?;
                if depth < 0 || depth as usize >= self.stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let index = self.stack.len() - 1 - depth as usize;
                let item = if opcode == OP_ROLL {
                    self.stack.remove(index)
                } else {
                    self.stack[index].clone()
                };
                self.stack.push(item);
            }
            OP_ROT => {
                self.require(3)?;
                let len = self.stack.len();
                let item = self.stack.remove(len - 3);
                self.stack.push(item);
            }
            OP_SWAP => {
                self.require(2)?;
                let len = self.stack.len();
                self.stack.swap(len - 2, len - 1);
            }
            OP_TUCK => {
                self.require(2)?;
                let top = self.top(1)?.clone();
                let len = self.stack.len();
                self.stack.insert(len - 2, top);
            }

            // Splice operations
            OP_CAT => {
                let second = self.pop_after(2)?;
                let first = self.stack.last_mut().ok_or(ScriptError::InvalidStackOperation)?;
                if first.len() + second.len() > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                first.extend_from_slice(&second);
            }
            OP_SPLIT => {
                self.require(2)?;
                let position = self.pop_num()?;
                let data = self.pop()?;
                if position < 0 || position as usize > data.len() {
                    return Err(ScriptError::InvalidSplitRange);
                }
                let (left, right) = data.split_at(position as usize);
                self.stack.push(left.to_vec());
                self.stack.push(right.to_vec());
            }
            OP_NUM2BIN => {
                self.require(2)?;
                let size = self.pop_num()?;
                if size < 0 || size as usize > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                let size = size as usize;
                let mut number = minimally_encode(self.pop()?);
                if number.len() > size {
                    return Err(ScriptError::ImpossibleEncoding);
                }
                if number.len() < size {
                    let mut sign = 0x00;
                    if let Some(last) = number.last_mut() {
                        sign = *last & 0x80;
                        *last &= 0x7f;
                    }
                    number.resize(size - 1, 0x00);
                    number.push(sign);
                }
                self.stack.push(number);
            }
            OP_BIN2NUM => {
                let number = minimally_encode(self.pop()?);
                if number.len() > DEFAULT_MAX_NUM_SIZE {
                    return Err(ScriptError::InvalidNumberRange);
                }
                self.stack.push(number);
            }
            OP_SIZE => {
                let size = self.top(1)?.len();
                self.stack.push(encode_num(size as i64));
            }

            // Bitwise logic
            OP_AND | OP_OR | OP_XOR => {
                let second = self.pop_after(2)?;
                let first = self.stack.last_mut().ok_or(ScriptError::InvalidStackOperation)?;
                if first.len() != second.len() {
                    return Err(ScriptError::InvalidOperandSize);
                }
                for (left, right) in first.iter_mut().zip(second.iter()) {
                    match opcode {
                        OP_AND => *left &= right,
                        OP_OR => *left |= right,
                        _ => *left ^= right,
                    }
                }
            }
            OP_EQUAL | OP_EQUALVERIFY => {
                self.require(2)?;
                let second = self.pop()?;
                let first = self.pop()?;
                let equal = first == second;
                if opcode == OP_EQUALVERIFY {
                    if !equal {
                        return Err(ScriptError::EqualVerify);
                    }
                } else {
                    self.push_bool(equal);
                }
            }

            // Unary arithmetic
            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let value = self.pop_num()?;
                let result = match opcode {
                    OP_1ADD => value + 1,
                    OP_1SUB => value - 1,
                    OP_NEGATE => -value,
                    OP_ABS => value.abs(),
                    OP_NOT => (value == 0) as i64,
                    _ => (value != 0) as i64,
                };
                self.stack.push(encode_num(result));
            }

            // Binary arithmetic
            OP_ADD | OP_SUB | OP_DIV | OP_MOD | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL
            | OP_NUMEQUALVERIFY | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN
            | OP_LESSTHANOREQUAL | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                self.require(2)?;
                let right = self.pop_num()?;
                let left = self.pop_num()?;
                let result = match opcode {
                    OP_ADD => left + right,
                    OP_SUB => left - right,
                    OP_DIV => {
                        if right == 0 {
                            return Err(ScriptError::DivisionByZero);
                        }
                        left / right
                    }
                    OP_MOD => {
                        if right == 0 {
                            return Err(ScriptError::ModuloByZero);
                        }
                        left % right
                    }
                    OP_BOOLAND => (left != 0 && right != 0) as i64,
                    OP_BOOLOR => (left != 0 || right != 0) as i64,
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => (left == right) as i64,
                    OP_NUMNOTEQUAL => (left != right) as i64,
                    OP_LESSTHAN => (left < right) as i64,
                    OP_GREATERTHAN => (left > right) as i64,
                    OP_LESSTHANOREQUAL => (left <= right) as i64,
                    OP_GREATERTHANOREQUAL => (left >= right) as i64,
                    OP_MIN => left.min(right),
                    _ => left.max(right),
                };
                if opcode == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::NumEqualVerify);
                    }
                } else {
                    self.stack.push(encode_num(result));
                }
            }
            OP_WITHIN => {
                self.require(3)?;
                let maximum = self.pop_num()?;
                let minimum = self.pop_num()?;
                let value = self.pop_num()?;
                self.push_bool(minimum <= value && value < maximum);
            }

            // Hashing
            OP_RIPEMD160 => {
                let item = self.pop()?;
                self.stack.push(Ripemd160::digest(&item).to_vec());
            }
            OP_SHA1 => {
                let item = self.pop()?;
                self.stack.push(sha1::Hash::hash(&item).into_inner().to_vec());
            }
            OP_SHA256 => {
                let item = self.pop()?;
                self.stack.push(Sha256::digest(&item).to_vec());
            }
            OP_HASH160 => {
                let item = self.pop()?;
                self.stack.push(hash160(&item).to_vec());
            }
            OP_HASH256 => {
                let item = self.pop()?;
                self.stack.push(double_sha256(&item).to_vec());
            }

            OP_CODESEPARATOR => frame.code_start = operation.end,

            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                self.require(2)?;
                let public_key = self.pop()?;
                let signature = self.pop()?;
                let success = self.check_signature(&signature, &public_key, &frame.script[frame.code_start..], &[])?;
                if !success && self.flags.null_fail && !signature.is_empty() {
                    return Err(ScriptError::NullFail);
                }
                if opcode == OP_CHECKSIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckSigVerify);
                    }
                } else {
                    self.push_bool(success);
                }
            }

            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let success = self.check_multisig(frame)?;
                if opcode == OP_CHECKMULTISIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckMultiSigVerify);
                    }
                } else {
                    self.push_bool(success);
                }
            }

            OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY if self.flags.check_data_sig => {
                self.require(3)?;
                let public_key = self.pop()?;
                let message = self.pop()?;
                let signature = self.pop()?;
                let rules = self.signature_rules();
                check_data_signature_encoding(&signature, &rules)?;
                check_public_key_encoding(&public_key, &rules)?;

                let success = !signature.is_empty() && {
                    let mut digest = [0u8; 32];
                    digest.copy_from_slice(&Sha256::digest(&message));
                    verify_ecdsa(&signature, &public_key, &digest)
                };
                if !success && self.flags.null_fail && !signature.is_empty() {
                    return Err(ScriptError::NullFail);
                }
                if opcode == OP_CHECKDATASIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckDataSigVerify);
                    }
                } else {
                    self.push_bool(success);
                }
            }

            _ => return Err(ScriptError::BadOpcode(opcode)),
        }
        Ok(())
    }

    fn signature_rules(&self) -> SignatureRules {
        SignatureRules {
            strict_der: self.flags.strict_der,
            strict_encoding: self.flags.strict_encoding,
            low_s: self.flags.low_s,
            forkid: self.flags.forkid,
        }
    }

    /// Verify one transaction signature against `script_code`, after removing
    /// `extra_signatures` (and this signature) from legacy script code.
    fn check_signature(
        &self,
        signature: &[u8],
        public_key: &[u8],
        script_code: &[u8],
        extra_signatures: &[StackItem],
    ) -> Result<bool, ScriptError> {
        let rules = self.signature_rules();
        check_transaction_signature_encoding(signature, &rules)?;
        check_public_key_encoding(public_key, &rules)?;

        let Some((hash_type, der)) = signature.split_last() else {
            return Ok(false);
        };
        let hash_type = *hash_type as u32;

        // Legacy signatures cannot sign themselves
        let mut script_code = script_code.to_vec();
        for removed in extra_signatures.iter().map(Vec::as_slice).chain(std::iter::once(signature)) {
            let uses_forkid = removed.last().map_or(false, |byte| *byte as u32 & SIGHASH_FORKID != 0);
            if !(self.flags.forkid && uses_forkid) {
                script_code = find_and_delete(&script_code, &push_data(removed));
            }
        }

        let context = self.context;
        if context.input_index >= context.transaction.inputs.len() {
            return Err(ScriptError::InputIndex);
        }
        let digest = signature_hash(
            context.transaction,
            context.input_index,
            &script_code,
            context.amount,
            hash_type,
            self.flags.forkid,
        );
        Ok(verify_ecdsa(der, public_key, &digest))
    }

    /// CHECKMULTISIG: [dummy] sig_1..sig_m m key_1..key_n n
    ///
    /// Signatures must match keys in order; each key is tried at most once.
    /// The extra dummy element is consumed without inspection.
    fn check_multisig(&mut self, frame: &mut Frame<'_>) -> Result<bool, ScriptError> {
        let key_count = self.top_num(1)?;
        if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
            return Err(ScriptError::PubkeyCount);
        }
        let key_count = key_count as usize;
        frame.op_count += key_count;
        if frame.op_count > MAX_SCRIPT_OPS {
            return Err(ScriptError::OpCount);
        }

        let signature_count_depth = key_count + 2;
        let signature_count = self.top_num(signature_count_depth)?;
        if signature_count < 0 || signature_count as usize > key_count {
            return Err(ScriptError::SigCount);
        }
        let signature_count = signature_count as usize;
        // Arguments plus the dummy element
        self.require(signature_count_depth + signature_count + 1)?;

        let len = self.stack.len();
        let keys: Vec<StackItem> = (0..key_count)
            .map(|offset| self.stack[len - 2 - offset].clone())
            .collect();
        let signatures: Vec<StackItem> = (0..signature_count)
            .map(|offset| self.stack[len - 1 - signature_count_depth - offset].clone())
            .collect();

        let script_code = &frame.script[frame.code_start..];
        let mut success = true;
        let mut key_index = 0;
        let mut signature_index = 0;
        while success && signature_index < signatures.len() {
            let signature = &signatures[signature_index];
            let public_key = &keys[key_index];
            let others: Vec<StackItem> = signatures
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != signature_index)
                .map(|(_, other)| other.clone())
                .collect();
            if self.check_signature(signature, public_key, script_code, &others)? {
                signature_index += 1;
            }
            key_index += 1;
            if signatures.len() - signature_index > keys.len() - key_index {
                success = false;
            }
        }

        if !success && self.flags.null_fail && signatures.iter().any(|signature| !signature.is_empty()) {
            return Err(ScriptError::NullFail);
        }

        self.stack.truncate(len - signature_count_depth - signature_count - 1);
        Ok(success)
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx = self.context.transaction;
        let tx_lock_time = tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        let same_kind = (tx_lock_time < threshold) == (lock_time < threshold);
        if !same_kind || lock_time > tx_lock_time {
            return false;
        }
        match tx.inputs.get(self.context.input_index) {
            Some(input) => input.sequence != SEQUENCE_FINAL,
            None => false,
        }
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let tx = self.context.transaction;
        let Some(input) = tx.inputs.get(self.context.input_index) else {
            return false;
        };
        if tx.version < 2 || input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let tx_masked = input.sequence as i64 & mask;
        let required_masked = sequence & mask;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        let same_kind = (tx_masked < type_flag) == (required_masked < type_flag);
        same_kind && required_masked <= tx_masked
    }

    fn require(&self, count: usize) -> Result<(), ScriptError> {
        if self.stack.len() < count {
            return Err(ScriptError::InvalidStackOperation);
        }
        Ok(())
    }

    /// Item `depth` places from the top (1 = top)
    fn top(&self, depth: usize) -> Result<&StackItem, ScriptError> {
        self.require(depth)?;
        Ok(&self.stack[self.stack.len() - depth])
    }

    fn top_num(&self, depth: usize) -> Result<i64, ScriptError> {
        decode_num(self.top(depth)?, DEFAULT_MAX_NUM_SIZE)
    }

    fn pop(&mut self) -> Result<StackItem, ScriptError> {
        self.stack.pop().ok_or(ScriptError::InvalidStackOperation)
    }

    /// Pop the top item after checking `count` items are present
    fn pop_after(&mut self, count: usize) -> Result<StackItem, ScriptError> {
        self.require(count)?;
        self.pop()
    }

    fn pop_num(&mut self) -> Result<i64, ScriptError> {
        let item = self.pop()?;
        decode_num(&item, DEFAULT_MAX_NUM_SIZE)
    }

    fn push_bool(&mut self, value: bool) {
        self.stack.push(if value { vec![1] } else { Vec::new() });
    }
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Ripemd160::digest(Sha256::digest(data)));
    hash
}
