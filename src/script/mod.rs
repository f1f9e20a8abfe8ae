//! Script execution engine
//!
//! Evaluates one input's unlocking script against the locking script of the
//! output it spends. Which rules apply depends on the height and median time
//! past of the block being validated, see [`ScriptFlags::for_context`].

pub mod interpreter;
pub mod num;
pub mod opcodes;
pub mod parser;
pub mod signature;

use thiserror::Error;

use crate::config::ChainParams;
use crate::types::*;
use interpreter::Interpreter;
use num::cast_to_bool;
use opcodes::*;
use parser::{is_push_only, parse_script};

/// Reasons a script evaluation fails. These are rule violations, reported to
/// callers as a failed verification rather than an infrastructure error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("script exceeds the maximum size")]
    ScriptSize,
    #[error("push exceeds the maximum element size")]
    PushSize,
    #[error("operation limit exceeded")]
    OpCount,
    #[error("stack size limit exceeded")]
    StackSize,
    #[error("disabled opcode 0x{0:02x}")]
    DisabledOpcode(u8),
    #[error("bad opcode 0x{0:02x}")]
    BadOpcode(u8),
    #[error("truncated push at offset {0}")]
    TruncatedPush(usize),
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("invalid stack operation")]
    InvalidStackOperation,
    #[error("invalid altstack operation")]
    InvalidAltstackOperation,
    #[error("OP_VERIFY failed")]
    Verify,
    #[error("OP_EQUALVERIFY failed")]
    EqualVerify,
    #[error("OP_NUMEQUALVERIFY failed")]
    NumEqualVerify,
    #[error("OP_CHECKSIGVERIFY failed")]
    CheckSigVerify,
    #[error("OP_CHECKMULTISIGVERIFY failed")]
    CheckMultiSigVerify,
    #[error("OP_CHECKDATASIGVERIFY failed")]
    CheckDataSigVerify,
    #[error("OP_RETURN executed")]
    OpReturn,
    #[error("numeric operand of {0} bytes exceeds the limit")]
    NumberOverflow(usize),
    #[error("operands differ in size")]
    InvalidOperandSize,
    #[error("split position out of range")]
    InvalidSplitRange,
    #[error("number out of range")]
    InvalidNumberRange,
    #[error("number does not fit the requested size")]
    ImpossibleEncoding,
    #[error("division by zero")]
    DivisionByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("public key count out of range")]
    PubkeyCount,
    #[error("signature count out of range")]
    SigCount,
    #[error("negative lock time")]
    NegativeLockTime,
    #[error("lock time requirement not satisfied")]
    UnsatisfiedLockTime,
    #[error("non-canonical DER signature")]
    SignatureDer,
    #[error("signature S value is not low")]
    SignatureHighS,
    #[error("invalid signature hash type")]
    SignatureHashType,
    #[error("SIGHASH_FORKID used before activation")]
    IllegalForkId,
    #[error("signature must use SIGHASH_FORKID")]
    MustUseForkId,
    #[error("invalid public key encoding")]
    PublicKeyType,
    #[error("failed signature check with a non-empty signature")]
    NullFail,
    #[error("unlocking script is not push-only")]
    PushOnly,
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("stack not clean after evaluation")]
    CleanStack,
    #[error("input index out of range")]
    InputIndex,
}

/// What a script may observe about the spend it authorizes
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub transaction: &'a Transaction,
    pub input_index: usize,
    /// Value of the output being spent
    pub amount: Integer,
    /// Height of the block containing the transaction
    pub block_height: Natural,
    /// Median time past of the block's parent
    pub median_time_past: u32,
}

/// Rule switches derived from fork activation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptFlags {
    pub p2sh: bool,
    pub strict_der: bool,
    pub strict_encoding: bool,
    pub low_s: bool,
    pub null_fail: bool,
    pub forkid: bool,
    pub check_locktime: bool,
    pub check_sequence: bool,
    pub monolith_opcodes: bool,
    pub push_only: bool,
    pub clean_stack: bool,
    pub check_data_sig: bool,
    pub segwit_recovery: bool,
}

impl ScriptFlags {
    pub fn for_context(params: &ChainParams, height: Natural, median_time_past: u32) -> Self {
        let uahf = params.is_uahf_active(height);
        let daa = params.is_daa_active(height);
        let magnetic_anomaly = params.is_magnetic_anomaly_active(height);
        Self {
            p2sh: params.is_bip16_active(height),
            strict_der: params.is_bip66_active(height),
            strict_encoding: uahf,
            low_s: daa,
            null_fail: daa,
            forkid: uahf,
            check_locktime: params.is_bip65_active(height),
            check_sequence: params.is_csv_active(height),
            monolith_opcodes: params.is_monolith_active(median_time_past),
            push_only: magnetic_anomaly,
            clean_stack: magnetic_anomaly && !params.is_clean_stack_retired(height),
            check_data_sig: magnetic_anomaly,
            segwit_recovery: params.is_segwit_recovery_active(median_time_past),
        }
    }
}

/// OP_HASH160 <20 bytes> OP_EQUAL
pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// A version opcode followed by a single 2..=40 byte push
pub fn is_segwit_program(script: &[u8]) -> bool {
    if !(4..=42).contains(&script.len()) {
        return false;
    }
    if script[0] != OP_0 && !(OP_1..=OP_16).contains(&script[0]) {
        return false;
    }
    script[1] as usize + 2 == script.len()
}

pub struct ScriptRunner<'a> {
    params: &'a ChainParams,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(params: &'a ChainParams) -> Self {
        Self { params }
    }

    /// Pass/fail verdict for one input. Malformed scripts are failures.
    pub fn run(&self, locking_script: &[u8], unlocking_script: &[u8], context: &ScriptContext<'_>) -> bool {
        self.verify(locking_script, unlocking_script, context).is_ok()
    }

    /// VerifyScript
    ///
    /// 1. Run the unlocking script on an empty stack (push-only once required)
    /// 2. Run the locking script on the resulting stack; its top must be true
    /// 3. For pay-to-script-hash, run the redeem script taken from the stack
    ///    as it was after step 1
    /// 4. Enforce the clean stack rule, except for segwit recovery spends
    pub fn verify(
        &self,
        locking_script: &[u8],
        unlocking_script: &[u8],
        context: &ScriptContext<'_>,
    ) -> Result<(), ScriptError> {
        let flags = ScriptFlags::for_context(self.params, context.block_height, context.median_time_past);
        if context.input_index >= context.transaction.inputs.len() {
            return Err(ScriptError::InputIndex);
        }
        if flags.push_only && !is_push_only(unlocking_script) {
            // Malformed pushes report as such
            parse_script(unlocking_script)?;
            return Err(ScriptError::PushOnly);
        }

        let mut interpreter = Interpreter::new(flags, context, Vec::new());
        interpreter.evaluate(unlocking_script)?;
        let snapshot = interpreter.stack.clone();

        interpreter.evaluate(locking_script)?;
        require_true(&interpreter.stack)?;
        let mut final_stack = interpreter.stack;

        let mut segwit_recovery = false;
        if flags.p2sh && is_p2sh(locking_script) {
            if !is_push_only(unlocking_script) {
                return Err(ScriptError::PushOnly);
            }
            let mut stack = snapshot;
            let redeem_script = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;

            let mut redeem = Interpreter::new(flags, context, stack);
            redeem.evaluate(&redeem_script)?;
            require_true(&redeem.stack)?;
            segwit_recovery = flags.segwit_recovery && is_segwit_program(&redeem_script);
            final_stack = redeem.stack;
        }

        if flags.clean_stack && !segwit_recovery && final_stack.len() != 1 {
            return Err(ScriptError::CleanStack);
        }
        Ok(())
    }
}

fn require_true(stack: &[Vec<u8>]) -> Result<(), ScriptError> {
    match stack.last() {
        Some(top) if cast_to_bool(top) => Ok(()),
        _ => Err(ScriptError::EvalFalse),
    }
}

#[cfg(test)]
mod tests {
    use super::interpreter::hash160;
    use super::parser::{push_data, push_number};
    use super::signature::*;
    use super::*;
    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

    fn spend() -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TransactionInput {
                prevout: OutPoint::new([7; 32], 0),
                script_sig: Vec::new(),
                sequence: 0xffff_fffe,
            }],
            outputs: vec![TransactionOutput {
                value: 900,
                script_pubkey: vec![OP_1],
            }],
            lock_time: 0,
        }
    }

    fn context(tx: &Transaction) -> ScriptContext<'_> {
        ScriptContext {
            transaction: tx,
            input_index: 0,
            amount: 1000,
            block_height: 10,
            median_time_past: 2_000_000_000,
        }
    }

    fn legacy_params() -> ChainParams {
        // Only P2SH active; no push-only, clean stack or monolith opcodes
        let mut params = ChainParams::regtest();
        params.bip66_height = u64::MAX;
        params.bip65_height = u64::MAX;
        params.csv_height = u64::MAX;
        params.uahf_height = u64::MAX;
        params.daa_height = u64::MAX;
        params.magnetic_anomaly_height = u64::MAX;
        params.monolith_activation_mtp = u32::MAX;
        params.segwit_recovery_activation_mtp = u32::MAX;
        params
    }

    fn run(params: &ChainParams, locking: &[u8], unlocking: &[u8]) -> Result<(), ScriptError> {
        let tx = spend();
        ScriptRunner::new(params).verify(locking, unlocking, &context(&tx))
    }

    #[test]
    fn test_arithmetic_and_equality() {
        let params = ChainParams::regtest();
        let locking = [OP_ADD, OP_5, OP_EQUAL];
        assert!(run(&params, &locking, &[OP_2, OP_3]).is_ok());
        assert_eq!(run(&params, &locking, &[OP_2, OP_2]), Err(ScriptError::EvalFalse));
    }

    #[test]
    fn test_conditionals_must_balance_per_script() {
        let params = ChainParams::regtest();
        assert!(run(&params, &[OP_IF, OP_1, OP_ELSE, OP_0, OP_ENDIF], &[OP_1]).is_ok());
        assert_eq!(
            run(&legacy_params(), &[OP_ENDIF, OP_1], &[OP_1, OP_IF]),
            Err(ScriptError::UnbalancedConditional)
        );
    }

    #[test]
    fn test_disabled_opcode_fails_in_unexecuted_branch() {
        let params = ChainParams::regtest();
        let locking = [OP_0, OP_IF, OP_MUL, OP_ENDIF, OP_1];
        assert_eq!(run(&params, &locking, &[]), Err(ScriptError::DisabledOpcode(OP_MUL)));
        // Reserved opcodes only fail when executed
        assert!(run(&params, &[OP_0, OP_IF, OP_RESERVED, OP_ENDIF, OP_1], &[]).is_ok());
    }

    #[test]
    fn test_monolith_opcodes_follow_activation() {
        let locking = [OP_CAT, 0x02, 0xab, 0xcd, OP_EQUAL];
        let unlocking = [0x01, 0xab, 0x01, 0xcd];
        assert!(run(&ChainParams::regtest(), &locking, &unlocking).is_ok());
        assert_eq!(
            run(&legacy_params(), &locking, &unlocking),
            Err(ScriptError::DisabledOpcode(OP_CAT))
        );
    }

    #[test]
    fn test_split_and_num2bin() {
        let params = ChainParams::regtest();
        // "abc" split at 1 -> "a" "bc"
        let locking = [OP_1, OP_SPLIT, 0x02, b'b', b'c', OP_EQUALVERIFY, 0x01, b'a', OP_EQUAL];
        assert!(run(&params, &locking, &[0x03, b'a', b'b', b'c']).is_ok());

        let locking = [OP_4, OP_NUM2BIN, 0x04, 0x02, 0x00, 0x00, 0x80, OP_EQUAL];
        assert!(run(&params, &locking, &[0x01, 0x82]).is_ok());
    }

    #[test]
    fn test_push_only_and_clean_stack() {
        let params = ChainParams::regtest();
        assert_eq!(run(&params, &[OP_1], &[OP_1, OP_DUP]), Err(ScriptError::PushOnly));
        assert_eq!(run(&params, &[OP_1], &[OP_1]), Err(ScriptError::CleanStack));
        assert!(run(&legacy_params(), &[OP_1], &[OP_1, OP_DUP]).is_ok());
    }

    #[test]
    fn test_clean_stack_retirement() {
        let mut params = ChainParams::regtest();
        params.clean_stack_retirement_height = Some(5);
        assert!(run(&params, &[OP_1], &[OP_1]).is_ok());
    }

    fn p2sh_locking(redeem_script: &[u8]) -> Vec<u8> {
        let mut locking = vec![OP_HASH160, 0x14];
        locking.extend_from_slice(&hash160(redeem_script));
        locking.push(OP_EQUAL);
        locking
    }

    #[test]
    fn test_p2sh_runs_redeem_script() {
        let params = ChainParams::regtest();
        let redeem_script = vec![OP_3, OP_EQUAL];
        let locking = p2sh_locking(&redeem_script);

        let mut unlocking = push_number(3);
        unlocking.extend(push_data(&redeem_script));
        assert!(run(&params, &locking, &unlocking).is_ok());

        let mut wrong = push_number(4);
        wrong.extend(push_data(&redeem_script));
        assert_eq!(run(&params, &locking, &wrong), Err(ScriptError::EvalFalse));
    }

    #[test]
    fn test_segwit_recovery_exempt_from_clean_stack() {
        let mut redeem_script = vec![OP_0, 0x14];
        redeem_script.extend_from_slice(&[0x42; 20]);
        assert!(is_segwit_program(&redeem_script));
        let locking = p2sh_locking(&redeem_script);
        let unlocking = push_data(&redeem_script);

        assert!(run(&ChainParams::regtest(), &locking, &unlocking).is_ok());

        let mut params = ChainParams::regtest();
        params.segwit_recovery_activation_mtp = u32::MAX;
        assert_eq!(run(&params, &locking, &unlocking), Err(ScriptError::CleanStack));
    }

    #[test]
    fn test_truncated_push_fails() {
        let params = legacy_params();
        assert_eq!(run(&params, &[OP_1], &[0x05, 0x01]), Err(ScriptError::TruncatedPush(0)));
    }

    #[test]
    fn test_locktime_verification() {
        let params = ChainParams::regtest();
        let mut tx = spend();
        tx.lock_time = 100;
        let runner = ScriptRunner::new(&params);
        let ctx = context(&tx);

        let mut satisfied = push_number(100);
        satisfied.extend([OP_CHECKLOCKTIMEVERIFY, OP_DROP, OP_1]);
        assert!(runner.verify(&satisfied, &[], &ctx).is_ok());

        let mut unsatisfied = push_number(101);
        unsatisfied.extend([OP_CHECKLOCKTIMEVERIFY, OP_DROP, OP_1]);
        assert_eq!(runner.verify(&unsatisfied, &[], &ctx), Err(ScriptError::UnsatisfiedLockTime));
    }

    fn sign(tx: &Transaction, key: &SecretKey, script_code: &[u8], amount: Integer, hash_type: u32, forkid: bool) -> Vec<u8> {
        let secp = Secp256k1::new();
        let digest = signature_hash(tx, 0, script_code, amount, hash_type, forkid);
        let message = Message::from_digest_slice(&digest).unwrap();
        let mut signature = secp.sign_ecdsa(&message, key).serialize_der().to_vec();
        signature.push(hash_type as u8);
        signature
    }

    fn p2pkh(public_key: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&hash160(public_key));
        script.extend([OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    #[test]
    fn test_p2pkh_forkid_signature() {
        let params = ChainParams::regtest();
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let public_key = PublicKey::from_secret_key(&secp, &key).serialize();
        let locking = p2pkh(&public_key);
        let tx = spend();

        let signature = sign(&tx, &key, &locking, 1000, SIGHASH_ALL | SIGHASH_FORKID, true);
        let mut unlocking = push_data(&signature);
        unlocking.extend(push_data(&public_key));
        let runner = ScriptRunner::new(&params);
        assert!(runner.run(&locking, &unlocking, &context(&tx)));

        // The digest commits to the spent amount
        let mut other_amount = context(&tx);
        other_amount.amount = 999;
        assert_eq!(runner.verify(&locking, &unlocking, &other_amount), Err(ScriptError::NullFail));
    }

    #[test]
    fn test_legacy_multisig_two_of_three() {
        let params = legacy_params();
        let secp = Secp256k1::new();
        let keys: Vec<SecretKey> = (1..=3u8).map(|seed| SecretKey::from_slice(&[seed; 32]).unwrap()).collect();
        let public_keys: Vec<[u8; 33]> = keys
            .iter()
            .map(|key| PublicKey::from_secret_key(&secp, key).serialize())
            .collect();

        let mut locking = vec![OP_2];
        for public_key in &public_keys {
            locking.extend(push_data(public_key));
        }
        locking.extend([OP_3, OP_CHECKMULTISIG]);

        let tx = spend();
        let first = sign(&tx, &keys[0], &locking, 1000, SIGHASH_ALL, false);
        let third = sign(&tx, &keys[2], &locking, 1000, SIGHASH_ALL, false);

        let mut unlocking = vec![OP_0];
        unlocking.extend(push_data(&first));
        unlocking.extend(push_data(&third));
        assert!(run(&params, &locking, &unlocking).is_ok());

        // Signatures out of key order do not verify
        let mut reversed = vec![OP_0];
        reversed.extend(push_data(&third));
        reversed.extend(push_data(&first));
        assert_eq!(run(&params, &locking, &reversed), Err(ScriptError::EvalFalse));
    }

    #[test]
    fn test_pattern_detection() {
        let mut p2sh = vec![OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[0; 20]);
        p2sh.push(OP_EQUAL);
        assert!(is_p2sh(&p2sh));
        assert!(!is_p2sh(&p2sh[..22]));
        assert!(!is_segwit_program(&[OP_0, 0x01, 0x00]));
        assert!(!is_segwit_program(&[OP_DUP, 0x02, 0x00, 0x00]));
        assert!(is_segwit_program(&[OP_16, 0x02, 0x00, 0x00]));
    }
}
