//! Signature digests, encoding rules and ECDSA verification

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use std::sync::OnceLock;

use super::ScriptError;
use crate::serialization::{double_sha256, encode_varint, write_output};
use crate::types::*;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Digest returned by the legacy algorithm for out-of-range SIGHASH_SINGLE
const SIGHASH_ONE: Hash = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static CONTEXT: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::verification_only)
}

/// Encoding rules active for one script evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignatureRules {
    pub strict_der: bool,
    pub strict_encoding: bool,
    pub low_s: bool,
    pub forkid: bool,
}

/// Strict DER check of a signature without its hash-type byte
pub fn is_valid_der(signature: &[u8]) -> bool {
    // 0x30 [total] 0x02 [R-len] [R] 0x02 [S-len] [S]
    let length = signature.len();
    if !(8..=72).contains(&length) {
        return false;
    }
    if signature[0] != 0x30 || signature[1] as usize != length - 2 {
        return false;
    }

    let r_length = signature[3] as usize;
    if 5 + r_length >= length {
        return false;
    }
    let s_length = signature[5 + r_length] as usize;
    if r_length + s_length + 6 != length {
        return false;
    }

    if signature[2] != 0x02 || r_length == 0 || signature[4] & 0x80 != 0 {
        return false;
    }
    if r_length > 1 && signature[4] == 0x00 && signature[5] & 0x80 == 0 {
        return false;
    }

    let s_start = r_length + 6;
    if signature[r_length + 4] != 0x02 || s_length == 0 || signature[s_start] & 0x80 != 0 {
        return false;
    }
    if s_length > 1 && signature[s_start] == 0x00 && signature[s_start + 1] & 0x80 == 0 {
        return false;
    }
    true
}

fn is_low_s(signature: &[u8]) -> bool {
    match Signature::from_der_lax(signature) {
        Ok(parsed) => {
            let mut normalized = parsed;
            normalized.normalize_s();
            normalized == parsed
        }
        Err(_) => false,
    }
}

/// Encoding checks for a transaction signature (DER + hash-type byte).
/// An empty signature passes: it simply fails verification.
pub fn check_transaction_signature_encoding(signature: &[u8], rules: &SignatureRules) -> Result<(), ScriptError> {
    let Some((hash_type, der)) = signature.split_last() else {
        return Ok(());
    };
    check_der_rules(der, rules)?;

    if rules.strict_encoding {
        let hash_type = *hash_type as u32;
        let base_type = hash_type & !(SIGHASH_ANYONECANPAY | SIGHASH_FORKID);
        if !(SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base_type) {
            return Err(ScriptError::SignatureHashType);
        }
        let uses_forkid = hash_type & SIGHASH_FORKID != 0;
        if uses_forkid && !rules.forkid {
            return Err(ScriptError::IllegalForkId);
        }
        if !uses_forkid && rules.forkid {
            return Err(ScriptError::MustUseForkId);
        }
    }
    Ok(())
}

/// Encoding checks for a data signature (DER only, no hash-type byte)
pub fn check_data_signature_encoding(signature: &[u8], rules: &SignatureRules) -> Result<(), ScriptError> {
    if signature.is_empty() {
        return Ok(());
    }
    check_der_rules(signature, rules)
}

fn check_der_rules(der: &[u8], rules: &SignatureRules) -> Result<(), ScriptError> {
    if (rules.strict_der || rules.low_s || rules.strict_encoding) && !is_valid_der(der) {
        return Err(ScriptError::SignatureDer);
    }
    if rules.low_s && !is_low_s(der) {
        return Err(ScriptError::SignatureHighS);
    }
    Ok(())
}

pub fn check_public_key_encoding(public_key: &[u8], rules: &SignatureRules) -> Result<(), ScriptError> {
    if !rules.strict_encoding {
        return Ok(());
    }
    let valid = match public_key.first() {
        Some(0x04) => public_key.len() == 65,
        Some(0x02) | Some(0x03) => public_key.len() == 33,
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ScriptError::PublicKeyType)
    }
}

/// ECDSA verification of a DER signature over a 32-byte digest.
/// Non-canonical DER and high S are tolerated here; the encoding rules above
/// decide whether they are acceptable at all.
pub fn verify_ecdsa(der: &[u8], public_key: &[u8], digest: &Hash) -> bool {
    let Ok(public_key) = PublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(mut signature) = Signature::from_der_lax(der) else {
        return false;
    };
    signature.normalize_s();
    let Ok(message) = Message::from_digest_slice(digest) else {
        return false;
    };
    secp().verify_ecdsa(&message, &signature, &public_key).is_ok()
}

/// Digest signed by a transaction signature
///
/// With SIGHASH_FORKID (once replay protection is active) the BIP143-style
/// algorithm commits to the spent amount; otherwise the legacy algorithm is used.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Integer,
    hash_type: u32,
    forkid_enabled: bool,
) -> Hash {
    if forkid_enabled && hash_type & SIGHASH_FORKID != 0 {
        forkid_signature_hash(tx, input_index, script_code, amount, hash_type)
    } else {
        legacy_signature_hash(tx, input_index, script_code, hash_type)
    }
}

fn forkid_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: Integer,
    hash_type: u32,
) -> Hash {
    let base_type = hash_type & 0x1f;
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;

    let hash_prevouts = if anyone_can_pay {
        [0u8; 32]
    } else {
        let mut data = Vec::with_capacity(tx.inputs.len() * 36);
        for input in &tx.inputs {
            data.extend_from_slice(&input.prevout.hash);
            data.extend_from_slice(&input.prevout.index.to_le_bytes());
        }
        double_sha256(&data)
    };

    let hash_sequence = if anyone_can_pay || base_type == SIGHASH_SINGLE || base_type == SIGHASH_NONE {
        [0u8; 32]
    } else {
        let data: Vec<u8> = tx.inputs.iter().flat_map(|input| input.sequence.to_le_bytes()).collect();
        double_sha256(&data)
    };

    let hash_outputs = if base_type != SIGHASH_SINGLE && base_type != SIGHASH_NONE {
        let mut data = Vec::new();
        for output in &tx.outputs {
            write_output(output, &mut data);
        }
        double_sha256(&data)
    } else if base_type == SIGHASH_SINGLE && input_index < tx.outputs.len() {
        let mut data = Vec::new();
        write_output(&tx.outputs[input_index], &mut data);
        double_sha256(&data)
    } else {
        [0u8; 32]
    };

    let input = &tx.inputs[input_index];
    let mut preimage = Vec::with_capacity(160 + script_code.len());
    preimage.extend_from_slice(&tx.version.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    preimage.extend_from_slice(&input.prevout.hash);
    preimage.extend_from_slice(&input.prevout.index.to_le_bytes());
    encode_varint(script_code.len() as u64, &mut preimage);
    preimage.extend_from_slice(script_code);
    preimage.extend_from_slice(&amount.to_le_bytes());
    preimage.extend_from_slice(&input.sequence.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&tx.lock_time.to_le_bytes());
    preimage.extend_from_slice(&hash_type.to_le_bytes());
    double_sha256(&preimage)
}

fn legacy_signature_hash(tx: &Transaction, input_index: usize, script_code: &[u8], hash_type: u32) -> Hash {
    let base_type = hash_type & 0x1f;
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;

    if input_index >= tx.inputs.len() {
        return SIGHASH_ONE;
    }
    // Historical quirk: SIGHASH_SINGLE without a matching output signs the number one
    if base_type == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        return SIGHASH_ONE;
    }

    let script_code = super::parser::remove_codeseparators(script_code);
    let mut preimage = Vec::new();
    preimage.extend_from_slice(&tx.version.to_le_bytes());

    let signed_inputs: Vec<usize> = if anyone_can_pay {
        vec![input_index]
    } else {
        (0..tx.inputs.len()).collect()
    };
    encode_varint(signed_inputs.len() as u64, &mut preimage);
    for index in signed_inputs {
        let input = &tx.inputs[index];
        preimage.extend_from_slice(&input.prevout.hash);
        preimage.extend_from_slice(&input.prevout.index.to_le_bytes());
        if index == input_index {
            encode_varint(script_code.len() as u64, &mut preimage);
            preimage.extend_from_slice(&script_code);
        } else {
            encode_varint(0, &mut preimage);
        }
        let zero_sequence = index != input_index && (base_type == SIGHASH_NONE || base_type == SIGHASH_SINGLE);
        let sequence = if zero_sequence { 0 } else { input.sequence };
        preimage.extend_from_slice(&sequence.to_le_bytes());
    }

    match base_type {
        SIGHASH_NONE => encode_varint(0, &mut preimage),
        SIGHASH_SINGLE => {
            encode_varint(input_index as u64 + 1, &mut preimage);
            let blank = TransactionOutput {
                value: -1,
                script_pubkey: Vec::new(),
            };
            for _ in 0..input_index {
                write_output(&blank, &mut preimage);
            }
            write_output(&tx.outputs[input_index], &mut preimage);
        }
        _ => {
            encode_varint(tx.outputs.len() as u64, &mut preimage);
            for output in &tx.outputs {
                write_output(output, &mut preimage);
            }
        }
    }

    preimage.extend_from_slice(&tx.lock_time.to_le_bytes());
    preimage.extend_from_slice(&hash_type.to_le_bytes());
    double_sha256(&preimage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn spending_tx(outputs: usize) -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![
                TransactionInput {
                    prevout: OutPoint::new([1; 32], 0),
                    script_sig: vec![],
                    sequence: 0xffffffff,
                },
                TransactionInput {
                    prevout: OutPoint::new([2; 32], 1),
                    script_sig: vec![],
                    sequence: 0xfffffffe,
                },
            ],
            outputs: (0..outputs)
                .map(|index| TransactionOutput {
                    value: 1000 + index as i64,
                    script_pubkey: vec![0x51],
                })
                .collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn test_der_validation() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let message = Message::from_digest_slice(&[0x22; 32]).unwrap();
        let der = secp.sign_ecdsa(&message, &key).serialize_der().to_vec();
        assert!(is_valid_der(&der));
        assert!(is_low_s(&der));

        let mut padded = der.clone();
        padded[1] += 1;
        padded.push(0x00);
        assert!(!is_valid_der(&padded));
        assert!(!is_valid_der(&der[..7]));
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x33; 32]).unwrap();
        let public_key = PublicKey::from_secret_key(&secp, &key).serialize();
        let digest = double_sha256(b"payload");
        let message = Message::from_digest_slice(&digest).unwrap();
        let der = secp.sign_ecdsa(&message, &key).serialize_der().to_vec();

        assert!(verify_ecdsa(&der, &public_key, &digest));
        assert!(!verify_ecdsa(&der, &public_key, &double_sha256(b"other")));
        assert!(!verify_ecdsa(&der, &[0x02; 10], &digest));
    }

    #[test]
    fn test_forkid_required_once_enabled() {
        let rules = SignatureRules {
            strict_der: true,
            strict_encoding: true,
            low_s: false,
            forkid: true,
        };
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x44; 32]).unwrap();
        let message = Message::from_digest_slice(&[0x55; 32]).unwrap();
        let mut signature = secp.sign_ecdsa(&message, &key).serialize_der().to_vec();
        signature.push((SIGHASH_ALL | SIGHASH_FORKID) as u8);
        assert!(check_transaction_signature_encoding(&signature, &rules).is_ok());

        let last = signature.len() - 1;
        signature[last] = SIGHASH_ALL as u8;
        assert_eq!(
            check_transaction_signature_encoding(&signature, &rules),
            Err(ScriptError::MustUseForkId)
        );

        signature[last] = 0x05;
        assert_eq!(
            check_transaction_signature_encoding(&signature, &rules),
            Err(ScriptError::SignatureHashType)
        );
    }

    #[test]
    fn test_empty_signature_passes_encoding_checks() {
        let rules = SignatureRules {
            strict_der: true,
            strict_encoding: true,
            low_s: true,
            forkid: true,
        };
        assert!(check_transaction_signature_encoding(&[], &rules).is_ok());
    }

    #[test]
    fn test_public_key_encoding() {
        let rules = SignatureRules {
            strict_encoding: true,
            ..SignatureRules::default()
        };
        assert!(check_public_key_encoding(&[0x02; 33], &rules).is_ok());
        assert!(check_public_key_encoding(&[0x04; 65], &rules).is_ok());
        assert!(check_public_key_encoding(&[0x04; 33], &rules).is_err());
        assert!(check_public_key_encoding(&[0x05; 33], &rules).is_err());
        assert!(check_public_key_encoding(&[0x05; 33], &SignatureRules::default()).is_ok());
    }

    #[test]
    fn test_legacy_single_without_output_signs_one() {
        let tx = spending_tx(1);
        assert_eq!(signature_hash(&tx, 1, &[0x51], 0, SIGHASH_SINGLE, false), SIGHASH_ONE);
        assert_ne!(signature_hash(&tx, 0, &[0x51], 0, SIGHASH_SINGLE, false), SIGHASH_ONE);
    }

    #[test]
    fn test_forkid_digest_commits_to_amount() {
        let tx = spending_tx(2);
        let hash_type = SIGHASH_ALL | SIGHASH_FORKID;
        let first = signature_hash(&tx, 0, &[0x51], 1000, hash_type, true);
        let second = signature_hash(&tx, 0, &[0x51], 1001, hash_type, true);
        assert_ne!(first, second);
        // Without replay protection the amount is not committed to
        let legacy_a = signature_hash(&tx, 0, &[0x51], 1000, hash_type, false);
        let legacy_b = signature_hash(&tx, 0, &[0x51], 1001, hash_type, false);
        assert_eq!(legacy_a, legacy_b);
    }

    #[test]
    fn test_anyone_can_pay_ignores_other_inputs() {
        let tx = spending_tx(2);
        let mut altered = tx.clone();
        altered.inputs[1].prevout = OutPoint::new([9; 32], 7);
        let hash_type = SIGHASH_ALL | SIGHASH_FORKID | SIGHASH_ANYONECANPAY;
        assert_eq!(
            signature_hash(&tx, 0, &[0x51], 5, hash_type, true),
            signature_hash(&altered, 0, &[0x51], 5, hash_type, true)
        );
        assert_ne!(
            signature_hash(&tx, 0, &[0x51], 5, SIGHASH_ALL | SIGHASH_FORKID, true),
            signature_hash(&altered, 0, &[0x51], 5, SIGHASH_ALL | SIGHASH_FORKID, true)
        );
    }
}
