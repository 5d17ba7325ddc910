//! Consensus rule checks applied to candidate blocks.

use std::collections::HashSet;
use std::sync::Arc;

use ledgerd_consensus::constants::{
    COINBASE_MATURITY, LOCKTIME_THRESHOLD, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT,
    MAX_COINBASE_SCRIPT_LEN, MAX_FUTURE_BLOCK_TIME, MIN_COINBASE_SCRIPT_LEN, WITNESS_SCALE_FACTOR,
};
use ledgerd_consensus::money::{money_range, Amount};
use ledgerd_consensus::{block_subsidy, ConsensusParams};
use ledgerd_pow::{check_proof_of_work, PowError};
use ledgerd_primitives::block::{merkle_root, Block, BlockHeader};
use ledgerd_primitives::transaction::{Transaction, TxOut, SEQUENCE_FINAL};
use rayon::prelude::*;

use crate::error::ConsensusError;
use crate::flags::ConsensusFlags;
use crate::index::ChainedHeader;
use crate::working::WorkingUtxoSet;

/// Chain facts a candidate header is judged against.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContextInformation {
    /// Height the candidate would take.
    pub height: i32,
    /// Median-time-past of the candidate's parent.
    pub median_time_past: i64,
    pub expected_bits: u32,
    pub adjusted_time: i64,
}

/// Rule checks the consensus loop runs, in order, for each block.
///
/// Every method is deterministic in its arguments. A failure carries the
/// rule class and a short reason code.
pub trait Validator: Send + Sync {
    fn params(&self) -> &ConsensusParams;

    fn check_block_header(&self, header: &BlockHeader) -> Result<(), ConsensusError>;

    fn contextual_check_block_header(
        &self,
        header: &BlockHeader,
        context: &ContextInformation,
    ) -> Result<(), ConsensusError>;

    fn contextual_check_block(
        &self,
        block: &Block,
        flags: &ConsensusFlags,
        context: &ContextInformation,
    ) -> Result<(), ConsensusError>;

    fn check_block(&self, block: &Block) -> Result<(), ConsensusError>;

    /// Spends and creates the block's coins in `view`. The set is returned
    /// only on success; on failure it is dropped with the error.
    fn execute_block(
        &self,
        block: &Block,
        header: &ChainedHeader,
        flags: &ConsensusFlags,
        view: WorkingUtxoSet,
    ) -> Result<WorkingUtxoSet, ConsensusError>;
}

/// One input's script evaluation request.
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub spent_output: &'a TxOut,
    pub flags: u32,
}

pub trait ScriptVerifier: Send + Sync {
    fn verify(&self, check: &ScriptCheck<'_>) -> bool;
}

/// Verifier used when script evaluation is delegated elsewhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllScripts;

impl ScriptVerifier for AcceptAllScripts {
    fn verify(&self, _check: &ScriptCheck<'_>) -> bool {
        true
    }
}

pub struct ConsensusValidator {
    params: ConsensusParams,
    scripts: Arc<dyn ScriptVerifier>,
}

impl ConsensusValidator {
    pub fn new(params: ConsensusParams) -> Self {
        Self {
            params,
            scripts: Arc::new(AcceptAllScripts),
        }
    }

    pub fn with_script_verifier(mut self, scripts: Arc<dyn ScriptVerifier>) -> Self {
        self.scripts = scripts;
        self
    }
}

impl Validator for ConsensusValidator {
    fn params(&self) -> &ConsensusParams {
        &self.params
    }

    fn check_block_header(&self, header: &BlockHeader) -> Result<(), ConsensusError> {
        check_proof_of_work(&header.hash(), header.bits, &self.params).map_err(|err| match err {
            PowError::HashMismatch => ConsensusError::header("high-hash"),
            PowError::InvalidBits(_) | PowError::Compact(_) => ConsensusError::header("bad-diffbits"),
        })
    }

    fn contextual_check_block_header(
        &self,
        header: &BlockHeader,
        context: &ContextInformation,
    ) -> Result<(), ConsensusError> {
        if header.bits != context.expected_bits {
            return Err(ConsensusError::header_context("bad-diffbits"));
        }
        let time = header.time as i64;
        if time <= context.median_time_past {
            return Err(ConsensusError::header_context("time-too-old"));
        }
        if time > context.adjusted_time + MAX_FUTURE_BLOCK_TIME {
            return Err(ConsensusError::header_context("time-too-new"));
        }
        let params = &self.params;
        let outdated = (header.version < 2 && context.height >= params.bip34_height)
            || (header.version < 3 && context.height >= params.bip66_height)
            || (header.version < 4 && context.height >= params.bip65_height);
        if outdated {
            return Err(ConsensusError::header_context("bad-version"));
        }
        Ok(())
    }

    fn contextual_check_block(
        &self,
        block: &Block,
        flags: &ConsensusFlags,
        context: &ContextInformation,
    ) -> Result<(), ConsensusError> {
        let cutoff = if flags.lock_time_uses_mtp {
            context.median_time_past
        } else {
            block.header.time as i64
        };
        if !block
            .transactions
            .iter()
            .all(|tx| is_final_tx(tx, context.height, cutoff))
        {
            return Err(ConsensusError::block_context("bad-txns-nonfinal"));
        }

        if flags.enforce_bip34 {
            let expected = script_push_int(context.height as i64);
            let matches = block
                .transactions
                .first()
                .and_then(|coinbase| coinbase.vin.first())
                .is_some_and(|input| input.script_sig.starts_with(&expected));
            if !matches {
                return Err(ConsensusError::block_context("bad-cb-height"));
            }
        }

        if block_weight(block) > MAX_BLOCK_WEIGHT as usize {
            return Err(ConsensusError::block_context("bad-blk-weight"));
        }
        Ok(())
    }

    fn check_block(&self, block: &Block) -> Result<(), ConsensusError> {
        let txids = block.txids();
        let (root, mutated) = merkle_root(&txids);
        if root != block.header.merkle_root {
            return Err(ConsensusError::structure("bad-txnmrklroot"));
        }
        if mutated {
            return Err(ConsensusError::structure("bad-txns-duplicate"));
        }

        let scale = WITNESS_SCALE_FACTOR as usize;
        let max_weight = MAX_BLOCK_WEIGHT as usize;
        if block.transactions.is_empty()
            || block.transactions.len() * scale > max_weight
            || block.serialized_size() * scale > max_weight
        {
            return Err(ConsensusError::structure("bad-blk-length"));
        }

        if !block.transactions[0].is_coinbase() {
            return Err(ConsensusError::structure("bad-cb-missing"));
        }
        if block.transactions[1..].iter().any(Transaction::is_coinbase) {
            return Err(ConsensusError::structure("bad-cb-multiple"));
        }

        for tx in &block.transactions {
            check_transaction(tx)?;
        }

        let mut seen = HashSet::with_capacity(txids.len());
        if !txids.iter().all(|txid| seen.insert(*txid)) {
            return Err(ConsensusError::structure("bad-txns-duplicate"));
        }

        let sigops: usize = block.transactions.iter().map(tx_legacy_sigops).sum();
        if sigops * scale > MAX_BLOCK_SIGOPS_COST as usize {
            return Err(ConsensusError::structure("bad-blk-sigops"));
        }
        Ok(())
    }

    fn execute_block(
        &self,
        block: &Block,
        header: &ChainedHeader,
        flags: &ConsensusFlags,
        mut view: WorkingUtxoSet,
    ) -> Result<WorkingUtxoSet, ConsensusError> {
        let txids = block.txids();
        if flags.enforce_bip30 && txids.iter().any(|txid| view.coins(txid).is_some()) {
            return Err(ConsensusError::block_context("bad-txns-BIP30"));
        }

        let mut fees: Amount = 0;
        let mut checks: Vec<(usize, usize, TxOut)> = Vec::new();
        for (tx_index, (tx, txid)) in block.transactions.iter().zip(&txids).enumerate() {
            if !tx.is_coinbase() {
                let mut value_in: Amount = 0;
                for (input_index, input) in tx.vin.iter().enumerate() {
                    let spent = view
                        .spend(&input.prevout)
                        .ok_or(ConsensusError::execution("bad-txns-inputs-missingorspent"))?;
                    if spent.coinbase && header.height - spent.height < COINBASE_MATURITY {
                        return Err(ConsensusError::execution(
                            "bad-txns-premature-spend-of-coinbase",
                        ));
                    }
                    value_in = value_in
                        .checked_add(spent.output.value)
                        .filter(|total| money_range(spent.output.value) && money_range(*total))
                        .ok_or(ConsensusError::execution(
                            "bad-txns-inputvalues-outofrange",
                        ))?;
                    checks.push((tx_index, input_index, spent.output));
                }
                let value_out = tx
                    .value_out()
                    .ok_or(ConsensusError::execution("bad-txns-txouttotal-toolarge"))?;
                if value_in < value_out {
                    return Err(ConsensusError::execution("bad-txns-in-belowout"));
                }
                fees = fees
                    .checked_add(value_in - value_out)
                    .filter(|total| money_range(*total))
                    .ok_or(ConsensusError::execution("bad-txns-fee-outofrange"))?;
            }
            view.add_transaction(tx, *txid, header.height);
        }

        let coinbase_out = block.transactions[0]
            .value_out()
            .ok_or(ConsensusError::execution("bad-cb-amount"))?;
        if coinbase_out > fees + block_subsidy(header.height, &self.params) {
            return Err(ConsensusError::execution("bad-cb-amount"));
        }

        let script_flags = flags.script_flags;
        let scripts = &self.scripts;
        let all_valid = checks.par_iter().all(|(tx_index, input_index, spent)| {
            scripts.verify(&ScriptCheck {
                tx: &block.transactions[*tx_index],
                input_index: *input_index,
                spent_output: spent,
                flags: script_flags,
            })
        });
        if !all_valid {
            return Err(ConsensusError::execution(
                "mandatory-script-verify-flag-failed",
            ));
        }
        Ok(view)
    }
}

fn check_transaction(tx: &Transaction) -> Result<(), ConsensusError> {
    if tx.vin.is_empty() {
        return Err(ConsensusError::structure("bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(ConsensusError::structure("bad-txns-vout-empty"));
    }
    if tx.serialized_size() * WITNESS_SCALE_FACTOR as usize > MAX_BLOCK_WEIGHT as usize {
        return Err(ConsensusError::structure("bad-txns-oversize"));
    }

    let mut total: Amount = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ConsensusError::structure("bad-txns-vout-negative"));
        }
        if !money_range(output.value) {
            return Err(ConsensusError::structure("bad-txns-vout-toolarge"));
        }
        total += output.value;
        if !money_range(total) {
            return Err(ConsensusError::structure("bad-txns-txouttotal-toolarge"));
        }
    }

    let mut prevouts = HashSet::with_capacity(tx.vin.len());
    if !tx.vin.iter().all(|input| prevouts.insert(input.prevout)) {
        return Err(ConsensusError::structure("bad-txns-inputs-duplicate"));
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
            return Err(ConsensusError::structure("bad-cb-length"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ConsensusError::structure("bad-txns-prevout-null"));
    }
    Ok(())
}

fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = tx.lock_time as i64;
    let compare = if tx.lock_time < LOCKTIME_THRESHOLD {
        height as i64
    } else {
        block_time
    };
    if lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Weight of a block without witness data.
fn block_weight(block: &Block) -> usize {
    block.serialized_size() * WITNESS_SCALE_FACTOR as usize
}

/// Serializes the script push of `value` that a BIP34 coinbase starts with.
pub fn script_push_int(value: i64) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1NEGATE: u8 = 0x4f;
    const OP_1: u8 = 0x51;
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![OP_1 + (value as u8 - 1)];
    }
    let data = script_num_to_vec(value);
    let mut script = Vec::with_capacity(data.len() + 1);
    push_data(&mut script, &data);
    script
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let sign_bit = 0x80u8;
    if let Some(last) = result.last_mut() {
        if (*last & sign_bit) != 0 {
            result.push(if value < 0 { sign_bit } else { 0 });
        } else if value < 0 {
            *last |= sign_bit;
        }
    }
    result
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    const OP_PUSHDATA1: u8 = 0x4c;
    const OP_PUSHDATA2: u8 = 0x4d;
    const OP_PUSHDATA4: u8 = 0x4e;

    if data.len() < OP_PUSHDATA1 as usize {
        script.push(data.len() as u8);
    } else if data.len() <= u8::MAX as usize {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
    } else if data.len() <= u16::MAX as usize {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(data.len() as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(data.len() as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

fn tx_legacy_sigops(tx: &Transaction) -> usize {
    let input_ops: usize = tx
        .vin
        .iter()
        .map(|input| legacy_sigops(&input.script_sig))
        .sum();
    let output_ops: usize = tx
        .vout
        .iter()
        .map(|output| legacy_sigops(&output.script_pubkey))
        .sum();
    input_ops + output_ops
}

/// Inaccurate sigop count: every CHECKMULTISIG counts as twenty.
fn legacy_sigops(script: &[u8]) -> usize {
    const OP_CHECKSIG: u8 = 0xac;
    const OP_CHECKSIGVERIFY: u8 = 0xad;
    const OP_CHECKMULTISIG: u8 = 0xae;
    const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    const OP_PUSHDATA1: u8 = 0x4c;
    const OP_PUSHDATA2: u8 = 0x4d;
    const OP_PUSHDATA4: u8 = 0x4e;

    let mut count = 0usize;
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let push_len = match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                count += 1;
                0
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += 20;
                0
            }
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => match script.get(cursor) {
                Some(len) => {
                    cursor += 1;
                    *len as usize
                }
                None => break,
            },
            OP_PUSHDATA2 => match script.get(cursor..cursor + 2) {
                Some(bytes) => {
                    cursor += 2;
                    u16::from_le_bytes([bytes[0], bytes[1]]) as usize
                }
                None => break,
            },
            OP_PUSHDATA4 => match script.get(cursor..cursor + 4) {
                Some(bytes) => {
                    cursor += 4;
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                None => break,
            },
            _ => 0,
        };
        if cursor + push_len > script.len() {
            break;
        }
        cursor += push_len;
    }
    count
}
