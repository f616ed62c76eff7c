//! The outer evaluation surface: callers hand in scripts and a spending
//! context, and get back a fail-closed [Evaluation].

use bytes::Bytes;

use crate::cache::BoundedCache;
use crate::chain::{ChainReader, OutPoint, Transaction, TxInput};
use crate::crypto;
use crate::error::ScriptError;
use crate::machine::Machine;
use crate::opcode::OpCode;
use crate::resolver::{self, Resolution};
use crate::script::Script;
use crate::validator;
use crate::value::Value;

/// Transactions cached per interpreter across validation passes.
const TX_CACHE_CAPACITY: usize = 2000;

/// The outcome of one script evaluation.
///
/// `value` is the only authorization signal. `code` carries the final
/// stack top for callers that dispatch on settlement phase codes, and
/// `error` records why a rejected evaluation was rejected.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub value: bool,
    pub code: Option<Value>,
    pub error: Option<ScriptError>,
}

/// The canonical payload a spender signs: the consumed outpoint bound to
/// the spending transaction's identity.
pub fn data_to_sign(outpoint: &OutPoint, tx: &Transaction) -> Vec<u8> {
    format!(
        "{} {} {} {}",
        outpoint.tx_hash, outpoint.index, tx.hash, tx.nonce
    )
    .into_bytes()
}

/// The digest of the signed payload travels as the bottom stack item, so
/// signature opcodes deep in the script can reach it.
fn signed_script(data_to_sign: &[u8], script: &Script) -> Script {
    let digest = crypto::blake2bl(data_to_sign);
    let mut ops = vec![OpCode::Push(Bytes::copy_from_slice(&digest))];
    ops.extend_from_slice(script.ops());
    Script::from_ops(ops)
}

fn evaluation_of(machine: &Machine) -> Evaluation {
    let code = machine.top();
    Evaluation {
        value: code.as_ref().map(Value::as_bool).unwrap_or(false),
        code,
        error: None,
    }
}

fn rejected(error: ScriptError) -> Evaluation {
    Evaluation {
        value: false,
        code: None,
        error: Some(error),
    }
}

/// A script interpreter bound to one persistence collaborator.
pub struct Interpreter<R: ChainReader> {
    reader: R,
    cache: BoundedCache<String, Transaction>,
}

impl<R: ChainReader> Interpreter<R> {
    pub fn new(reader: R) -> Self {
        Interpreter {
            reader,
            cache: BoundedCache::new(TX_CACHE_CAPACITY),
        }
    }

    /// Evaluates an environment-free script. Scripts using disabled
    /// opcodes are refused outright; execution faults come back as
    /// rejected evaluations.
    pub fn parse(
        &self,
        data_to_sign: &[u8],
        script: &Script,
        allow_disabled: bool,
    ) -> Result<Evaluation, ScriptError> {
        if !allow_disabled {
            if let Some(op) = validator::disabled_opcode(script) {
                return Err(ScriptError::DisabledOpcode(op.to_string()));
            }
        }
        let full = signed_script(data_to_sign, script);
        let mut machine = Machine::new().allow_disabled(allow_disabled);
        match machine.execute(&full) {
            Ok(()) => Ok(evaluation_of(&machine)),
            Err(e) => {
                log::debug!("execution fault: {e}");
                Ok(rejected(e))
            }
        }
    }

    /// Evaluates a spend, resolving the environment when the script needs
    /// one. Scripts without environment-dependent opcodes never touch
    /// storage. A failed resolution is a rejected evaluation, not an
    /// error.
    pub async fn parse_async(
        &self,
        data_to_sign: &[u8],
        output_script: &Script,
        input_script: &Script,
        input: &TxInput,
        tx: &Transaction,
        allow_disabled: bool,
    ) -> Result<Evaluation, ScriptError> {
        let combined = input_script.concat(output_script);
        if validator::first_async_opcode(&combined).is_none() {
            return self.parse(data_to_sign, &combined, allow_disabled);
        }
        if !allow_disabled {
            if let Some(op) = validator::disabled_opcode(&combined) {
                return Err(ScriptError::DisabledOpcode(op.to_string()));
            }
        }
        let resolution = match resolver::resolve(
            &self.reader,
            &self.cache,
            output_script,
            input_script,
            input,
            tx,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                log::warn!("environment resolution failed: {e}");
                return Ok(rejected(ScriptError::EnvironmentUnresolved(e.to_string())));
            }
        };
        let full = signed_script(data_to_sign, &resolution.script);
        let mut machine = Machine::with_env(&resolution.env).allow_disabled(allow_disabled);
        match machine.execute(&full) {
            Ok(()) => Ok(evaluation_of(&machine)),
            Err(e) => {
                log::debug!("execution fault: {e}");
                Ok(rejected(e))
            }
        }
    }

    /// Boolean reduction of [Interpreter::parse]; every failure mode is
    /// `false`.
    pub fn evaluate(&self, data_to_sign: &[u8], script: &Script) -> bool {
        self.parse(data_to_sign, script, false)
            .map(|e| e.value)
            .unwrap_or(false)
    }

    /// Boolean reduction of [Interpreter::parse_async].
    pub async fn evaluate_async(
        &self,
        data_to_sign: &[u8],
        output_script: &Script,
        input_script: &Script,
        input: &TxInput,
        tx: &Transaction,
    ) -> bool {
        self.parse_async(data_to_sign, output_script, input_script, input, tx, false)
            .await
            .map(|e| e.value)
            .unwrap_or(false)
    }

    /// Full spend check for one input: derives the signed payload from
    /// the outpoint and evaluates input against output.
    pub async fn unlock(
        &self,
        output_script: &Script,
        input_script: &Script,
        input: &TxInput,
        tx: &Transaction,
    ) -> Result<Evaluation, ScriptError> {
        let data = data_to_sign(&input.outpoint, tx);
        self.parse_async(&data, output_script, input_script, input, tx, false)
            .await
    }

    /// Resolution without execution, for callers that need the watch
    /// targets a script surfaces.
    pub async fn resolve(
        &self,
        output_script: &Script,
        input_script: &Script,
        input: &TxInput,
        tx: &Transaction,
    ) -> Result<Resolution, crate::error::ResolutionError> {
        resolver::resolve(
            &self.reader,
            &self.cache,
            output_script,
            input_script,
            input,
            tx,
        )
        .await
    }
}
