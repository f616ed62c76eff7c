use thiserror::Error;

/// A fault raised while executing a script.
///
/// Every variant is fail-closed: the boolean reductions in the driver turn
/// any of these into "not authorized", never into a successful spend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script uses disabled opcode {0}")]
    DisabledOpcode(String),
    #[error("stack underflow: needed {needed} items, have {depth}")]
    StackUnderflow { needed: usize, depth: usize },
    #[error("verify failed")]
    VerifyFailed,
    #[error("bad opcode: {0}")]
    BadOpcode(String),
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("environment unresolved: {0}")]
    EnvironmentUnresolved(String),
}

/// A failure while assembling the execution environment.
///
/// Resolution errors are reported to the caller as rejected evaluations;
/// they must never surface as a successful result.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("unable to load outpoint transaction {hash} on {chain}")]
    MissingOutpoint { hash: String, chain: String },
    #[error("unable to load block {0}")]
    MissingBlock(String),
    #[error("malformed outpoint reference: {0}")]
    BadOutpoint(String),
    #[error("unable to recover script referenced callback {hash}:{index}")]
    UnresolvedCallback { hash: String, index: u32 },
    #[error("callback referenced script does not carry the monoid tag")]
    CallbackNotMonoid,
    #[error("script contains both monoid and callback")]
    MonoidWithCallback,
    #[error("monoid isomorphism broken: {found} tagged outpoints in inputs")]
    BrokenIsomorphism { found: usize },
    #[error("malformed script: {0}")]
    BadScript(String),
}
