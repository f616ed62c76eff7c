#![allow(clippy::upper_case_acronyms)]
#![doc = include_str!("../README.md")]

mod cache;
pub mod chain;
pub mod crypto;
mod driver;
pub mod env;
mod error;
mod machine;
mod opcode;
mod resolver;
mod script;
mod stack;
pub mod validator;
mod value;

pub use crate::cache::BoundedCache;
pub use crate::driver::{data_to_sign, Evaluation, Interpreter};
pub use crate::error::{ResolutionError, ScriptError};
pub use crate::machine::Machine;
pub use crate::opcode::{DecodeError, EncodeError, OpCode, EXTENDED_ESCAPE};
pub use crate::resolver::{resolve, Resolution, WatchTarget};
pub use crate::script::{mast_root, verify_mast_branch, OutputType, ParseError, Script};
pub use crate::stack::ScriptStack;
pub use crate::value::Value;
