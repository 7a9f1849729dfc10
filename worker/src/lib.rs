//! Sandbox worker: one isolated process that runs model-generated
//! JavaScript against an injected document list, speaking the delver wire
//! protocol over stdio.

pub mod interpreter;
pub mod server;

pub use interpreter::Interpreter;
pub use interpreter::InterpreterError;
pub use interpreter::SubCallFailure;
pub use interpreter::SubCallFn;
pub use server::serve;
