//! Deterministic workflow interpreter with suspend/resume replay

mod eval;
mod interpreter;
mod program;

pub use eval::{eval_expr, EvalError};
pub use interpreter::{EngineConfig, EngineError, StepOutcome, WorkflowEngine};
pub use program::{
    BinaryOp, CompiledProgram, Expr, Instr, ProgramRegistry, Statement, TaskCallOptions,
    WorkflowProgram,
};
