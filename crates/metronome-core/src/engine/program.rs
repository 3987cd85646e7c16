//! Workflow program representation
//!
//! A workflow is a finite sequence of statements over a small instruction
//! set. External front-ends (the `.flow` interpreter among them) compile
//! source text into this serde-friendly form; the engine itself never sees
//! source. Before execution the structured tree is flattened into a linear
//! instruction stream so the durable cursor is a plain integer and branch /
//! loop control flow becomes jumps.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Binary operators of the pure expression language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Pure expression over workflow inputs and locals
///
/// Evaluation is deterministic: the same inputs and locals always yield the
/// same value, which is what makes replay sound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    /// Literal JSON value
    Literal { value: Value },

    /// The workflow's inputs object
    Input,

    /// Reference to a local variable
    Local { name: String },

    /// Property access; missing keys evaluate to null
    Get { object: Box<Expr>, key: String },

    /// Object construction (field order preserved)
    Object { fields: Vec<(String, Expr)> },

    /// List construction
    List { items: Vec<Expr> },

    /// Binary operation
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Boolean negation
    Not { expr: Box<Expr> },
}

impl Expr {
    pub fn literal(value: Value) -> Self {
        Self::Literal { value }
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self::Local { name: name.into() }
    }

    pub fn get(object: Expr, key: impl Into<String>) -> Self {
        Self::Get {
            object: Box::new(object),
            key: key.into(),
        }
    }

    pub fn object(fields: Vec<(String, Expr)>) -> Self {
        Self::Object { fields }
    }
}

/// Per-call options for a `call_task` statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCallOptions {
    /// Dispatch queue; defaults to the parent workflow's queue
    #[serde(default)]
    pub queue: Option<String>,

    /// Dispatch priority
    #[serde(default)]
    pub priority: Option<i32>,

    /// Retry ceiling for the child task
    #[serde(default)]
    pub max_retries: Option<i32>,

    /// Per-task timeout override (seconds)
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

/// One statement of a workflow program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Statement {
    /// Bind a pure expression to a local
    Assign { var: String, expr: Expr },

    /// Schedule a child task and suspend until its result is known
    CallTask {
        result_var: String,
        task: String,
        args: Expr,
        #[serde(default)]
        options: TaskCallOptions,
    },

    /// Suspend until a named signal is delivered
    WaitSignal {
        result_var: String,
        signal: String,
        #[serde(default)]
        timeout_seconds: Option<i64>,
    },

    /// Deterministic version probe for gating code paths
    Version {
        result_var: String,
        change_id: String,
        min: i64,
        max: i64,
    },

    /// Structured conditional
    Branch {
        cond: Expr,
        then_block: Vec<Statement>,
        #[serde(default)]
        else_block: Vec<Statement>,
    },

    /// Bounded iteration: run `init` once, then repeat `body` + `step`
    /// while `cond` holds
    Loop {
        #[serde(default)]
        init: Vec<Statement>,
        cond: Expr,
        body: Vec<Statement>,
        #[serde(default)]
        step: Vec<Statement>,
    },

    /// Terminate the workflow with an output value
    Return { expr: Expr },
}

/// A workflow program as registered by a front-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgram {
    pub name: String,
    pub statements: Vec<Statement>,
}

/// One instruction of the flattened stream
///
/// The durable `statement_index` cursor points into this stream; structured
/// control flow has been lowered to jumps.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Assign {
        var: String,
        expr: Expr,
    },
    CallTask {
        result_var: String,
        task: String,
        args: Expr,
        options: TaskCallOptions,
    },
    WaitSignal {
        result_var: String,
        signal: String,
        timeout_seconds: Option<i64>,
    },
    Version {
        result_var: String,
        change_id: String,
        min: i64,
        max: i64,
    },
    Jump {
        target: usize,
    },
    JumpIfNot {
        cond: Expr,
        target: usize,
    },
    Return {
        expr: Expr,
    },
}

/// A compiled (flattened) workflow program
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProgram {
    pub name: String,
    pub instrs: Vec<Instr>,
}

impl WorkflowProgram {
    /// Flatten the statement tree into a linear instruction stream.
    ///
    /// Flattening is deterministic: the same program always produces the
    /// same stream, so persisted cursors stay valid across restarts.
    pub fn compile(&self) -> CompiledProgram {
        let mut instrs = Vec::new();
        flatten(&self.statements, &mut instrs);
        CompiledProgram {
            name: self.name.clone(),
            instrs,
        }
    }
}

fn flatten(statements: &[Statement], out: &mut Vec<Instr>) {
    for statement in statements {
        match statement {
            Statement::Assign { var, expr } => out.push(Instr::Assign {
                var: var.clone(),
                expr: expr.clone(),
            }),

            Statement::CallTask {
                result_var,
                task,
                args,
                options,
            } => out.push(Instr::CallTask {
                result_var: result_var.clone(),
                task: task.clone(),
                args: args.clone(),
                options: options.clone(),
            }),

            Statement::WaitSignal {
                result_var,
                signal,
                timeout_seconds,
            } => out.push(Instr::WaitSignal {
                result_var: result_var.clone(),
                signal: signal.clone(),
                timeout_seconds: *timeout_seconds,
            }),

            Statement::Version {
                result_var,
                change_id,
                min,
                max,
            } => out.push(Instr::Version {
                result_var: result_var.clone(),
                change_id: change_id.clone(),
                min: *min,
                max: *max,
            }),

            Statement::Return { expr } => out.push(Instr::Return { expr: expr.clone() }),

            Statement::Branch {
                cond,
                then_block,
                else_block,
            } => {
                let cond_jump = out.len();
                out.push(Instr::JumpIfNot {
                    cond: cond.clone(),
                    target: 0,
                });
                flatten(then_block, out);

                if else_block.is_empty() {
                    let after_then = out.len();
                    patch_target(out, cond_jump, after_then);
                } else {
                    let exit_jump = out.len();
                    out.push(Instr::Jump { target: 0 });
                    let else_start = out.len();
                    patch_target(out, cond_jump, else_start);
                    flatten(else_block, out);
                    let after_else = out.len();
                    patch_target(out, exit_jump, after_else);
                }
            }

            Statement::Loop {
                init,
                cond,
                body,
                step,
            } => {
                flatten(init, out);
                let loop_start = out.len();
                out.push(Instr::JumpIfNot {
                    cond: cond.clone(),
                    target: 0,
                });
                flatten(body, out);
                flatten(step, out);
                out.push(Instr::Jump { target: loop_start });
                let after_loop = out.len();
                patch_target(out, loop_start, after_loop);
            }
        }
    }
}

fn patch_target(out: &mut [Instr], index: usize, target: usize) {
    match &mut out[index] {
        Instr::Jump { target: t } | Instr::JumpIfNot { target: t, .. } => *t = target,
        _ => unreachable!("patched instruction is always a jump"),
    }
}

/// Registry of compiled workflow programs, keyed by workflow name
///
/// Populated at startup (before workers start), read-mostly afterwards.
pub struct ProgramRegistry {
    programs: RwLock<HashMap<String, Arc<CompiledProgram>>>,
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self {
            programs: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a program
    pub fn register(&self, program: WorkflowProgram) {
        let compiled = Arc::new(program.compile());
        self.programs
            .write()
            .insert(program.name.clone(), compiled);
    }

    /// Register a program from its JSON form
    pub fn register_json(&self, source: &str) -> Result<String, serde_json::Error> {
        let program: WorkflowProgram = serde_json::from_str(source)?;
        let name = program.name.clone();
        self.register(program);
        Ok(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CompiledProgram>> {
        self.programs.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.programs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.programs.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramRegistry")
            .field("programs", &self.names())
            .finish()
    }
}
