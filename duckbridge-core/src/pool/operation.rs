//! Named connection operations dispatched through `run_with_connection`.

use serde::Serialize;

use crate::error::PoolError;
use crate::types::Row;

/// One operation a pooled connection can perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Execute(String),
    ExecuteBatch(String),
    Query(String),
    Begin,
    Commit,
    Rollback,
    Reconnect,
    /// No-op on a pooled connection; the pool owns the real connection.
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum OperationOutput {
    Affected(usize),
    Rows(Vec<Row>),
    Done,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Execute(_) => "execute",
            Operation::ExecuteBatch(_) => "execute_batch",
            Operation::Query(_) => "query",
            Operation::Begin => "begin",
            Operation::Commit => "commit",
            Operation::Rollback => "rollback",
            Operation::Reconnect => "reconnect",
            Operation::Close => "close",
        }
    }

    /// Build an operation from its name and positional arguments.
    pub fn from_name<S: AsRef<str>>(name: &str, args: &[S]) -> Result<Self, PoolError> {
        let op = match name.trim().to_ascii_lowercase().as_str() {
            "execute" => Operation::Execute(single_sql("execute", args)?),
            "execute_batch" | "executebatch" => {
                Operation::ExecuteBatch(single_sql("execute_batch", args)?)
            }
            "query" => Operation::Query(single_sql("query", args)?),
            "begin" => no_args("begin", args, Operation::Begin)?,
            "commit" => no_args("commit", args, Operation::Commit)?,
            "rollback" => no_args("rollback", args, Operation::Rollback)?,
            "reconnect" => no_args("reconnect", args, Operation::Reconnect)?,
            "close" => no_args("close", args, Operation::Close)?,
            _ => return Err(PoolError::UnknownOperation(name.to_string())),
        };
        Ok(op)
    }
}

impl OperationOutput {
    pub fn affected(&self) -> Option<usize> {
        match self {
            OperationOutput::Affected(n) => Some(*n),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            OperationOutput::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

fn single_sql<S: AsRef<str>>(operation: &'static str, args: &[S]) -> Result<String, PoolError> {
    match args {
        [sql] => Ok(sql.as_ref().to_string()),
        _ => Err(PoolError::InvalidArguments {
            operation,
            reason: format!("expected 1 argument (sql), got {}", args.len()),
        }),
    }
}

fn no_args<S: AsRef<str>>(
    operation: &'static str,
    args: &[S],
    op: Operation,
) -> Result<Operation, PoolError> {
    if args.is_empty() {
        Ok(op)
    } else {
        Err(PoolError::InvalidArguments {
            operation,
            reason: format!("expected no arguments, got {}", args.len()),
        })
    }
}
