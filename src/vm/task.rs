// File: src/vm/task.rs
//
// Suspended task snapshots and the pooled stack holders.
// Suspension moves the live VM state out into a TaskState; resumption moves
// it back in. Emptied records are recycled through free lists.

use super::frame::Frame;
use crate::value::Value;

/// Identifier of a task, unique and monotonically increasing per run.
pub type TaskId = i64;

/// Opaque connection handle carried for the embedder; the engine only
/// saves and restores it across suspension.
pub type ConnId = i64;

/// A complete saved VM state: the frame chain, both stacks, the connection,
/// and the task identity.
#[derive(Debug, Default)]
pub(crate) struct TaskState {
    pub frames: Vec<Frame>,
    pub stack: Vec<Value>,
    pub arg_starts: Vec<usize>,
    pub conn: Option<ConnId>,
    pub task_id: TaskId,
    pub paused: bool,
}

/// A parked pair of stack buffers, kept so a fresh task can reuse the
/// capacity of a finished one.
#[derive(Debug, Default)]
pub(crate) struct StackHolder {
    pub stack: Vec<Value>,
    pub arg_starts: Vec<usize>,
}
