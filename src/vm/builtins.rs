// File: src/vm/builtins.rs
//
// The built-in functions the engine itself provides: scheduler controls and
// the error-protocol intrinsics. Every native gates its argument slice
// through func_init before touching it: arity, slot types, then the
// optional object binding.

use super::Vm;
use crate::ident::ids;
use crate::object::ObjectStore;
use crate::value::{Dbref, Tag, Value};

/// Located argument slice of a native call: `[start, start + count)` on the
/// value stack.
pub(crate) struct NativeArgs {
    pub start: usize,
    pub count: usize,
}

const ORDINALS: [&str; 3] = ["first", "second", "third"];

fn english_type(tag: Tag) -> &'static str {
    match tag {
        Tag::Int => "an integer",
        Tag::Float => "a float",
        Tag::Str => "a string",
        Tag::Dbref => "a dbref",
        Tag::List => "a list",
        Tag::Dict => "a dictionary",
        Tag::Symbol => "a symbol",
        Tag::Error => "an error",
        Tag::Buffer => "a buffer",
        Tag::Frob => "a frob",
    }
}

impl<S: ObjectStore> Vm<S> {
    /// Locate and validate a native's argument slice. Pops the argument
    /// start unconditionally; on any failure the error is raised and the
    /// slice is left on the stack for unwinding to clean.
    fn func_init(
        &mut self,
        lo: usize,
        hi: usize,
        required: &'static str,
        types: &[Option<Tag>],
    ) -> Option<NativeArgs> {
        let start = self.pop_arg_start();
        let count = self.stack.len() - start;

        if count < lo || count > hi {
            self.func_num_error(count, required);
            return None;
        }

        for (i, expected) in types.iter().enumerate() {
            if i >= count {
                break;
            }
            if let Some(tag) = expected {
                if self.stack[start + i].tag() != *tag {
                    let repr = self.stack[start + i].to_string();
                    let msg = format!(
                        "The {} argument ({}) is not {}.",
                        ORDINALS[i],
                        repr,
                        english_type(*tag)
                    );
                    self.cthrow(ids().type_id, msg);
                    return None;
                }
            }
        }

        if let Some(definer) = self.binding_violation() {
            let msg = format!("Caller (#{}) is not the object bound to this function.", definer);
            self.cthrow(ids().perm_id, msg);
            return None;
        }

        Some(NativeArgs { start, count })
    }

    fn func_num_error(&mut self, count: usize, required: &'static str) {
        let msg = format!(
            "Called with {} argument{}, requires {}.",
            count,
            if count == 1 { "" } else { "s" },
            required
        );
        self.cthrow(ids().numargs_id, msg);
    }

    /// If the running built-in is bound to an object and the calling
    /// method's definer differs, report the violating definer.
    fn binding_violation(&self) -> Option<Dbref> {
        let f = self.frames.last()?;
        let bound = *self.bindings.get(&f.last_opcode)?;
        if bound != f.method.definer {
            Some(f.method.definer)
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Scheduler controls
    // ------------------------------------------------------------------

    pub(crate) fn fun_pause(&mut self) {
        if self.func_init(0, 0, "none", &[]).is_none() {
            return;
        }
        // The call's value after resumption; it must be in the snapshot.
        self.push(Value::Int(0));
        self.task_pause();
    }

    pub(crate) fn fun_suspend(&mut self) {
        if self.func_init(0, 0, "none", &[]).is_none() {
            return;
        }
        // task_resume pushes the call's value when the task comes back.
        self.task_suspend();
    }

    pub(crate) fn fun_resume(&mut self) {
        let args = match self.func_init(1, 2, "one or two", &[Some(Tag::Int), None]) {
            Some(args) => args,
            None => return,
        };
        let tid = match self.stack[args.start] {
            Value::Int(tid) => tid,
            _ => return,
        };
        if !self.suspended.iter().any(|t| t.task_id == tid) {
            self.cthrow(ids().range_id, format!("No suspended task {}.", tid));
            return;
        }
        let ret = if args.count == 2 {
            Some(self.stack[args.start + 1].clone())
        } else {
            None
        };
        self.pop_discard(args.count);
        self.task_resume(tid, ret);
        self.push(Value::Int(0));
    }

    pub(crate) fn fun_cancel(&mut self) {
        let args = match self.func_init(1, 1, "one", &[Some(Tag::Int)]) {
            Some(args) => args,
            None => return,
        };
        let tid = match self.stack[args.start] {
            Value::Int(tid) => tid,
            _ => return,
        };
        let known = self.suspended.iter().any(|t| t.task_id == tid)
            || self.paused.iter().any(|t| t.task_id == tid);
        if !known {
            self.cthrow(ids().range_id, format!("No such task {}.", tid));
            return;
        }
        self.pop_discard(args.count);
        self.task_cancel(tid);
        self.push(Value::Int(0));
    }

    pub(crate) fn fun_tasks(&mut self) {
        if self.func_init(0, 0, "none", &[]).is_none() {
            return;
        }
        let list = self.task_list();
        self.push(list);
    }

    pub(crate) fn fun_callers(&mut self) {
        if self.func_init(0, 0, "none", &[]).is_none() {
            return;
        }
        let callers = self.task_callers();
        self.push(callers);
    }

    pub(crate) fn fun_task_id(&mut self) {
        if self.func_init(0, 0, "none", &[]).is_none() {
            return;
        }
        let tid = self.task_id;
        self.push(Value::Int(tid));
    }

    pub(crate) fn fun_ticks_left(&mut self) {
        if self.func_init(0, 0, "none", &[]).is_none() {
            return;
        }
        let ticks = self.cur().ticks as i64;
        self.push(Value::Int(ticks));
    }

    // ------------------------------------------------------------------
    // Error protocol intrinsics
    // ------------------------------------------------------------------

    pub(crate) fn fun_throw(&mut self) {
        let args = match self.func_init(2, 3, "two or three", &[Some(Tag::Error), Some(Tag::Str), None])
        {
            Some(args) => args,
            None => return,
        };
        let error = match self.stack[args.start] {
            Value::Error(error) => error,
            _ => return,
        };
        let explanation = match &self.stack[args.start + 1] {
            Value::Str(s) => s.clone(),
            _ => return,
        };
        let arg = if args.count == 3 {
            Some(self.stack[args.start + 2].clone())
        } else {
            None
        };
        self.pop_discard(args.count);
        self.user_error(error, explanation, arg);
    }

    pub(crate) fn fun_traceback(&mut self) {
        if self.func_init(0, 0, "none", &[]).is_none() {
            return;
        }
        let traceback = self.cur().handlers.last().map(|h| h.traceback.clone());
        match traceback {
            Some(tb) => self.push(tb),
            None => self.cthrow(ids().methoderr_id, String::from("Not in an error handler.")),
        }
    }

    pub(crate) fn fun_error(&mut self) {
        if self.func_init(0, 0, "none", &[]).is_none() {
            return;
        }
        let error = self.cur().handlers.last().map(|h| h.error);
        match error {
            Some(error) => self.push(Value::Error(error)),
            None => self.cthrow(ids().methoderr_id, String::from("Not in an error handler.")),
        }
    }
}
