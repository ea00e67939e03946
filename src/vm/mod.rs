// File: src/vm/mod.rs
//
// The Ember execution engine: frame management, message dispatch, the
// interpreter loop, error propagation, and the cooperative task scheduler.
// Opcode handlers live in ops.rs; the built-in function surface in
// builtins.rs.

mod builtins;
mod frame;
mod ops;
mod task;


use crate::config::VmConfig;
use crate::ident::{ident_name, ids, Ident};
use crate::object::{Method, MethodState, ObjectStore};
use crate::opcode::{OpKind, Opcode};
use crate::value::{Dbref, Value, NO_DBREF, ROOT_DBREF};
use ahash::AHashMap;
use frame::{Frame, FrameShell, HandlerInfo, Specifier};
use std::mem;
use std::sync::Arc;
use std::sync::OnceLock;
use task::{StackHolder, TaskState};

pub use task::{ConnId, TaskId};

static TRACE_VM: OnceLock<bool> = OnceLock::new();

fn trace_enabled() -> bool {
    *TRACE_VM.get_or_init(|| std::env::var("EMBER_TRACE_VM").is_ok())
}

/// The virtual machine.
///
/// Single-threaded and cooperative: exactly one task is live at a time, and
/// every other task is a moved-out [`TaskState`] snapshot in the suspended
/// or paused queue. The value stack and the argument-start stack are shared
/// by the whole frame chain; frames record indices into them.
pub struct Vm<S: ObjectStore> {
    /// The object store the engine executes against.
    pub store: S,
    config: VmConfig,

    stack: Vec<Value>,
    arg_starts: Vec<usize>,
    frames: Vec<Frame>,

    suspended: Vec<TaskState>,
    paused: Vec<TaskState>,

    // Free lists. Returned records are pushed here and consulted before
    // allocating fresh ones.
    frame_pool: Vec<FrameShell>,
    task_pool: Vec<TaskState>,
    stack_pool: Vec<StackHolder>,

    cur_conn: Option<ConnId>,
    task_id: TaskId,
    tick: i64,

    /// Explanation for the most recent arity failure; frame_start fills it
    /// in and the message opcodes report it.
    numargs_str: Option<Arc<String>>,

    /// Built-in bindings installed with bind_opcode.
    bindings: AHashMap<Opcode, Dbref>,
}

impl<S: ObjectStore> Vm<S> {
    pub fn new(store: S) -> Self {
        Vm::with_config(store, VmConfig::default())
    }

    pub fn with_config(store: S, config: VmConfig) -> Self {
        let stack = Vec::with_capacity(config.stack_capacity);
        let arg_starts = Vec::with_capacity(config.arg_stack_capacity);
        Vm {
            store,
            config,
            stack,
            arg_starts,
            frames: Vec::new(),
            suspended: Vec::new(),
            paused: Vec::new(),
            frame_pool: Vec::new(),
            task_pool: Vec::new(),
            stack_pool: Vec::new(),
            cur_conn: None,
            task_id: 0,
            tick: 0,
            numargs_str: None,
            bindings: AHashMap::new(),
        }
    }

    /// The diagnostic tick counter: total opcodes executed so far.
    pub fn tick(&self) -> i64 {
        self.tick
    }

    /// Current value-stack depth. Zero whenever no task is live.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Restrict a built-in function to methods defined on `dbref`.
    /// Passing NO_DBREF removes the restriction.
    pub fn bind_opcode(&mut self, op: Opcode, dbref: Dbref) {
        if dbref == NO_DBREF {
            self.bindings.remove(&op);
        } else {
            self.bindings.insert(op, dbref);
        }
    }

    // ------------------------------------------------------------------
    // Task entry points
    // ------------------------------------------------------------------

    /// Execute a task by sending a message to an object. The arguments are
    /// ownership-transferred onto the value stack. Runs to completion or
    /// suspension; returns the dispatch failure kind if the send itself
    /// could not start a frame.
    pub fn task(
        &mut self,
        conn: Option<ConnId>,
        target: Dbref,
        message: Ident,
        args: Vec<Value>,
    ) -> Result<(), Ident> {
        debug_assert!(self.frames.is_empty(), "task started while a task is live");
        self.cur_conn = conn;
        // Error unwinding may strand argument-start entries; a fresh task
        // begins with none.
        self.arg_starts.clear();

        for arg in args {
            self.stack.push(arg);
        }

        match self.send_message(target, message, 0, 0) {
            Ok(()) => {
                self.execute();
                if !self.stack.is_empty() {
                    panic!("stack not empty after interpretation");
                }
                self.task_id += 1;
                Ok(())
            }
            Err(e) => {
                let n = self.stack.len();
                self.pop_discard(n);
                Err(e)
            }
        }
    }

    /// Execute a task by entering a method directly, bypassing dispatch and
    /// visibility. Used for top-level eval.
    pub fn task_method(
        &mut self,
        conn: Option<ConnId>,
        this: Dbref,
        method: Arc<Method>,
    ) -> Result<(), Ident> {
        debug_assert!(self.frames.is_empty(), "task started while a task is live");
        self.cur_conn = conn;
        self.arg_starts.clear();
        self.frame_start(this, method, NO_DBREF, NO_DBREF, 0, 0)?;
        self.execute();
        if !self.stack.is_empty() {
            panic!("stack not empty after interpretation");
        }
        self.task_id += 1;
        Ok(())
    }

    /// Resume a suspended (non-paused) task, pushing `ret` (or Integer 0)
    /// as the value of its suspend call, and run it to completion or the
    /// next suspension. Returns false if no such suspended task exists.
    pub fn task_resume(&mut self, tid: TaskId, ret: Option<Value>) -> bool {
        let ix = match self.suspended.iter().position(|t| t.task_id == tid) {
            Some(ix) => ix,
            None => return false,
        };
        let state = self.suspended.remove(ix);
        if trace_enabled() {
            eprintln!("task_resume: tid {}", tid);
        }
        let old = self.suspend_vm(false);
        self.restore_vm(state);
        self.push(ret.unwrap_or(Value::Int(0)));
        self.execute();
        self.store_stack();
        self.restore_vm(old);
        true
    }

    /// Cancel a suspended or paused task, tearing down its frame chain and
    /// discarding all held resources. Returns false if no such task exists.
    pub fn task_cancel(&mut self, tid: TaskId) -> bool {
        let state = if let Some(ix) = self.suspended.iter().position(|t| t.task_id == tid) {
            self.suspended.remove(ix)
        } else if let Some(ix) = self.paused.iter().position(|t| t.task_id == tid) {
            self.paused.remove(ix)
        } else {
            return false;
        };
        if trace_enabled() {
            eprintln!("task_cancel: tid {}", tid);
        }
        let old = self.suspend_vm(false);
        self.restore_vm(state);
        while !self.frames.is_empty() {
            self.frame_return();
        }
        self.store_stack();
        self.restore_vm(old);
        true
    }

    /// Suspend the live task into the runnable-suspended queue and leave
    /// the engine idle with fresh stacks. The interpreter loop exits because
    /// no frame remains current.
    pub fn task_suspend(&mut self) {
        if trace_enabled() {
            eprintln!("task_suspend: tid {}", self.task_id);
        }
        let state = self.suspend_vm(false);
        self.suspended.push(state);
        self.init_execute();
    }

    /// Like task_suspend, but onto the paused queue for the next
    /// run_paused_tasks batch.
    pub fn task_pause(&mut self) {
        if trace_enabled() {
            eprintln!("task_pause: tid {}", self.task_id);
        }
        let state = self.suspend_vm(true);
        self.paused.push(state);
        self.init_execute();
    }

    /// Run every currently paused task with a fresh paused-method tick
    /// budget. The queue is detached first so a task pausing itself again
    /// lands in the next batch, not this one.
    pub fn run_paused_tasks(&mut self) {
        if self.paused.is_empty() {
            return;
        }
        let batch = mem::take(&mut self.paused);
        let outer = self.suspend_vm(false);
        for state in batch {
            self.restore_vm(state);
            if let Some(f) = self.frames.last_mut() {
                f.ticks = self.config.paused_method_ticks;
            }
            self.execute();
            self.store_stack();
        }
        self.restore_vm(outer);
    }

    /// Ids of all suspended and paused tasks, as a List of Integers.
    pub fn task_list(&self) -> Value {
        let mut ids: Vec<Value> = Vec::with_capacity(self.suspended.len() + self.paused.len());
        for t in &self.suspended {
            ids.push(Value::Int(t.task_id));
        }
        for t in &self.paused {
            ids.push(Value::Int(t.task_id));
        }
        Value::list(ids)
    }

    /// The live call chain, innermost first, as a List of
    /// [this, definer, method_name_or_0, line] records.
    pub fn task_callers(&self) -> Value {
        let mut callers = Vec::with_capacity(self.frames.len());
        for f in self.frames.iter().rev() {
            let name = match f.method.name {
                Some(n) => Value::Symbol(n),
                None => Value::Int(0),
            };
            callers.push(Value::list(vec![
                Value::Dbref(f.this),
                Value::Dbref(f.method.definer),
                name,
                Value::Int(f.method.line_number(f.pc.saturating_sub(1))),
            ]));
        }
        Value::list(callers)
    }

    // ------------------------------------------------------------------
    // VM state snapshots
    // ------------------------------------------------------------------

    fn suspend_vm(&mut self, paused: bool) -> TaskState {
        let mut state = self.task_pool.pop().unwrap_or_default();
        mem::swap(&mut state.frames, &mut self.frames);
        mem::swap(&mut state.stack, &mut self.stack);
        mem::swap(&mut state.arg_starts, &mut self.arg_starts);
        state.conn = self.cur_conn;
        state.task_id = self.task_id;
        state.paused = paused;
        state
    }

    fn restore_vm(&mut self, mut state: TaskState) {
        if trace_enabled() {
            eprintln!("restore_vm: tid {}", state.task_id);
        }
        mem::swap(&mut self.frames, &mut state.frames);
        mem::swap(&mut self.stack, &mut state.stack);
        mem::swap(&mut self.arg_starts, &mut state.arg_starts);
        self.cur_conn = state.conn;
        self.task_id = state.task_id;
        // The emptied record goes back on the free list.
        self.task_pool.push(state);
    }

    fn store_stack(&mut self) {
        debug_assert!(self.stack.is_empty(), "parking a non-empty stack");
        let mut holder = StackHolder {
            stack: mem::take(&mut self.stack),
            arg_starts: mem::take(&mut self.arg_starts),
        };
        holder.arg_starts.clear();
        self.stack_pool.push(holder);
    }

    fn init_execute(&mut self) {
        if let Some(holder) = self.stack_pool.pop() {
            self.stack = holder.stack;
            self.arg_starts = holder.arg_starts;
        } else {
            self.stack = Vec::with_capacity(self.config.stack_capacity);
            self.arg_starts = Vec::with_capacity(self.config.arg_stack_capacity);
        }
    }

    // ------------------------------------------------------------------
    // Frames and dispatch
    // ------------------------------------------------------------------

    pub(crate) fn frame_start(
        &mut self,
        this: Dbref,
        method: Arc<Method>,
        sender: Dbref,
        caller: Dbref,
        stack_start: usize,
        arg_start: usize,
    ) -> Result<(), Ident> {
        let num_args = self.stack.len() - arg_start;
        if num_args < method.num_args || (num_args > method.num_args && !method.rest) {
            let name = match method.name {
                Some(n) => ident_name(n).to_string(),
                None => String::from("<eval>"),
            };
            let requires = if method.num_args == 0 {
                String::from("none")
            } else {
                method.num_args.to_string()
            };
            self.numargs_str = Some(Arc::new(format!(
                "#{}.{} called with {} argument{}, requires {}{}",
                this,
                name,
                num_args,
                if num_args == 1 { "" } else { "s" },
                requires,
                if method.rest { " or more." } else { "." },
            )));
            return Err(ids().numargs_id);
        }

        if self.frames.len() >= self.config.max_call_depth {
            return Err(ids().maxdepth_id);
        }

        if method.rest {
            // Collect the surplus arguments into the rest list.
            let rest = self.stack.split_off(arg_start + method.num_args);
            self.stack.push(Value::List(Arc::new(rest)));
        }

        let num_vars = method.num_vars;
        let shell = self.frame_pool.pop().unwrap_or_default();
        let frame = shell.into_frame(
            this,
            sender,
            caller,
            method,
            stack_start,
            arg_start,
            self.config.method_ticks,
        );
        self.frames.push(frame);

        // Local variables start out as Integer 0.
        for _ in 0..num_vars {
            self.stack.push(Value::Int(0));
        }
        Ok(())
    }

    pub(crate) fn frame_return(&mut self) {
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => return,
        };
        // Everything the frame owned on the stack goes away with it.
        self.stack.truncate(frame.stack_start);
        self.frame_pool.push(frame.into_shell());
    }

    /// Resolve and dispatch `message` on the object `dbref`, enforcing the
    /// method's visibility modifier against the calling frame.
    pub(crate) fn send_message(
        &mut self,
        dbref: Dbref,
        message: Ident,
        stack_start: usize,
        arg_start: usize,
    ) -> Result<(), Ident> {
        let ids = ids();
        let obj = self.store.retrieve(dbref).ok_or(ids.objnf_id)?;
        let method = self.store.find_method(obj.dbref, message).ok_or(ids.methodnf_id)?;

        if let Some(f) = self.frames.last() {
            match method.state {
                MethodState::Public => {}
                MethodState::Private => {
                    if f.method.definer != method.definer {
                        return Err(ids.private_id);
                    }
                }
                MethodState::Protected => {
                    if f.this != obj.dbref {
                        return Err(ids.protected_id);
                    }
                }
                MethodState::Root => {
                    if f.method.definer != ROOT_DBREF {
                        return Err(ids.root_id);
                    }
                }
                // A live frame means this send did not come from the driver.
                MethodState::Driver => return Err(ids.driver_id),
            }
        }

        let (sender, caller) = match self.frames.last() {
            Some(f) => (f.this, f.method.definer),
            None => (NO_DBREF, NO_DBREF),
        };
        self.frame_start(obj.dbref, method, sender, caller, stack_start, arg_start)
    }

    /// Dispatch the current message to the next definition above the
    /// current method's definer in the inheritance chain.
    pub(crate) fn pass_message(
        &mut self,
        stack_start: usize,
        arg_start: usize,
    ) -> Result<(), Ident> {
        let (this, name, definer, sender, caller) = {
            let f = self.cur();
            (f.this, f.method.name, f.method.definer, f.sender, f.caller)
        };
        let name = name.ok_or(ids().methodnf_id)?;
        let method = self
            .store
            .find_next_method(this, name, definer)
            .ok_or(ids().methodnf_id)?;
        self.frame_start(this, method, sender, caller, stack_start, arg_start)
    }

    /// The interpreter loop. Runs until the frame chain empties, either by
    /// returns, by unhandled error unwinding, or by suspension moving the
    /// chain out from under us.
    fn execute(&mut self) {
        while !self.frames.is_empty() {
            self.tick += 1;
            let op = {
                let ix = self.frames.len() - 1;
                let f = &mut self.frames[ix];
                f.ticks -= 1;
                if f.ticks == 0 {
                    None
                } else {
                    let word = f.method.opcodes[f.pc];
                    let op = match Opcode::from_word(word) {
                        Some(op) => op,
                        None => panic!("unknown opcode word {} at pc {}", word, f.pc),
                    };
                    f.last_opcode = op;
                    f.pc += 1;
                    Some(op)
                }
            };
            match op {
                Some(op) => self.dispatch(op),
                None => self.out_of_ticks_error(),
            }
        }
    }

    /// Zero the destination of an immediately following assignment opcode,
    /// so an in-place container mutation never leaks a partially built
    /// value through an alias. Requires the current pc to sit on the next
    /// instruction; must not be called if the current one can still fail.
    pub(crate) fn anticipate_assignment(&mut self) {
        let (next, this, definer) = {
            let f = self.cur();
            (Opcode::from_word(f.method.opcodes[f.pc]), f.this, f.method.definer)
        };
        match next {
            Some(Opcode::SetLocal) => {
                let slot = {
                    let f = self.cur();
                    f.var_start + f.method.opcodes[f.pc + 1] as usize
                };
                self.stack[slot] = Value::Int(0);
            }
            Some(Opcode::SetObjVar) => {
                let id = {
                    let f = self.cur();
                    f.method.get_ident(f.method.opcodes[f.pc + 1] as usize)
                };
                // A missing parameter will fail for real in the assignment.
                let _ = self.store.assign_var(this, definer, id, Value::Int(0));
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Stack helpers
    // ------------------------------------------------------------------

    pub(crate) fn cur(&self) -> &Frame {
        match self.frames.last() {
            Some(f) => f,
            None => panic!("no active frame"),
        }
    }

    pub(crate) fn cur_mut(&mut self) -> &mut Frame {
        match self.frames.last_mut() {
            Some(f) => f,
            None => panic!("no active frame"),
        }
    }

    pub(crate) fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub(crate) fn pop_value(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => panic!("value stack underflow"),
        }
    }

    pub(crate) fn pop_discard(&mut self, n: usize) {
        for _ in 0..n {
            self.stack.pop();
        }
    }

    pub(crate) fn pop_arg_start(&mut self) -> usize {
        match self.arg_starts.pop() {
            Some(pos) => pos,
            None => panic!("argument stack underflow"),
        }
    }

    // ------------------------------------------------------------------
    // Error raising and propagation
    // ------------------------------------------------------------------

    /// Raise an error from an opcode or built-in context.
    pub(crate) fn cthrow(&mut self, error: Ident, explanation: String) {
        self.interp_error(error, Arc::new(explanation));
    }

    pub(crate) fn interp_error(&mut self, error: Ident, explanation: Arc<String>) {
        let op = self.cur().last_opcode;
        let site = match op.info().kind {
            OpKind::Function => ids().function_id,
            OpKind::Opcode => ids().opcode_id,
        };
        let location = vec![Value::Symbol(site), Value::Symbol(op.symbol())];
        self.start_error(error, explanation, None, location);
    }

    /// Raise an error on behalf of user code (the throw built-in). The
    /// throwing frame is returned first; the throw itself is not a
    /// reportable location within it.
    pub(crate) fn user_error(&mut self, error: Ident, explanation: Arc<String>, arg: Option<Value>) {
        let mut location = vec![Value::Symbol(ids().method_id)];
        self.fill_in_method_info(&mut location);
        self.frame_return();
        self.start_error(error, explanation, arg, location);
    }

    pub(crate) fn out_of_ticks_error(&mut self) {
        let mut location = vec![Value::Symbol(ids().method_id)];
        self.fill_in_method_info(&mut location);
        // The exhausted frame gets no chance to handle its own death.
        self.frame_return();
        self.start_error(
            ids().methoderr_id,
            Arc::new(String::from("Out of ticks")),
            None,
            location,
        );
    }

    fn start_error(
        &mut self,
        error: Ident,
        explanation: Arc<String>,
        arg: Option<Value>,
        location: Vec<Value>,
    ) {
        let condition = vec![
            Value::Error(error),
            Value::Str(explanation),
            arg.unwrap_or(Value::Int(0)),
        ];
        let traceback = vec![Value::list(condition), Value::list(location)];
        self.propagate_error(traceback, error);
    }

    /// Walk specifiers inner-to-outer, frame by frame, until the error is
    /// handled or the chain empties. Consumes the traceback.
    pub(crate) fn propagate_error(&mut self, mut traceback: Vec<Value>, mut error: Ident) {
        loop {
            // No current frame: drop all of this on the floor.
            if self.frames.is_empty() {
                return;
            }

            traceback.push(self.frame_error_record(error));

            let mut propagate = false;
            loop {
                let spec = match self.cur().specifiers.last() {
                    Some(spec) => *spec,
                    None => break,
                };
                match spec {
                    Specifier::Critical { stack_pos, end } => {
                        // Recover by substituting the error value at the
                        // critical's saved position.
                        self.stack.truncate(stack_pos);
                        {
                            let f = self.cur_mut();
                            f.pc = end;
                            f.specifiers.pop();
                        }
                        self.push(Value::Error(error));
                        return;
                    }
                    Specifier::Propagate { .. } => {
                        propagate = true;
                        self.cur_mut().specifiers.pop();
                    }
                    Specifier::Catch { stack_pos, handler, error_list } => {
                        let caught = error_list < 0 || {
                            let f = self.cur();
                            f.method.error_lists[error_list as usize].contains(&error)
                        };
                        if caught {
                            self.stack.truncate(stack_pos);
                            let info = HandlerInfo {
                                traceback: Value::List(Arc::new(traceback)),
                                error,
                            };
                            let f = self.cur_mut();
                            f.pc = handler;
                            f.specifiers.pop();
                            f.handlers.push(info);
                            return;
                        }
                        self.cur_mut().specifiers.pop();
                    }
                }
            }

            // Nothing in this frame handles it; unwind and generalize
            // unless a propagate specifier was in force.
            self.frame_return();
            if !propagate {
                error = ids().methoderr_id;
            }
        }
    }

    fn frame_error_record(&self, error: Ident) -> Value {
        let mut record = vec![Value::Error(error)];
        self.fill_in_method_info(&mut record);
        Value::List(Arc::new(record))
    }

    fn fill_in_method_info(&self, out: &mut Vec<Value>) {
        if let Some(f) = self.frames.last() {
            out.push(match f.method.name {
                Some(name) => Value::Symbol(name),
                None => Value::Int(0),
            });
            out.push(Value::Dbref(f.this));
            out.push(Value::Dbref(f.method.definer));
            out.push(Value::Int(f.method.line_number(f.pc)));
        }
    }

    /// Translate a dispatch failure into a raised error at a message or
    /// pass opcode.
    pub(crate) fn report_send_error(&mut self, result: Ident, message: Ident, target: Dbref) {
        let ids = ids();
        if result == ids.numargs_id {
            let explanation = match self.numargs_str.clone() {
                Some(s) => s,
                None => Arc::new(String::from("Wrong number of arguments.")),
            };
            self.interp_error(result, explanation);
        } else if result == ids.objnf_id {
            self.cthrow(result, format!("Target (#{}) not found.", target));
        } else if result == ids.methodnf_id {
            self.cthrow(result, format!("Method '{} not found.", ident_name(message)));
        } else if result == ids.maxdepth_id {
            self.cthrow(result, String::from("Maximum call depth exceeded."));
        } else if result == ids.private_id {
            self.cthrow(result, format!("Method '{} is private.", ident_name(message)));
        } else if result == ids.protected_id {
            self.cthrow(result, format!("Method '{} is protected.", ident_name(message)));
        } else if result == ids.root_id {
            self.cthrow(
                result,
                format!("Method '{} can only be called by $root.", ident_name(message)),
            );
        } else if result == ids.driver_id {
            self.cthrow(
                result,
                format!("Method '{} can only be called by the driver.", ident_name(message)),
            );
        } else {
            self.cthrow(result, String::from("Message send failed."));
        }
    }
}
