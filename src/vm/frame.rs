// File: src/vm/frame.rs
//
// Activation records and the per-frame error-action bookkeeping.

use crate::ident::Ident;
use crate::object::Method;
use crate::opcode::Opcode;
use crate::value::{Dbref, Value};
use std::sync::Arc;

/// A scoped error-action record. Each kind records the value-stack position
/// saved when its scope opened, so unwinding can truncate back to it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Specifier {
    /// Any error inside the scope jumps to `end` with the error kind pushed
    /// as an Error value.
    Critical { stack_pos: usize, end: usize },
    /// Errors escaping the scope keep their original kind across frames.
    Propagate { stack_pos: usize, end: usize },
    /// Errors matching the method's error list `error_list` (-1 = any) jump
    /// to `handler` with a handler-info record pushed.
    Catch { stack_pos: usize, handler: usize, error_list: i64 },
}

/// The record a matched Catch pushes for the duration of its handler body.
/// Carries the traceback (as a List value) and the caught kind.
#[derive(Debug, Clone)]
pub(crate) struct HandlerInfo {
    pub traceback: Value,
    pub error: Ident,
}

/// An activation record.
///
/// Frames own no stack storage; they record start indices into the shared
/// value stack. `var_start` points at the first argument, with local
/// variable slots following the (effective) argument vector.
#[derive(Debug)]
pub(crate) struct Frame {
    pub this: Dbref,
    pub sender: Dbref,
    pub caller: Dbref,
    pub method: Arc<Method>,
    pub pc: usize,
    pub ticks: i32,
    pub stack_start: usize,
    pub var_start: usize,
    pub specifiers: Vec<Specifier>,
    pub handlers: Vec<HandlerInfo>,
    pub last_opcode: Opcode,
}

/// The reusable part of a returned frame. Keeping the specifier and handler
/// vectors alive preserves their capacity across the one-frame-per-dispatch
/// hot path without holding method references past frame teardown.
#[derive(Debug, Default)]
pub(crate) struct FrameShell {
    specifiers: Vec<Specifier>,
    handlers: Vec<HandlerInfo>,
}

impl FrameShell {
    #[allow(clippy::too_many_arguments)]
    pub fn into_frame(
        self,
        this: Dbref,
        sender: Dbref,
        caller: Dbref,
        method: Arc<Method>,
        stack_start: usize,
        var_start: usize,
        ticks: i32,
    ) -> Frame {
        Frame {
            this,
            sender,
            caller,
            method,
            pc: 0,
            ticks,
            stack_start,
            var_start,
            specifiers: self.specifiers,
            handlers: self.handlers,
            last_opcode: Opcode::Comment,
        }
    }
}

impl Frame {
    /// Tear down into a pooled shell, releasing held references and any
    /// remaining specifier and handler records.
    pub fn into_shell(mut self) -> FrameShell {
        self.specifiers.clear();
        self.handlers.clear();
        FrameShell { specifiers: self.specifiers, handlers: self.handlers }
    }
}
