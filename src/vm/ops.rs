// File: src/vm/ops.rs
//
// Opcode handlers for the Ember VM.
// Each handler runs with the interpreter globals in a consistent state and
// may push or pop the value stack, move the pc, start or return frames, or
// raise through the error protocol.

use super::frame::Specifier;
use super::Vm;
use crate::ident::{ident, ident_name, ids};
use crate::object::ObjectStore;
use crate::opcode::Opcode;
use crate::value::{data_equal, data_order, str_cfind, DictMap, FloatType, Frob, Tag, Value};
use std::cmp::Ordering;
use std::sync::Arc;

impl<S: ObjectStore> Vm<S> {
    pub(crate) fn dispatch(&mut self, op: Opcode) {
        match op {
            Opcode::Comment => self.op_comment(),
            Opcode::Pop => self.pop_discard(1),
            Opcode::SetLocal => self.op_set_local(),
            Opcode::SetObjVar => self.op_set_obj_var(),
            Opcode::If => self.op_if(),
            Opcode::Else => self.op_else(),
            Opcode::ForRange => self.op_for_range(),
            Opcode::ForList => self.op_for_list(),
            Opcode::While => self.op_while(),
            Opcode::Switch => self.op_switch(),
            Opcode::CaseValue => self.op_case_value(),
            Opcode::CaseRange => self.op_case_range(),
            Opcode::LastCaseValue => self.op_last_case_value(),
            Opcode::LastCaseRange => self.op_last_case_range(),
            Opcode::EndCase => self.op_end_case(),
            Opcode::Default => self.pop_discard(1),
            Opcode::End => self.op_end(),
            Opcode::Break => self.op_break(),
            Opcode::Continue => self.op_continue(),
            Opcode::Return => self.op_return(),
            Opcode::ReturnExpr => self.op_return_expr(),
            Opcode::Catch => self.op_catch(),
            Opcode::CatchEnd => self.op_catch_end(),
            Opcode::HandlerEnd => self.op_handler_end(),
            Opcode::Critical => self.op_critical(),
            Opcode::CriticalEnd => self.op_specifier_end(),
            Opcode::Propagate => self.op_propagate(),
            Opcode::PropagateEnd => self.op_specifier_end(),
            Opcode::Zero => self.push(Value::Int(0)),
            Opcode::One => self.push(Value::Int(1)),
            Opcode::Integer => self.op_integer(),
            Opcode::Float => self.op_float(),
            Opcode::String => self.op_string(),
            Opcode::Dbref => self.op_dbref(),
            Opcode::Symbol => self.op_symbol(),
            Opcode::Error => self.op_error(),
            Opcode::Name => self.op_name(),
            Opcode::GetLocal => self.op_get_local(),
            Opcode::GetObjVar => self.op_get_obj_var(),
            Opcode::StartArgs => self.arg_start_push(),
            Opcode::Pass => self.op_pass(),
            Opcode::Message => self.op_message(),
            Opcode::ExprMessage => self.op_expr_message(),
            Opcode::List => self.op_list(),
            Opcode::Dict => self.op_dict(),
            Opcode::Buffer => self.op_buffer(),
            Opcode::Frob => self.op_frob(),
            Opcode::Index => self.op_index(),
            Opcode::And => self.op_and(),
            Opcode::Or => self.op_or(),
            Opcode::Splice => self.op_splice(),
            Opcode::Not => self.op_not(),
            Opcode::Negate => self.op_negate(),
            Opcode::Multiply => self.op_multiply(),
            Opcode::Divide => self.op_divide(),
            Opcode::Modulo => self.op_modulo(),
            Opcode::Add => self.op_add(),
            Opcode::SpliceAdd => self.op_splice_add(),
            Opcode::Subtract => self.op_subtract(),
            Opcode::Equal => self.op_equal(),
            Opcode::NotEqual => self.op_not_equal(),
            Opcode::Greater => self.compare_op(|o| o == Ordering::Greater),
            Opcode::GreaterOrEqual => self.compare_op(|o| o != Ordering::Less),
            Opcode::Less => self.compare_op(|o| o == Ordering::Less),
            Opcode::LessOrEqual => self.compare_op(|o| o != Ordering::Greater),
            Opcode::In => self.op_in(),
            Opcode::BitAnd => self.int_binary(|a, b| a & b),
            Opcode::BitOr => self.int_binary(|a, b| a | b),
            Opcode::Shr => self.int_binary(|a, b| a.wrapping_shr(b as u32)),
            Opcode::Shl => self.int_binary(|a, b| a.wrapping_shl(b as u32)),
            Opcode::Pause => self.fun_pause(),
            Opcode::Suspend => self.fun_suspend(),
            Opcode::Resume => self.fun_resume(),
            Opcode::Cancel => self.fun_cancel(),
            Opcode::Tasks => self.fun_tasks(),
            Opcode::Callers => self.fun_callers(),
            Opcode::TaskId => self.fun_task_id(),
            Opcode::TicksLeft => self.fun_ticks_left(),
            Opcode::Throw => self.fun_throw(),
            Opcode::Traceback => self.fun_traceback(),
            Opcode::ErrorFunc => self.fun_error(),
        }
    }

    /// Read the next operand word and advance the pc past it.
    fn operand(&mut self) -> i64 {
        let f = self.cur_mut();
        let w = f.method.opcodes[f.pc];
        f.pc += 1;
        w
    }

    /// Jump to the pc stored in the operand word.
    fn jump_operand(&mut self) {
        let f = self.cur_mut();
        f.pc = f.method.opcodes[f.pc] as usize;
    }

    fn top_truthy(&self) -> bool {
        self.stack[self.stack.len() - 1].truthy()
    }

    fn arg_start_push(&mut self) {
        let pos = self.stack.len();
        self.arg_starts.push(pos);
    }

    // ------------------------------------------------------------------
    // Statements, variables, control flow
    // ------------------------------------------------------------------

    fn op_comment(&mut self) {
        // Skip the literal operand. Comments don't do anything, so give the
        // tick back.
        let f = self.cur_mut();
        f.pc += 1;
        f.ticks += 1;
        self.tick -= 1;
    }

    fn op_set_local(&mut self) {
        let ix = self.operand() as usize;
        let slot = self.cur().var_start + ix;
        let top = self.stack[self.stack.len() - 1].clone();
        self.stack[slot] = top;
    }

    fn op_set_obj_var(&mut self) {
        let ind = self.operand() as usize;
        let (id, this, definer) = {
            let f = self.cur();
            (f.method.get_ident(ind), f.this, f.method.definer)
        };
        let val = self.stack[self.stack.len() - 1].clone();
        if let Err(e) = self.store.assign_var(this, definer, id, val) {
            self.cthrow(e, format!("No such parameter '{}.", ident_name(id)));
        }
    }

    fn op_get_local(&mut self) {
        let ix = self.operand() as usize;
        let slot = self.cur().var_start + ix;
        let val = self.stack[slot].clone();
        self.push(val);
    }

    fn op_get_obj_var(&mut self) {
        let ind = self.operand() as usize;
        let (id, this, definer) = {
            let f = self.cur();
            (f.method.get_ident(ind), f.this, f.method.definer)
        };
        match self.store.get_var(this, definer, id) {
            Ok(val) => self.push(val),
            Err(e) => {
                self.cthrow(e, format!("No such parameter '{}.", ident_name(id)))
            }
        }
    }

    fn op_if(&mut self) {
        // Jump if the condition is false.
        if !self.top_truthy() {
            self.jump_operand();
        } else {
            self.cur_mut().pc += 1;
        }
        self.pop_discard(1);
    }

    fn op_else(&mut self) {
        self.jump_operand();
    }

    fn op_for_range(&mut self) {
        let n = self.stack.len();
        let (lo, hi) = match (&self.stack[n - 2], &self.stack[n - 1]) {
            (Value::Int(lo), Value::Int(hi)) => (*lo, *hi),
            (lo, hi) => {
                let msg = format!("Range bounds ({}, {}) are not both integers.", lo, hi);
                self.cthrow(ids().type_id, msg);
                return;
            }
        };

        if lo > hi {
            // Finished; pop the range and jump to the end.
            self.pop_discard(2);
            self.jump_operand();
        } else {
            // Write the index variable, bump the lower bound, continue.
            let slot = {
                let f = self.cur();
                f.var_start + f.method.opcodes[f.pc + 1] as usize
            };
            self.stack[slot] = Value::Int(lo);
            let n = self.stack.len();
            self.stack[n - 2] = Value::Int(lo.wrapping_add(1));
            self.cur_mut().pc += 2;
        }
    }

    fn op_for_list(&mut self) {
        let n = self.stack.len();
        // The counter below is engine-produced and always an integer.
        let counter = if let Value::Int(c) = self.stack[n - 1] { c } else { 0 };
        let len = match &self.stack[n - 2] {
            Value::List(l) => l.len(),
            Value::Dict(d) => d.len(),
            other => {
                let msg = format!("Domain ({}) is not a list or dictionary.", other);
                self.cthrow(ids().type_id, msg);
                return;
            }
        };

        if counter < 0 || counter as usize >= len {
            // Finished; pop the domain and counter and jump to the end.
            self.pop_discard(2);
            self.jump_operand();
            return;
        }

        let elem = match &self.stack[n - 2] {
            Value::List(l) => l[counter as usize].clone(),
            Value::Dict(d) => d.key_value_pair(counter as usize).map(Value::list).unwrap_or_default(),
            _ => Value::default(),
        };
        let slot = {
            let f = self.cur();
            f.var_start + f.method.opcodes[f.pc + 1] as usize
        };
        self.stack[slot] = elem;
        self.stack[n - 1] = Value::Int(counter + 1);
        self.cur_mut().pc += 2;
    }

    fn op_while(&mut self) {
        if !self.top_truthy() {
            self.jump_operand();
        } else {
            self.cur_mut().pc += 2;
        }
        self.pop_discard(1);
    }

    fn op_switch(&mut self) {
        // Placeholder for break; just step over the end operand.
        self.cur_mut().pc += 1;
    }

    fn op_case_value(&mut self) {
        let n = self.stack.len();
        if data_equal(&self.stack[n - 2], &self.stack[n - 1]) {
            self.pop_discard(2);
            self.jump_operand();
        } else {
            self.pop_discard(1);
            self.cur_mut().pc += 1;
        }
    }

    /// Shared range test for the case-range opcodes. The controlling value
    /// sits beneath the two range endpoints. Returns None after raising if
    /// the endpoints are unusable.
    fn case_range_match(&mut self) -> Option<bool> {
        let n = self.stack.len();
        let lo_tag = self.stack[n - 2].tag();
        let hi_tag = self.stack[n - 1].tag();
        if lo_tag != hi_tag {
            let msg = format!(
                "{} and {} are not of the same type.",
                self.stack[n - 2],
                self.stack[n - 1]
            );
            self.cthrow(ids().type_id, msg);
            return None;
        }
        if lo_tag != Tag::Int && lo_tag != Tag::Str {
            let msg = format!(
                "{} and {} are not integers or strings.",
                self.stack[n - 2],
                self.stack[n - 1]
            );
            self.cthrow(ids().type_id, msg);
            return None;
        }
        let sw = &self.stack[n - 3];
        let matched = sw.tag() == lo_tag
            && data_order(sw, &self.stack[n - 2]).map(|o| o != Ordering::Less).unwrap_or(false)
            && data_order(sw, &self.stack[n - 1]).map(|o| o != Ordering::Greater).unwrap_or(false);
        Some(matched)
    }

    fn op_case_range(&mut self) {
        match self.case_range_match() {
            Some(true) => {
                self.pop_discard(3);
                self.jump_operand();
            }
            Some(false) => {
                self.pop_discard(2);
                self.cur_mut().pc += 1;
            }
            None => {}
        }
    }

    fn op_last_case_value(&mut self) {
        let n = self.stack.len();
        if data_equal(&self.stack[n - 2], &self.stack[n - 1]) {
            self.pop_discard(2);
            self.cur_mut().pc += 1;
        } else {
            self.pop_discard(1);
            self.jump_operand();
        }
    }

    fn op_last_case_range(&mut self) {
        match self.case_range_match() {
            Some(true) => {
                self.pop_discard(3);
                self.cur_mut().pc += 1;
            }
            Some(false) => {
                self.pop_discard(2);
                self.jump_operand();
            }
            None => {}
        }
    }

    fn op_end_case(&mut self) {
        self.jump_operand();
    }

    fn op_end(&mut self) {
        // Back to the top of the loop or condition expression.
        self.jump_operand();
    }

    fn op_break(&mut self) {
        let (loop_op, target) = {
            let f = self.cur();
            let loop_pc = f.method.opcodes[f.pc] as usize;
            (
                Opcode::from_word(f.method.opcodes[loop_pc]),
                f.method.opcodes[loop_pc + 1] as usize,
            )
        };
        // For loops keep their control values on the stack; drop them.
        if matches!(loop_op, Some(Opcode::ForList) | Some(Opcode::ForRange)) {
            self.pop_discard(2);
        }
        self.cur_mut().pc = target;
    }

    fn op_continue(&mut self) {
        let f = self.cur_mut();
        f.pc = f.method.opcodes[f.pc] as usize;
        // A while loop re-enters at its condition expression.
        if Opcode::from_word(f.method.opcodes[f.pc]) == Some(Opcode::While) {
            f.pc = f.method.opcodes[f.pc + 2] as usize;
        }
    }

    fn op_return(&mut self) {
        let dbref = self.cur().this;
        self.frame_return();
        if !self.frames.is_empty() {
            self.push(Value::Dbref(dbref));
        }
    }

    fn op_return_expr(&mut self) {
        // Ownership of the return value transfers to the caller's stack.
        let val = self.pop_value();
        self.frame_return();
        if !self.frames.is_empty() {
            self.push(val);
        }
    }

    // ------------------------------------------------------------------
    // Error-action specifiers
    // ------------------------------------------------------------------

    fn op_catch(&mut self) {
        let stack_pos = self.stack.len();
        let handler = self.operand() as usize;
        let error_list = self.operand();
        self.cur_mut().specifiers.push(Specifier::Catch { stack_pos, handler, error_list });
    }

    fn op_catch_end(&mut self) {
        // Successful body: drop the specifier and jump past the handler.
        self.cur_mut().specifiers.pop();
        self.jump_operand();
    }

    fn op_handler_end(&mut self) {
        self.cur_mut().handlers.pop();
    }

    fn op_critical(&mut self) {
        let stack_pos = self.stack.len();
        let end = self.operand() as usize;
        self.cur_mut().specifiers.push(Specifier::Critical { stack_pos, end });
    }

    fn op_propagate(&mut self) {
        let stack_pos = self.stack.len();
        let end = self.operand() as usize;
        self.cur_mut().specifiers.push(Specifier::Propagate { stack_pos, end });
    }

    fn op_specifier_end(&mut self) {
        self.cur_mut().specifiers.pop();
    }

    // ------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------

    fn op_integer(&mut self) {
        let w = self.operand();
        self.push(Value::Int(w));
    }

    fn op_float(&mut self) {
        // The float literal is the bit pattern of the following word.
        let w = self.operand();
        self.push(Value::Float(FloatType::from_bits(w as u64)));
    }

    fn op_string(&mut self) {
        let ind = self.operand() as usize;
        let s = self.cur().method.get_string(ind);
        self.push(Value::Str(s));
    }

    fn op_dbref(&mut self) {
        let w = self.operand();
        self.push(Value::Dbref(w));
    }

    fn op_symbol(&mut self) {
        let ind = self.operand() as usize;
        let id = self.cur().method.get_ident(ind);
        self.push(Value::Symbol(id));
    }

    fn op_error(&mut self) {
        let ind = self.operand() as usize;
        let id = self.cur().method.get_ident(ind);
        self.push(Value::Error(id));
    }

    fn op_name(&mut self) {
        let ind = self.operand() as usize;
        let id = self.cur().method.get_ident(ind);
        match self.store.name_to_dbref(id) {
            Some(dbref) => self.push(Value::Dbref(dbref)),
            None => {
                let msg = format!("Can't find object name '{}.", ident_name(id));
                self.cthrow(ids().namenf_id, msg);
            }
        }
    }

    // ------------------------------------------------------------------
    // Message passing
    // ------------------------------------------------------------------

    fn op_pass(&mut self) {
        let arg_start = self.pop_arg_start();
        if let Err(e) = self.pass_message(arg_start, arg_start) {
            let ids = ids();
            if e == ids.numargs_id {
                let explanation = match self.numargs_str.clone() {
                    Some(s) => s,
                    None => Arc::new(String::from("Wrong number of arguments.")),
                };
                self.interp_error(e, explanation);
            } else if e == ids.methodnf_id {
                self.cthrow(e, String::from("No next method found."));
            } else if e == ids.maxdepth_id {
                self.cthrow(e, String::from("Maximum call depth exceeded."));
            } else {
                self.cthrow(e, String::from("Pass failed."));
            }
        }
    }

    fn op_message(&mut self) {
        let ind = self.operand() as usize;
        let message = self.cur().method.get_ident(ind);
        let mut arg_start = self.pop_arg_start();
        let target_ix = arg_start - 1;

        let dbref = match self.stack[target_ix].clone() {
            Value::Dbref(dbref) => dbref,
            Value::Frob(frob) => {
                // Dispatch on the class; the rep becomes the first argument.
                self.stack[target_ix] = frob.rep;
                arg_start -= 1;
                frob.cclass
            }
            other => {
                // Messages to plain values dispatch on the type object,
                // with the value itself as the first argument.
                let type_name = other.type_name();
                match self.store.name_to_dbref(ident(type_name)) {
                    Some(dbref) => {
                        arg_start -= 1;
                        dbref
                    }
                    None => {
                        let msg = format!("No object for data type '{}.", type_name);
                        self.cthrow(ids().objnf_id, msg);
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.send_message(dbref, message, target_ix, arg_start) {
            self.report_send_error(e, message, dbref);
        }
    }

    fn op_expr_message(&mut self) {
        let mut arg_start = self.pop_arg_start();
        let target_ix = arg_start - 2;
        let msg_ix = arg_start - 1;

        let message = match &self.stack[msg_ix] {
            Value::Symbol(sym) => *sym,
            other => {
                let msg = format!("Message ({}) is not a symbol.", other);
                self.cthrow(ids().type_id, msg);
                return;
            }
        };

        let dbref = match self.stack[target_ix].clone() {
            Value::Dbref(dbref) => dbref,
            Value::Frob(frob) => {
                // The rep replaces the message slot as the first argument;
                // a dummy fills the target slot beneath the send.
                self.stack[msg_ix] = frob.rep;
                self.stack[target_ix] = Value::Int(0);
                arg_start -= 1;
                frob.cclass
            }
            other => {
                let type_name = other.type_name();
                match self.store.name_to_dbref(ident(type_name)) {
                    Some(dbref) => {
                        self.stack[msg_ix] = other;
                        self.stack[target_ix] = Value::Int(0);
                        arg_start -= 1;
                        dbref
                    }
                    None => {
                        let msg = format!("No object for data type '{}.", type_name);
                        self.cthrow(ids().objnf_id, msg);
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.send_message(dbref, message, target_ix, arg_start) {
            self.report_send_error(e, message, dbref);
        }
    }

    // ------------------------------------------------------------------
    // Construction and indexing
    // ------------------------------------------------------------------

    fn op_list(&mut self) {
        let start = self.pop_arg_start();
        let elems = self.stack.split_off(start);
        self.push(Value::List(Arc::new(elems)));
    }

    fn op_dict(&mut self) {
        let start = self.pop_arg_start();
        let elems = self.stack.split_off(start);
        match DictMap::from_slices(elems) {
            Some(dict) => self.push(Value::Dict(Arc::new(dict))),
            None => {
                self.cthrow(ids().type_id, String::from("Arguments were not all two-element lists."))
            }
        }
    }

    fn op_buffer(&mut self) {
        let start = self.pop_arg_start();
        let mut bad = None;
        for (i, v) in self.stack[start..].iter().enumerate() {
            if !matches!(v, Value::Int(_)) {
                bad = Some(format!("Element {} ({}) is not an integer.", i + 1, v));
                break;
            }
        }
        if let Some(msg) = bad {
            self.cthrow(ids().type_id, msg);
            return;
        }
        let bytes: Vec<u8> = self
            .stack
            .split_off(start)
            .into_iter()
            .map(|v| match v {
                Value::Int(n) => n as u8,
                _ => 0,
            })
            .collect();
        self.push(Value::Buffer(Arc::new(bytes)));
    }

    fn op_frob(&mut self) {
        let n = self.stack.len();
        let cclass = match &self.stack[n - 2] {
            Value::Dbref(dbref) => *dbref,
            other => {
                let msg = format!("Class ({}) is not a dbref.", other);
                self.cthrow(ids().type_id, msg);
                return;
            }
        };
        if !matches!(self.stack[n - 1].tag(), Tag::List | Tag::Dict) {
            let msg = format!("Rep ({}) is not a list or dictionary.", self.stack[n - 1]);
            self.cthrow(ids().type_id, msg);
            return;
        }
        let rep = self.stack[n - 1].clone();
        self.stack[n - 2] = Value::Frob(Box::new(Frob { cclass, rep }));
        self.pop_discard(1);
    }

    fn op_index(&mut self) {
        let n = self.stack.len();
        let d_tag = self.stack[n - 2].tag();
        if !matches!(d_tag, Tag::List | Tag::Str | Tag::Dict) {
            let msg = format!("Array ({}) is not a list, string, or dictionary.", self.stack[n - 2]);
            self.cthrow(ids().type_id, msg);
            return;
        }
        let ind = self.stack[n - 1].clone();
        if d_tag != Tag::Dict && !matches!(ind, Value::Int(_)) {
            let msg = format!("Offset ({}) is not an integer.", ind);
            self.cthrow(ids().type_id, msg);
            return;
        }

        if d_tag == Tag::Dict {
            let found = match &self.stack[n - 2] {
                Value::Dict(d) => d.find(&ind).cloned(),
                _ => None,
            };
            match found {
                Some(val) => {
                    self.pop_discard(1);
                    let n = self.stack.len();
                    self.stack[n - 1] = val;
                }
                None => {
                    let msg = format!("Key ({}) is not in the dictionary.", ind);
                    self.cthrow(ids().keynf_id, msg);
                }
            }
            return;
        }

        // One-based indexing into a list or string.
        let len = match &self.stack[n - 2] {
            Value::List(l) => l.len() as i64,
            Value::Str(s) => s.len() as i64,
            _ => 0,
        };
        let i = match ind {
            Value::Int(v) => v - 1,
            _ => 0,
        };
        if i < 0 {
            self.cthrow(ids().range_id, format!("Index ({}) is less than one.", i + 1));
        } else if i > len - 1 {
            let msg = format!("Index ({}) is greater than length ({})", i + 1, len);
            self.cthrow(ids().range_id, msg);
        } else {
            match &self.stack[n - 2] {
                Value::List(l) => {
                    let elem = l[i as usize].clone();
                    self.pop_discard(2);
                    self.push(elem);
                }
                Value::Str(s) => {
                    let one = (s.as_bytes()[i as usize] as char).to_string();
                    self.pop_discard(2);
                    self.push(Value::string(&one));
                }
                _ => {}
            }
        }
    }

    fn op_and(&mut self) {
        // Short-circuit if the left side is false; otherwise discard it.
        if !self.top_truthy() {
            self.jump_operand();
        } else {
            self.cur_mut().pc += 1;
            self.pop_discard(1);
        }
    }

    fn op_or(&mut self) {
        if self.top_truthy() {
            self.jump_operand();
        } else {
            self.cur_mut().pc += 1;
            self.pop_discard(1);
        }
    }

    fn op_splice(&mut self) {
        let n = self.stack.len();
        let list = match &self.stack[n - 1] {
            Value::List(l) => l.clone(),
            other => {
                let msg = format!("{} is not a list.", other);
                self.cthrow(ids().type_id, msg);
                return;
            }
        };
        self.pop_discard(1);
        for elem in list.iter() {
            self.push(elem.clone());
        }
    }

    // ------------------------------------------------------------------
    // Arithmetic, comparison, membership
    // ------------------------------------------------------------------

    fn pop_pair(&mut self) -> (Value, Value) {
        let right = self.pop_value();
        let left = self.pop_value();
        (left, right)
    }

    /// Promote an integer paired with a float to a float.
    fn coerce_pair(pair: (Value, Value)) -> (Value, Value) {
        match pair {
            (Value::Float(a), Value::Int(b)) => (Value::Float(a), Value::Float(b as FloatType)),
            (Value::Int(a), Value::Float(b)) => (Value::Float(a as FloatType), Value::Float(b)),
            other => other,
        }
    }

    fn throw_mixed_numeric(&mut self, a: &Value, b: &Value) {
        if a.tag() != b.tag() {
            self.cthrow(ids().type_id, format!("{} and {} are not of the same type.", a, b));
        } else {
            self.cthrow(ids().type_id, format!("{} and {} are not integers or floats.", a, b));
        }
    }

    fn op_not(&mut self) {
        let val = self.pop_value();
        self.push(Value::Int(if val.truthy() { 0 } else { 1 }));
    }

    fn op_negate(&mut self) {
        let n = self.stack.len();
        match self.stack[n - 1].clone() {
            Value::Int(v) => self.stack[n - 1] = Value::Int(v.wrapping_neg()),
            Value::Float(f) => self.stack[n - 1] = Value::Float(-f),
            other => {
                let msg = format!("Argument ({}) is not an integer or float.", other);
                self.cthrow(ids().type_id, msg);
            }
        }
    }

    fn op_multiply(&mut self) {
        let pair = Self::coerce_pair(self.pop_pair());
        match pair {
            (Value::Int(a), Value::Int(b)) => self.push(Value::Int(a.wrapping_mul(b))),
            (Value::Float(a), Value::Float(b)) => self.push(Value::Float(a * b)),
            (a, b) => self.throw_mixed_numeric(&a, &b),
        }
    }

    fn op_divide(&mut self) {
        let pair = Self::coerce_pair(self.pop_pair());
        match pair {
            (Value::Int(a), Value::Int(b)) => {
                if b == 0 {
                    self.cthrow(ids().div_id, format!("Attempt to divide {} by zero.", a));
                } else {
                    self.push(Value::Int(a.wrapping_div(b)));
                }
            }
            (Value::Float(a), Value::Float(b)) => {
                if b == 0.0 {
                    self.cthrow(
                        ids().div_id,
                        format!("Attempt to divide {} by zero.", Value::Float(a)),
                    );
                } else {
                    self.push(Value::Float(a / b));
                }
            }
            (a, b) => self.throw_mixed_numeric(&a, &b),
        }
    }

    fn op_modulo(&mut self) {
        let (a, b) = self.pop_pair();
        match (a, b) {
            (Value::Int(a), Value::Int(b)) => {
                if b == 0 {
                    self.cthrow(ids().div_id, format!("Attempt to divide {} by zero.", a));
                } else {
                    self.push(Value::Int(a.wrapping_rem(b)));
                }
            }
            (Value::Int(_), b) => {
                self.cthrow(ids().type_id, format!("Right side ({}) is not an integer.", b))
            }
            (a, _) => self.cthrow(ids().type_id, format!("Left side ({}) is not an integer.", a)),
        }
    }

    fn op_add(&mut self) {
        let pair = Self::coerce_pair(self.pop_pair());
        match pair {
            (Value::Int(a), Value::Int(b)) => self.push(Value::Int(a.wrapping_add(b))),
            (Value::Float(a), Value::Float(b)) => self.push(Value::Float(a + b)),
            (Value::Str(a), Value::Str(b)) => {
                // Let an in-place assignment see a unique reference.
                self.anticipate_assignment();
                let mut owned = Arc::try_unwrap(a).unwrap_or_else(|arc| (*arc).clone());
                owned.push_str(&b);
                self.push(Value::Str(Arc::new(owned)));
            }
            (Value::List(a), Value::List(b)) => {
                self.anticipate_assignment();
                let mut owned = Arc::try_unwrap(a).unwrap_or_else(|arc| (*arc).clone());
                owned.extend(b.iter().cloned());
                self.push(Value::List(Arc::new(owned)));
            }
            (a, b) => self.cthrow(ids().type_id, format!("Cannot add {} and {}.", a, b)),
        }
    }

    fn op_splice_add(&mut self) {
        let (a, b) = self.pop_pair();
        // Code generation guarantees the right side is a list.
        let spliced = match b {
            Value::List(l) => l,
            _ => Arc::new(Vec::new()),
        };
        let base = match a {
            Value::List(l) => l,
            other => {
                self.cthrow(ids().type_id, format!("{} is not a list.", other));
                return;
            }
        };
        self.anticipate_assignment();
        let mut owned = Arc::try_unwrap(base).unwrap_or_else(|arc| (*arc).clone());
        owned.extend(spliced.iter().cloned());
        self.push(Value::List(Arc::new(owned)));
    }

    fn op_subtract(&mut self) {
        let pair = Self::coerce_pair(self.pop_pair());
        match pair {
            (Value::Int(a), Value::Int(b)) => self.push(Value::Int(a.wrapping_sub(b))),
            (Value::Float(a), Value::Float(b)) => self.push(Value::Float(a - b)),
            (a, b) => self.throw_mixed_numeric(&a, &b),
        }
    }

    fn op_equal(&mut self) {
        let (a, b) = self.pop_pair();
        self.push(Value::Int(if data_equal(&a, &b) { 1 } else { 0 }));
    }

    fn op_not_equal(&mut self) {
        let (a, b) = self.pop_pair();
        self.push(Value::Int(if data_equal(&a, &b) { 0 } else { 1 }));
    }

    fn compare_op(&mut self, test: fn(Ordering) -> bool) {
        let (a, b) = Self::coerce_pair(self.pop_pair());
        if a.tag() != b.tag() {
            self.cthrow(ids().type_id, format!("{} and {} are not of the same type.", a, b));
            return;
        }
        match data_order(&a, &b) {
            Some(order) => self.push(Value::Int(if test(order) { 1 } else { 0 })),
            None => self.cthrow(
                ids().type_id,
                format!("{} and {} are not integers, floats or strings.", a, b),
            ),
        }
    }

    fn op_in(&mut self) {
        let (a, b) = self.pop_pair();
        match (&a, &b) {
            (_, Value::List(l)) => {
                let pos = l.iter().position(|elem| data_equal(elem, &a));
                self.push(Value::Int(pos.map(|p| p as i64 + 1).unwrap_or(0)));
            }
            (Value::Str(needle), Value::Str(hay)) => {
                let pos = str_cfind(hay, needle);
                self.push(Value::Int(pos.map(|p| p as i64 + 1).unwrap_or(0)));
            }
            _ => self.cthrow(ids().type_id, format!("Cannot search for {} in {}.", a, b)),
        }
    }

    fn int_binary(&mut self, f: fn(i64, i64) -> i64) {
        let (a, b) = self.pop_pair();
        match (a, b) {
            (Value::Int(a), Value::Int(b)) => self.push(Value::Int(f(a, b))),
            (Value::Int(_), b) => {
                self.cthrow(ids().type_id, format!("Right side ({}) is not an integer.", b))
            }
            (a, _) => self.cthrow(ids().type_id, format!("Left side ({}) is not an integer.", a)),
        }
    }
}
