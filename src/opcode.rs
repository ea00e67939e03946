// File: src/opcode.rs
//
// Bytecode instruction definitions for the Ember VM.
// The opcode stream is a flat sequence of signed words; operands follow
// their opcode inline, and float immediates reinterpret the word's bits.

use crate::ident::{ident, Ident};
use crate::value::Word;

/// Whether a raising site is reported in tracebacks as an operator opcode
/// or as a built-in function. Carried on the descriptor rather than derived
/// from the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Opcode,
    Function,
}

/// Static descriptor for one opcode.
pub struct OpInfo {
    pub name: &'static str,
    pub kind: OpKind,
}

macro_rules! opcodes {
    ($($variant:ident = $num:literal => $name:literal, $kind:ident;)*) => {
        /// Bytecode instruction opcodes.
        ///
        /// Stack-based machine with a shared value stack and a parallel
        /// argument-start stack; see the engine for the behavioral
        /// contracts. Discriminants are the on-the-wire word values.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i64)]
        pub enum Opcode {
            $($variant = $num,)*
        }

        impl Opcode {
            /// Decode a bytecode word into an opcode.
            pub fn from_word(w: Word) -> Option<Opcode> {
                match w {
                    $($num => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            pub fn info(self) -> &'static OpInfo {
                match self {
                    $(Opcode::$variant => &OpInfo { name: $name, kind: OpKind::$kind },)*
                }
            }
        }
    };
}

opcodes! {
    // Statements and assignment
    Comment = 0 => "COMMENT", Opcode;
    Pop = 1 => "POP", Opcode;
    SetLocal = 2 => "SET_LOCAL", Opcode;
    SetObjVar = 3 => "SET_OBJ_VAR", Opcode;

    // Control flow
    If = 4 => "IF", Opcode;
    Else = 5 => "ELSE", Opcode;
    ForRange = 6 => "FOR_RANGE", Opcode;
    ForList = 7 => "FOR_LIST", Opcode;
    While = 8 => "WHILE", Opcode;
    Switch = 9 => "SWITCH", Opcode;
    CaseValue = 10 => "CASE_VALUE", Opcode;
    CaseRange = 11 => "CASE_RANGE", Opcode;
    LastCaseValue = 12 => "LAST_CASE_VALUE", Opcode;
    LastCaseRange = 13 => "LAST_CASE_RANGE", Opcode;
    EndCase = 14 => "END_CASE", Opcode;
    Default = 15 => "DEFAULT", Opcode;
    End = 16 => "END", Opcode;
    Break = 17 => "BREAK", Opcode;
    Continue = 18 => "CONTINUE", Opcode;
    Return = 19 => "RETURN", Opcode;
    ReturnExpr = 20 => "RETURN_EXPR", Opcode;

    // Error-action scoping
    Catch = 21 => "CATCH", Opcode;
    CatchEnd = 22 => "CATCH_END", Opcode;
    HandlerEnd = 23 => "HANDLER_END", Opcode;
    Critical = 24 => "CRITICAL", Opcode;
    CriticalEnd = 25 => "CRITICAL_END", Opcode;
    Propagate = 26 => "PROPAGATE", Opcode;
    PropagateEnd = 27 => "PROPAGATE_END", Opcode;

    // Literals
    Zero = 28 => "ZERO", Opcode;
    One = 29 => "ONE", Opcode;
    Integer = 30 => "INTEGER", Opcode;
    Float = 31 => "FLOAT", Opcode;
    String = 32 => "STRING", Opcode;
    Dbref = 33 => "DBREF", Opcode;
    Symbol = 34 => "SYMBOL", Opcode;
    Error = 35 => "ERROR", Opcode;
    Name = 36 => "NAME", Opcode;

    // Variables
    GetLocal = 37 => "GET_LOCAL", Opcode;
    GetObjVar = 38 => "GET_OBJ_VAR", Opcode;

    // Message passing
    StartArgs = 39 => "START_ARGS", Opcode;
    Pass = 40 => "PASS", Opcode;
    Message = 41 => "MESSAGE", Opcode;
    ExprMessage = 42 => "EXPR_MESSAGE", Opcode;

    // Construction and indexing
    List = 43 => "LIST", Opcode;
    Dict = 44 => "DICT", Opcode;
    Buffer = 45 => "BUFFER", Opcode;
    Frob = 46 => "FROB", Opcode;
    Index = 47 => "INDEX", Opcode;
    And = 48 => "AND", Opcode;
    Or = 49 => "OR", Opcode;
    Splice = 50 => "SPLICE", Opcode;

    // Arithmetic and relational
    Not = 51 => "NOT", Opcode;
    Negate = 52 => "NEGATE", Opcode;
    Multiply = 53 => "MULTIPLY", Opcode;
    Divide = 54 => "DIVIDE", Opcode;
    Modulo = 55 => "MODULO", Opcode;
    Add = 56 => "ADD", Opcode;
    SpliceAdd = 57 => "SPLICE_ADD", Opcode;
    Subtract = 58 => "SUBTRACT", Opcode;
    Equal = 59 => "EQUAL", Opcode;
    NotEqual = 60 => "NOT_EQUAL", Opcode;
    Greater = 61 => "GREATER", Opcode;
    GreaterOrEqual = 62 => "GREATER_OR_EQUAL", Opcode;
    Less = 63 => "LESS", Opcode;
    LessOrEqual = 64 => "LESS_OR_EQUAL", Opcode;
    In = 65 => "IN", Opcode;
    BitAnd = 66 => "BITAND", Opcode;
    BitOr = 67 => "BITOR", Opcode;
    Shr = 68 => "SHR", Opcode;
    Shl = 69 => "SHL", Opcode;

    // Built-in functions (scheduler and error protocol)
    Pause = 70 => "pause", Function;
    Suspend = 71 => "suspend", Function;
    Resume = 72 => "resume", Function;
    Cancel = 73 => "cancel", Function;
    Tasks = 74 => "tasks", Function;
    Callers = 75 => "callers", Function;
    TaskId = 76 => "task_id", Function;
    TicksLeft = 77 => "ticks_left", Function;
    Throw = 78 => "throw", Function;
    Traceback = 79 => "traceback", Function;
    ErrorFunc = 80 => "error", Function;
}

impl Opcode {
    /// The bytecode word for this opcode.
    pub fn word(self) -> Word {
        self as Word
    }

    /// The interned symbol for this opcode's name, used in traceback
    /// location records.
    pub fn symbol(self) -> Ident {
        ident(self.info().name)
    }
}
