// File: src/object.rs
//
// Methods, objects, and the store interface the engine executes against.
// The real store is disk-backed and lives elsewhere; MemStore is the
// in-memory implementation used for embedding bring-up and tests.

use crate::ident::{ident, ids, Ident};
use crate::opcode::Opcode;
use crate::value::{Dbref, Value, Word, NO_DBREF};
use ahash::AHashMap;
use nohash_hasher::IntMap;
use std::sync::Arc;

/// Visibility modifier of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodState {
    Public,
    Private,
    Protected,
    Root,
    Driver,
}

/// A compiled method: opcode stream plus the literal side tables the
/// stream indexes into.
#[derive(Debug, Clone)]
pub struct Method {
    /// Method name; None for anonymous eval methods.
    pub name: Option<Ident>,
    /// The defining object.
    pub definer: Dbref,
    pub opcodes: Vec<Word>,
    /// Declared fixed argument count.
    pub num_args: usize,
    /// Whether surplus arguments are collected into a rest list.
    pub rest: bool,
    /// Local variable slots beyond the arguments.
    pub num_vars: usize,
    pub strings: Vec<Arc<String>>,
    pub idents: Vec<Ident>,
    pub error_lists: Vec<Vec<Ident>>,
    /// (first_pc, line) pairs, sorted by pc.
    pub lines: Vec<(usize, i64)>,
    pub state: MethodState,
}

impl Method {
    pub fn get_string(&self, ix: usize) -> Arc<String> {
        self.strings[ix].clone()
    }

    pub fn get_ident(&self, ix: usize) -> Ident {
        self.idents[ix]
    }

    /// Source line for a program counter, or 0 if the method carries no
    /// line information.
    pub fn line_number(&self, pc: usize) -> i64 {
        let mut line = 0;
        for &(first_pc, l) in &self.lines {
            if first_pc > pc {
                break;
            }
            line = l;
        }
        line
    }
}

/// Incremental assembler for methods, in emit/patch style.
///
/// The compiler proper is an external collaborator; embedders and the test
/// suite use this to put together executable methods by hand.
#[derive(Debug, Default)]
pub struct MethodBuilder {
    name: Option<Ident>,
    definer: Dbref,
    opcodes: Vec<Word>,
    num_args: usize,
    rest: bool,
    num_vars: usize,
    strings: Vec<Arc<String>>,
    idents: Vec<Ident>,
    error_lists: Vec<Vec<Ident>>,
    lines: Vec<(usize, i64)>,
    state: Option<MethodState>,
}

impl MethodBuilder {
    pub fn new() -> Self {
        MethodBuilder { definer: NO_DBREF, ..Default::default() }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(ident(name));
        self
    }

    pub fn num_args(mut self, n: usize) -> Self {
        self.num_args = n;
        self
    }

    pub fn rest(mut self) -> Self {
        self.rest = true;
        self
    }

    pub fn num_vars(mut self, n: usize) -> Self {
        self.num_vars = n;
        self
    }

    pub fn state(mut self, state: MethodState) -> Self {
        self.state = Some(state);
        self
    }

    /// Emit an opcode and return its index.
    pub fn emit(&mut self, op: Opcode) -> usize {
        self.emit_word(op.word())
    }

    /// Emit a raw operand word and return its index.
    pub fn emit_word(&mut self, w: Word) -> usize {
        let ix = self.opcodes.len();
        self.opcodes.push(w);
        ix
    }

    /// Current emit position, for forward-jump bookkeeping.
    pub fn here(&self) -> Word {
        self.opcodes.len() as Word
    }

    /// Patch a previously emitted operand word.
    pub fn patch(&mut self, ix: usize, w: Word) {
        self.opcodes[ix] = w;
    }

    /// Record that opcodes emitted from here on belong to `line`.
    pub fn line(&mut self, line: i64) {
        self.lines.push((self.opcodes.len(), line));
    }

    /// Add a string literal (deduplicated) and return its pool index.
    pub fn string_lit(&mut self, s: &str) -> Word {
        if let Some(ix) = self.strings.iter().position(|e| e.as_str() == s) {
            return ix as Word;
        }
        self.strings.push(Arc::new(s.to_string()));
        (self.strings.len() - 1) as Word
    }

    /// Add an identifier literal (deduplicated) and return its pool index.
    pub fn ident_lit(&mut self, name: &str) -> Word {
        let id = ident(name);
        if let Some(ix) = self.idents.iter().position(|e| *e == id) {
            return ix as Word;
        }
        self.idents.push(id);
        (self.idents.len() - 1) as Word
    }

    /// Register an error-id list for a catch statement and return its index.
    pub fn error_list(&mut self, kinds: &[Ident]) -> Word {
        self.error_lists.push(kinds.to_vec());
        (self.error_lists.len() - 1) as Word
    }

    pub fn build(self) -> Method {
        Method {
            name: self.name,
            definer: self.definer,
            opcodes: self.opcodes,
            num_args: self.num_args,
            rest: self.rest,
            num_vars: self.num_vars,
            strings: self.strings,
            idents: self.idents,
            error_lists: self.error_lists,
            lines: self.lines,
            state: self.state.unwrap_or(MethodState::Public),
        }
    }
}

/// An object record: identity, parents, declared parameters, methods.
#[derive(Debug, Clone, Default)]
pub struct Object {
    pub dbref: Dbref,
    pub parents: Vec<Dbref>,
    pub params: Vec<Ident>,
    pub methods: AHashMap<Ident, Arc<Method>>,
}

/// The store interface the engine consumes.
///
/// Holds are expressed through the shared ownership of the returned
/// records; dropping the Arc releases the hold.
pub trait ObjectStore {
    fn retrieve(&self, dbref: Dbref) -> Option<Arc<Object>>;

    /// Resolve `name` starting at `dbref`, walking the inheritance graph.
    fn find_method(&self, dbref: Dbref, name: Ident) -> Option<Arc<Method>>;

    /// Resolve the next definition of `name` above `after` in the
    /// inheritance chain of `dbref`.
    fn find_next_method(&self, dbref: Dbref, name: Ident, after: Dbref) -> Option<Arc<Method>>;

    /// Read an object variable. The variable must be declared by `definer`;
    /// undeclared reads fail with the parameter-not-found kind.
    fn get_var(&self, this: Dbref, definer: Dbref, id: Ident) -> Result<Value, Ident>;

    /// Write an object variable, with the same declaration rule.
    fn assign_var(&mut self, this: Dbref, definer: Dbref, id: Ident, value: Value)
        -> Result<(), Ident>;

    /// Resolve an object name (`$foo`, type objects) to a dbref.
    fn name_to_dbref(&self, name: Ident) -> Option<Dbref>;
}

/// In-memory object store with multiple inheritance.
///
/// Ancestor order is left-to-right depth-first from the object itself,
/// duplicates pruned keeping the first occurrence.
#[derive(Debug, Default)]
pub struct MemStore {
    objects: IntMap<Dbref, Arc<Object>>,
    vars: AHashMap<(Dbref, Dbref, Ident), Value>,
    names: AHashMap<Ident, Dbref>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    pub fn add_object(&mut self, dbref: Dbref, parents: Vec<Dbref>) {
        let obj = Object { dbref, parents, ..Default::default() };
        self.objects.insert(dbref, Arc::new(obj));
    }

    /// Declare a parameter (object variable) on `dbref`.
    pub fn add_param(&mut self, dbref: Dbref, name: &str) {
        let id = ident(name);
        if let Some(obj) = self.objects.get_mut(&dbref) {
            let obj = Arc::make_mut(obj);
            if !obj.params.contains(&id) {
                obj.params.push(id);
            }
        }
    }

    /// Install a method on `dbref` under `name`, fixing up the method's
    /// identity fields.
    pub fn add_method(&mut self, dbref: Dbref, name: &str, mut method: Method) {
        let id = ident(name);
        method.name = Some(id);
        method.definer = dbref;
        if let Some(obj) = self.objects.get_mut(&dbref) {
            Arc::make_mut(obj).methods.insert(id, Arc::new(method));
        }
    }

    /// Bind an object name for NAME resolution and type-object dispatch.
    pub fn set_name(&mut self, name: &str, dbref: Dbref) {
        self.names.insert(ident(name), dbref);
    }

    fn ancestors(&self, dbref: Dbref) -> Vec<Dbref> {
        let mut order = Vec::new();
        self.walk_ancestors(dbref, &mut order);
        order
    }

    fn walk_ancestors(&self, dbref: Dbref, order: &mut Vec<Dbref>) {
        if order.contains(&dbref) {
            return;
        }
        order.push(dbref);
        if let Some(obj) = self.objects.get(&dbref) {
            for &parent in &obj.parents {
                self.walk_ancestors(parent, order);
            }
        }
    }
}

impl ObjectStore for MemStore {
    fn retrieve(&self, dbref: Dbref) -> Option<Arc<Object>> {
        self.objects.get(&dbref).cloned()
    }

    fn find_method(&self, dbref: Dbref, name: Ident) -> Option<Arc<Method>> {
        for ancestor in self.ancestors(dbref) {
            if let Some(obj) = self.objects.get(&ancestor) {
                if let Some(method) = obj.methods.get(&name) {
                    return Some(method.clone());
                }
            }
        }
        None
    }

    fn find_next_method(&self, dbref: Dbref, name: Ident, after: Dbref) -> Option<Arc<Method>> {
        let mut passed = false;
        for ancestor in self.ancestors(dbref) {
            if passed {
                if let Some(obj) = self.objects.get(&ancestor) {
                    if let Some(method) = obj.methods.get(&name) {
                        return Some(method.clone());
                    }
                }
            } else if ancestor == after {
                passed = true;
            }
        }
        None
    }

    fn get_var(&self, this: Dbref, definer: Dbref, id: Ident) -> Result<Value, Ident> {
        let declared = self
            .objects
            .get(&definer)
            .map(|obj| obj.params.contains(&id))
            .unwrap_or(false);
        if !declared {
            return Err(ids().paramnf_id);
        }
        Ok(self.vars.get(&(this, definer, id)).cloned().unwrap_or(Value::Int(0)))
    }

    fn assign_var(
        &mut self,
        this: Dbref,
        definer: Dbref,
        id: Ident,
        value: Value,
    ) -> Result<(), Ident> {
        let declared = self
            .objects
            .get(&definer)
            .map(|obj| obj.params.contains(&id))
            .unwrap_or(false);
        if !declared {
            return Err(ids().paramnf_id);
        }
        self.vars.insert((this, definer, id), value);
        Ok(())
    }

    fn name_to_dbref(&self, name: Ident) -> Option<Dbref> {
        self.names.get(&name).copied()
    }
}
