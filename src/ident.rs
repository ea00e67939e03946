// File: src/ident.rs
//
// Interned identifiers for the Ember VM.
// Symbols, error kinds, and method names are all interned once and passed
// around as small copyable handles.

use ahash::AHashMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

/// A handle to an interned identifier.
///
/// Two idents compare equal iff they were interned from the same text, so
/// symbol and error-kind comparison is a single integer compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(u32);

struct Interner {
    names: Vec<Arc<str>>,
    table: AHashMap<Arc<str>, u32>,
}

impl Interner {
    fn intern(&mut self, name: &str) -> Ident {
        if let Some(&ix) = self.table.get(name) {
            return Ident(ix);
        }
        let ix = self.names.len() as u32;
        let owned: Arc<str> = Arc::from(name);
        self.names.push(owned.clone());
        self.table.insert(owned, ix);
        Ident(ix)
    }
}

static INTERNER: Lazy<Mutex<Interner>> = Lazy::new(|| {
    Mutex::new(Interner { names: Vec::new(), table: AHashMap::new() })
});

/// Intern `name` and return its handle.
pub fn ident(name: &str) -> Ident {
    match INTERNER.lock() {
        Ok(mut interner) => interner.intern(name),
        Err(poisoned) => poisoned.into_inner().intern(name),
    }
}

/// Look up the text of an interned identifier.
pub fn ident_name(id: Ident) -> Arc<str> {
    let interner = match INTERNER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    interner.names[id.0 as usize].clone()
}

/// The well-known identifiers the engine itself raises and reports with.
///
/// Error kinds are a closed set; everything else an embedder throws goes
/// through `ident()` like any other symbol.
pub struct Ids {
    pub numargs_id: Ident,
    pub objnf_id: Ident,
    pub methodnf_id: Ident,
    pub type_id: Ident,
    pub range_id: Ident,
    pub div_id: Ident,
    pub keynf_id: Ident,
    pub perm_id: Ident,
    pub private_id: Ident,
    pub protected_id: Ident,
    pub root_id: Ident,
    pub driver_id: Ident,
    pub maxdepth_id: Ident,
    pub namenf_id: Ident,
    pub paramnf_id: Ident,
    pub methoderr_id: Ident,

    // Traceback location markers.
    pub opcode_id: Ident,
    pub function_id: Ident,
    pub method_id: Ident,
}

static IDS: Lazy<Ids> = Lazy::new(|| Ids {
    numargs_id: ident("numargs"),
    objnf_id: ident("objnf"),
    methodnf_id: ident("methodnf"),
    type_id: ident("type"),
    range_id: ident("range"),
    div_id: ident("div"),
    keynf_id: ident("keynf"),
    perm_id: ident("perm"),
    private_id: ident("private"),
    protected_id: ident("protected"),
    root_id: ident("root"),
    driver_id: ident("driver"),
    maxdepth_id: ident("maxdepth"),
    namenf_id: ident("namenf"),
    paramnf_id: ident("paramnf"),
    methoderr_id: ident("methoderr"),
    opcode_id: ident("opcode"),
    function_id: ident("function"),
    method_id: ident("method"),
});

/// Access the well-known identifier set.
pub fn ids() -> &'static Ids {
    &IDS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let a = ident("wizard");
        let b = ident("wizard");
        let c = ident("apprentice");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ident_name(a).as_ref(), "wizard");
        assert_eq!(ident_name(c).as_ref(), "apprentice");
    }

    #[test]
    fn well_known_ids_are_distinct() {
        let ids = ids();
        assert_ne!(ids.type_id, ids.range_id);
        assert_ne!(ids.methoderr_id, ids.methodnf_id);
        assert_eq!(ids.div_id, ident("div"));
    }
}
