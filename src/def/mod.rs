//! The definition tree: runtime values shaped by a [`crate::decl::Declaration`].
//!
//! A `Definition` owns its children outright (plain `Vec`, never shared);
//! the only indirection is a `RefCell` per node, which lets a dynamic
//! array's length or a variant's selected option be looked up by walking
//! an already-resolved [`crate::decl::FieldPath`] through sibling and
//! ancestor `Definition`s while a later field is still being populated,
//! without fighting the borrow checker over a tree with backward
//! references. Nodes are never shared across cursors, so this never
//! exercises `RefCell`'s runtime check against concurrent aliasing — it
//! only ever sees one borrow active at a time, sequentially.
//!
//! Generalizes a flat field-value tree, which never needed to resolve a
//! reference when events were flat byte-aligned structs, to one that
//! resolves dynamic-array lengths and variant selectors against sibling
//! and ancestor fields.

use crate::bitpos::StreamPos;
use crate::decl::{DeclKind, Declaration, FieldPath, PreferredDisplayBase, ScopeKind};
use crate::error::Error;
use crate::value::Value;
use internment::Intern;
use std::cell::RefCell;

enum Data {
    UInt(u64),
    SInt(i64),
    F32(f32),
    F64(f64),
    Enum(i64),
    Str(String),
    Struct(Vec<Definition>),
    Variant { options: Vec<Definition>, selected: Option<usize> },
    StaticArray(Vec<Definition>),
    DynArray(Vec<Definition>),
}

/// An instance node: a declaration paired with a value, its position among
/// its siblings, and its dot-joined path from the scope root.
pub struct Definition {
    decl: Declaration,
    name: Intern<String>,
    index: usize,
    path: String,
    data: RefCell<Data>,
}

/// The five top-level definition trees a sibling reference can resolve
/// against, mirroring [`crate::decl::CanonicalScopes`] but holding the
/// already-built instances rather than their declarations.
#[derive(Default)]
pub struct ScopeSet<'a> {
    pub trace_header: Option<&'a Definition>,
    pub packet_context: Option<&'a Definition>,
    pub event_header: Option<&'a Definition>,
    pub event_context: Option<&'a Definition>,
    pub event_payload: Option<&'a Definition>,
}

impl<'a> ScopeSet<'a> {
    fn get(&self, kind: ScopeKind) -> Option<&'a Definition> {
        match kind {
            ScopeKind::TraceHeader => self.trace_header,
            ScopeKind::PacketContext => self.packet_context,
            ScopeKind::EventHeader => self.event_header,
            ScopeKind::EventContext => self.event_context,
            ScopeKind::EventPayload => self.event_payload,
        }
    }
}

impl Definition {
    /// Builds an instance tree shaped by `decl`. Containers recurse
    /// eagerly except dynamic arrays, which start empty and grow on read
    /// (to the resolved length) or via [`Definition::push_element`] on
    /// write.
    pub fn create_from(decl: &Declaration, name: impl Into<String>, index: usize, parent_path: &str) -> Definition {
        let name = Intern::new(name.into());
        let path = if parent_path.is_empty() {
            name.as_str().to_owned()
        } else {
            format!("{parent_path}.{name}")
        };

        let data = match decl.kind() {
            DeclKind::UInt => Data::UInt(0),
            DeclKind::SInt => Data::SInt(0),
            DeclKind::Float => match decl.float_total_bits() {
                Some(32) => Data::F32(0.0),
                _ => Data::F64(0.0),
            },
            DeclKind::Enum => Data::Enum(0),
            DeclKind::Str => Data::Str(String::new()),
            DeclKind::Struct => {
                let members = decl.members().unwrap_or_default();
                let children = members
                    .iter()
                    .enumerate()
                    .map(|(i, (n, d))| Definition::create_from(d, n.as_str(), i, &path))
                    .collect();
                Data::Struct(children)
            }
            DeclKind::Variant => {
                let options = decl.options().unwrap_or_default();
                let children = options
                    .iter()
                    .enumerate()
                    .map(|(i, (n, d))| Definition::create_from(d, n.as_str(), i, &path))
                    .collect();
                Data::Variant {
                    options: children,
                    selected: None,
                }
            }
            DeclKind::StaticArray => {
                if decl.is_char_array() {
                    Data::Str(String::new())
                } else {
                    let element = decl.element().expect("static array always has an element decl");
                    let length = decl.static_array_length().unwrap_or(0);
                    let children = (0..length)
                        .map(|i| Definition::create_from(&element, format!("[{i}]"), i, &path))
                        .collect();
                    Data::StaticArray(children)
                }
            }
            DeclKind::DynArray => {
                if decl.is_char_array() {
                    Data::Str(String::new())
                } else {
                    Data::DynArray(Vec::new())
                }
            }
        };

        Definition {
            decl: decl.clone(),
            name,
            index,
            path,
            data: RefCell::new(data),
        }
    }

    pub fn decl(&self) -> &Declaration {
        &self.decl
    }

    pub fn name(&self) -> Intern<String> {
        self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    // -- setters (write side) -------------------------------------------------

    pub fn set_uint(&self, v: u64) -> Result<(), Error> {
        match &mut *self.data.borrow_mut() {
            Data::UInt(slot) => {
                *slot = v;
                Ok(())
            }
            Data::Enum(slot) => {
                *slot = v as i64;
                Ok(())
            }
            _ => Err(Error::invalid(format!("set_uint on '{}' ({})", self.path, self.decl.type_name()))),
        }
    }

    pub fn set_sint(&self, v: i64) -> Result<(), Error> {
        match &mut *self.data.borrow_mut() {
            Data::SInt(slot) => {
                *slot = v;
                Ok(())
            }
            Data::Enum(slot) => {
                *slot = v;
                Ok(())
            }
            _ => Err(Error::invalid(format!("set_sint on '{}' ({})", self.path, self.decl.type_name()))),
        }
    }

    pub fn set_f32(&self, v: f32) -> Result<(), Error> {
        match &mut *self.data.borrow_mut() {
            Data::F32(slot) => {
                *slot = v;
                Ok(())
            }
            _ => Err(Error::invalid(format!("set_f32 on '{}'", self.path))),
        }
    }

    pub fn set_f64(&self, v: f64) -> Result<(), Error> {
        match &mut *self.data.borrow_mut() {
            Data::F64(slot) => {
                *slot = v;
                Ok(())
            }
            _ => Err(Error::invalid(format!("set_f64 on '{}'", self.path))),
        }
    }

    pub fn set_str(&self, v: impl Into<String>) -> Result<(), Error> {
        match &mut *self.data.borrow_mut() {
            Data::Str(slot) => {
                *slot = v.into();
                Ok(())
            }
            _ => Err(Error::invalid(format!("set_str on '{}'", self.path))),
        }
    }

    /// Sets the enum's raw value by label, looking the range up on the
    /// declaration (first match, per `Declaration::value_for_label`).
    pub fn set_enum_label(&self, label: &str) -> Result<(), Error> {
        let (lo, _) = self
            .decl
            .value_for_label(label)
            .ok_or_else(|| Error::invalid(format!("unknown enum label '{label}' for '{}'", self.path)))?;
        match &mut *self.data.borrow_mut() {
            Data::Enum(slot) => {
                *slot = lo;
                Ok(())
            }
            _ => Err(Error::invalid(format!("set_enum_label on '{}'", self.path))),
        }
    }

    /// Selects a variant's active option by label and returns its index.
    /// Subsequent `member`/`set_*` calls target that option.
    pub fn select_variant(&self, label: &str) -> Result<usize, Error> {
        match &mut *self.data.borrow_mut() {
            Data::Variant { options, selected } => {
                let idx = options
                    .iter()
                    .position(|o| o.name.as_str() == label)
                    .ok_or_else(|| Error::invalid(format!("unknown variant option '{label}' for '{}'", self.path)))?;
                *selected = Some(idx);
                Ok(idx)
            }
            _ => Err(Error::invalid(format!("select_variant on '{}'", self.path))),
        }
    }

    /// Appends one element to a dynamic array, growing its length by one.
    pub fn push_element(&self, value: impl Into<Value>) -> Result<(), Error> {
        let value = value.into();
        match &mut *self.data.borrow_mut() {
            Data::DynArray(children) => {
                let element_decl = self.decl.element().expect("dynamic array has an element decl");
                let idx = children.len();
                let child = Definition::create_from(&element_decl, format!("[{idx}]"), idx, &self.path);
                child.set_value(&value)?;
                children.push(child);
                Ok(())
            }
            _ => Err(Error::invalid(format!("push_element on '{}'", self.path))),
        }
    }

    fn set_value(&self, value: &Value) -> Result<(), Error> {
        match value {
            Value::UnsignedInteger(v, _) => self.set_uint(*v),
            Value::SignedInteger(v, _) => self.set_sint(*v),
            Value::F32(v) => self.set_f32(v.0),
            Value::F64(v) => self.set_f64(v.0),
            Value::Enumeration(v, _, _) => self.set_sint(*v),
            Value::String(s) => self.set_str(s.clone()),
            Value::Array(elems) => {
                for e in elems {
                    self.push_element(e.clone())?;
                }
                Ok(())
            }
            Value::Struct(members) => {
                for (name, v) in members {
                    self.with_struct_children(|children| -> Result<(), Error> {
                        let child = children
                            .iter()
                            .find(|c| c.name == *name)
                            .ok_or_else(|| Error::invalid(format!("unknown member '{name}' on '{}'", self.path)))?;
                        child.set_value(v)
                    })
                    .ok_or_else(|| Error::invalid(format!("set_value(Struct) on non-struct '{}'", self.path)))??;
                }
                Ok(())
            }
            Value::Variant(label, v) => {
                let idx = self.select_variant(label.as_str())?;
                match &*self.data.borrow() {
                    Data::Variant { options, .. } => options[idx].set_value(v),
                    _ => unreachable!(),
                }
            }
        }
    }

    // -- accessors (read side) -------------------------------------------------

    pub fn as_value(&self) -> Value {
        match &*self.data.borrow() {
            Data::UInt(v) => Value::UnsignedInteger(*v, PreferredDisplayBase::Decimal),
            Data::SInt(v) => Value::SignedInteger(*v, PreferredDisplayBase::Decimal),
            Data::F32(v) => Value::F32((*v).into()),
            Data::F64(v) => Value::F64((*v).into()),
            Data::Enum(v) => {
                let labels = self.decl.labels_for_value(*v);
                Value::Enumeration(*v, PreferredDisplayBase::Decimal, labels)
            }
            Data::Str(s) => Value::String(s.clone()),
            Data::Struct(children) => Value::Struct(children.iter().map(|c| (c.name, c.as_value())).collect()),
            Data::Variant { options, selected } => {
                let idx = selected.expect("variant read before a selection was made");
                Value::Variant(options[idx].name, Box::new(options[idx].as_value()))
            }
            Data::StaticArray(children) | Data::DynArray(children) => {
                Value::Array(children.iter().map(|c| c.as_value()).collect())
            }
        }
    }

    /// Looks up a struct member's index by name (used by callers that don't
    /// already have a resolved [`FieldPath`]).
    pub fn member_index(&self, name: &str) -> Option<usize> {
        match &*self.data.borrow() {
            Data::Struct(children) => children.iter().position(|c| c.name.as_str() == name),
            _ => None,
        }
    }

    /// Runs `f` against the named struct member, if any.
    pub fn with_member<R>(&self, name: &str, f: impl FnOnce(&Definition) -> R) -> Option<R> {
        self.with_struct_children(|children| {
            let idx = children.iter().position(|c| c.name.as_str() == name)?;
            Some(f(&children[idx]))
        })
        .flatten()
    }

    fn with_struct_children<R>(&self, f: impl FnOnce(&[Definition]) -> R) -> Option<R> {
        match &*self.data.borrow() {
            Data::Struct(children) | Data::StaticArray(children) | Data::DynArray(children) => Some(f(children)),
            _ => None,
        }
    }

    /// Sets one element of an already-sized array by index. Static arrays
    /// are pre-sized at construction; dynamic arrays only after elements
    /// have been pushed via [`Definition::push_element`].
    pub fn set_array_element(&self, idx: usize, value: impl Into<Value>) -> Result<(), Error> {
        let value = value.into();
        match &*self.data.borrow() {
            Data::StaticArray(children) | Data::DynArray(children) => {
                let child = children
                    .get(idx)
                    .ok_or_else(|| Error::invalid(format!("index {idx} out of range on '{}'", self.path)))?;
                child.set_value(&value)
            }
            _ => Err(Error::invalid(format!("set_array_element on '{}'", self.path))),
        }
    }

    /// Writes a struct's members in order like [`Definition::write`], but
    /// also returns the bit offset each member's value began at. Used by
    /// the packet writer to locate `content_size`/`packet_size` members so
    /// it can patch them in once the packet's true size is known.
    pub fn write_struct_with_offsets(&self, pos: &mut StreamPos, scopes: &ScopeSet) -> Result<Vec<(Intern<String>, usize)>, Error> {
        pos.align(self.decl.alignment_bits())?;
        let mut offsets = Vec::new();
        self.with_struct_children(|children| -> Result<(), Error> {
            for child in children {
                offsets.push((child.name, pos.offset_bits()));
                child.write(pos, scopes)?;
            }
            Ok(())
        })
        .ok_or_else(|| Error::invalid(format!("write_struct_with_offsets on non-struct '{}'", self.path)))??;
        Ok(offsets)
    }

    /// Walks a resolved [`FieldPath`] from a scope root down to the target
    /// field and invokes `f` with it, applied from inside the final borrow
    /// so `f`'s owned result can propagate out without ever needing a
    /// `&Definition` to outlive the `RefCell` guard that produced it.
    /// Structs only: array elements and variant options aren't addressable
    /// by a field path.
    fn with_path<R>(scopes: &ScopeSet, path: &FieldPath, f: impl FnOnce(&Definition) -> R) -> Option<R> {
        fn walk<R>(cur: &Definition, indices: &[usize], f: impl FnOnce(&Definition) -> R) -> Option<R> {
            match indices.split_first() {
                None => Some(f(cur)),
                Some((&idx, rest)) => match &*cur.data.borrow() {
                    Data::Struct(children) => walk(children.get(idx)?, rest, f),
                    _ => None,
                },
            }
        }
        let root = scopes.get(path.scope)?;
        walk(root, &path.indices, f)
    }

    /// The current value of a dynamic array's resolved length field.
    pub fn resolve_length(&self, scopes: &ScopeSet) -> Result<u64, Error> {
        let path = self
            .decl
            .dyn_array_resolved_path()
            .ok_or_else(|| Error::resolution_failed(&self.path, "dynamic array length was never resolved"))?;
        Definition::with_path(scopes, &path, |target| match &*target.data.borrow() {
            Data::UInt(v) => Ok(*v),
            _ => Err(Error::resolution_failed(&self.path, "length field is not an unsigned integer")),
        })
        .ok_or_else(|| Error::resolution_failed(&self.path, "length field not found at read time"))?
    }

    /// The label of the option selected by the variant's resolved selector,
    /// and that option's index among `self`'s children.
    pub fn current_option(&self, scopes: &ScopeSet) -> Result<(Intern<String>, usize), Error> {
        let path = self
            .decl
            .variant_resolved_path()
            .ok_or_else(|| Error::resolution_failed(&self.path, "variant selector was never resolved"))?;
        let selector_decl = self
            .decl
            .variant_selector_decl()
            .ok_or_else(|| Error::resolution_failed(&self.path, "variant has no resolved selector declaration"))?;
        let raw = Definition::with_path(scopes, &path, |target| match &*target.data.borrow() {
            Data::Enum(v) => Ok(*v),
            _ => Err(Error::resolution_failed(&self.path, "selector field is not an enum")),
        })
        .ok_or_else(|| Error::resolution_failed(&self.path, "selector field not found at read time"))??;
        let labels = selector_decl.labels_for_value(raw);
        let label = labels
            .first()
            .copied()
            .ok_or_else(|| Error::resolution_failed(&self.path, "selector value maps to no label"))?;
        match &*self.data.borrow() {
            Data::Variant { options, .. } => {
                let idx = options
                    .iter()
                    .position(|o| o.name == label)
                    .ok_or_else(|| Error::resolution_failed(&self.path, "selected label has no matching option"))?;
                Ok((label, idx))
            }
            _ => Err(Error::invalid(format!("current_option on non-variant '{}'", self.path))),
        }
    }

    /// Reads this definition's value (and, for containers, its children)
    /// from `pos`, resolving dynamic-array lengths and variant selectors
    /// against `scopes`.
    pub fn read(&self, pos: &mut StreamPos, scopes: &ScopeSet) -> Result<(), Error> {
        pos.align(self.decl.alignment_bits())?;
        match self.decl.kind() {
            DeclKind::UInt => {
                let (width, byte_order, _) = self.decl.integer_snapshot().unwrap();
                let v = pos.read_uint(width as usize, byte_order.resolve())?;
                *self.data.borrow_mut() = Data::UInt(v);
            }
            DeclKind::SInt => {
                let (width, byte_order, _) = self.decl.integer_snapshot().unwrap();
                let v = pos.read_sint(width as usize, byte_order.resolve())?;
                *self.data.borrow_mut() = Data::SInt(v);
            }
            DeclKind::Enum => {
                let container = self.decl.enum_container().expect("enum has a container");
                let (width, byte_order, signed) = container.integer_snapshot().unwrap();
                let v = if signed {
                    pos.read_sint(width as usize, byte_order.resolve())?
                } else {
                    pos.read_uint(width as usize, byte_order.resolve())? as i64
                };
                *self.data.borrow_mut() = Data::Enum(v);
            }
            DeclKind::Float => {
                let (_, _, byte_order) = self.decl.float_snapshot().unwrap();
                if self.decl.float_total_bits() == Some(32) {
                    let v = pos.read_f32(byte_order.resolve())?;
                    *self.data.borrow_mut() = Data::F32(v);
                } else {
                    let v = pos.read_f64(byte_order.resolve())?;
                    *self.data.borrow_mut() = Data::F64(v);
                }
            }
            DeclKind::Str => {
                let s = read_cstring(pos)?;
                *self.data.borrow_mut() = Data::Str(s);
            }
            DeclKind::Struct => {
                self.with_struct_children(|children| -> Result<(), Error> {
                    for child in children {
                        child.read(pos, scopes)?;
                    }
                    Ok(())
                })
                .unwrap()?;
            }
            DeclKind::StaticArray if self.decl.is_char_array() => {
                let len = self.decl.static_array_length().unwrap_or(0);
                let bytes = pos.read_bytes(len)?;
                let s = bytes_to_cstring(bytes);
                *self.data.borrow_mut() = Data::Str(s);
            }
            DeclKind::StaticArray => {
                self.with_struct_children(|children| -> Result<(), Error> {
                    for child in children {
                        child.read(pos, scopes)?;
                    }
                    Ok(())
                })
                .unwrap()?;
            }
            DeclKind::DynArray if self.decl.is_char_array() => {
                let len = self.resolve_length(scopes)? as usize;
                let bytes = pos.read_bytes(len)?;
                let s = bytes_to_cstring(bytes);
                *self.data.borrow_mut() = Data::Str(s);
            }
            DeclKind::DynArray => {
                let len = self.resolve_length(scopes)? as usize;
                let element_decl = self.decl.element().expect("dynamic array has an element decl");
                let mut children = Vec::with_capacity(len);
                for i in 0..len {
                    let child = Definition::create_from(&element_decl, format!("[{i}]"), i, &self.path);
                    child.read(pos, scopes)?;
                    children.push(child);
                }
                *self.data.borrow_mut() = Data::DynArray(children);
            }
            DeclKind::Variant => {
                let (_, idx) = self.current_option(scopes)?;
                match &*self.data.borrow() {
                    Data::Variant { options, .. } => options[idx].read(pos, scopes)?,
                    _ => unreachable!(),
                }
                match &mut *self.data.borrow_mut() {
                    Data::Variant { selected, .. } => *selected = Some(idx),
                    _ => unreachable!(),
                }
            }
        }
        Ok(())
    }

    /// Writes this definition's value to `pos`, resolving dynamic-array
    /// lengths and variant selectors against `scopes`. For a dynamic array,
    /// the number of elements already pushed must equal the resolved
    /// length field's current value, or this fails with `invalid_argument`
    /// (the caller's length field and its array contents have diverged).
    pub fn write(&self, pos: &mut StreamPos, scopes: &ScopeSet) -> Result<(), Error> {
        pos.align(self.decl.alignment_bits())?;
        match self.decl.kind() {
            DeclKind::UInt => {
                let (width, byte_order, _) = self.decl.integer_snapshot().unwrap();
                let v = match &*self.data.borrow() {
                    Data::UInt(v) => *v,
                    _ => unreachable!(),
                };
                pos.write_uint(v, width as usize, byte_order.resolve())?;
            }
            DeclKind::SInt => {
                let (width, byte_order, _) = self.decl.integer_snapshot().unwrap();
                let v = match &*self.data.borrow() {
                    Data::SInt(v) => *v,
                    _ => unreachable!(),
                };
                pos.write_sint(v, width as usize, byte_order.resolve())?;
            }
            DeclKind::Enum => {
                let container = self.decl.enum_container().expect("enum has a container");
                let (width, byte_order, signed) = container.integer_snapshot().unwrap();
                let v = match &*self.data.borrow() {
                    Data::Enum(v) => *v,
                    _ => unreachable!(),
                };
                if signed {
                    pos.write_sint(v, width as usize, byte_order.resolve())?;
                } else {
                    pos.write_uint(v as u64, width as usize, byte_order.resolve())?;
                }
            }
            DeclKind::Float => {
                let (_, _, byte_order) = self.decl.float_snapshot().unwrap();
                if self.decl.float_total_bits() == Some(32) {
                    let v = match &*self.data.borrow() {
                        Data::F32(v) => *v,
                        _ => unreachable!(),
                    };
                    pos.write_f32(v, byte_order.resolve())?;
                } else {
                    let v = match &*self.data.borrow() {
                        Data::F64(v) => *v,
                        _ => unreachable!(),
                    };
                    pos.write_f64(v, byte_order.resolve())?;
                }
            }
            DeclKind::Str => {
                let s = match &*self.data.borrow() {
                    Data::Str(s) => s.clone(),
                    _ => unreachable!(),
                };
                write_cstring(pos, &s)?;
            }
            DeclKind::Struct => {
                self.with_struct_children(|children| -> Result<(), Error> {
                    for child in children {
                        child.write(pos, scopes)?;
                    }
                    Ok(())
                })
                .unwrap()?;
            }
            DeclKind::StaticArray if self.decl.is_char_array() => {
                let len = self.decl.static_array_length().unwrap_or(0);
                let s = match &*self.data.borrow() {
                    Data::Str(s) => s.clone(),
                    _ => unreachable!(),
                };
                write_fixed_cstring(pos, &s, len)?;
            }
            DeclKind::StaticArray => {
                self.with_struct_children(|children| -> Result<(), Error> {
                    for child in children {
                        child.write(pos, scopes)?;
                    }
                    Ok(())
                })
                .unwrap()?;
            }
            DeclKind::DynArray if self.decl.is_char_array() => {
                let declared_len = self.resolve_length(scopes)? as usize;
                let s = match &*self.data.borrow() {
                    Data::Str(s) => s.clone(),
                    _ => unreachable!(),
                };
                if s.len() != declared_len {
                    return Err(Error::invalid(format!(
                        "'{}' has {} bytes but its length field says {}",
                        self.path,
                        s.len(),
                        declared_len
                    )));
                }
                pos.write_bytes(s.as_bytes())?;
            }
            DeclKind::DynArray => {
                let declared_len = self.resolve_length(scopes)? as usize;
                let actual_len = match &*self.data.borrow() {
                    Data::DynArray(children) => children.len(),
                    _ => unreachable!(),
                };
                if actual_len != declared_len {
                    return Err(Error::invalid(format!(
                        "'{}' has {actual_len} elements but its length field says {declared_len}",
                        self.path
                    )));
                }
                self.with_struct_children(|children| -> Result<(), Error> {
                    for child in children {
                        child.write(pos, scopes)?;
                    }
                    Ok(())
                })
                .unwrap()?;
            }
            DeclKind::Variant => {
                let (_, idx) = self.current_option(scopes)?;
                match &*self.data.borrow() {
                    Data::Variant { options, selected } => {
                        if *selected != Some(idx) {
                            return Err(Error::invalid(format!(
                                "'{}' was populated for a different option than its selector now resolves to",
                                self.path
                            )));
                        }
                        options[idx].write(pos, scopes)?;
                    }
                    _ => unreachable!(),
                }
            }
        }
        Ok(())
    }
}

fn read_cstring(pos: &mut StreamPos) -> Result<String, Error> {
    let mut bytes = Vec::new();
    loop {
        let b = pos.read_uint(8, crate::bitpos::Endianness::Little)? as u8;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(bytes_to_cstring(&bytes))
}

fn write_cstring(pos: &mut StreamPos, s: &str) -> Result<(), Error> {
    for b in s.as_bytes() {
        pos.write_uint(*b as u64, 8, crate::bitpos::Endianness::Little)?;
    }
    pos.write_uint(0, 8, crate::bitpos::Endianness::Little)?;
    Ok(())
}

fn write_fixed_cstring(pos: &mut StreamPos, s: &str, len: usize) -> Result<(), Error> {
    if s.len() >= len {
        return Err(Error::invalid(format!(
            "string of {} bytes does not fit in a {len}-byte character array (needs a NUL terminator)",
            s.len()
        )));
    }
    let mut buf = vec![0u8; len];
    buf[..s.len()].copy_from_slice(s.as_bytes());
    pos.write_bytes(&buf)
}

fn bytes_to_cstring(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitpos::Endianness;
    use crate::decl::{ByteOrder, CanonicalScopes, Declaration, Encoding, PreferredDisplayBase, ScopeKind};

    fn u8_decl() -> Declaration {
        Declaration::new_uint(8, ByteOrder::Little, PreferredDisplayBase::Decimal, 8).unwrap()
    }

    fn u32_decl() -> Declaration {
        Declaration::new_uint(32, ByteOrder::Little, PreferredDisplayBase::Decimal, 32).unwrap()
    }

    #[test]
    fn dynamic_array_roundtrip() {
        let root = Declaration::new_struct();
        root.append_member("len", u8_decl()).unwrap();
        root.append_member("data", Declaration::new_dyn_array(u8_decl(), "len")).unwrap();
        let scopes_decl = CanonicalScopes {
            event_payload: Some(root.clone()),
            ..Default::default()
        };
        root.resolve(ScopeKind::EventPayload, &scopes_decl).unwrap();
        root.freeze();

        let def = Definition::create_from(&root, "payload", 0, "");
        def.with_member("len", |len| len.set_uint(3)).unwrap().unwrap();
        def.with_member("data", |data| {
            data.push_element(0x10u8).unwrap();
            data.push_element(0x20u8).unwrap();
            data.push_element(0x30u8).unwrap();
        })
        .unwrap();

        let mut pos = crate::bitpos::StreamPos::for_write(4096);
        let scopes = ScopeSet {
            event_payload: Some(&def),
            ..Default::default()
        };
        def.write(&mut pos, &scopes).unwrap();

        let bytes = pos.into_buffer();
        let mut read_pos = crate::bitpos::StreamPos::for_read(bytes, 32);
        let read_def = Definition::create_from(&root, "payload", 0, "");
        let read_scopes = ScopeSet {
            event_payload: Some(&read_def),
            ..Default::default()
        };
        read_def.read(&mut read_pos, &read_scopes).unwrap();

        match read_def.as_value() {
            Value::Struct(members) => {
                assert_eq!(members[0].1.as_unsigned(), Some(3));
                let data = members[1].1.as_array().unwrap();
                assert_eq!(data.len(), 3);
                assert_eq!(data[0].as_unsigned(), Some(0x10));
                assert_eq!(data[2].as_unsigned(), Some(0x30));
            }
            _ => panic!("expected a struct"),
        }
    }

    #[test]
    fn dynamic_array_length_mismatch_is_invalid_argument() {
        let root = Declaration::new_struct();
        root.append_member("len", u8_decl()).unwrap();
        root.append_member("data", Declaration::new_dyn_array(u8_decl(), "len")).unwrap();
        let scopes_decl = CanonicalScopes {
            event_payload: Some(root.clone()),
            ..Default::default()
        };
        root.resolve(ScopeKind::EventPayload, &scopes_decl).unwrap();

        let def = Definition::create_from(&root, "payload", 0, "");
        def.with_member("len", |len| len.set_uint(3)).unwrap().unwrap();
        def.with_member("data", |data| {
            data.push_element(0x10u8).unwrap();
            data.push_element(0x20u8).unwrap();
        })
        .unwrap();

        let mut pos = crate::bitpos::StreamPos::for_write(4096);
        let scopes = ScopeSet {
            event_payload: Some(&def),
            ..Default::default()
        };
        assert!(def.write(&mut pos, &scopes).is_err());
    }

    #[test]
    fn variant_selected_by_enum_roundtrip() {
        let sel = Declaration::new_enum_unsigned(u8_decl(), 8).unwrap();
        sel.map_range("A", 0, 0).unwrap();
        sel.map_range("B", 1, 1).unwrap();

        let root = Declaration::new_struct();
        root.append_member("tag", sel).unwrap();
        let variant = Declaration::new_variant(Some("tag"));
        variant.append_option("A", u32_decl()).unwrap();
        variant.append_option("B", Declaration::new_string(Encoding::Utf8)).unwrap();
        root.append_member("v", variant).unwrap();

        let scopes_decl = CanonicalScopes {
            event_payload: Some(root.clone()),
            ..Default::default()
        };
        root.resolve(ScopeKind::EventPayload, &scopes_decl).unwrap();
        root.freeze();

        // event 1: A / 42
        let def_a = Definition::create_from(&root, "payload", 0, "");
        def_a.with_member("tag", |t| t.set_enum_label("A")).unwrap().unwrap();
        def_a.with_member("v", |v| {
            v.select_variant("A").unwrap();
            match &*v.data.borrow() {
                Data::Variant { options, .. } => options[0].set_uint(42).unwrap(),
                _ => unreachable!(),
            }
        })
        .unwrap();

        let mut pos = crate::bitpos::StreamPos::for_write(4096);
        let scopes = ScopeSet {
            event_payload: Some(&def_a),
            ..Default::default()
        };
        def_a.write(&mut pos, &scopes).unwrap();
        let bit_len = pos.offset_bits();
        let bytes = pos.into_buffer();

        let mut read_pos = crate::bitpos::StreamPos::for_read(bytes, bit_len);
        let read_def = Definition::create_from(&root, "payload", 0, "");
        let read_scopes = ScopeSet {
            event_payload: Some(&read_def),
            ..Default::default()
        };
        read_def.read(&mut read_pos, &read_scopes).unwrap();

        match read_def.as_value() {
            Value::Struct(members) => {
                assert_eq!(members[0].1.enum_label().unwrap().as_str(), "A");
                match &members[1].1 {
                    Value::Variant(label, v) => {
                        assert_eq!(label.as_str(), "A");
                        assert_eq!(v.as_unsigned(), Some(42));
                    }
                    _ => panic!("expected a variant value"),
                }
            }
            _ => panic!("expected a struct"),
        }
    }

    #[test]
    fn char_array_round_trips_as_a_string() {
        let elem = Declaration::new_uint(8, ByteOrder::Little, PreferredDisplayBase::Decimal, 8).unwrap();
        elem.set_encoding(Encoding::Utf8).unwrap();
        let arr = Declaration::new_static_array(elem, 8);
        let def = Definition::create_from(&arr, "name", 0, "");
        def.set_str("hi").unwrap();

        let mut pos = crate::bitpos::StreamPos::for_write(4096);
        let scopes = ScopeSet::default();
        def.write(&mut pos, &scopes).unwrap();

        let mut read_pos = crate::bitpos::StreamPos::for_read(pos.into_buffer(), 64);
        let read_def = Definition::create_from(&arr, "name", 0, "");
        read_def.read(&mut read_pos, &scopes).unwrap();
        assert_eq!(read_def.as_value(), Value::String("hi".to_owned()));
    }

    #[test]
    fn endianness_roundtrip_through_definition() {
        let d = Declaration::new_uint(16, ByteOrder::Big, PreferredDisplayBase::Hexadecimal, 16).unwrap();
        let def = Definition::create_from(&d, "x", 0, "");
        def.set_uint(0x1234).unwrap();

        let mut pos = crate::bitpos::StreamPos::for_write(16);
        def.write(&mut pos, &ScopeSet::default()).unwrap();
        assert_eq!(pos.buffer(), &[0x12, 0x34]);

        let mut read_pos = crate::bitpos::StreamPos::for_read(pos.into_buffer(), 16);
        let read_def = Definition::create_from(&d, "x", 0, "");
        read_def.read(&mut read_pos, &ScopeSet::default()).unwrap();
        assert_eq!(read_def.as_value().as_unsigned(), Some(0x1234));
        let _ = Endianness::Big;
    }
}
