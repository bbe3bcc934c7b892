//! The declaration tree: an immutable, shared, composable schema DAG.
//!
//! A [`Declaration`] is cheap to clone (an `Arc` bump) and is mutated only
//! through its builder methods, which fail with [`Error::Frozen`] once the
//! node has produced any [`crate::def::Definition`] instance. Generalizes a
//! flat, byte-aligned field-type surface to the fully nested, bit-packed
//! schema this crate's definitions are read against.

use crate::error::Error;
use internment::Intern;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use crate::value::PreferredDisplayBase;

/// Byte order of an integer or float declaration. `Native` and `Network`
/// are resolved to [`crate::bitpos::Endianness`] at attachment time, same as
/// the source's `native`/`network` byte orders resolve against the host.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ByteOrder {
    Little,
    Big,
    Native,
    Network,
}

impl ByteOrder {
    pub fn resolve(self) -> crate::bitpos::Endianness {
        use crate::bitpos::Endianness;
        match self {
            ByteOrder::Little => Endianness::Little,
            ByteOrder::Big | ByteOrder::Network => Endianness::Big,
            ByteOrder::Native => Endianness::NATIVE,
        }
    }
}

/// Preferred character encoding for an integer (when used as a character)
/// or a string declaration.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum Encoding {
    #[default]
    None,
    Ascii,
    Utf8,
}

/// Which of the five canonical scopes a resolved field path points into.
/// Order matters: it is the search order `resolve` falls back through when
/// a name isn't found among a node's own ancestors.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ScopeKind {
    TraceHeader,
    PacketContext,
    EventHeader,
    EventContext,
    EventPayload,
}

pub const CANONICAL_SCOPE_ORDER: [ScopeKind; 5] = [
    ScopeKind::TraceHeader,
    ScopeKind::PacketContext,
    ScopeKind::EventHeader,
    ScopeKind::EventContext,
    ScopeKind::EventPayload,
];

/// A resolved sibling reference: which scope it lives in, and the member
/// index chain from that scope's root structure down to the field. Lets
/// [`crate::def`] walk straight to the target in O(depth) instead of
/// re-resolving the name on every read.
#[derive(Clone, Debug)]
pub struct FieldPath {
    pub scope: ScopeKind,
    pub indices: Vec<usize>,
}

/// The five top-level declaration trees a field reference can resolve
/// against, in canonical search order. Built once per trace/stream/event
/// class attachment and threaded through `resolve`.
#[derive(Clone, Default)]
pub struct CanonicalScopes {
    pub trace_header: Option<Declaration>,
    pub packet_context: Option<Declaration>,
    pub event_header: Option<Declaration>,
    pub event_context: Option<Declaration>,
    pub event_payload: Option<Declaration>,
}

impl CanonicalScopes {
    fn get(&self, kind: ScopeKind) -> Option<&Declaration> {
        match kind {
            ScopeKind::TraceHeader => self.trace_header.as_ref(),
            ScopeKind::PacketContext => self.packet_context.as_ref(),
            ScopeKind::EventHeader => self.event_header.as_ref(),
            ScopeKind::EventContext => self.event_context.as_ref(),
            ScopeKind::EventPayload => self.event_payload.as_ref(),
        }
    }
}

#[derive(Clone)]
struct IntegerDecl {
    width: u32,
    byte_order: ByteOrder,
    base: PreferredDisplayBase,
    encoding: Encoding,
    mapped_clock: Option<Intern<String>>,
}

#[derive(Clone)]
struct FloatDecl {
    exp_bits: u32,
    mant_bits: u32,
    byte_order: ByteOrder,
}

#[derive(Clone)]
struct EnumDecl {
    container: Declaration,
    signed: bool,
    /// Ordered `{label -> [lo, hi]}` mappings, in insertion order (first
    /// match wins when ranges overlap; see `labels_for_value`).
    mappings: Vec<(Intern<String>, i64, i64)>,
}

#[derive(Clone, Default)]
struct StringDecl {
    encoding: Encoding,
}

#[derive(Clone, Default)]
struct StructDecl {
    members: Vec<(Intern<String>, Declaration)>,
}

#[derive(Clone)]
struct VariantDecl {
    selector_name: Option<Intern<String>>,
    selector_decl: Option<Declaration>,
    options: Vec<(Intern<String>, Declaration)>,
    resolved_path: Option<FieldPath>,
}

#[derive(Clone)]
struct StaticArrayDecl {
    element: Declaration,
    length: usize,
}

#[derive(Clone)]
struct DynArrayDecl {
    element: Declaration,
    length_field_name: Intern<String>,
    resolved_path: Option<FieldPath>,
}

#[derive(Clone)]
enum Kind {
    UInt(IntegerDecl),
    SInt(IntegerDecl),
    Float(FloatDecl),
    Enum(EnumDecl),
    Str(StringDecl),
    Struct(StructDecl),
    Variant(VariantDecl),
    StaticArray(StaticArrayDecl),
    DynArray(DynArrayDecl),
}

impl Kind {
    fn type_name(&self) -> &'static str {
        match self {
            Kind::UInt(_) => "unsigned-integer",
            Kind::SInt(_) => "signed-integer",
            Kind::Float(_) => "float",
            Kind::Enum(_) => "enum",
            Kind::Str(_) => "string",
            Kind::Struct(_) => "structure",
            Kind::Variant(_) => "variant",
            Kind::StaticArray(_) => "static-array",
            Kind::DynArray(_) => "dynamic-array",
        }
    }

    fn discriminant(&self) -> DeclKind {
        match self {
            Kind::UInt(_) => DeclKind::UInt,
            Kind::SInt(_) => DeclKind::SInt,
            Kind::Float(_) => DeclKind::Float,
            Kind::Enum(_) => DeclKind::Enum,
            Kind::Str(_) => DeclKind::Str,
            Kind::Struct(_) => DeclKind::Struct,
            Kind::Variant(_) => DeclKind::Variant,
            Kind::StaticArray(_) => DeclKind::StaticArray,
            Kind::DynArray(_) => DeclKind::DynArray,
        }
    }
}

/// Fieldless mirror of the internal `Kind` tag, for callers (`def`, `io`,
/// `metadata`) that need to dispatch on a declaration's kind.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum DeclKind {
    UInt,
    SInt,
    Float,
    Enum,
    Str,
    Struct,
    Variant,
    StaticArray,
    DynArray,
}

struct DeclInner {
    alignment_bits: AtomicUsize,
    frozen: AtomicBool,
    kind: Mutex<Kind>,
}

/// A node in the schema DAG. Clones share the same underlying node (an
/// `Arc` bump), matching the source's reference-counted declarations.
#[derive(Clone)]
pub struct Declaration(Arc<DeclInner>);

impl PartialEq for Declaration {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Declaration {}

impl Declaration {
    fn new(kind: Kind, alignment_bits: usize) -> Self {
        Declaration(Arc::new(DeclInner {
            alignment_bits: AtomicUsize::new(alignment_bits.max(1)),
            frozen: AtomicBool::new(false),
            kind: Mutex::new(kind),
        }))
    }

    pub fn alignment_bits(&self) -> usize {
        self.0.alignment_bits.load(Ordering::Acquire)
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.load(Ordering::Acquire)
    }

    fn check_mutable(&self) -> Result<(), Error> {
        if self.is_frozen() {
            Err(Error::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.0.kind.lock().unwrap().type_name()
    }

    pub fn kind(&self) -> DeclKind {
        self.0.kind.lock().unwrap().discriminant()
    }

    /// Idempotent, recursive: freezes this node and every declaration it
    /// owns. Called when a declaration is attached to a stream or event
    /// class, per the source's attachment-time freeze.
    pub fn freeze(&self) {
        if self.0.frozen.swap(true, Ordering::AcqRel) {
            return;
        }
        match &*self.0.kind.lock().unwrap() {
            Kind::Enum(e) => e.container.freeze(),
            Kind::Struct(s) => {
                for (_, m) in &s.members {
                    m.freeze();
                }
            }
            Kind::Variant(v) => {
                if let Some(s) = &v.selector_decl {
                    s.freeze();
                }
                for (_, o) in &v.options {
                    o.freeze();
                }
            }
            Kind::StaticArray(a) => a.element.freeze(),
            Kind::DynArray(a) => a.element.freeze(),
            Kind::UInt(_) | Kind::SInt(_) | Kind::Float(_) | Kind::Str(_) => {}
        }
    }

    // -- integer -----------------------------------------------------

    pub fn new_uint(width: u32, byte_order: ByteOrder, base: PreferredDisplayBase, alignment_bits: usize) -> Result<Self, Error> {
        Self::new_integer(width, byte_order, base, alignment_bits, false)
    }

    pub fn new_sint(width: u32, byte_order: ByteOrder, base: PreferredDisplayBase, alignment_bits: usize) -> Result<Self, Error> {
        Self::new_integer(width, byte_order, base, alignment_bits, true)
    }

    fn new_integer(
        width: u32,
        byte_order: ByteOrder,
        base: PreferredDisplayBase,
        alignment_bits: usize,
        signed: bool,
    ) -> Result<Self, Error> {
        if !(1..=64).contains(&width) {
            return Err(Error::invalid(format!("integer width {width} out of range 1..=64")));
        }
        let data = IntegerDecl {
            width,
            byte_order,
            base,
            encoding: Encoding::None,
            mapped_clock: None,
        };
        let kind = if signed { Kind::SInt(data) } else { Kind::UInt(data) };
        Ok(Self::new(kind, alignment_bits))
    }

    pub fn set_encoding(&self, encoding: Encoding) -> Result<(), Error> {
        self.check_mutable()?;
        match &mut *self.0.kind.lock().unwrap() {
            Kind::UInt(i) | Kind::SInt(i) => {
                i.encoding = encoding;
                Ok(())
            }
            Kind::Str(s) => {
                s.encoding = encoding;
                Ok(())
            }
            k => Err(Error::invalid(format!("set_encoding on a {}", k.type_name()))),
        }
    }

    pub fn set_mapped_clock(&self, clock: Intern<String>) -> Result<(), Error> {
        self.check_mutable()?;
        match &mut *self.0.kind.lock().unwrap() {
            Kind::UInt(i) | Kind::SInt(i) => {
                i.mapped_clock = Some(clock);
                Ok(())
            }
            k => Err(Error::invalid(format!("set_mapped_clock on a {}", k.type_name()))),
        }
    }

    pub fn integer_width(&self) -> Option<u32> {
        match &*self.0.kind.lock().unwrap() {
            Kind::UInt(i) | Kind::SInt(i) => Some(i.width),
            _ => None,
        }
    }

    pub fn is_signed_integer(&self) -> bool {
        matches!(&*self.0.kind.lock().unwrap(), Kind::SInt(_))
    }

    pub fn is_unsigned_integer(&self) -> bool {
        matches!(&*self.0.kind.lock().unwrap(), Kind::UInt(_))
    }

    pub(crate) fn integer_snapshot(&self) -> Option<(u32, ByteOrder, bool)> {
        match &*self.0.kind.lock().unwrap() {
            Kind::UInt(i) => Some((i.width, i.byte_order, false)),
            Kind::SInt(i) => Some((i.width, i.byte_order, true)),
            _ => None,
        }
    }

    pub(crate) fn integer_base(&self) -> Option<PreferredDisplayBase> {
        match &*self.0.kind.lock().unwrap() {
            Kind::UInt(i) | Kind::SInt(i) => Some(i.base),
            _ => None,
        }
    }

    pub(crate) fn integer_encoding(&self) -> Option<Encoding> {
        match &*self.0.kind.lock().unwrap() {
            Kind::UInt(i) | Kind::SInt(i) => Some(i.encoding),
            _ => None,
        }
    }

    pub(crate) fn mapped_clock(&self) -> Option<Intern<String>> {
        match &*self.0.kind.lock().unwrap() {
            Kind::UInt(i) | Kind::SInt(i) => i.mapped_clock,
            _ => None,
        }
    }

    // -- float ---------------------------------------------------------

    pub fn new_float(mantissa_digits: u32, exponent_digits: u32, byte_order: ByteOrder, alignment_bits: usize) -> Result<Self, Error> {
        let total = mantissa_digits + exponent_digits;
        if total != 32 && total != 64 {
            return Err(Error::unsupported(format!(
                "float width {total} (mantissa {mantissa_digits} + exponent {exponent_digits}); only 32 and 64 are supported"
            )));
        }
        Ok(Self::new(
            Kind::Float(FloatDecl {
                exp_bits: exponent_digits,
                mant_bits: mantissa_digits,
                byte_order,
            }),
            alignment_bits,
        ))
    }

    pub(crate) fn float_snapshot(&self) -> Option<(u32, u32, ByteOrder)> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Float(f) => Some((f.exp_bits, f.mant_bits, f.byte_order)),
            _ => None,
        }
    }

    pub fn float_total_bits(&self) -> Option<u32> {
        self.float_snapshot().map(|(exp, mant, _)| 1 + exp + mant)
    }

    // -- enum ------------------------------------------------------------

    pub fn new_enum_unsigned(container: Declaration, alignment_bits: usize) -> Result<Self, Error> {
        Self::new_enum(container, false, alignment_bits)
    }

    pub fn new_enum_signed(container: Declaration, alignment_bits: usize) -> Result<Self, Error> {
        Self::new_enum(container, true, alignment_bits)
    }

    fn new_enum(container: Declaration, signed: bool, alignment_bits: usize) -> Result<Self, Error> {
        let ok = if signed {
            container.is_signed_integer()
        } else {
            container.is_unsigned_integer()
        };
        if !ok {
            return Err(Error::invalid("enum container must be an integer of matching signedness"));
        }
        Ok(Self::new(
            Kind::Enum(EnumDecl {
                container,
                signed,
                mappings: Vec::new(),
            }),
            alignment_bits,
        ))
    }

    pub fn map_range(&self, label: impl Into<String>, lo: i64, hi: i64) -> Result<(), Error> {
        self.check_mutable()?;
        if lo > hi {
            return Err(Error::invalid(format!("enum range [{lo}, {hi}] has lo > hi")));
        }
        match &mut *self.0.kind.lock().unwrap() {
            Kind::Enum(e) => {
                e.mappings.push((Intern::new(label.into()), lo, hi));
                Ok(())
            }
            k => Err(Error::invalid(format!("map_range on a {}", k.type_name()))),
        }
    }

    /// Labels whose mapped range contains `v`, in declaration order.
    /// Overlapping ranges are permitted (see source); callers that need a
    /// single label should take `.first()`, matching `value_for_label`'s
    /// first-match policy.
    pub fn labels_for_value(&self, v: i64) -> Vec<Intern<String>> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Enum(e) => e
                .mappings
                .iter()
                .filter(|(_, lo, hi)| v >= *lo && v <= *hi)
                .map(|(label, _, _)| *label)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn value_for_label(&self, label: &str) -> Option<(i64, i64)> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Enum(e) => e
                .mappings
                .iter()
                .find(|(l, _, _)| l.as_str() == label)
                .map(|(_, lo, hi)| (*lo, *hi)),
            _ => None,
        }
    }

    /// All labels of an enum or variant declaration, in declaration order.
    pub fn label_set(&self) -> Vec<Intern<String>> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Enum(e) => e.mappings.iter().map(|(l, _, _)| *l).collect(),
            Kind::Variant(v) => v.options.iter().map(|(l, _)| *l).collect(),
            _ => Vec::new(),
        }
    }

    /// Warns (returns `Err`) if any two mapped ranges overlap. Not called
    /// automatically; the writer calls it during attachment validation
    /// because overlapping ranges are permitted, only flagged.
    pub fn validate_enum_ranges(&self) -> Result<(), String> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Enum(e) => {
                for i in 0..e.mappings.len() {
                    for j in (i + 1)..e.mappings.len() {
                        let (la, loa, hia) = &e.mappings[i];
                        let (lb, lob, hib) = &e.mappings[j];
                        if *loa <= *hib && *lob <= *hia {
                            return Err(format!("enum ranges for '{la}' and '{lb}' overlap"));
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn enum_container(&self) -> Option<Declaration> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Enum(e) => Some(e.container.clone()),
            _ => None,
        }
    }

    // -- string ------------------------------------------------------------

    pub fn new_string(encoding: Encoding) -> Self {
        Self::new(Kind::Str(StringDecl { encoding }), 8)
    }

    pub fn string_encoding(&self) -> Option<Encoding> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Str(s) => Some(s.encoding),
            _ => None,
        }
    }

    // -- structure ------------------------------------------------------------

    pub fn new_struct() -> Self {
        Self::new(Kind::Struct(StructDecl::default()), 1)
    }

    pub fn append_member(&self, name: impl Into<String>, decl: Declaration) -> Result<(), Error> {
        self.check_mutable()?;
        let name = Intern::new(name.into());
        let member_alignment = decl.alignment_bits();
        match &mut *self.0.kind.lock().unwrap() {
            Kind::Struct(s) => {
                if s.members.iter().any(|(n, _)| *n == name) {
                    return Err(Error::invalid(format!("duplicate member '{name}'")));
                }
                s.members.push((name, decl));
                drop(s);
                self.grow_alignment(member_alignment);
                Ok(())
            }
            k => Err(Error::invalid(format!("append_member on a {}", k.type_name()))),
        }
    }

    fn grow_alignment(&self, at_least: usize) {
        self.0.alignment_bits.fetch_max(at_least.max(1), Ordering::AcqRel);
    }

    pub fn members(&self) -> Option<Vec<(Intern<String>, Declaration)>> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Struct(s) => Some(s.members.clone()),
            _ => None,
        }
    }

    pub fn member(&self, name: &str) -> Option<Declaration> {
        self.members()?.into_iter().find(|(n, _)| n.as_str() == name).map(|(_, d)| d)
    }

    // -- variant ------------------------------------------------------------

    pub fn new_variant(selector_name: Option<impl Into<String>>) -> Self {
        Self::new(
            Kind::Variant(VariantDecl {
                selector_name: selector_name.map(|s| Intern::new(s.into())),
                selector_decl: None,
                options: Vec::new(),
                resolved_path: None,
            }),
            1,
        )
    }

    pub fn set_selector_decl(&self, enum_decl: Declaration) -> Result<(), Error> {
        self.check_mutable()?;
        if enum_decl.label_set().is_empty() && !matches!(&*enum_decl.0.kind.lock().unwrap(), Kind::Enum(_)) {
            return Err(Error::invalid("variant selector must be an enum declaration"));
        }
        match &mut *self.0.kind.lock().unwrap() {
            Kind::Variant(v) => {
                v.selector_decl = Some(enum_decl);
                Ok(())
            }
            k => Err(Error::invalid(format!("set_selector_decl on a {}", k.type_name()))),
        }
    }

    pub fn append_option(&self, label: impl Into<String>, decl: Declaration) -> Result<(), Error> {
        self.check_mutable()?;
        let label = Intern::new(label.into());
        match &mut *self.0.kind.lock().unwrap() {
            Kind::Variant(v) => {
                if v.options.iter().any(|(l, _)| *l == label) {
                    return Err(Error::invalid(format!("duplicate option '{label}'")));
                }
                v.options.push((label, decl));
                Ok(())
            }
            k => Err(Error::invalid(format!("append_option on a {}", k.type_name()))),
        }
    }

    pub fn options(&self) -> Option<Vec<(Intern<String>, Declaration)>> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Variant(v) => Some(v.options.clone()),
            _ => None,
        }
    }

    pub fn option(&self, label: &str) -> Option<Declaration> {
        self.options()?.into_iter().find(|(l, _)| l.as_str() == label).map(|(_, d)| d)
    }

    pub(crate) fn variant_selector_name(&self) -> Option<Intern<String>> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Variant(v) => v.selector_name,
            _ => None,
        }
    }

    pub(crate) fn variant_resolved_path(&self) -> Option<FieldPath> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Variant(v) => v.resolved_path.clone(),
            _ => None,
        }
    }

    pub(crate) fn variant_selector_decl(&self) -> Option<Declaration> {
        match &*self.0.kind.lock().unwrap() {
            Kind::Variant(v) => v.selector_decl.clone(),
            _ => None,
        }
    }

    // -- arrays ------------------------------------------------------------

    pub fn new_static_array(element: Declaration, length: usize) -> Self {
        let alignment = element.alignment_bits();
        Self::new(Kind::StaticArray(StaticArrayDecl { element, length }), alignment)
    }

    pub fn new_dyn_array(element: Declaration, length_field_name: impl Into<String>) -> Self {
        let alignment = element.alignment_bits();
        Self::new(
            Kind::DynArray(DynArrayDecl {
                element,
                length_field_name: Intern::new(length_field_name.into()),
                resolved_path: None,
            }),
            alignment,
        )
    }

    pub fn element(&self) -> Option<Declaration> {
        match &*self.0.kind.lock().unwrap() {
            Kind::StaticArray(a) => Some(a.element.clone()),
            Kind::DynArray(a) => Some(a.element.clone()),
            _ => None,
        }
    }

    pub fn static_array_length(&self) -> Option<usize> {
        match &*self.0.kind.lock().unwrap() {
            Kind::StaticArray(a) => Some(a.length),
            _ => None,
        }
    }

    pub(crate) fn dyn_array_length_field_name(&self) -> Option<Intern<String>> {
        match &*self.0.kind.lock().unwrap() {
            Kind::DynArray(a) => Some(a.length_field_name),
            _ => None,
        }
    }

    pub(crate) fn dyn_array_resolved_path(&self) -> Option<FieldPath> {
        match &*self.0.kind.lock().unwrap() {
            Kind::DynArray(a) => a.resolved_path.clone(),
            _ => None,
        }
    }

    /// A character array: a static array of 8-bit, 8-bit-aligned integers.
    /// Read/written as a byte range rather than a per-element vector.
    pub fn is_char_array(&self) -> bool {
        match self.element() {
            Some(e) => matches!(e.integer_snapshot(), Some((8, _, _))) && e.alignment_bits() == 8,
            None => false,
        }
    }

    // -- resolution ------------------------------------------------------------

    /// Recursively resolves every dynamic-array length and variant selector
    /// reachable from `self`, which is the root of scope `own_scope` within
    /// `scopes`. Call once per top-level tree at attachment time.
    pub fn resolve(&self, own_scope: ScopeKind, scopes: &CanonicalScopes) -> Result<(), Error> {
        let mut frames: Vec<(Vec<usize>, Declaration)> = Vec::new();
        self.resolve_inner(own_scope, scopes, &[], &mut frames)
    }

    /// `path_to_self` is the index chain from the scope root down to `self`
    /// (empty when `self` is the scope root); `frames` is the stack of
    /// enclosing structures, each paired with its own path from the root,
    /// innermost last.
    fn resolve_inner(
        &self,
        own_scope: ScopeKind,
        scopes: &CanonicalScopes,
        path_to_self: &[usize],
        frames: &mut Vec<(Vec<usize>, Declaration)>,
    ) -> Result<(), Error> {
        let kind_snapshot = self.0.kind.lock().unwrap().clone();
        match kind_snapshot {
            Kind::Struct(s) => {
                frames.push((path_to_self.to_vec(), self.clone()));
                for (i, (_, member)) in s.members.iter().enumerate() {
                    let mut member_path = path_to_self.to_vec();
                    member_path.push(i);
                    member.resolve_inner(own_scope, scopes, &member_path, frames)?;
                }
                frames.pop();
                Ok(())
            }
            Kind::StaticArray(a) => a.element.resolve_inner(own_scope, scopes, path_to_self, frames),
            Kind::DynArray(a) => {
                let path = find_sibling(&a.length_field_name, own_scope, scopes, frames)?;
                let target = resolve_path_decl(scopes, &path).ok_or_else(|| {
                    Error::resolution_failed(a.length_field_name.as_str(), "length field vanished during resolution")
                })?;
                if !target.is_unsigned_integer() {
                    return Err(Error::resolution_failed(
                        a.length_field_name.as_str(),
                        "dynamic array length field must be an unsigned integer",
                    ));
                }
                match &mut *self.0.kind.lock().unwrap() {
                    Kind::DynArray(a) => a.resolved_path = Some(path),
                    _ => unreachable!(),
                }
                a.element.resolve_inner(own_scope, scopes, path_to_self, frames)
            }
            Kind::Variant(v) => {
                let selector_decl = if let Some(d) = &v.selector_decl {
                    d.clone()
                } else if let Some(name) = &v.selector_name {
                    let path = find_sibling(name, own_scope, scopes, frames)?;
                    let target = resolve_path_decl(scopes, &path)
                        .ok_or_else(|| Error::resolution_failed(name.as_str(), "selector field vanished during resolution"))?;
                    match &mut *self.0.kind.lock().unwrap() {
                        Kind::Variant(v) => v.resolved_path = Some(path),
                        _ => unreachable!(),
                    }
                    target
                } else {
                    return Err(Error::invalid("variant has no selector name or declaration"));
                };
                if selector_decl.label_set().iter().collect::<std::collections::HashSet<_>>()
                    != v.options.iter().map(|(l, _)| l).collect::<std::collections::HashSet<_>>()
                {
                    return Err(Error::invalid(
                        "variant option labels must equal the selector enum's label set exactly",
                    ));
                }
                match &mut *self.0.kind.lock().unwrap() {
                    Kind::Variant(v) => v.selector_decl = Some(selector_decl),
                    _ => unreachable!(),
                }
                for (_, opt) in &v.options {
                    opt.resolve_inner(own_scope, scopes, path_to_self, frames)?;
                }
                Ok(())
            }
            Kind::Enum(_) | Kind::UInt(_) | Kind::SInt(_) | Kind::Float(_) | Kind::Str(_) => Ok(()),
        }
    }
}

fn find_sibling(
    name: &Intern<String>,
    own_scope: ScopeKind,
    scopes: &CanonicalScopes,
    frames: &[(Vec<usize>, Declaration)],
) -> Result<FieldPath, Error> {
    for (prefix, frame) in frames.iter().rev() {
        if let Some(members) = frame.members() {
            if let Some(idx) = members.iter().position(|(n, _)| n == name) {
                let mut indices = prefix.clone();
                indices.push(idx);
                return Ok(FieldPath {
                    scope: own_scope,
                    indices,
                });
            }
        }
    }
    for kind in CANONICAL_SCOPE_ORDER {
        if kind == own_scope {
            continue;
        }
        if let Some(root) = scopes.get(kind) {
            if let Some(indices) = find_in_scope(root, name) {
                return Ok(FieldPath { scope: kind, indices });
            }
        }
    }
    Err(Error::resolution_failed(name.as_str(), "no enclosing structure declares this field"))
}

fn find_in_scope(root: &Declaration, name: &Intern<String>) -> Option<Vec<usize>> {
    let members = root.members()?;
    for (i, (n, decl)) in members.iter().enumerate() {
        if n == name {
            return Some(vec![i]);
        }
        if let Some(mut rest) = find_in_scope(decl, name) {
            let mut path = vec![i];
            path.append(&mut rest);
            return Some(path);
        }
    }
    None
}

fn resolve_path_decl(scopes: &CanonicalScopes, path: &FieldPath) -> Option<Declaration> {
    let mut cur = scopes.get(path.scope)?.clone();
    for &idx in &path.indices {
        cur = cur.members()?.into_iter().nth(idx)?.1;
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u8_decl() -> Declaration {
        Declaration::new_uint(8, ByteOrder::Little, PreferredDisplayBase::Decimal, 8).unwrap()
    }

    #[test]
    fn struct_alignment_follows_widest_member() {
        let s = Declaration::new_struct();
        s.append_member("a", Declaration::new_uint(8, ByteOrder::Little, PreferredDisplayBase::Decimal, 8).unwrap())
            .unwrap();
        assert_eq!(s.alignment_bits(), 8);
        s.append_member(
            "b",
            Declaration::new_uint(32, ByteOrder::Little, PreferredDisplayBase::Decimal, 32).unwrap(),
        )
        .unwrap();
        assert_eq!(s.alignment_bits(), 32);
    }

    #[test]
    fn append_member_rejects_duplicate_name() {
        let s = Declaration::new_struct();
        s.append_member("a", u8_decl()).unwrap();
        assert!(s.append_member("a", u8_decl()).is_err());
    }

    #[test]
    fn frozen_rejects_further_mutation() {
        let s = Declaration::new_struct();
        s.append_member("a", u8_decl()).unwrap();
        s.freeze();
        assert!(s.is_frozen());
        assert!(s.append_member("b", u8_decl()).is_err());
    }

    #[test]
    fn freeze_is_recursive() {
        let inner = Declaration::new_struct();
        inner.append_member("x", u8_decl()).unwrap();
        let outer = Declaration::new_struct();
        outer.append_member("inner", inner.clone()).unwrap();
        outer.freeze();
        assert!(inner.is_frozen());
    }

    #[test]
    fn enum_labels_for_value_first_match_on_overlap() {
        let e = Declaration::new_enum_unsigned(u8_decl(), 8).unwrap();
        e.map_range("a", 0, 10).unwrap();
        e.map_range("b", 5, 15).unwrap();
        let labels = e.labels_for_value(7);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].as_str(), "a");
        assert!(e.validate_enum_ranges().is_err());
    }

    #[test]
    fn dyn_array_resolves_sibling_length() {
        let root = Declaration::new_struct();
        root.append_member("len", u8_decl()).unwrap();
        let arr = Declaration::new_dyn_array(u8_decl(), "len");
        root.append_member("data", arr).unwrap();

        let scopes = CanonicalScopes {
            event_payload: Some(root.clone()),
            ..Default::default()
        };
        root.resolve(ScopeKind::EventPayload, &scopes).unwrap();

        let data = root.member("data").unwrap();
        let path = data.dyn_array_resolved_path().unwrap();
        assert_eq!(path.indices, vec![0]);
    }

    #[test]
    fn dyn_array_rejects_non_integer_length_field() {
        let root = Declaration::new_struct();
        root.append_member("len", Declaration::new_string(Encoding::Utf8)).unwrap();
        let arr = Declaration::new_dyn_array(u8_decl(), "len");
        root.append_member("data", arr).unwrap();

        let scopes = CanonicalScopes {
            event_payload: Some(root.clone()),
            ..Default::default()
        };
        assert!(root.resolve(ScopeKind::EventPayload, &scopes).is_err());
    }

    #[test]
    fn variant_requires_exact_label_match() {
        let sel = Declaration::new_enum_unsigned(u8_decl(), 8).unwrap();
        sel.map_range("a", 0, 0).unwrap();
        sel.map_range("b", 1, 1).unwrap();

        let root = Declaration::new_struct();
        root.append_member("tag", sel).unwrap();
        let variant = Declaration::new_variant(Some("tag"));
        variant.append_option("a", u8_decl()).unwrap();
        root.append_member("v", variant).unwrap();

        let scopes = CanonicalScopes {
            event_payload: Some(root.clone()),
            ..Default::default()
        };
        assert!(root.resolve(ScopeKind::EventPayload, &scopes).is_err());
    }

    #[test]
    fn variant_resolves_when_labels_match() {
        let sel = Declaration::new_enum_unsigned(u8_decl(), 8).unwrap();
        sel.map_range("a", 0, 0).unwrap();
        sel.map_range("b", 1, 1).unwrap();

        let root = Declaration::new_struct();
        root.append_member("tag", sel).unwrap();
        let variant = Declaration::new_variant(Some("tag"));
        variant.append_option("a", Declaration::new_uint(32, ByteOrder::Little, PreferredDisplayBase::Decimal, 32).unwrap())
            .unwrap();
        variant.append_option("b", Declaration::new_string(Encoding::Utf8)).unwrap();
        root.append_member("v", variant).unwrap();

        let scopes = CanonicalScopes {
            event_payload: Some(root.clone()),
            ..Default::default()
        };
        root.resolve(ScopeKind::EventPayload, &scopes).unwrap();
    }

    #[test]
    fn cross_scope_resolution_falls_back_to_earlier_scope() {
        let header = Declaration::new_struct();
        header.append_member("len", u8_decl()).unwrap();

        let payload = Declaration::new_struct();
        payload.append_member("data", Declaration::new_dyn_array(u8_decl(), "len")).unwrap();

        let scopes = CanonicalScopes {
            event_header: Some(header.clone()),
            event_payload: Some(payload.clone()),
            ..Default::default()
        };
        payload.resolve(ScopeKind::EventPayload, &scopes).unwrap();
        let path = payload.member("data").unwrap().dyn_array_resolved_path().unwrap();
        assert_eq!(path.scope as u8, ScopeKind::EventHeader as u8);
    }
}
