//! Packed 32-bit type descriptors.
//!
//! [`TypeInfo`] encodes everything the analyzer and the backend need to
//! know about a value's type in one word: base kind, lane count, matrix
//! column count and qualifiers. Width promotion, equality and
//! implicit-cast distance are all computable from the descriptor alone,
//! which keeps the analyzer free of any out-of-band type tables.
//!
//! Bit layout:
//!
//! ```text
//! [ 0.. 3]  base kind      (TypeKind)
//! [ 4.. 7]  lane count     (1, 2, 3, 4 or 8; matrix rows)
//! [ 8..11]  column count   (0 = scalar/vector, 2..4 = matrix)
//! [12]      ref  (lvalue)
//! [13]      const
//! [14]      read-only layout member
//! [15]      write-only layout member
//! ```

use std::fmt;

/// Base kind of a type. The discriminants are the packed encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum TypeKind {
    Void = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    Double = 4,
    /// String literals only. Has no size and converts to nothing; it
    /// exists so that `float x = "oops";` fails as a cast error rather
    /// than a lex error.
    Str = 5,
}

impl TypeKind {
    fn from_bits(bits: u32) -> TypeKind {
        match bits {
            0 => TypeKind::Void,
            1 => TypeKind::Bool,
            2 => TypeKind::Int,
            3 => TypeKind::Float,
            4 => TypeKind::Double,
            _ => TypeKind::Str,
        }
    }

    /// Element size in bytes as stored in a layout record.
    pub fn elem_size(self) -> u32 {
        match self {
            TypeKind::Double => 8,
            TypeKind::Void | TypeKind::Str => 0,
            _ => 4,
        }
    }

    /// Rank used for numeric widening: int < float < double.
    fn numeric_rank(self) -> Option<u32> {
        match self {
            TypeKind::Int => Some(0),
            TypeKind::Float => Some(1),
            TypeKind::Double => Some(2),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeKind::Void => "void",
            TypeKind::Bool => "bool",
            TypeKind::Int => "int",
            TypeKind::Float => "float",
            TypeKind::Double => "double",
            TypeKind::Str => "str",
        }
    }
}

/// Register width class of a value, as seen by the IR and the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WidthClass {
    B32,
    B64,
    B128,
    B256,
}

impl WidthClass {
    /// Number of 128-bit register parts needed to hold a value of this
    /// width on an SSE-only machine.
    pub fn parts(self) -> u32 {
        match self {
            WidthClass::B256 => 2,
            _ => 1,
        }
    }
}

const KIND_MASK: u32 = 0x000f;
const LANES_SHIFT: u32 = 4;
const LANES_MASK: u32 = 0x00f0;
const COLS_SHIFT: u32 = 8;
const COLS_MASK: u32 = 0x0f00;
const FLAG_REF: u32 = 1 << 12;
const FLAG_CONST: u32 = 1 << 13;
const FLAG_RO: u32 = 1 << 14;
const FLAG_WO: u32 = 1 << 15;

/// Packed 32-bit type descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeInfo(u32);

impl TypeInfo {
    pub const VOID: TypeInfo = TypeInfo(TypeKind::Void as u32);
    pub const BOOL: TypeInfo = TypeInfo(TypeKind::Bool as u32 | 1 << LANES_SHIFT);
    pub const INT: TypeInfo = TypeInfo(TypeKind::Int as u32 | 1 << LANES_SHIFT);
    pub const FLOAT: TypeInfo = TypeInfo(TypeKind::Float as u32 | 1 << LANES_SHIFT);
    pub const DOUBLE: TypeInfo = TypeInfo(TypeKind::Double as u32 | 1 << LANES_SHIFT);
    pub const STR: TypeInfo = TypeInfo(TypeKind::Str as u32);

    pub fn scalar(kind: TypeKind) -> TypeInfo {
        TypeInfo(kind as u32 | 1 << LANES_SHIFT)
    }

    /// A vector type. `lanes` must be 1..=4 or 8; lanes == 1 degrades to
    /// the scalar type.
    pub fn vector(kind: TypeKind, lanes: u32) -> TypeInfo {
        debug_assert!(matches!(lanes, 1..=4 | 8));
        TypeInfo(kind as u32 | lanes << LANES_SHIFT)
    }

    /// A matrix type with `rows` lanes per column and `cols` columns.
    pub fn matrix(kind: TypeKind, rows: u32, cols: u32) -> TypeInfo {
        debug_assert!((2..=4).contains(&rows) && (2..=4).contains(&cols));
        TypeInfo(kind as u32 | rows << LANES_SHIFT | cols << COLS_SHIFT)
    }

    pub fn from_bits(bits: u32) -> TypeInfo {
        TypeInfo(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn kind(self) -> TypeKind {
        TypeKind::from_bits(self.0 & KIND_MASK)
    }

    /// Lane count (matrix row count). Zero for void/str.
    pub fn lanes(self) -> u32 {
        (self.0 & LANES_MASK) >> LANES_SHIFT
    }

    /// Matrix column count; zero for scalars and vectors.
    pub fn cols(self) -> u32 {
        (self.0 & COLS_MASK) >> COLS_SHIFT
    }

    pub fn rows(self) -> u32 {
        self.lanes()
    }

    pub fn is_void(self) -> bool {
        self.kind() == TypeKind::Void
    }

    pub fn is_scalar(self) -> bool {
        self.lanes() == 1 && self.cols() == 0
    }

    pub fn is_vector(self) -> bool {
        self.lanes() > 1 && self.cols() == 0
    }

    pub fn is_matrix(self) -> bool {
        self.cols() != 0
    }

    pub fn is_ref(self) -> bool {
        self.0 & FLAG_REF != 0
    }

    pub fn is_const(self) -> bool {
        self.0 & FLAG_CONST != 0
    }

    pub fn is_read_only(self) -> bool {
        self.0 & FLAG_RO != 0
    }

    pub fn is_write_only(self) -> bool {
        self.0 & FLAG_WO != 0
    }

    pub fn with_ref(self) -> TypeInfo {
        TypeInfo(self.0 | FLAG_REF)
    }

    pub fn with_const(self) -> TypeInfo {
        TypeInfo(self.0 | FLAG_CONST)
    }

    pub fn with_read_only(self) -> TypeInfo {
        TypeInfo(self.0 | FLAG_RO)
    }

    pub fn with_write_only(self) -> TypeInfo {
        TypeInfo(self.0 | FLAG_WO)
    }

    /// The value type: qualifiers stripped.
    pub fn deref(self) -> TypeInfo {
        TypeInfo(self.0 & (KIND_MASK | LANES_MASK | COLS_MASK))
    }

    /// Same base kind and shape, ignoring qualifiers.
    pub fn same_value_type(self, other: TypeInfo) -> bool {
        self.deref() == other.deref()
    }

    /// Replaces the base kind, keeping shape and qualifiers.
    pub fn with_kind(self, kind: TypeKind) -> TypeInfo {
        TypeInfo((self.0 & !KIND_MASK) | kind as u32)
    }

    /// Replaces shape with a scalar of the same kind (no qualifiers).
    pub fn scalar_of(self) -> TypeInfo {
        TypeInfo::scalar(self.kind())
    }

    /// Register width class of one column of this type.
    pub fn width(self) -> WidthClass {
        let bits = self.kind().elem_size() * 8 * self.lanes();
        match bits {
            0..=32 => WidthClass::B32,
            33..=64 => WidthClass::B64,
            65..=128 => WidthClass::B128,
            _ => WidthClass::B256,
        }
    }

    /// Size in bytes of this value in a layout record. Three-lane vectors
    /// are tightly packed (12 or 24 bytes); matrix columns are laid out
    /// consecutively.
    pub fn mem_size(self) -> u32 {
        let col = self.kind().elem_size() * self.lanes();
        if self.is_matrix() {
            col * self.cols()
        } else {
            col
        }
    }

    /// Byte size of one column as stored in memory.
    pub fn col_size(self) -> u32 {
        self.kind().elem_size() * self.lanes()
    }

    /// Cost of implicitly converting `self` into `target`, or `None` when
    /// only an explicit cast (or no cast at all) can do it. Zero means the
    /// value types are identical. Widening costs 1 per numeric rank step;
    /// a scalar-to-vector broadcast costs 1 on top.
    pub fn implicit_cast_cost(self, target: TypeInfo) -> Option<u32> {
        let from = self.deref();
        let to = target.deref();
        if from == to {
            return Some(0);
        }
        // No implicit conversion ever produces or consumes these.
        if from.is_matrix() || to.is_matrix() {
            return None;
        }
        let (fk, tk) = (from.kind(), to.kind());
        let rank_cost = if fk == tk {
            0
        } else {
            let fr = fk.numeric_rank()?;
            let tr = tk.numeric_rank()?;
            if fr > tr {
                return None; // narrowing is explicit-only
            }
            tr - fr
        };
        match (from.lanes(), to.lanes()) {
            (a, b) if a == b => Some(rank_cost),
            (1, b) if b > 1 => Some(rank_cost + 1), // broadcast
            _ => None,
        }
    }

    /// Result kind of a component-wise binary operation over two numeric
    /// kinds (the wider one), or `None` when the kinds cannot combine.
    pub fn promote_kind(a: TypeKind, b: TypeKind) -> Option<TypeKind> {
        if a == b && (a == TypeKind::Bool || a.numeric_rank().is_some()) {
            return Some(a);
        }
        let (ra, rb) = (a.numeric_rank()?, b.numeric_rank()?);
        Some(if ra >= rb { a } else { b })
    }

    /// Whether an explicit constructor cast between the two value types is
    /// defined (same shape, both numeric or bool-from-nothing).
    pub fn explicit_cast_ok(self, target: TypeInfo) -> bool {
        let from = self.deref();
        let to = target.deref();
        if from == to {
            return true;
        }
        if from.is_matrix() || to.is_matrix() {
            return false;
        }
        let numeric =
            |k: TypeKind| k.numeric_rank().is_some();
        if !numeric(from.kind()) || !numeric(to.kind()) {
            return false;
        }
        from.lanes() == to.lanes() || from.lanes() == 1
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.kind().name();
        if self.is_matrix() {
            write!(f, "{}{}x{}", base, self.rows(), self.cols())
        } else if self.is_vector() {
            write!(f, "{}{}", base, self.lanes())
        } else {
            f.write_str(base)
        }
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)?;
        if self.is_ref() {
            f.write_str("&")?;
        }
        if self.is_const() {
            f.write_str(" const")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_round_trip() {
        let t = TypeInfo::vector(TypeKind::Float, 4);
        assert_eq!(t.kind(), TypeKind::Float);
        assert_eq!(t.lanes(), 4);
        assert!(t.is_vector());
        assert!(!t.is_matrix());
        assert_eq!(TypeInfo::from_bits(t.bits()), t);

        let m = TypeInfo::matrix(TypeKind::Float, 3, 2);
        assert_eq!(m.rows(), 3);
        assert_eq!(m.cols(), 2);
        assert!(m.is_matrix());
    }

    #[test]
    fn qualifiers() {
        let t = TypeInfo::FLOAT.with_ref().with_const();
        assert!(t.is_ref());
        assert!(t.is_const());
        assert_eq!(t.deref(), TypeInfo::FLOAT);
        assert!(t.same_value_type(TypeInfo::FLOAT));
    }

    #[test]
    fn width_classes() {
        assert_eq!(TypeInfo::INT.width(), WidthClass::B32);
        assert_eq!(TypeInfo::DOUBLE.width(), WidthClass::B64);
        assert_eq!(TypeInfo::vector(TypeKind::Float, 2).width(), WidthClass::B64);
        assert_eq!(TypeInfo::vector(TypeKind::Float, 3).width(), WidthClass::B128);
        assert_eq!(TypeInfo::vector(TypeKind::Float, 4).width(), WidthClass::B128);
        assert_eq!(TypeInfo::vector(TypeKind::Double, 2).width(), WidthClass::B128);
        assert_eq!(TypeInfo::vector(TypeKind::Double, 4).width(), WidthClass::B256);
        assert_eq!(WidthClass::B256.parts(), 2);
    }

    #[test]
    fn implicit_cast_distance() {
        let f = TypeInfo::FLOAT;
        let f4 = TypeInfo::vector(TypeKind::Float, 4);
        let i = TypeInfo::INT;
        let d = TypeInfo::DOUBLE;

        assert_eq!(f.implicit_cast_cost(f), Some(0));
        assert_eq!(i.implicit_cast_cost(f), Some(1));
        assert_eq!(i.implicit_cast_cost(d), Some(2));
        assert_eq!(f.implicit_cast_cost(i), None); // narrowing
        assert_eq!(f.implicit_cast_cost(f4), Some(1)); // broadcast
        assert_eq!(i.implicit_cast_cost(f4), Some(2)); // widen + broadcast
        assert_eq!(f4.implicit_cast_cost(f), None);
        assert_eq!(TypeInfo::BOOL.implicit_cast_cost(i), None);
        assert_eq!(TypeInfo::STR.implicit_cast_cost(f), None);
    }

    #[test]
    fn explicit_casts() {
        let f4 = TypeInfo::vector(TypeKind::Float, 4);
        let i4 = TypeInfo::vector(TypeKind::Int, 4);
        assert!(f4.explicit_cast_ok(i4));
        assert!(i4.explicit_cast_ok(f4));
        assert!(TypeInfo::FLOAT.explicit_cast_ok(TypeInfo::INT));
        assert!(TypeInfo::FLOAT.explicit_cast_ok(f4));
        assert!(!TypeInfo::STR.explicit_cast_ok(TypeInfo::FLOAT));
        assert!(!TypeInfo::BOOL.explicit_cast_ok(TypeInfo::INT));
    }

    #[test]
    fn display_names() {
        assert_eq!(TypeInfo::FLOAT.to_string(), "float");
        assert_eq!(TypeInfo::vector(TypeKind::Int, 3).to_string(), "int3");
        assert_eq!(TypeInfo::matrix(TypeKind::Float, 4, 4).to_string(), "float4x4");
    }

    #[test]
    fn mem_sizes() {
        assert_eq!(TypeInfo::vector(TypeKind::Float, 3).mem_size(), 12);
        assert_eq!(TypeInfo::vector(TypeKind::Double, 3).mem_size(), 24);
        assert_eq!(TypeInfo::matrix(TypeKind::Float, 4, 4).mem_size(), 64);
    }
}
