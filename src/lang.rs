//! Built-in language tables: type names, constants and intrinsics.
//!
//! These populate the root scope of every compilation. Built-ins may not
//! be shadowed by user declarations.

use crate::types::{TypeInfo, TypeKind};

/// Resolves a type keyword (`float`, `int3`, `float4x4`, …).
pub fn type_by_name(name: &str) -> Option<TypeInfo> {
    let (kind, rest) = if let Some(rest) = name.strip_prefix("double") {
        (TypeKind::Double, rest)
    } else if let Some(rest) = name.strip_prefix("float") {
        (TypeKind::Float, rest)
    } else if let Some(rest) = name.strip_prefix("int") {
        (TypeKind::Int, rest)
    } else if let Some(rest) = name.strip_prefix("bool") {
        (TypeKind::Bool, rest)
    } else if name == "void" {
        return Some(TypeInfo::VOID);
    } else {
        return None;
    };

    let bytes = rest.as_bytes();
    match bytes {
        [] => Some(TypeInfo::scalar(kind)),
        [n @ b'2'..=b'4'] => Some(TypeInfo::vector(kind, (n - b'0') as u32)),
        // Matrices are float-only: floatRxC with rows and columns in 2..4.
        [r @ b'2'..=b'4', b'x', c @ b'2'..=b'4'] if kind == TypeKind::Float => {
            Some(TypeInfo::matrix(kind, (r - b'0') as u32, (c - b'0') as u32))
        }
        _ => None,
    }
}

/// Built-in floating-point constants installed in the root scope.
pub const CONSTANTS: &[(&str, f32)] = &[
    ("PI", std::f32::consts::PI),
    ("E", std::f32::consts::E),
    ("INFINITY", f32::INFINITY),
    ("NAN", f32::NAN),
];

/// Built-in intrinsic functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Abs,
    Min,
    Max,
    Sqrt,
    Floor,
    Ceil,
    Round,
    Trunc,
    Frac,
    Dot,
    Lerp,
}

pub const INTRINSICS: &[Intrinsic] = &[
    Intrinsic::Abs,
    Intrinsic::Min,
    Intrinsic::Max,
    Intrinsic::Sqrt,
    Intrinsic::Floor,
    Intrinsic::Ceil,
    Intrinsic::Round,
    Intrinsic::Trunc,
    Intrinsic::Frac,
    Intrinsic::Dot,
    Intrinsic::Lerp,
];

impl Intrinsic {
    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::Abs => "abs",
            Intrinsic::Min => "min",
            Intrinsic::Max => "max",
            Intrinsic::Sqrt => "sqrt",
            Intrinsic::Floor => "floor",
            Intrinsic::Ceil => "ceil",
            Intrinsic::Round => "round",
            Intrinsic::Trunc => "trunc",
            Intrinsic::Frac => "frac",
            Intrinsic::Dot => "dot",
            Intrinsic::Lerp => "lerp",
        }
    }

    pub fn from_name(name: &str) -> Option<Intrinsic> {
        INTRINSICS.iter().copied().find(|i| i.name() == name)
    }

    pub fn arg_count(self) -> usize {
        match self {
            Intrinsic::Min | Intrinsic::Max | Intrinsic::Dot => 2,
            Intrinsic::Lerp => 3,
            _ => 1,
        }
    }

    /// Whether the intrinsic accepts operands of this base kind.
    pub fn accepts_kind(self, kind: TypeKind) -> bool {
        match self {
            Intrinsic::Abs | Intrinsic::Min | Intrinsic::Max => {
                matches!(kind, TypeKind::Int | TypeKind::Float | TypeKind::Double)
            }
            _ => matches!(kind, TypeKind::Float | TypeKind::Double),
        }
    }

    /// Whether operands and result share one shape, lane for lane. `dot`
    /// is the exception: it reduces a vector pair to a scalar.
    pub fn component_wise(self) -> bool {
        !matches!(self, Intrinsic::Dot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_resolve() {
        assert_eq!(type_by_name("float"), Some(TypeInfo::FLOAT));
        assert_eq!(type_by_name("int3"), Some(TypeInfo::vector(TypeKind::Int, 3)));
        assert_eq!(
            type_by_name("float4x4"),
            Some(TypeInfo::matrix(TypeKind::Float, 4, 4))
        );
        assert_eq!(type_by_name("double2"), Some(TypeInfo::vector(TypeKind::Double, 2)));
        assert_eq!(type_by_name("void"), Some(TypeInfo::VOID));
        assert_eq!(type_by_name("float5"), None);
        assert_eq!(type_by_name("int2x2"), None);
        assert_eq!(type_by_name("quux"), None);
    }

    #[test]
    fn intrinsic_lookup() {
        assert_eq!(Intrinsic::from_name("dot"), Some(Intrinsic::Dot));
        assert_eq!(Intrinsic::from_name("nope"), None);
        assert_eq!(Intrinsic::Lerp.arg_count(), 3);
        assert!(Intrinsic::Abs.accepts_kind(TypeKind::Int));
        assert!(!Intrinsic::Sqrt.accepts_kind(TypeKind::Int));
        assert!(!Intrinsic::Dot.component_wise());
    }
}
