//! Argument record descriptors.
//!
//! A [`Layout`] describes the shape of one argument record passed to a
//! compiled program: an ordered list of named, typed members with byte
//! offsets, plus an optional record name. The analyzer treats offsets as
//! opaque; the backend turns member access into typed loads and stores at
//! `base_pointer + offset`.

use crate::error::{Error, Result};
use crate::types::TypeInfo;

/// Longest accepted identifier, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Maximum number of members in one layout.
pub const MAX_MEMBERS: usize = 32;

/// Member storage starts at this capacity and doubles as it grows.
const INITIAL_DATA_CAPACITY: usize = 512;

/// One member of a layout.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: Box<str>,
    pub type_info: TypeInfo,
    pub offset: i32,
}

/// Descriptor of one argument record.
#[derive(Debug, Default)]
pub struct Layout {
    name: Option<Box<str>>,
    members: Vec<Member>,
}

impl Layout {
    pub fn new() -> Layout {
        Layout::default()
    }

    /// Sets the record's type name. When the name is non-empty, members
    /// are reached in shader code as `name.member`; an empty name injects
    /// the members directly into the root scope.
    pub fn configure(&mut self, name: &str) -> Result<()> {
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(Error::InvalidArgument("layout name too long"));
        }
        if self.name.is_some() {
            return Err(Error::AlreadyConfigured);
        }
        self.name = Some(name.into());
        Ok(())
    }

    /// Appends a member. Names must be unique within the layout.
    pub fn add(&mut self, name: &str, type_info: TypeInfo, offset: i32) -> Result<()> {
        if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
            return Err(Error::InvalidArgument("member name length"));
        }
        if type_info.is_void() {
            return Err(Error::InvalidArgument("member cannot be void"));
        }
        if self.members.len() >= MAX_MEMBERS {
            return Err(Error::TooManyMembers);
        }
        if self.get(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        if self.members.capacity() == self.members.len() {
            let grow = self.members.capacity().max(
                INITIAL_DATA_CAPACITY / std::mem::size_of::<Member>(),
            );
            self.members.reserve(grow);
        }
        self.members.push(Member {
            name: name.into(),
            type_info,
            offset,
        });
        Ok(())
    }

    /// Finds a member by name.
    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| &*m.name == name)
    }

    /// The record's type name, if configured.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeKind;

    #[test]
    fn configure_once() {
        let mut layout = Layout::new();
        layout.configure("in").unwrap();
        assert_eq!(layout.name(), Some("in"));
        assert_eq!(layout.configure("again"), Err(Error::AlreadyConfigured));
    }

    #[test]
    fn add_and_get_round_trip() {
        let mut layout = Layout::new();
        layout.add("a", TypeInfo::FLOAT, 0).unwrap();
        layout
            .add("b", TypeInfo::vector(TypeKind::Float, 4), 16)
            .unwrap();

        let b = layout.get("b").unwrap();
        assert_eq!(b.offset, 16);
        assert_eq!(b.type_info.lanes(), 4);
        assert!(layout.get("missing").is_none());
    }

    #[test]
    fn duplicate_member_rejected() {
        let mut layout = Layout::new();
        layout.add("x", TypeInfo::FLOAT, 0).unwrap();
        assert_eq!(layout.add("x", TypeInfo::INT, 4), Err(Error::AlreadyExists));
    }

    #[test]
    fn member_limit() {
        let mut layout = Layout::new();
        for i in 0..MAX_MEMBERS {
            layout.add(&format!("m{i}"), TypeInfo::FLOAT, i as i32 * 4).unwrap();
        }
        assert_eq!(
            layout.add("one_too_many", TypeInfo::FLOAT, 999),
            Err(Error::TooManyMembers)
        );
    }

    #[test]
    fn name_length_limit() {
        let mut layout = Layout::new();
        let long = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(
            layout.add(&long, TypeInfo::FLOAT, 0),
            Err(Error::InvalidArgument(_))
        ));
    }
}
