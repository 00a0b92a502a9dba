//! Wire-format registry
//!
//! Holds one descriptor per record kind that crosses process boundaries.
//! Descriptors are created once, in the order of [`TypeKind::ALL`], and
//! released in reverse order when the registry is dropped, also when
//! creation fails half way.

use std::fmt;

use tracing::{debug, trace};

use crate::datatype::{Equivalence, UserDatatype};
use crate::error::Result;
use crate::records::{
    DesignationRecord, DomainConfig, OutDomIo, RunInputs, SpinupConfig, VegEstabInfo, WallTime,
};

/// Record kinds with a registered wire format
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// [`DomainConfig`]
    Domain,
    /// [`SpinupConfig`]
    Spinup,
    /// [`RunInputs`], including its nested aggregates
    Inputs,
    /// [`DesignationRecord`]
    Designate,
    /// [`WallTime`]
    WallTime,
    /// [`OutDomIo`]
    OutDomIo,
    /// [`VegEstabInfo`]
    VegEstabIn,
}

impl TypeKind {
    /// Every kind, in creation order
    pub const ALL: [TypeKind; 7] = [
        TypeKind::Domain,
        TypeKind::Spinup,
        TypeKind::Inputs,
        TypeKind::Designate,
        TypeKind::WallTime,
        TypeKind::OutDomIo,
        TypeKind::VegEstabIn,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn build(self) -> Result<UserDatatype> {
        match self {
            TypeKind::Domain => DomainConfig::equivalent_datatype(),
            TypeKind::Spinup => SpinupConfig::equivalent_datatype(),
            TypeKind::Inputs => RunInputs::equivalent_datatype(),
            TypeKind::Designate => DesignationRecord::equivalent_datatype(),
            TypeKind::WallTime => WallTime::equivalent_datatype(),
            TypeKind::OutDomIo => OutDomIo::equivalent_datatype(),
            TypeKind::VegEstabIn => VegEstabInfo::equivalent_datatype(),
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The registered wire formats of one process
pub struct TypeRegistry {
    entries: Vec<(TypeKind, UserDatatype)>,
}

impl TypeRegistry {
    /// Build every descriptor in [`TypeKind::ALL`] order.
    pub fn create() -> Result<TypeRegistry> {
        let mut registry = TypeRegistry {
            entries: Vec::with_capacity(TypeKind::ALL.len()),
        };
        for kind in TypeKind::ALL {
            let datatype = kind.build()?;
            trace!(%kind, size = datatype.packed_size(), "created wire format");
            registry.entries.push((kind, datatype));
        }
        debug!(kinds = registry.entries.len(), "wire formats ready");
        Ok(registry)
    }

    /// The descriptor of `kind`
    pub fn get(&self, kind: TypeKind) -> &UserDatatype {
        &self.entries[kind.index()].1
    }

    /// Registered kinds, in creation order
    pub fn kinds(&self) -> impl Iterator<Item = TypeKind> + '_ {
        self.entries.iter().map(|(kind, _)| *kind)
    }
}

impl Drop for TypeRegistry {
    fn drop(&mut self) {
        while let Some((kind, _datatype)) = self.entries.pop() {
            trace!(%kind, "released wire format");
        }
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.kinds()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_registered_in_order() {
        let registry = TypeRegistry::create().unwrap();
        assert_eq!(registry.kinds().collect::<Vec<_>>(), TypeKind::ALL.to_vec());
        for kind in TypeKind::ALL {
            assert_eq!(registry.get(kind).signature(), kind.build().unwrap().signature());
        }
    }

    #[test]
    fn lookups_match_record_types() {
        let registry = TypeRegistry::create().unwrap();
        assert!(registry.get(TypeKind::Designate).describes::<DesignationRecord>());
        assert!(registry.get(TypeKind::Inputs).describes::<RunInputs>());
        assert!(registry.get(TypeKind::VegEstabIn).describes::<VegEstabInfo>());
    }
}
