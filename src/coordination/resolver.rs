//! Which I/O rank serves a compute rank
//!
//! Only compute ranks are ever resolved. Root is always an I/O rank (the
//! first rank of the first node), so the table keeps its designation apart
//! and no I/O designation lists root among the ranks it serves.

use tracing::error;

use crate::coordination::designation::Designation;
use crate::coordination::discovery::NodeGroup;
use crate::error::{Error, Result};
use crate::topology::{Rank, ROOT};

/// The designations of every rank, held by root
///
/// Root's own designation is kept apart from the rest of the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesignationTable {
    root: Designation,
    others: Vec<Designation>,
}

impl DesignationTable {
    /// A table from designations in rank order
    pub fn from_designations(designations: Vec<Designation>) -> Result<DesignationTable> {
        let mut designations = designations.into_iter();
        let root = designations
            .next()
            .ok_or_else(|| Error::ProtocolDefect("empty designation table".into()))?;
        Ok(DesignationTable {
            root,
            others: designations.collect(),
        })
    }

    /// The designation of `rank`
    pub fn get(&self, rank: Rank) -> Result<&Designation> {
        if rank == ROOT {
            return Ok(&self.root);
        }
        usize::try_from(rank - 1)
            .ok()
            .and_then(|index| self.others.get(index))
            .ok_or(Error::InvalidRank {
                rank,
                size: self.len(),
            })
    }

    /// Root's designation
    pub fn root(&self) -> &Designation {
        &self.root
    }

    /// Number of ranks in the table
    pub fn len(&self) -> Rank {
        Rank::try_from(self.others.len() + 1).unwrap_or(Rank::MAX)
    }

    /// Always false; a table holds at least root.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Ranks and designations in rank order
    pub fn iter(&self) -> impl Iterator<Item = (Rank, &Designation)> {
        (0..).zip(std::iter::once(&self.root).chain(&self.others))
    }

    /// Consume the table, yielding root's designation and the others in rank order.
    pub fn into_parts(self) -> (Designation, Vec<Designation>) {
        (self.root, self.others)
    }
}

/// The I/O rank serving `compute_rank` on `node`.
///
/// Searches the node's I/O designations in assignment order and stops at the
/// first one serving `compute_rank`. Finding none means the table is
/// inconsistent and is reported as [`Error::ProtocolDefect`].
pub fn resolve(table: &DesignationTable, node: &NodeGroup, compute_rank: Rank) -> Result<Rank> {
    for &rank in &node.ranks {
        if table.get(rank)?.serves(compute_rank) {
            return Ok(rank);
        }
    }
    error!(compute_rank, node = %node.name, "no I/O rank serves compute rank");
    Err(Error::ProtocolDefect(format!(
        "no I/O rank on node {} serves compute rank {}",
        node.name, compute_rank
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::designation::IoAssignment;

    fn table() -> DesignationTable {
        DesignationTable::from_designations(vec![
            Designation::Io(IoAssignment {
                compute_ranks: vec![2],
                ..IoAssignment::default()
            }),
            Designation::Io(IoAssignment {
                compute_ranks: vec![3],
                ..IoAssignment::default()
            }),
            Designation::Compute { io_rank: 0 },
            Designation::Compute { io_rank: 1 },
        ])
        .unwrap()
    }

    fn node(ranks: Vec<Rank>) -> NodeGroup {
        NodeGroup {
            name: "n".into(),
            ranks,
        }
    }

    #[test]
    fn root_is_kept_apart() {
        let table = table();
        assert_eq!(table.len(), 4);
        assert!(table.get(ROOT).unwrap().serves(2));
        assert_eq!(table.get(3).unwrap().io_rank(), Some(1));
        assert!(table.get(4).is_err());
        assert!(table.get(-1).is_err());
        assert_eq!(table.iter().count(), 4);
    }

    #[test]
    fn compute_ranks_resolve_to_their_server() {
        let table = table();
        let node = node(vec![0, 1, 2, 3]);
        assert_eq!(resolve(&table, &node, 2).unwrap(), 0);
        assert_eq!(resolve(&table, &node, 3).unwrap(), 1);
    }

    #[test]
    fn missing_owner_is_a_defect() {
        let table = table();
        let err = resolve(&table, &node(vec![1, 3]), 2).unwrap_err();
        assert!(matches!(err, Error::ProtocolDefect(_)));
    }
}
