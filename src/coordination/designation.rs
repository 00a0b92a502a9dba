//! Role and workload designation
//!
//! Root splits the ranks of every node into I/O and compute processes and
//! partitions the work units across all I/O processes of the job. The
//! partition is a reproducibility contract: the same topology and unit list
//! always give the same assignment.
//!
//! Per node with `n` processes, `min(ceil(n / 2), io_target)` ranks do I/O,
//! or `n / 2` when `n < 2 * io_target`. The first ranks of the node are the
//! I/O ranks. Every node has at least two processes, so at least one I/O
//! rank, and root is the first rank of the first node: root is always an I/O
//! rank and never needs an I/O rank of its own. The node's compute ranks are spread evenly over its I/O ranks,
//! the first I/O ranks taking one extra each when the division leaves a
//! remainder.
//!
//! Work units are handed out as contiguous ranges in node-major order. With
//! `S` units and `C` compute processes in the job, every I/O rank gets
//! `S / C` units per compute rank it serves. The `S % C` remaining units go
//! one at a time to the I/O ranks in the same order, starting over at the
//! first I/O rank when every I/O rank has received one.

use std::fmt;
use std::ops::Range;

use conv::ConvUtil;
use tracing::debug;

use crate::coordination::discovery::NodeTopology;
use crate::coordination::resolver::{self, DesignationTable};
use crate::error::{Error, Result};
use crate::records::{DesignationRecord, Suid};
use crate::topology::{Rank, ROOT};

/// The job of a process
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Role {
    /// Runs simulations
    Compute = 0,
    /// Reads inputs and writes outputs for the compute ranks it serves
    Io = 1,
}

impl Role {
    /// Wire code of the role
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The role with wire code `code`
    pub fn from_code(code: i32) -> Option<Role> {
        match code {
            0 => Some(Role::Compute),
            1 => Some(Role::Io),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Compute => "compute",
            Role::Io => "io",
        })
    }
}

/// What an I/O process is responsible for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoAssignment {
    /// Compute ranks served, in rank-list order
    pub compute_ranks: Vec<Rank>,
    /// Owned work units
    pub suids: Vec<Suid>,
    /// Owned work units in each translated index space
    pub translated: Vec<Vec<Suid>>,
}

/// Role and workload of one process
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Designation {
    /// A compute process and the I/O rank serving it
    Compute {
        /// Serving I/O rank, on the same node
        io_rank: Rank,
    },
    /// An I/O process
    Io(IoAssignment),
}

impl Designation {
    /// The role
    pub fn role(&self) -> Role {
        match self {
            Designation::Compute { .. } => Role::Compute,
            Designation::Io(_) => Role::Io,
        }
    }

    /// The serving I/O rank of a compute process
    pub fn io_rank(&self) -> Option<Rank> {
        match self {
            Designation::Compute { io_rank } => Some(*io_rank),
            Designation::Io(_) => None,
        }
    }

    /// The assignment of an I/O process
    pub fn as_io(&self) -> Option<&IoAssignment> {
        match self {
            Designation::Io(assignment) => Some(assignment),
            Designation::Compute { .. } => None,
        }
    }

    /// Whether an I/O process serves `rank`
    pub fn serves(&self, rank: Rank) -> bool {
        self.as_io()
            .map_or(false, |io| io.compute_ranks.contains(&rank))
    }

    /// The fixed-size record announcing this designation
    pub fn record(&self) -> Result<DesignationRecord> {
        let too_large = |what: &str| Error::Configuration(format!("too many {} in a designation", what));
        Ok(match self {
            Designation::Compute { io_rank } => DesignationRecord {
                proc_job: Role::Compute.code(),
                io_rank: *io_rank,
                ..DesignationRecord::default()
            },
            Designation::Io(io) => DesignationRecord {
                proc_job: Role::Io.code(),
                n_comp_procs: io
                    .compute_ranks
                    .len()
                    .value_as::<i32>()
                    .map_err(|_| too_large("compute ranks"))?,
                io_rank: -1,
                n_translated_sets: io
                    .translated
                    .len()
                    .value_as::<i32>()
                    .map_err(|_| too_large("translated sets"))?,
                n_suids: io
                    .suids
                    .len()
                    .value_as::<u64>()
                    .map_err(|_| too_large("work units"))?,
            },
        })
    }

    /// The placeholder sent to ranks still waiting when designation failed:
    /// a compute process without units or server.
    pub fn placeholder() -> DesignationRecord {
        DesignationRecord {
            proc_job: Role::Compute.code(),
            io_rank: -1,
            ..DesignationRecord::default()
        }
    }
}

/// The work units of a job
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkUnits {
    suids: Vec<Suid>,
    translated: Vec<Vec<Suid>>,
}

impl WorkUnits {
    /// Units without translated index spaces
    pub fn new(suids: Vec<Suid>) -> WorkUnits {
        WorkUnits {
            suids,
            translated: Vec::new(),
        }
    }

    /// Units with one parallel list per translated index space.
    pub fn with_translated(suids: Vec<Suid>, translated: Vec<Vec<Suid>>) -> Result<WorkUnits> {
        if let Some(list) = translated.iter().find(|list| list.len() != suids.len()) {
            return Err(Error::Configuration(format!(
                "translated unit list has {} entries, expected {}",
                list.len(),
                suids.len()
            )));
        }
        Ok(WorkUnits { suids, translated })
    }

    /// Number of units
    pub fn len(&self) -> usize {
        self.suids.len()
    }

    /// Whether there are no units
    pub fn is_empty(&self) -> bool {
        self.suids.is_empty()
    }

    /// The units
    pub fn suids(&self) -> &[Suid] {
        &self.suids
    }

    /// The translated lists
    pub fn translated(&self) -> &[Vec<Suid>] {
        &self.translated
    }

    fn slice(&self, range: Range<usize>) -> (Vec<Suid>, Vec<Vec<Suid>>) {
        (
            self.suids[range.clone()].to_vec(),
            self.translated
                .iter()
                .map(|list| list[range.clone()].to_vec())
                .collect(),
        )
    }
}

/// Number of I/O processes on a node with `n` processes
pub fn io_count(n: usize, io_target: usize) -> usize {
    if n < 2 * io_target {
        n / 2
    } else {
        ((n + 1) / 2).min(io_target)
    }
}

/// Numbers of compute ranks served by each of `io_count` I/O ranks
pub fn spread_compute(node_compute: usize, io_count: usize) -> Vec<usize> {
    if io_count == 0 {
        return Vec::new();
    }
    let base = node_compute / io_count;
    let leftover = node_compute % io_count;
    (0..io_count)
        .map(|i| base + usize::from(i < leftover))
        .collect()
}

/// Numbers of units owned by I/O ranks serving `served[i]` compute ranks each
///
/// `served` lists every I/O rank of the job in processing order.
pub fn partition_units(total_units: usize, served: &[usize]) -> Vec<usize> {
    let total_compute: usize = served.iter().sum();
    if total_compute == 0 || served.is_empty() {
        return vec![0; served.len()];
    }
    let base = total_units / total_compute;
    let leftover = total_units % total_compute;
    let rounds = leftover / served.len();
    let partial = leftover % served.len();
    served
        .iter()
        .enumerate()
        .map(|(i, &compute)| base * compute + rounds + usize::from(i < partial))
        .collect()
}

/// Designate every rank of `topology` and partition `units`.
pub fn designate(
    topology: &NodeTopology,
    units: &WorkUnits,
    io_target: usize,
) -> Result<DesignationTable> {
    if let Some(node) = topology.nodes().iter().find(|node| node.len() < 2) {
        return Err(Error::Configuration(format!(
            "node {} runs a single process; every node needs at least two",
            node.name
        )));
    }

    let io_counts: Vec<usize> = topology
        .nodes()
        .iter()
        .map(|node| io_count(node.len(), io_target))
        .collect();
    let total_compute: usize = topology
        .nodes()
        .iter()
        .zip(&io_counts)
        .map(|(node, &io)| node.len() - io)
        .sum();
    if units.len() < total_compute {
        return Err(Error::Configuration(format!(
            "{} work units cannot keep {} compute processes busy",
            units.len(),
            total_compute
        )));
    }

    let size = topology.nodes().iter().map(|node| node.len()).sum();
    let mut designations: Vec<Option<Designation>> = Vec::new();
    designations
        .try_reserve_exact(size)
        .map_err(|err| Error::out_of_memory("designation table", err))?;
    designations.resize(size, None);

    // node-major list of (I/O rank, served compute ranks)
    let mut io_ranks: Vec<(Rank, Vec<Rank>)> = Vec::new();
    for (node, &io) in topology.nodes().iter().zip(&io_counts) {
        let (io_part, compute_part) = node.ranks.split_at(io);
        let mut compute = compute_part.iter().copied();
        for (&io_rank, served) in io_part.iter().zip(spread_compute(compute_part.len(), io)) {
            io_ranks.push((io_rank, compute.by_ref().take(served).collect()));
        }
    }

    let served: Vec<usize> = io_ranks.iter().map(|(_, ranks)| ranks.len()).collect();
    let shares = partition_units(units.len(), &served);
    let mut next = 0;
    for ((io_rank, compute_ranks), share) in io_ranks.into_iter().zip(shares) {
        let (suids, translated) = units.slice(next..next + share);
        next += share;
        debug!(io_rank, served = compute_ranks.len(), units = suids.len(), "designated I/O rank");
        for &rank in &compute_ranks {
            *slot(&mut designations, rank)? = Some(Designation::Compute { io_rank });
        }
        *slot(&mut designations, io_rank)? = Some(Designation::Io(IoAssignment {
            compute_ranks,
            suids,
            translated,
        }));
    }

    let designations = designations
        .into_iter()
        .enumerate()
        .map(|(rank, designation)| {
            designation.ok_or_else(|| Error::ProtocolDefect(format!("rank {} was not designated", rank)))
        })
        .collect::<Result<Vec<_>>>()?;
    let table = DesignationTable::from_designations(designations)?;

    // every compute rank must resolve to a server on its own node
    for node in topology.nodes() {
        for &rank in &node.ranks {
            if let Designation::Compute { io_rank } = table.get(rank)? {
                let resolved = resolver::resolve(&table, node, rank)?;
                if resolved != *io_rank {
                    return Err(Error::ProtocolDefect(format!(
                        "rank {} resolves to I/O rank {} but was assigned {}",
                        rank, resolved, io_rank
                    )));
                }
            }
        }
    }
    debug_assert!(matches!(table.get(ROOT), Ok(Designation::Io(_))));
    Ok(table)
}

fn slot(designations: &mut [Option<Designation>], rank: Rank) -> Result<&mut Option<Designation>> {
    usize::try_from(rank)
        .ok()
        .and_then(|index| designations.get_mut(index))
        .ok_or_else(|| Error::ProtocolDefect(format!("rank {} is outside the job", rank)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(n: u64) -> WorkUnits {
        WorkUnits::new((0..n).map(|i| Suid::new(i, 0)).collect())
    }

    #[test]
    fn io_count_follows_node_size() {
        assert_eq!(io_count(2, 4), 1);
        assert_eq!(io_count(3, 4), 1);
        assert_eq!(io_count(7, 4), 3);
        assert_eq!(io_count(8, 4), 4);
        assert_eq!(io_count(9, 4), 4);
        assert_eq!(io_count(100, 4), 4);
        assert_eq!(io_count(5, 1), 1);
        for n in 2..40 {
            assert!(io_count(n, 4) <= (n + 1) / 2);
            assert!(io_count(n, 4) >= 1);
        }
    }

    #[test]
    fn compute_ranks_spread_leftover_first() {
        assert_eq!(spread_compute(5, 2), vec![3, 2]);
        assert_eq!(spread_compute(4, 4), vec![1, 1, 1, 1]);
        assert_eq!(spread_compute(7, 3), vec![3, 2, 2]);
    }

    #[test]
    fn units_follow_compute_share() {
        assert_eq!(partition_units(10, &[2, 2]), vec![5, 5]);
        assert_eq!(partition_units(11, &[2, 2]), vec![6, 5]);
        assert_eq!(partition_units(12, &[3, 1]), vec![9, 3]);
        // leftover larger than the number of I/O ranks wraps around
        assert_eq!(partition_units(11, &[3, 1]), vec![8, 3]);
        for (total, served) in [(100, vec![3, 2, 2]), (7, vec![1, 1, 5]), (9, vec![4])] {
            assert_eq!(partition_units(total, &served).iter().sum::<usize>(), total);
        }
    }

    #[test]
    fn example_layout_is_split_evenly() {
        // one node, two I/O ranks serving two compute ranks each
        let topology = NodeTopology::from_names(["n"; 6]);
        let table = designate(&topology, &units(10), 2).unwrap();
        let io0 = table.get(0).unwrap().as_io().unwrap();
        let io1 = table.get(1).unwrap().as_io().unwrap();
        assert_eq!(io0.compute_ranks, vec![2, 3]);
        assert_eq!(io1.compute_ranks, vec![4, 5]);
        assert_eq!(io0.suids.len(), 5);
        assert_eq!(io1.suids.len(), 5);
        assert_eq!(io0.suids[0], Suid::new(0, 0));
        assert_eq!(io1.suids[0], Suid::new(5, 0));
        assert_eq!(table.get(4).unwrap().io_rank(), Some(1));
    }

    #[test]
    fn every_unit_is_owned_once() {
        let topology = NodeTopology::from_names(["a", "a", "a", "b", "b", "b", "b", "b", "a"]);
        let table = designate(&topology, &units(23), 4).unwrap();
        let mut owned: Vec<Suid> = (0..9)
            .filter_map(|rank| table.get(rank).unwrap().as_io().cloned())
            .flat_map(|io| io.suids)
            .collect();
        owned.sort_by_key(|suid| suid.row);
        assert_eq!(owned, units(23).suids().to_vec());
    }

    #[test]
    fn compute_ranks_stay_on_their_node() {
        let names = ["a", "b", "a", "b", "a", "b", "a", "b"];
        let topology = NodeTopology::from_names(names);
        let table = designate(&topology, &units(8), 4).unwrap();
        for rank in 0..8 {
            if let Some(io_rank) = table.get(rank).unwrap().io_rank() {
                assert_eq!(names[rank as usize], names[io_rank as usize]);
            }
        }
    }

    #[test]
    fn translated_units_mirror_ranges() {
        let suids: Vec<Suid> = (0..4).map(|i| Suid::new(i, 0)).collect();
        let translated: Vec<Suid> = (0..4).map(|i| Suid::new(0, 100 + i)).collect();
        let units = WorkUnits::with_translated(suids, vec![translated]).unwrap();
        let topology = NodeTopology::from_names(["n"; 4]);
        let table = designate(&topology, &units, 4).unwrap();
        let io1 = table.get(1).unwrap().as_io().unwrap();
        assert_eq!(io1.suids, vec![Suid::new(2, 0), Suid::new(3, 0)]);
        assert_eq!(io1.translated, vec![vec![Suid::new(0, 102), Suid::new(0, 103)]]);
    }

    #[test]
    fn root_is_always_io() {
        let layouts: [&[&str]; 4] = [
            &["a", "a"],
            &["a", "a", "a", "b", "b"],
            &["b", "a", "b", "a", "a", "a"],
            &["n"; 17],
        ];
        for names in layouts {
            let topology = NodeTopology::from_names(names.iter().copied());
            let table = designate(&topology, &units(40), 4).unwrap();
            assert_eq!(table.root().role(), Role::Io);
            for node in topology.nodes() {
                assert!(resolver::resolve(&table, node, ROOT).is_err());
            }
        }
    }

    #[test]
    fn single_process_node_is_rejected() {
        let topology = NodeTopology::from_names(["a", "a", "b"]);
        let err = designate(&topology, &units(10), 4).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn too_few_units_are_rejected() {
        let topology = NodeTopology::from_names(["a"; 5]);
        let err = designate(&topology, &units(2), 4).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn mismatched_translated_lists_are_rejected() {
        let result = WorkUnits::with_translated(vec![Suid::new(0, 0)], vec![vec![]]);
        assert!(result.is_err());
    }

    #[test]
    fn records_describe_designations() {
        let io = Designation::Io(IoAssignment {
            compute_ranks: vec![2, 3],
            suids: vec![Suid::new(0, 0); 5],
            translated: vec![vec![Suid::new(0, 0); 5]],
        });
        let record = io.record().unwrap();
        assert_eq!(record.proc_job, Role::Io.code());
        assert_eq!(record.n_comp_procs, 2);
        assert_eq!(record.n_suids, 5);
        assert_eq!(record.n_translated_sets, 1);

        let compute = Designation::Compute { io_rank: 1 }.record().unwrap();
        assert_eq!(Role::from_code(compute.proc_job), Some(Role::Compute));
        assert_eq!(compute.io_rank, 1);
        assert_eq!(Designation::placeholder().n_suids, 0);
    }
}
