//! Checks `#[derive(Equivalence)]` through a renamed `swmpi` dependency.
