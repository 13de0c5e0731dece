// doclock-common: shared lock model and wire protocol for the doclock relay

pub mod protocol;
pub mod types;
