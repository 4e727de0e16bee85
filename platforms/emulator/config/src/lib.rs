// Licensed under the Apache-2.0 license

pub mod flash;

pub use flash::{FlashLayout, PartitionInfo, PartitionKind, PartitionTable};
