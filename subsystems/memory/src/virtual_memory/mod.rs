//! # Virtual Memory Management
//!
//! Address spaces, their regions and the backing stores behind them.

pub mod address_space;
pub mod anon;
pub mod object;
pub mod pmap;
pub mod region;

pub use address_space::{AddressSpace, AddressSpaceId, PendingFork, SpaceKind};
pub use anon::{AnonPage, AnonStore, PageRef};
pub use object::{FileError, FileObject, FileReader};
pub use pmap::Pmap;
pub use region::{Backing, MappingRegion};
