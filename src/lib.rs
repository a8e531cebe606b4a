//! Lock-free ordered sets and priority queues keyed by `i64`.
//!
//! Five independent structures, each linearizable or quiescently consistent
//! as documented on its type, all safe to drive from any number of threads:
//!
//! - [`NMTree`]: external binary search tree with edge flagging/tagging;
//! - [`SkipList`]: fixed-height skip-list set;
//! - [`ShavitLotanQueue`]: skip list + logical-deletion priority queue;
//! - [`LindenJonssonQueue`]: relaxed prefix-deleting priority queue;
//! - [`SprayList`]: relaxed priority queue with randomised pops;
//! - [`MichaelHashSet`] / [`SplitOrderedSet`]: fixed-size lock-free hash sets.
//!
//! Keys are plain `i64`; `i64::MIN` and `i64::MAX` are reserved for the
//! internal sentinels. Memory reclamation is delegated to
//! [`crossbeam_epoch`]: every operation takes a pinned [`Guard`] and retired
//! nodes are handed to `Guard::defer_destroy`.
//!
//! [`Guard`]: crossbeam_epoch::Guard

pub mod concurrent_set;
pub mod linden_jonsson;
mod list;
pub mod michael_hash;
pub mod natarajan_mittal_tree;
pub mod rng;
pub mod shavit_lotan;
pub mod skip_list;
pub mod split_ordered;
pub mod spray_list;

pub use concurrent_set::ConcurrentSet;
pub use linden_jonsson::LindenJonssonQueue;
pub use michael_hash::MichaelHashSet;
pub use natarajan_mittal_tree::NMTree;
pub use shavit_lotan::ShavitLotanQueue;
pub use skip_list::SkipList;
pub use split_ordered::SplitOrderedSet;
pub use spray_list::SprayList;
