pub(crate) mod arena;
pub(crate) mod block_tree;
pub mod heap;
pub(crate) mod integration;
pub(crate) mod node_alloc;
pub(crate) mod page_map;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
