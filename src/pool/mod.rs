pub(crate) mod adapter;
pub(crate) mod chunk;
pub(crate) mod fixed;
pub(crate) mod manager;
pub(crate) mod registry;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
