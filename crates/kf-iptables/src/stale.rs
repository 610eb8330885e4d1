use std::collections::BTreeSet;

/// Chains waiting to be destroyed by a later reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct StaleChains {
    chains: BTreeSet<String>,
}

impl StaleChains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, chain: &str) {
        self.chains.insert(chain.to_string());
    }

    pub fn remove(&mut self, chain: &str) {
        self.chains.remove(chain);
    }

    pub fn contains(&self, chain: &str) -> bool {
        self.chains.contains(chain)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Take every member, sorted, leaving the set empty.
    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.chains).into_iter().collect()
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.chains.iter().map(String::as_str)
    }
}
