use parking_lot::Mutex;
use std::collections::HashSet;

/// Names of unregistered classes seen so far. An unregistered class name may be
/// defined only once per dump.
#[derive(Debug, Default)]
pub struct UnregisteredClasses {
    names: Mutex<HashSet<String>>,
}

impl UnregisteredClasses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `name`. Returns `false` if it was already claimed.
    pub fn add(&self, name: &str) -> bool {
        self.names.lock().insert(name.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_claimed_once() {
        let classes = UnregisteredClasses::new();
        assert!(classes.add("custom/Foo"));
        assert!(!classes.add("custom/Foo"));
        assert!(classes.contains("custom/Foo"));
        assert_eq!(classes.len(), 1);
    }
}
