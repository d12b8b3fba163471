//! Lambda-proxy dictionary.
//!
//! At dump time every archived lambda call site maps to the proxy classes the
//! training run generated for it, in generation order. At run time each request
//! for a site takes the next unused proxy, so two sites with the same key still
//! get distinct classes and always in the same order.

use crate::table::DumpTimeTable;
use common::{KlassId, Runtime};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LambdaProxyKey {
    pub caller: KlassId,
    pub invoked_name: String,
    pub invoked_type: String,
    pub method_type: String,
    pub member_holder: KlassId,
    pub member_name: String,
    pub member_signature: String,
    pub instantiated_method_type: String,
}

#[derive(Debug, Default)]
pub struct LambdaProxyDictionary {
    entries: BTreeMap<LambdaProxyKey, Vec<KlassId>>,
}

impl LambdaProxyDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends `proxy` to the site's list and marks it as a registered proxy.
    pub fn add_proxy(&mut self, rt: &Runtime, table: &mut DumpTimeTable, key: LambdaProxyKey, proxy: KlassId) {
        let list = self.entries.entry(key).or_default();
        if !list.contains(&proxy) {
            list.push(proxy);
        }
        table.set_archived_lambda_proxy(rt, proxy);
    }

    pub fn get(&self, key: &LambdaProxyKey) -> Option<&[KlassId]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LambdaProxyKey, &[KlassId])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Drops sites whose caller or member holder is excluded, and excluded
    /// proxies from the remaining lists. Returns the number of removed sites.
    pub fn cleanup(&mut self, rt: &Runtime, table: &DumpTimeTable) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, proxies| {
            if table.is_excluded(key.caller) || table.is_excluded(key.member_holder) {
                debug!(
                    target: "cds::lambda",
                    "Removing lambda site {}.{} (excluded)",
                    rt.klass(key.caller).external_name(),
                    key.invoked_name
                );
                return false;
            }
            proxies.retain(|&p| !table.is_excluded(p));
            !proxies.is_empty()
        });
        before - self.entries.len()
    }
}

/// Run-time view of the dictionary. Each lookup pops the head of the site's
/// remaining proxies.
#[derive(Debug)]
pub struct RunTimeLambdaProxyTable<K: Ord> {
    entries: Mutex<BTreeMap<K, VecDeque<KlassId>>>,
}

impl<K: Ord> RunTimeLambdaProxyTable<K> {
    pub fn new(entries: impl IntoIterator<Item = (K, Vec<KlassId>)>) -> Self {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, VecDeque::from(v)))
                    .collect(),
            ),
        }
    }

    /// Takes the next proxy for `key`, if any is left.
    pub fn take(&self, key: &K) -> Option<KlassId> {
        self.entries.lock().get_mut(key)?.pop_front()
    }

    pub fn remaining(&self, key: &K) -> usize {
        self.entries.lock().get(key).map_or(0, VecDeque::len)
    }
}
