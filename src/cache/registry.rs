//! Bidirectional tag registry.
//!
//! Tracks which cache ids carry which invalidation tags, so a tag flush can
//! find every affected entry and an evicted entry can be removed from every
//! tag it was filed under.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

/// Tracks tag → cids and cid → tags mappings.
#[derive(Debug, Default)]
pub struct TagRegistry {
    tag_to_cids: RwLock<HashMap<String, HashSet<String>>>,
    cid_to_tags: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// File `cid` under `tags`, replacing whatever tags it had before.
    pub fn register(&self, cid: &str, tags: &BTreeSet<String>) {
        let mut t2c = rw_write(&self.tag_to_cids, SOURCE, "register.tag_to_cids");
        let mut c2t = rw_write(&self.cid_to_tags, SOURCE, "register.cid_to_tags");

        if let Some(previous) = c2t.remove(cid) {
            detach(&mut t2c, cid, &previous);
        }
        for tag in tags {
            t2c.entry(tag.clone()).or_default().insert(cid.to_string());
        }
        c2t.insert(cid.to_string(), tags.clone());
    }

    /// Forget `cid`, cleaning up every tag it was filed under.
    pub fn unregister(&self, cid: &str) {
        let mut t2c = rw_write(&self.tag_to_cids, SOURCE, "unregister.tag_to_cids");
        let mut c2t = rw_write(&self.cid_to_tags, SOURCE, "unregister.cid_to_tags");

        if let Some(tags) = c2t.remove(cid) {
            detach(&mut t2c, cid, &tags);
        }
    }

    /// Remove all mappings for the given tags.
    ///
    /// Returns every cid that carried at least one of them. Those cids are
    /// forgotten entirely, as their entries are about to be dropped.
    pub fn take_tagged<'a, I>(&self, tags: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut t2c = rw_write(&self.tag_to_cids, SOURCE, "take_tagged.tag_to_cids");
        let mut c2t = rw_write(&self.cid_to_tags, SOURCE, "take_tagged.cid_to_tags");

        let mut affected = BTreeSet::new();
        for tag in tags {
            if let Some(cids) = t2c.remove(tag) {
                affected.extend(cids);
            }
        }
        for cid in &affected {
            if let Some(tags) = c2t.remove(cid) {
                detach(&mut t2c, cid, &tags);
            }
        }
        affected
    }

    pub fn tags_for(&self, cid: &str) -> BTreeSet<String> {
        rw_read(&self.cid_to_tags, SOURCE, "tags_for")
            .get(cid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn cids_for(&self, tag: &str) -> BTreeSet<String> {
        rw_read(&self.tag_to_cids, SOURCE, "cids_for")
            .get(tag)
            .map(|cids| cids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tag_count(&self) -> usize {
        rw_read(&self.tag_to_cids, SOURCE, "tag_count").len()
    }

    pub fn cid_count(&self) -> usize {
        rw_read(&self.cid_to_tags, SOURCE, "cid_count").len()
    }
}

fn detach(t2c: &mut HashMap<String, HashSet<String>>, cid: &str, tags: &BTreeSet<String>) {
    for tag in tags {
        if let Some(cids) = t2c.get_mut(tag) {
            cids.remove(cid);
            if cids.is_empty() {
                t2c.remove(tag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn register_and_lookup() {
        let registry = TagRegistry::new();
        registry.register("foo:B1", &tags(&["node:1", "rendered"]));

        assert!(registry.cids_for("node:1").contains("foo:B1"));
        assert_eq!(registry.tags_for("foo:B1"), tags(&["node:1", "rendered"]));
    }

    #[test]
    fn reregister_replaces_previous_tags() {
        let registry = TagRegistry::new();
        registry.register("foo", &tags(&["node:1"]));
        registry.register("foo", &tags(&["node:2"]));

        assert!(registry.cids_for("node:1").is_empty());
        assert!(registry.cids_for("node:2").contains("foo"));
        assert_eq!(registry.tag_count(), 1);
    }

    #[test]
    fn unregister_cleans_up_mappings() {
        let registry = TagRegistry::new();
        registry.register("foo", &tags(&["node:1", "rendered"]));
        assert_eq!(registry.cid_count(), 1);
        assert_eq!(registry.tag_count(), 2);

        registry.unregister("foo");
        assert_eq!(registry.cid_count(), 0);
        assert_eq!(registry.tag_count(), 0);
    }

    #[test]
    fn take_tagged_returns_affected_and_forgets_them() {
        let registry = TagRegistry::new();
        registry.register("foo", &tags(&["node:1", "rendered"]));
        registry.register("foo:B1", &tags(&["node:1", "rendered"]));
        registry.register("bar", &tags(&["node:2", "rendered"]));

        let affected = registry.take_tagged(&tags(&["node:1"]));
        assert_eq!(affected, tags(&["foo", "foo:B1"]));

        // `rendered` still lists the untouched entry only.
        assert_eq!(registry.cids_for("rendered"), tags(&["bar"]));
        assert_eq!(registry.cid_count(), 1);
    }
}
