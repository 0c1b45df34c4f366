//! KV key schema for runs, deltas, and prompts.
//!
//! Zero-padding `seq` to ten digits guarantees lexicographic order matches
//! numeric order, which is what makes the delta log's `list`-then-sort
//! correct even though [`crate::KvStore::list`] makes no ordering promise.

const SEQ_WIDTH: usize = 10;

/// Key for a Run's persisted [`crate::deltalog`]-independent snapshot.
pub fn run(rid: &str) -> String {
    format!("run:{rid}")
}

/// Key for a single delta, zero-padded so `list` + lexicographic sort == numeric sort.
pub fn delta(rid: &str, seq: u64) -> String {
    format!("delta:{rid}:{seq:0width$}", width = SEQ_WIDTH)
}

/// Prefix covering every delta belonging to `rid`.
pub fn delta_prefix(rid: &str) -> String {
    format!("delta:{rid}:")
}

/// Key for the sanitized prompt record written once per run.
pub fn prompt(rid: &str) -> String {
    format!("prompt:{rid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_keys_sort_lexicographically_like_numbers() {
        let mut keys = vec![delta("r1", 11), delta("r1", 2), delta("r1", 100)];
        keys.sort();

        assert_eq!(keys, vec![delta("r1", 2), delta("r1", 11), delta("r1", 100)]);
    }

    #[test]
    fn delta_prefix_matches_its_own_keys() {
        let key = delta("r1", 7);
        assert!(key.starts_with(&delta_prefix("r1")));
    }
}
