// src/matching/blocking.rs
//! Partitions a record population into candidate buckets keyed by normalized
//! blocking-field values.

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::matching::transforms::normalize_key;
use crate::models::core::Record;
use crate::models::rules::{BlockingMode, MatchRule, OverflowPolicy};

const COMPOSITE_SEPARATOR: &str = "\u{1f}";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub field: String,
    pub value: String,
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field, self.value.replace(COMPOSITE_SEPARATOR, "|"))
    }
}

#[derive(Debug, Clone)]
pub struct Bucket {
    pub key: BlockKey,
    /// Indices into the record slice the index was built from, ascending.
    pub members: Vec<usize>,
    pub original_size: usize,
    pub truncated_pairs: usize,
}

impl Bucket {
    pub fn pair_count(&self) -> usize {
        pair_count(self.members.len())
    }
}

#[derive(Debug, Default)]
pub struct BlockingIndex {
    pub buckets: Vec<Bucket>,
    /// For each record index, the (ascending) indices of the buckets it sits in.
    record_buckets: Vec<Vec<usize>>,
    pub skipped_buckets: usize,
    pub truncated_pairs: usize,
}

pub fn pair_count(n: usize) -> usize {
    if n < 2 {
        0
    } else {
        n * (n - 1) / 2
    }
}

/// Blocking keys of one record under a rule. In `Any` mode each present field
/// yields its own key; in `All` mode every field must be present and a single
/// composite key is produced.
pub fn record_keys(record: &Record, rule: &MatchRule) -> Vec<BlockKey> {
    let values: Vec<Option<String>> = rule
        .blocking_fields
        .iter()
        .map(|field| {
            record
                .value(field)
                .map(|v| normalize_key(&v.as_text()))
                .filter(|v| !v.is_empty())
        })
        .collect();

    match rule.blocking_mode {
        BlockingMode::Any => rule
            .blocking_fields
            .iter()
            .zip(values)
            .filter_map(|(field, value)| {
                value.map(|value| BlockKey {
                    field: field.clone(),
                    value,
                })
            })
            .collect(),
        BlockingMode::All => {
            let Some(parts) = values.into_iter().collect::<Option<Vec<String>>>() else {
                return Vec::new();
            };
            vec![BlockKey {
                field: rule.blocking_fields.join("+"),
                value: parts.join(COMPOSITE_SEPARATOR),
            }]
        }
    }
}

fn sample_seed(key: &BlockKey) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.field.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.value.as_bytes());
    let digest = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(seed)
}

impl BlockingIndex {
    /// Builds the bucket list for `records`. Buckets with fewer than two members
    /// are dropped; oversized buckets are sampled or skipped per the rule.
    pub fn build(records: &[Record], rule: &MatchRule, default_max_bucket_size: usize) -> Self {
        let max_size = rule.max_bucket_size.unwrap_or(default_max_bucket_size).max(2);

        let mut grouped: BTreeMap<BlockKey, Vec<usize>> = BTreeMap::new();
        for (idx, record) in records.iter().enumerate() {
            for key in record_keys(record, rule) {
                let members = grouped.entry(key).or_default();
                if members.last() != Some(&idx) {
                    members.push(idx);
                }
            }
        }

        let mut index = BlockingIndex {
            record_buckets: vec![Vec::new(); records.len()],
            ..Default::default()
        };

        for (key, mut members) in grouped {
            if members.len() < 2 {
                continue;
            }
            let original_size = members.len();
            let mut truncated = 0;

            if original_size > max_size {
                match rule.overflow_policy {
                    OverflowPolicy::Sample => {
                        let mut rng = StdRng::seed_from_u64(sample_seed(&key));
                        let mut sampled: Vec<usize> =
                            members.choose_multiple(&mut rng, max_size).cloned().collect();
                        sampled.sort_unstable();
                        truncated = pair_count(original_size) - pair_count(max_size);
                        warn!(
                            "Bucket {} for rule '{}' has {} records (cap {}); sampled down, {} pairs truncated",
                            key, rule.rule_name, original_size, max_size, truncated
                        );
                        members = sampled;
                    }
                    OverflowPolicy::Skip => {
                        let skipped_pairs = pair_count(original_size);
                        warn!(
                            "Bucket {} for rule '{}' has {} records (cap {}); skipped, {} pairs truncated",
                            key, rule.rule_name, original_size, max_size, skipped_pairs
                        );
                        index.skipped_buckets += 1;
                        index.truncated_pairs += skipped_pairs;
                        continue;
                    }
                }
            }

            let bucket_idx = index.buckets.len();
            for &member in &members {
                index.record_buckets[member].push(bucket_idx);
            }
            index.truncated_pairs += truncated;
            index.buckets.push(Bucket {
                key,
                members,
                original_size,
                truncated_pairs: truncated,
            });
        }

        debug!(
            "Blocking for rule '{}' produced {} buckets ({} skipped, {} pairs truncated)",
            rule.rule_name,
            index.buckets.len(),
            index.skipped_buckets,
            index.truncated_pairs
        );
        index
    }

    pub fn total_pairs(&self) -> usize {
        self.buckets.iter().map(Bucket::pair_count).sum()
    }

    /// True when `bucket_idx` is the lowest bucket shared by both records, so a
    /// pair present in several buckets is scored exactly once.
    pub fn owns_pair(&self, bucket_idx: usize, a: usize, b: usize) -> bool {
        let (left, right) = (&self.record_buckets[a], &self.record_buckets[b]);
        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            match left[i].cmp(&right[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return left[i] == bucket_idx,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::AttributeValue;
    use chrono::Utc;

    fn rec(id: &str, postal: Option<&str>, email: Option<&str>) -> Record {
        let mut r = Record::new(id, "customer", "crm", Utc::now());
        if let Some(p) = postal {
            r = r.with_attribute("postal_code", AttributeValue::text(p));
        }
        if let Some(e) = email {
            r = r.with_attribute("email", AttributeValue::text(e));
        }
        r
    }

    fn rule() -> MatchRule {
        MatchRule::new("customer", "blocking-test").with_blocking_fields(&["postal_code", "email"])
    }

    #[test]
    fn test_any_mode_groups_by_each_field() {
        let records = vec![
            rec("a", Some("78701"), Some("x@acme.com")),
            rec("b", Some("78701 "), None),
            rec("c", None, Some("X@ACME.com")),
            rec("d", Some("10001"), None),
        ];
        let index = BlockingIndex::build(&records, &rule(), 500);
        assert_eq!(index.buckets.len(), 2);
        assert_eq!(index.total_pairs(), 2);
    }

    #[test]
    fn test_all_mode_requires_every_field() {
        let mut rule = rule();
        rule.blocking_mode = BlockingMode::All;
        let records = vec![
            rec("a", Some("78701"), Some("x@acme.com")),
            rec("b", Some("78701"), Some("x@acme.com")),
            rec("c", Some("78701"), None),
        ];
        let index = BlockingIndex::build(&records, &rule, 500);
        assert_eq!(index.buckets.len(), 1);
        assert_eq!(index.buckets[0].members, vec![0, 1]);
    }

    #[test]
    fn test_shared_pair_owned_by_lowest_bucket() {
        let records = vec![
            rec("a", Some("78701"), Some("x@acme.com")),
            rec("b", Some("78701"), Some("x@acme.com")),
        ];
        let index = BlockingIndex::build(&records, &rule(), 500);
        assert_eq!(index.buckets.len(), 2);
        let owners: Vec<usize> = (0..index.buckets.len())
            .filter(|&b| index.owns_pair(b, 0, 1))
            .collect();
        assert_eq!(owners, vec![0]);
    }

    #[test]
    fn test_oversized_bucket_sampled_deterministically() {
        let mut rule = rule();
        rule.max_bucket_size = Some(3);
        let records: Vec<Record> = (0..6).map(|i| rec(&format!("r{}", i), Some("78701"), None)).collect();
        let first = BlockingIndex::build(&records, &rule, 500);
        let second = BlockingIndex::build(&records, &rule, 500);
        assert_eq!(first.buckets[0].members.len(), 3);
        assert_eq!(first.buckets[0].members, second.buckets[0].members);
        assert_eq!(first.truncated_pairs, 15 - 3);
    }

    #[test]
    fn test_oversized_bucket_skipped() {
        let mut rule = rule();
        rule.max_bucket_size = Some(2);
        rule.overflow_policy = OverflowPolicy::Skip;
        let records: Vec<Record> = (0..3).map(|i| rec(&format!("r{}", i), Some("78701"), None)).collect();
        let index = BlockingIndex::build(&records, &rule, 500);
        assert!(index.buckets.is_empty());
        assert_eq!(index.skipped_buckets, 1);
        assert_eq!(index.truncated_pairs, 3);
    }
}
