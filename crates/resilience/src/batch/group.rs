//! Grouped batch processing

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use super::processor::{BatchJob, BatchProcessor};
use super::result::BatchResult;

/// Partition items by key, keeping groups in first-appearance order
///
/// Items keep their relative order inside each group.
///
/// ```
/// use breakwater_resilience::batch::group_by;
///
/// let groups = group_by(vec!["aws:s3", "gcp:gcs", "aws:ec2"], |r| r.split(':').next().unwrap().to_string());
/// assert_eq!(groups[0], ("aws".to_string(), vec!["aws:s3", "aws:ec2"]));
/// assert_eq!(groups[1], ("gcp".to_string(), vec!["gcp:gcs"]));
/// ```
pub fn group_by<T, K, F>(items: Vec<T>, mut key_fn: F) -> Vec<(K, Vec<T>)>
where
    K: Eq + Hash + Clone,
    F: FnMut(&T) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();

    for item in items {
        let key = key_fn(&item);
        match positions.get(&key) {
            Some(&position) => groups[position].1.push(item),
            None => {
                positions.insert(key.clone(), groups.len());
                groups.push((key, vec![item]));
            }
        }
    }

    groups
}

impl BatchProcessor {
    /// Start a batch whose items are the groups of `items`
    pub fn grouped<'a, T, K, E>(
        &self,
        items: Vec<T>,
        key_fn: impl FnMut(&T) -> K,
    ) -> BatchJob<'a, (K, Vec<T>), E>
    where
        K: Eq + Hash + Clone,
    {
        self.batch(group_by(items, key_fn))
    }

    /// Run `group_processor(key, group)` once per group
    ///
    /// Each group is one unit of work for concurrency, pacing and accounting.
    pub async fn process_grouped<T, K, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        key_fn: impl FnMut(&T) -> K,
        mut group_processor: F,
    ) -> BatchResult<(K, Vec<T>), Vec<R>, E>
    where
        T: Clone,
        K: Eq + Hash + Clone,
        F: FnMut(K, Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<R>, E>>,
    {
        self.grouped(items, key_fn)
            .process(move |(key, group), _index| group_processor(key, group))
            .await
    }
}
