//! Splitting a job list into batches.

use wp_batch_core::Job;

/// A fixed-size slice of the job list.
#[derive(Debug, Clone)]
pub struct Batch {
    /// 1-based position of the batch.
    pub index: usize,
    /// Position of the first job in the full list.
    pub offset: usize,
    pub jobs: Vec<Job>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Number of batches for `total` jobs.
#[must_use]
pub const fn batch_count(total: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    total.div_ceil(batch_size)
}

/// Split `jobs` into `ceil(len / batch_size)` batches in their original
/// order. Only the last batch may be short.
#[must_use]
pub fn partition(jobs: Vec<Job>, batch_size: usize) -> Vec<Batch> {
    let size = batch_size.max(1);
    let mut batches = Vec::with_capacity(batch_count(jobs.len(), size));
    let mut jobs = jobs.into_iter().peekable();
    let mut offset = 0;

    while jobs.peek().is_some() {
        let chunk: Vec<Job> = jobs.by_ref().take(size).collect();
        let len = chunk.len();
        batches.push(Batch {
            index: batches.len() + 1,
            offset,
            jobs: chunk,
        });
        offset += len;
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use wp_batch_transport::PostDraft;

    fn jobs(n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| Job::new(format!("job-{i}"), PostDraft::new(format!("Post {i}"), "")))
            .collect()
    }

    #[test]
    fn test_partition_sizes() {
        let batches = partition(jobs(23), 10);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(batches[2].index, 3);
        assert_eq!(batches[2].offset, 20);
    }

    #[test]
    fn test_partition_union_preserves_order() {
        let input = jobs(45);
        let expected: Vec<String> = input.iter().map(|j| j.id.clone()).collect();

        let batches = partition(input, 20);
        assert_eq!(batches.len(), batch_count(45, 20));

        let flattened: Vec<String> = batches
            .into_iter()
            .flat_map(|b| b.jobs)
            .map(|j| j.id)
            .collect();
        assert_eq!(flattened, expected);
    }

    #[test]
    fn test_partition_edge_cases() {
        assert!(partition(Vec::new(), 20).is_empty());
        assert_eq!(partition(jobs(20), 20).len(), 1);
        assert_eq!(partition(jobs(1), 20)[0].len(), 1);
        assert_eq!(batch_count(0, 20), 0);
        assert_eq!(batch_count(21, 20), 2);
    }
}
