//! Task construction from ordered label permutations.

use crate::error::{MetaError, MetaResult};

/// Ordered labels of one N-way episode; position `i` is task-local class `i`.
pub type Task = Vec<usize>;

/// Length-`k` permutations of `pool` in lexicographic order of positions.
#[derive(Debug, Clone)]
pub struct Permutations<'a> {
    pool: &'a [usize],
    k: usize,
    indices: Vec<usize>,
    cycles: Vec<usize>,
    started: bool,
    done: bool,
}

impl<'a> Permutations<'a> {
    pub fn new(pool: &'a [usize], k: usize) -> Self {
        let n = pool.len();
        let done = k > n;
        let cycles = if done { Vec::new() } else { (n - k + 1..=n).rev().collect() };
        Self {
            pool,
            k,
            indices: (0..n).collect(),
            cycles,
            started: false,
            done,
        }
    }

    fn current(&self) -> Task {
        self.indices[..self.k].iter().map(|&i| self.pool[i]).collect()
    }
}

impl Iterator for Permutations<'_> {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.current());
        }

        let n = self.pool.len();
        for i in (0..self.k).rev() {
            self.cycles[i] -= 1;
            if self.cycles[i] == 0 {
                self.indices[i..].rotate_left(1);
                self.cycles[i] = n - i;
            } else {
                let j = self.cycles[i];
                self.indices.swap(i, n - j);
                return Some(self.current());
            }
        }

        self.done = true;
        None
    }
}

/// Exactly `meta_batch_size` tasks: the permutation sequence truncated, or
/// repeated from the start when it is shorter than required.
pub fn build_tasks(
    labels: &[usize],
    num_classes_per_batch: usize,
    meta_batch_size: usize,
) -> MetaResult<Vec<Task>> {
    if num_classes_per_batch == 0 {
        return Err(MetaError::config("num_classes_per_batch", "must be non-zero"));
    }
    if labels.len() < num_classes_per_batch {
        return Err(MetaError::config(
            "num_classes_per_batch",
            format!(
                "{} labels cannot form a {}-way task",
                labels.len(),
                num_classes_per_batch
            ),
        ));
    }
    if meta_batch_size == 0 {
        return Err(MetaError::config("meta_batch_size", "must be non-zero"));
    }

    let head: Vec<Task> = Permutations::new(labels, num_classes_per_batch)
        .take(meta_batch_size)
        .collect();

    Ok(head.iter().cycle().take(meta_batch_size).cloned().collect())
}
