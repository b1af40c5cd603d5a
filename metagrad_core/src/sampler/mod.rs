//! Episode sampler: N-way few-shot tasks drawn from a labeled dataset.
//!
//! The sampler turns a [`DatasetPool`] into fixed-shape meta-batches:
//! label permutations become tasks, each task position gets `batch_size`
//! examples, and the result is gathered into dense tensors ready for the
//! model wrapper.

pub mod draw;
pub mod episode;
pub mod pool;
pub mod split;
pub mod task;

pub use draw::{draw_cyclic, draw_with_replacement, CursorMap};
pub use episode::{
    generate_dataset, generate_dataset_with_cursors, one_hot, Labels, MaterializedDataset,
    MetaBatch, MetaBatchIter, Split,
};
pub use pool::{build_pool, DatasetPool, LabelPool};
pub use split::{split_support_query, SupportQuery};
pub use task::{build_tasks, Permutations, Task};
