use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use crate::context::SendableBatchStream;

/// Counts batches passing through an instrumented stream.
#[derive(Debug, Default, Clone)]
pub struct BatchCounter(Arc<AtomicUsize>);

impl BatchCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Log each batch flowing through `stream` at debug level and count it.
pub fn instrument_stream(
    stream: SendableBatchStream,
    label: &'static str,
    counter: BatchCounter,
) -> SendableBatchStream {
    stream
        .inspect(move |batch| match batch {
            Ok(batch) => {
                let n = counter.0.fetch_add(1, Ordering::Relaxed);
                debug!(label, batch = n, rows = batch.num_rows(), "batch");
            }
            Err(e) => debug!(label, %e, "stream error"),
        })
        .boxed()
}
