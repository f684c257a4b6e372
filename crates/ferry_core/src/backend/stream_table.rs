use std::fmt;
use std::sync::Arc;

use datafusion::arrow::datatypes::SchemaRef;
use datafusion::common::DataFusionError;
use datafusion::datasource::streaming::StreamingTable;
use datafusion::datasource::TableProvider;
use datafusion::execution::TaskContext;
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::streaming::PartitionStream;
use datafusion::physical_plan::SendableRecordBatchStream;
use futures::{stream, TryStreamExt};
use parking_lot::Mutex;

use crate::context::SendableBatchStream;
use crate::errors::Result;

/// Partition handing out a single stream. Later executions error.
pub struct OneShotPartition {
    schema: SchemaRef,
    stream: Mutex<Option<SendableBatchStream>>,
}

impl OneShotPartition {
    pub fn new(schema: SchemaRef, stream: SendableBatchStream) -> Self {
        OneShotPartition {
            schema,
            stream: Mutex::new(Some(stream)),
        }
    }
}

impl fmt::Debug for OneShotPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShotPartition")
            .field("schema", &self.schema)
            .field("consumed", &self.stream.lock().is_none())
            .finish()
    }
}

impl PartitionStream for OneShotPartition {
    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn execute(&self, _ctx: Arc<TaskContext>) -> SendableRecordBatchStream {
        match self.stream.lock().take() {
            Some(s) => Box::pin(RecordBatchStreamAdapter::new(
                self.schema.clone(),
                s.map_err(|e| DataFusionError::External(Box::new(e))),
            )),
            None => Box::pin(RecordBatchStreamAdapter::new(
                self.schema.clone(),
                stream::once(async {
                    Err(DataFusionError::Execution(
                        "stream table already consumed".to_string(),
                    ))
                }),
            )),
        }
    }
}

pub fn one_shot_table(schema: SchemaRef, stream: SendableBatchStream) -> Result<Arc<dyn TableProvider>> {
    let partition = OneShotPartition::new(schema.clone(), stream);
    let table = StreamingTable::try_new(schema, vec![Arc::new(partition)])?;
    Ok(Arc::new(table))
}
