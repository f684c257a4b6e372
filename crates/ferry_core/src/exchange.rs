//! Running unbound computations over an input stream.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::context::{ContextRef, Exchanger, SendableBatchStream};
use crate::errors::{FerryError, Result};
use crate::execution::execute_stream;
use crate::logical::builder::single_placeholder;
use crate::logical::Plan;
use crate::schema::Schema;

/// Check that `unbound` has exactly one placeholder and that it matches
/// `input_schema`. Returns the placeholder.
pub fn validate_unbound(unbound: &Plan, input_schema: &Schema) -> Result<Plan> {
    let placeholder = single_placeholder(unbound)?;
    if placeholder.schema() != input_schema {
        return Err(FerryError::SchemaMismatch {
            expected: placeholder.schema().clone(),
            got: input_schema.clone(),
        });
    }
    Ok(placeholder)
}

/// Run `unbound` in `context` with its placeholder bound to `input`.
///
/// The input is registered lazily, so output is produced while input is still
/// arriving.
pub async fn execute_unbound(
    context: &ContextRef,
    unbound: &Plan,
    input_schema: &Schema,
    input: SendableBatchStream,
) -> Result<SendableBatchStream> {
    let placeholder = validate_unbound(unbound, input_schema)?;

    let name = format!("ferry_input_{}", Uuid::new_v4().simple());
    let table = context.register_stream(&name, input_schema, input)?;
    let bound = unbound.replace(|original, rebuilt| {
        if original == &placeholder {
            Ok(table.clone())
        } else {
            Ok(rebuilt)
        }
    });

    let result = match bound {
        Ok(bound) => execute_stream(bound, ExecutionConfig::with_fallback(context.clone())).await,
        Err(e) => Err(e),
    };
    debug!(table = %name, "dropping exchange input");
    context.drop_table(&name)?;
    result
}

/// Runs exchanges in-process against a context, without any transport.
#[derive(Debug, Clone)]
pub struct LocalExchanger {
    context: ContextRef,
}

impl LocalExchanger {
    pub fn new(context: ContextRef) -> Arc<Self> {
        Arc::new(LocalExchanger { context })
    }
}

#[async_trait]
impl Exchanger for LocalExchanger {
    fn token(&self) -> String {
        format!("local:{}", self.context.profile_token())
    }

    async fn exchange(
        &self,
        unbound: &Plan,
        input_schema: &Schema,
        input: SendableBatchStream,
    ) -> Result<SendableBatchStream> {
        execute_unbound(&self.context, unbound, input_schema, input).await
    }
}
