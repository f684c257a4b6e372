//! Control messages sent through `DoAction`.

use arrow_flight::Action;
use base64::prelude::*;
use ferry_core::wire::{decode_plan, encode_plan};
use ferry_core::Plan;
use serde::{Deserialize, Serialize};

use crate::errors::{FlightExchangeError, Result};

pub const ADD_EXCHANGE: &str = "add_exchange";
pub const LIST_EXCHANGES: &str = "list_exchanges";

/// Register an unbound plan under a command token. Later exchanges name the
/// token in their descriptor.
#[derive(Debug, Clone)]
pub struct AddExchangeAction {
    pub command: String,
    pub plan: Plan,
}

#[derive(Serialize, Deserialize)]
struct AddExchangeBody {
    command: String,
    /// Base64 of the encoded plan.
    plan: String,
}

/// Reply to [`AddExchangeAction`]: the output schema fixed at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddExchangeResponse {
    pub command: String,
    pub schema: arrow_schema::Schema,
}

impl AddExchangeAction {
    pub fn new(command: impl Into<String>, plan: Plan) -> Self {
        AddExchangeAction {
            command: command.into(),
            plan,
        }
    }

    pub fn into_action(self) -> Result<Action> {
        let body = AddExchangeBody {
            command: self.command,
            plan: BASE64_STANDARD.encode(encode_plan(&self.plan)?),
        };
        Ok(Action::new(ADD_EXCHANGE, serde_json::to_vec(&body)?))
    }

    pub fn try_from_body(body: &[u8]) -> Result<Self> {
        let body: AddExchangeBody = serde_json::from_slice(body)?;
        let plan = decode_plan(&BASE64_STANDARD.decode(body.plan)?)?;
        Ok(AddExchangeAction {
            command: body.command,
            plan,
        })
    }
}

/// Actions understood by the exchange service.
#[derive(Debug, Clone)]
pub enum ExchangeAction {
    Add(AddExchangeAction),
    List,
}

impl TryFrom<&Action> for ExchangeAction {
    type Error = FlightExchangeError;

    fn try_from(action: &Action) -> Result<Self> {
        match action.r#type.as_str() {
            ADD_EXCHANGE => Ok(ExchangeAction::Add(AddExchangeAction::try_from_body(
                &action.body,
            )?)),
            LIST_EXCHANGES => Ok(ExchangeAction::List),
            other => Err(FlightExchangeError::UnknownAction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::datatypes::DataType;
    use ferry_core::expr::{col, lit};
    use ferry_core::{Field, Schema};

    use super::*;

    #[test]
    fn add_exchange_action_body() {
        let plan = Plan::unbound("input", Schema::new([Field::new("a", DataType::Int64)]))
            .filter(col("a").gt(lit(1)))
            .unwrap();

        let action = AddExchangeAction::new("cmd", plan.clone())
            .into_action()
            .unwrap();
        assert_eq!(ADD_EXCHANGE, action.r#type);

        match ExchangeAction::try_from(&action).unwrap() {
            ExchangeAction::Add(add) => {
                assert_eq!("cmd", add.command);
                assert_eq!(plan, add.plan);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn unknown_action() {
        let action = Action::new("drop_everything", Vec::<u8>::new());
        let err = ExchangeAction::try_from(&action).unwrap_err();
        assert!(matches!(err, FlightExchangeError::UnknownAction(_)));
    }
}
