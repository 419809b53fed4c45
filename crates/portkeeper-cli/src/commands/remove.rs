//! `portkeeper rm`: stop a rule's forwarder and delete the rule.

use crate::client::ControlClient;
use anyhow::{bail, Result};
use portkeeper_core::{ControlResponse, Operation, RuleId};

pub async fn run(client: &mut ControlClient, rule_id: RuleId) -> Result<()> {
    match client.call(Operation::DeleteRule { rule_id }).await? {
        ControlResponse::RuleDeleted { rule_id, warning } => {
            match warning {
                Some(w) => println!("Rule {rule_id} deleted ({w})."),
                None => println!("Rule {rule_id} deleted."),
            }
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}
