//! `portkeeper add`: create a forwarding rule.

use crate::client::ControlClient;
use anyhow::{bail, Result};
use portkeeper_core::{ControlResponse, Operation, RuleParams};

pub async fn run(client: &mut ControlClient, params: RuleParams) -> Result<()> {
    match client.call(Operation::CreateRule(params)).await? {
        ControlResponse::RuleCreated { rule } => {
            println!("Rule {} created: {} (pid {})", rule.id, rule.spec, rule.last_known_pid);
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}
