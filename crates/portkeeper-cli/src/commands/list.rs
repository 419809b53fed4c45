//! `portkeeper ls`: list the caller's forwarding rules.

use crate::client::ControlClient;
use anyhow::{bail, Result};
use portkeeper_core::{ControlResponse, ForwardingRule, Operation};
use std::time::{SystemTime, UNIX_EPOCH};

pub async fn run(client: &mut ControlClient) -> Result<()> {
    let rules = match client.call(Operation::ListRules).await? {
        ControlResponse::Rules { rules } => rules,
        other => bail!("unexpected response: {other:?}"),
    };

    if rules.is_empty() {
        println!("No forwarding rules. Run `portkeeper add <listen-port> <host:port>` to create one.");
        return Ok(());
    }

    print!("{}", render_table(&rules, unix_now()));
    println!("\n{} rule(s).", rules.len());
    Ok(())
}

fn render_table(rules: &[ForwardingRule], now: u64) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<6} {:<8} {:<32} {:<8} {}\n",
        "ID", "LISTEN", "TARGET", "PID", "CREATED"
    ));
    out.push_str(&format!(
        "{:<6} {:<8} {:<32} {:<8} {}\n",
        "\u{2500}\u{2500}", "\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}",
        "\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}",
        "\u{2500}\u{2500}\u{2500}", "\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}"
    ));
    for rule in rules {
        let target = format!(
            "{}:{}",
            rule.spec.target_host_for_address(),
            rule.spec.target_port()
        );
        out.push_str(&format!(
            "{:<6} {:<8} {:<32} {:<8} {}\n",
            rule.id.to_string(),
            rule.spec.listen_port(),
            target,
            rule.last_known_pid.to_string(),
            format_age(now.saturating_sub(rule.created_at))
        ));
    }
    out
}

fn format_age(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
