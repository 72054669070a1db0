use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use lxkit::buffer::{split_exit_code, with_exit_code};
use lxkit::command::{CommandContainer, CommandRequest, CommandResult, HookSet};
use lxkit::config::{ConnectOptions, ExecuteOptions};
use lxkit::toolkit::Toolkit;

/// Demonstrates batched (parallel) and queued (serial, fail-fast) command
/// trees, with per-step exit-code checking.
#[tokio::main]
async fn main() -> Result<()> {
    let host = env::var("LXKIT_HOST").context("set LXKIT_HOST")?;
    let user = env::var("LXKIT_USER").context("set LXKIT_USER")?;
    let password = env::var("LXKIT_PASSWORD").context("set LXKIT_PASSWORD")?;

    let toolkit = Toolkit::new(ConnectOptions::new(host, user, password));
    toolkit.connect().await?;

    // Batched: three independent commands on three leased environments.
    let batch = toolkit
        .execute(CommandRequest::batch([
            ("hostname", "hostname"),
            ("kernel", "uname -r"),
            ("disks", "df -h"),
        ]))
        .await?;
    print_result("batch", batch.wait_for_results(None).await);

    // Queued: ordered, serial, aborting at the first non-zero exit. Each
    // step carries its own exit-code post-parser.
    let queue = toolkit
        .execute_with(
            CommandRequest::queue([step("echo one")?, step("false")?, step("echo three")?]),
            ExecuteOptions::default().stop_on_failure(true),
            HookSet::default(),
        )
        .await?;
    print_result("queue", queue.wait_for_results(None).await);
    println!("queue failed = {}", queue.failed());

    toolkit
        .wait_idle(Duration::from_secs(60), Duration::from_millis(100))
        .await;
    toolkit.disconnect().await?;
    Ok(())
}

/// One queue step: the command with `; echo $?` appended and a post-parser
/// that turns a non-zero status into a step failure.
fn step(cmd: &str) -> Result<CommandRequest> {
    let container = CommandContainer::new(
        with_exit_code(cmd),
        ExecuteOptions::default().timeout(Duration::from_secs(30)),
        HookSet::new().postparser(exit_check),
    )?;
    Ok(CommandRequest::from(container))
}

fn exit_check(result: CommandResult, _: &CommandContainer) -> Result<CommandResult, String> {
    let (body, success) = split_exit_code(result.as_text().unwrap_or(""));
    if success {
        Ok(CommandResult::Text(body))
    } else {
        Err("command exited non-zero".to_string())
    }
}

fn print_result(label: &str, result: Option<CommandResult>) {
    match result {
        Some(CommandResult::Map(map)) => {
            println!("{label}:");
            for (key, value) in map {
                println!("  {key} = {value:?}");
            }
        }
        other => println!("{label} = {other:?}"),
    }
}
