use std::env;

use anyhow::{Context, Result};
use lxkit::config::ConnectOptions;
use lxkit::toolkit::Toolkit;

/// Connects to the host named by LXKIT_HOST / LXKIT_USER / LXKIT_PASSWORD,
/// runs a couple of commands threaded, and prints the results.
#[tokio::main]
async fn main() -> Result<()> {
    let host = env::var("LXKIT_HOST").context("set LXKIT_HOST")?;
    let user = env::var("LXKIT_USER").context("set LXKIT_USER")?;
    let password = env::var("LXKIT_PASSWORD").context("set LXKIT_PASSWORD")?;

    let toolkit = Toolkit::new(ConnectOptions::new(host, user, password));
    toolkit.connect().await?;

    let kernel = toolkit.execute("uname -r").await?;
    let uptime = toolkit.execute("uptime").await?;

    println!("kernel = {:?}", kernel.wait_for_results(None).await);
    println!("uptime = {:?}", uptime.wait_for_results(None).await);
    println!("whoami = {}", toolkit.whoami(None).await?);

    toolkit.disconnect().await?;
    Ok(())
}
