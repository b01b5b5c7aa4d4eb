use anyhow::Context;
use executor_core::tokio::TokioGlobal;
use ferry::{Arg, Page, SocketTransport};
use serde_json::Value;

use crate::cli::InvokeArgs;
use crate::error::CliResult;

pub async fn execute(args: InvokeArgs) -> CliResult<()> {
    let (transport, _events) = SocketTransport::connect(&args.socket, TokioGlobal)
        .await
        .with_context(|| format!("failed to connect to {}", args.socket.display()))?;
    let page = Page::new(transport);

    let call_args = args.args.iter().map(|raw| Arg::Value(parse_arg(raw))).collect();
    let result = page.invoke(&args.channel, call_args).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// JSON when it parses, otherwise the raw string
pub fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
